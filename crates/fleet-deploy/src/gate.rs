use std::time::Duration;

use tracing::{debug, info};

use crate::config::TimingConfig;
use crate::error::{Error, Result};
use crate::executor::{CancelToken, collect_failures, fan_out};
use crate::remote::RemoteShell;
use crate::remote_text::sanitize_for_log;

const READY_COMMAND: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub retries: u32,
    pub interval: Duration,
    pub attempt_timeout: Duration,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::from_timing(&TimingConfig::default())
    }
}

impl WaitPolicy {
    pub fn from_timing(timing: &TimingConfig) -> Self {
        Self {
            retries: timing.ssh_wait_retries.max(1),
            interval: timing.ssh_wait_interval(),
            attempt_timeout: timing.ssh_connect_timeout(),
        }
    }
}

/// Block until `address` accepts a remote shell, or the retries run out.
pub fn wait_ready(
    shell: &dyn RemoteShell,
    address: &str,
    policy: &WaitPolicy,
    cancel: &CancelToken,
) -> Result<()> {
    if let Some(key) = shell.identity_file()
        && let Err(e) = std::fs::metadata(key)
    {
        return Err(Error::msg(format!(
            "ssh identity file unusable: {}: {e}",
            key.display()
        )));
    }

    for attempt in 1..=policy.retries {
        cancel.check()?;
        match shell.exec(address, READY_COMMAND, Some(policy.attempt_timeout), cancel) {
            Ok(out) if out.success() => {
                info!(address, attempt, "remote shell ready");
                return Ok(());
            }
            Ok(out) => {
                let output = sanitize_for_log(&out.summary());
                debug!(address, attempt, %output, "remote shell not ready");
            }
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(address, attempt, error = %e, "remote shell check errored");
            }
        }
        if attempt < policy.retries {
            cancel.sleep(policy.interval)?;
        }
    }
    Err(Error::msg(format!(
        "remote shell never became ready after {} attempts",
        policy.retries
    )))
}

/// Gate a whole batch; every address is checked, any failure is fatal.
pub fn wait_all_ready(
    shell: &dyn RemoteShell,
    addresses: &[String],
    policy: &WaitPolicy,
    max_parallel: usize,
    cancel: &CancelToken,
) -> Result<()> {
    let done = fan_out(addresses.to_vec(), max_parallel, |_, address: String| {
        wait_ready(shell, &address, policy, cancel)
    });
    collect_failures(done, |i| (addresses[i].clone(), None))
        .map(|_| ())
        .map_err(|e| e.context("connectivity check"))
}
