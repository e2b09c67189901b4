pub mod commands;
pub mod process;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::config::expand_home;
use crate::error::{Error, Result};
use crate::executor::CancelToken;
use crate::remote_text::sanitize_for_log;

pub use process::{ProcessOutput, run_captured};

/// ssh reserves exit status 255 for its own failures (connect, auth, ...).
pub const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Default bound for one remote command that is expected to return promptly.
pub const REMOTE_EXEC_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs a shell command on a remote host.
pub trait RemoteShell: Send + Sync {
    fn exec(
        &self,
        address: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput>;

    /// Identity file the shell authenticates with, if it uses one.
    fn identity_file(&self) -> Option<&Path> {
        None
    }
}

/// Run `command` and return its stdout, failing on any non-zero exit.
pub fn exec_checked(
    shell: &dyn RemoteShell,
    address: &str,
    command: &str,
    cancel: &CancelToken,
) -> Result<String> {
    let out = shell.exec(address, command, Some(REMOTE_EXEC_TIMEOUT), cancel)?;
    if !out.success() {
        return Err(Error::msg(format!(
            "remote command failed ({}): {}",
            out.code
                .map(|c| format!("exit {c}"))
                .unwrap_or_else(|| "signal".into()),
            sanitize_for_log(&out.summary())
        )));
    }
    Ok(out.stdout_text())
}

/// `ssh` client with non-interactive, throwaway host-key options.
#[derive(Debug, Clone)]
pub struct SshShell {
    pub user: String,
    pub key_path: PathBuf,
    pub connect_timeout: Duration,
}

impl SshShell {
    pub fn new(user: impl Into<String>, key_path: &Path, connect_timeout: Duration) -> Self {
        Self {
            user: user.into(),
            key_path: expand_home(&key_path.to_string_lossy()),
            connect_timeout,
        }
    }

    fn command(&self, address: &str, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        configure_ssh_cmd(&mut cmd, self);
        cmd.arg(format!("{}@{}", self.user, address)).arg(remote);
        cmd
    }
}

impl RemoteShell for SshShell {
    fn exec(
        &self,
        address: &str,
        command: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput> {
        run_captured(self.command(address, command), timeout, cancel)
            .map_err(|e| e.context(format!("ssh {address}")))
    }

    fn identity_file(&self) -> Option<&Path> {
        Some(self.key_path.as_path())
    }
}

fn configure_ssh_cmd(cmd: &mut Command, ssh: &SshShell) {
    for opt in [
        "StrictHostKeyChecking=no",
        "UserKnownHostsFile=/dev/null",
        "BatchMode=yes",
        "NumberOfPasswordPrompts=0",
        "IdentitiesOnly=yes",
    ] {
        cmd.arg("-o").arg(opt);
    }
    cmd.arg("-o")
        .arg(format!("ConnectTimeout={}", ssh.connect_timeout.as_secs().max(1)));
    cmd.arg("-o").arg("LogLevel=ERROR");
    cmd.arg("-i").arg(&ssh.key_path);
}
