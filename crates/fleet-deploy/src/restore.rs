use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::config::CommonConfig;
use crate::dispatch::launch_detached;
use crate::error::{Error, Result};
use crate::executor::{CancelToken, collect_failures, fan_out};
use crate::monitor::LogSyncMonitor;
use crate::remote::RemoteShell;
use crate::remote::commands::{local_log_path, remote_log_path};
use crate::state::{RunState, RunStatus, StateStore, now_unix};

/// Re-runs recorded workloads on existing hosts, using only persisted state.
pub struct Restorer<'a> {
    pub shell: &'a dyn RemoteShell,
    pub store: &'a StateStore,
    pub common: &'a CommonConfig,
}

/// Records that can be re-run: an address, a recorded command, and (when a
/// filter is given) an address on the list.
pub fn restorable(statuses: Vec<RunStatus>, only: &BTreeSet<String>) -> Vec<RunStatus> {
    statuses
        .into_iter()
        .filter(|st| !st.address.trim().is_empty() && !st.command.trim().is_empty())
        .filter(|st| only.is_empty() || only.contains(st.address.trim()))
        .collect()
}

impl Restorer<'_> {
    /// Relaunch every restorable record; returns how many were attempted.
    pub fn redispatch(&self, only: &BTreeSet<String>, cancel: &CancelToken) -> Result<usize> {
        let targets = restorable(self.store.snapshot_statuses(), only);
        let attempts = targets.len();
        let labels: Vec<(String, String)> = targets
            .iter()
            .map(|st| (st.address.clone(), st.display_name()))
            .collect();

        let done = fan_out(targets, self.common.max_parallel, |_, st: RunStatus| {
            self.redispatch_one(st, cancel)
        });
        collect_failures(done, |idx| {
            let (address, name) = labels[idx].clone();
            (address, Some(name))
        })?;
        info!(attempts, "recorded workloads relaunched");
        Ok(attempts)
    }

    fn redispatch_one(&self, st: RunStatus, cancel: &CancelToken) -> Result<()> {
        let name = st.display_name();
        let (remote_file, remote_dir) = remote_log_path(&st.remote_log_path, &name);
        let local = if st.local_log_path.trim().is_empty() {
            local_log_path(&self.common.log_dir(), &st.address, &name)
                .display()
                .to_string()
        } else {
            st.local_log_path.clone()
        };
        info!(address = %st.address, role = %st.role, %name, "relaunching");

        let pid = launch_detached(
            self.shell,
            &st.address,
            &st.command,
            &remote_file,
            &remote_dir,
            self.common.run_duration_mins,
            cancel,
        )?;
        self.store.update_status(&st.address, &st.role, |rec| {
            rec.name = name.clone();
            rec.command = st.command.clone();
            rec.pid = pid;
            rec.state = RunState::Running;
            rec.reason.clear();
            rec.remote_log_path = remote_file.clone();
            rec.local_log_path = local.clone();
            rec.updated_at = now_unix();
            rec.synced_offset = 0;
        })?;
        info!(address = %st.address, role = %st.role, %name, pid, "workload relaunched");
        Ok(())
    }
}

/// Load state from the output directory, relaunch, then monitor to completion.
pub fn restore(
    shell: &dyn RemoteShell,
    common: &CommonConfig,
    only: &BTreeSet<String>,
    cancel: &CancelToken,
) -> Result<()> {
    let output_dir = common.output_dir();
    let store = StateStore::load(&output_dir)
        .map_err(|e| e.context("load persisted state"))?;
    if store.snapshot_statuses().is_empty() {
        return Err(Error::msg(format!(
            "no run status records found in {}",
            output_dir.display()
        )));
    }

    let attempts = Restorer {
        shell,
        store: &store,
        common,
    }
    .redispatch(only, cancel)?;
    if attempts == 0 {
        warn!(dir = %output_dir.display(), "no recorded command matched; nothing relaunched");
    }

    LogSyncMonitor::new(shell, &store, common.log_dir(), common.timing.poll_interval()).run(cancel)
}
