use tracing::{debug, info};

use crate::config::{CommonConfig, ServiceConfig};
use crate::error::Result;
use crate::executor::{CancelToken, collect_failures, fan_out};
use crate::provision::Provisioner;
use crate::remote::commands::{
    background_command, local_log_path, parse_remote_pid, remote_log_path,
};
use crate::remote::{RemoteShell, exec_checked};
use crate::state::{NewRun, RunStatus, StateStore, now_unix};
use crate::templates::TemplateRegistry;

/// Start `command` detached on `address` and return the background pid.
pub fn launch_detached(
    shell: &dyn RemoteShell,
    address: &str,
    command: &str,
    remote_log_file: &str,
    remote_log_dir: &str,
    run_mins: u64,
    cancel: &CancelToken,
) -> Result<u32> {
    let wrapped = background_command(command, remote_log_file, remote_log_dir, run_mins);
    debug!(address, command = %wrapped, "launching detached workload");
    let stdout = exec_checked(shell, address, &wrapped, cancel)?;
    parse_remote_pid(&stdout)
}

/// Starts one role batch's workloads and records them as `running`.
pub struct Dispatcher<'a> {
    pub shell: &'a dyn RemoteShell,
    pub provisioner: &'a Provisioner<'a>,
    pub store: &'a StateStore,
    pub templates: &'a TemplateRegistry,
    pub common: &'a CommonConfig,
}

impl Dispatcher<'_> {
    /// Every address is attempted; failures come back as one aggregated error.
    /// Instances that launched keep their persisted `running` record.
    pub fn dispatch_batch(
        &self,
        svc: &ServiceConfig,
        addresses: &[String],
        cancel: &CancelToken,
    ) -> Result<Vec<RunStatus>> {
        let done = fan_out(
            addresses.to_vec(),
            self.common.max_parallel,
            |idx, address: String| self.dispatch_one(svc, &address, idx + 1, cancel),
        );
        let started = collect_failures(done, |idx| {
            (addresses[idx].clone(), Some(svc.instance_name(idx + 1)))
        })?;
        info!(role = %svc.role, count = started.len(), "workloads started");
        Ok(started.into_iter().map(|(_, st)| st).collect())
    }

    fn dispatch_one(
        &self,
        svc: &ServiceConfig,
        address: &str,
        ordinal: usize,
        cancel: &CancelToken,
    ) -> Result<RunStatus> {
        let name = svc.instance_name(ordinal);
        info!(address, role = %svc.role, %name, "dispatching");

        self.provisioner.retag_by_address(address, &name, cancel)?;
        let command = self.templates.build_command(svc, ordinal, self.common)?;
        let (remote_file, remote_dir) = remote_log_path("", &name);
        let pid = launch_detached(
            self.shell,
            address,
            &command,
            &remote_file,
            &remote_dir,
            self.common.run_duration_mins,
            cancel,
        )?;
        let local = local_log_path(&self.common.log_dir(), address, &name);
        let status = self.store.init_status(NewRun {
            address: address.to_string(),
            role: svc.role.clone(),
            name: name.clone(),
            command,
            pid,
            remote_log_path: remote_file,
            local_log_path: local.display().to_string(),
            now: now_unix(),
        })?;
        info!(address, role = %svc.role, %name, pid, "workload started");
        Ok(status)
    }
}
