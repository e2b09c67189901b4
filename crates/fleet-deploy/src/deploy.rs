use std::fmt::Write as _;

use tracing::{info, warn};

use crate::config::{CommonConfig, DeployConfig};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::executor::CancelToken;
use crate::gate::{WaitPolicy, wait_all_ready};
use crate::monitor::LogSyncMonitor;
use crate::provision::{ComputeProvider, Provisioner};
use crate::remote::RemoteShell;
use crate::state::{RunState, StateStore};
use crate::templates::TemplateRegistry;
use crate::workspace::{ensure_dir, rotate_existing_output_dir};

/// Fresh deploy: per role batch provision, gate, dispatch; then monitor everything.
pub fn run(
    cfg: &DeployConfig,
    provider: &dyn ComputeProvider,
    shell: &dyn RemoteShell,
    cancel: &CancelToken,
) -> Result<()> {
    let common = &cfg.common;
    cfg.validate()?;
    common.validate_remote_access()?;

    let log_dir = common.log_dir();
    let output_dir = common.output_dir();
    ensure_dir(&log_dir, "log dir")?;
    rotate_existing_output_dir(&output_dir).map_err(|e| e.context("archive previous output"))?;
    ensure_dir(&output_dir, "output dir")?;

    let store = StateStore::new(&output_dir);
    let templates = TemplateRegistry::builtin()?;
    let provisioner = Provisioner::new(provider);
    let policy = WaitPolicy::from_timing(&common.timing);
    let dispatcher = Dispatcher {
        shell,
        provisioner: &provisioner,
        store: &store,
        templates: &templates,
        common,
    };

    for svc in cfg.services.iter().filter(|s| s.count > 0) {
        cancel.check()?;
        info!(role = %svc.role, count = svc.count, "launching instances");
        let ids = provisioner.launch_batch(svc, common, cancel)?;

        info!(role = %svc.role, "waiting for instances to run");
        provisioner.await_running(&ids, cancel)?;
        let addresses = provisioner.resolve_addresses(&ids, cancel)?;
        info!(role = %svc.role, addresses = ?addresses, "instances addressed");

        if let Err(e) = store.add_instances(&addresses, &svc.role) {
            warn!(role = %svc.role, error = %e, "failed to persist instance roster");
        }

        wait_all_ready(shell, &addresses, &policy, common.max_parallel, cancel)?;
        dispatcher.dispatch_batch(svc, &addresses, cancel)?;
    }

    info!("all workloads started; syncing logs");
    LogSyncMonitor::new(shell, &store, log_dir, common.timing.poll_interval()).run(cancel)?;
    info!("all workloads finished");
    Ok(())
}

/// Resume monitoring from persisted state without launching anything.
pub fn resume_sync(
    common: &CommonConfig,
    shell: &dyn RemoteShell,
    cancel: &CancelToken,
) -> Result<()> {
    common.validate_remote_access()?;
    let log_dir = common.log_dir();
    ensure_dir(&log_dir, "log dir")?;
    let store =
        StateStore::load(common.output_dir()).map_err(|e| e.context("load persisted state"))?;
    info!(dir = %store.dir().display(), "resuming log sync");
    LogSyncMonitor::new(shell, &store, log_dir, common.timing.poll_interval()).run(cancel)
}

/// Plain-text summary of the persisted roster and run states.
pub fn status_report(common: &CommonConfig) -> Result<String> {
    let store = StateStore::load(common.output_dir())?;
    let instances = store.snapshot_instances();
    let statuses = store.snapshot_statuses();

    let mut out = String::new();
    let _ = writeln!(out, "output: {}", store.dir().display());
    let _ = writeln!(out, "instances: {}", instances.len());
    for state in [
        RunState::Running,
        RunState::Success,
        RunState::Failed,
        RunState::Unknown,
    ] {
        let n = statuses.iter().filter(|s| s.state == state).count();
        if n > 0 {
            let _ = writeln!(out, "{state}: {n}");
        }
    }
    if statuses.is_empty() {
        return Ok(out);
    }
    let _ = writeln!(
        out,
        "\n{:<16} {:<8} {:<24} {:<8} {:>8} {:>12}  REASON",
        "ADDRESS", "ROLE", "NAME", "STATE", "PID", "SYNCED"
    );
    for st in &statuses {
        let _ = writeln!(
            out,
            "{:<16} {:<8} {:<24} {:<8} {:>8} {:>12}  {}",
            st.address,
            st.role,
            st.display_name(),
            st.state,
            st.pid,
            st.synced_offset,
            st.reason
        );
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NewRun;

    #[test]
    fn status_report_counts_states() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let common = CommonConfig {
            log_dir: tmp.path().display().to_string(),
            ..CommonConfig::default()
        };
        let store = StateStore::new(common.output_dir());
        store
            .add_instances(&["10.0.0.1".into(), "10.0.0.2".into()], "op")
            .expect("roster");
        for (addr, pid) in [("10.0.0.1", 10), ("10.0.0.2", 20)] {
            store
                .init_status(NewRun {
                    address: addr.into(),
                    role: "op".into(),
                    name: String::new(),
                    command: "./op_pipe.sh".into(),
                    pid,
                    remote_log_path: "/tmp/x.log".into(),
                    local_log_path: String::new(),
                    now: 1,
                })
                .expect("init");
        }
        store
            .update_status("10.0.0.2", "op", |st| {
                st.state = RunState::Failed;
                st.reason = "no completion marker".into();
            })
            .expect("update");

        let report = status_report(&common).expect("report");
        assert!(report.contains("instances: 2"), "{report}");
        assert!(report.contains("running: 1"), "{report}");
        assert!(report.contains("failed: 1"), "{report}");
        assert!(report.contains("op-10.0.0.2"), "{report}");
        assert!(report.contains("no completion marker"), "{report}");
    }
}
