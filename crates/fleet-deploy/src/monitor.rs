use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::error::{Error, Result};
use crate::executor::{CancelToken, fan_out};
use crate::remote::commands::{
    liveness_command, local_log_path, log_size_command, parse_log_size, tail_command,
};
use crate::remote::{REMOTE_EXEC_TIMEOUT, RemoteShell, SSH_TRANSPORT_FAILURE, exec_checked};
use crate::remote_text::sanitize_for_log;
use crate::state::{RunState, RunStatus, StateStore, now_unix};

/// How much of the newest log text feeds classification.
const CLASSIFY_WINDOW: usize = 64 * 1024;

/// Consecutive failed liveness checks after which the workload counts as gone.
/// Hosts power themselves off once their run window ends.
const MAX_UNREACHABLE_CHECKS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Liveness {
    Alive,
    Gone,
    /// The remote shell itself failed (ssh exit 255 or killed by a signal).
    Unreachable(String),
}

/// Polls every running workload: pulls new remote log bytes, checks the pid,
/// and records a terminal state once the process is gone.
pub struct LogSyncMonitor<'a> {
    shell: &'a dyn RemoteShell,
    store: &'a StateStore,
    log_dir: PathBuf,
    poll_interval: Duration,
}

impl<'a> LogSyncMonitor<'a> {
    pub fn new(
        shell: &'a dyn RemoteShell,
        store: &'a StateStore,
        log_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            shell,
            store,
            log_dir: log_dir.into(),
            poll_interval,
        }
    }

    /// New bytes of `remote_path` past `offset`; empty when nothing grew.
    pub fn fetch_delta(
        &self,
        address: &str,
        remote_path: &str,
        offset: u64,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>> {
        if remote_path.trim().is_empty() {
            return Err(Error::msg("remote log path is empty"));
        }
        let size = parse_log_size(&exec_checked(
            self.shell,
            address,
            &log_size_command(remote_path),
            cancel,
        )?)?;
        if size <= offset {
            return Ok(Vec::new());
        }
        let out = self.shell.exec(
            address,
            &tail_command(remote_path, offset),
            Some(REMOTE_EXEC_TIMEOUT),
            cancel,
        )?;
        if !out.success() {
            return Err(Error::msg(format!(
                "read remote log failed: {}",
                sanitize_for_log(&out.summary())
            )));
        }
        Ok(out.stdout)
    }

    fn check_alive(&self, address: &str, pid: u32, cancel: &CancelToken) -> Result<Liveness> {
        let out = self.shell.exec(
            address,
            &liveness_command(pid),
            Some(REMOTE_EXEC_TIMEOUT),
            cancel,
        )?;
        Ok(match out.code {
            Some(0) => Liveness::Alive,
            Some(SSH_TRANSPORT_FAILURE) | None => {
                Liveness::Unreachable(sanitize_for_log(&out.summary()))
            }
            Some(_) => Liveness::Gone,
        })
    }

    /// Fetch and append one delta; returns the new offset. Nothing advances on error.
    fn sync_once(
        &self,
        record: &RunStatus,
        local: &Path,
        offset: u64,
        recent: &mut Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let delta = self.fetch_delta(&record.address, &record.remote_log_path, offset, cancel)?;
        if delta.is_empty() {
            return Ok(offset);
        }
        append_to_file(local, &delta)?;
        remember_tail(recent, &delta);
        Ok(offset + delta.len() as u64)
    }

    /// Follow one workload until it ends (or the run is cancelled).
    pub fn watch(&self, record: RunStatus, cancel: &CancelToken) -> Result<RunStatus> {
        let address = record.address.clone();
        let role = record.role.clone();
        let name = record.display_name();
        let local = if record.local_log_path.trim().is_empty() {
            local_log_path(&self.log_dir, &address, &name)
        } else {
            PathBuf::from(&record.local_log_path)
        };
        let local_text = local.display().to_string();
        let mut offset = record.synced_offset;
        let mut recent = Vec::new();
        let mut unreachable = 0u32;
        info!(%address, %role, %name, pid = record.pid, offset, "monitoring workload");

        loop {
            cancel.check()?;

            match self.sync_once(&record, &local, offset, &mut recent, cancel) {
                Ok(next) => offset = next,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(%address, %role, error = %e, "log sync failed; retrying"),
            }

            let liveness = match self.check_alive(&address, record.pid, cancel) {
                Ok(l) => l,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => Liveness::Unreachable(e.to_string()),
            };
            let alive = match liveness {
                Liveness::Alive => {
                    unreachable = 0;
                    true
                }
                Liveness::Gone => false,
                Liveness::Unreachable(why) => {
                    unreachable += 1;
                    warn!(
                        %address, %role, pid = record.pid, attempt = unreachable,
                        error = %why, "liveness check failed"
                    );
                    unreachable < MAX_UNREACHABLE_CHECKS
                }
            };

            if alive {
                let persisted = self.store.update_status(&address, &role, |st| {
                    if st.state.is_terminal() {
                        return;
                    }
                    st.updated_at = now_unix();
                    st.synced_offset = st.synced_offset.max(offset);
                    if st.local_log_path.is_empty() {
                        st.local_log_path = local_text.clone();
                    }
                });
                if let Err(e) = persisted {
                    warn!(%address, %role, error = %e, "failed to persist progress");
                }
                debug!(%address, %role, offset, "still running");
                cancel.sleep(self.poll_interval)?;
                continue;
            }

            // Exited: pick up whatever was written after the last poll.
            match self.sync_once(&record, &local, offset, &mut recent, cancel) {
                Ok(next) => offset = next,
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(%address, %role, error = %e, "final log sync failed"),
            }

            let text = if recent.is_empty() {
                read_tail(&local, CLASSIFY_WINDOW).unwrap_or_default()
            } else {
                String::from_utf8_lossy(&recent).into_owned()
            };
            let (state, mut reason) = classify(&role, &text);
            if unreachable >= MAX_UNREACHABLE_CHECKS && state != RunState::Success {
                reason = format!("host unreachable after {unreachable} liveness checks; {reason}");
            }
            let final_record = self.store.update_status(&address, &role, |st| {
                st.state = state;
                st.reason = reason.clone();
                st.updated_at = now_unix();
                st.synced_offset = st.synced_offset.max(offset);
                if st.local_log_path.is_empty() {
                    st.local_log_path = local_text.clone();
                }
            })?;
            info!(%address, %role, %name, state = %state, reason = %reason, "workload finished");
            return Ok(final_record);
        }
    }

    /// Watch every monitorable record concurrently. After all of them end,
    /// the first `failed` one (in completion order) becomes the error.
    pub fn run(&self, cancel: &CancelToken) -> Result<()> {
        let records: Vec<RunStatus> = self
            .store
            .snapshot_statuses()
            .into_iter()
            .filter(RunStatus::is_monitorable)
            .collect();
        if records.is_empty() {
            info!("no running workloads to monitor");
            return Ok(());
        }
        info!(count = records.len(), "monitoring workloads");

        let mut first_failure: Option<Error> = None;
        let mut cancelled = false;
        for done in fan_out(records, 0, |_, rec| self.watch(rec, cancel)) {
            match done.result {
                Ok(st) if st.state == RunState::Failed => {
                    first_failure.get_or_insert_with(|| {
                        Error::msg(format!(
                            "workload failed on {} (role {}): {}",
                            st.address, st.role, st.reason
                        ))
                    });
                }
                Ok(_) => {}
                Err(e) if e.is_cancelled() => cancelled = true,
                Err(e) => {
                    first_failure.get_or_insert(e);
                }
            }
        }
        if cancelled {
            return Err(Error::cancelled());
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn remember_tail(recent: &mut Vec<u8>, delta: &[u8]) {
    recent.extend_from_slice(delta);
    if recent.len() > CLASSIFY_WINDOW {
        let drop = recent.len() - CLASSIFY_WINDOW;
        recent.drain(..drop);
    }
}

fn append_to_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
    }
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
    f.write_all(data)
        .map_err(|e| Error::msg(format!("failed to append {}: {e}", path.display())))
}

fn read_tail(path: &Path, max: usize) -> Result<String> {
    let mut f = fs::File::open(path)?;
    let len = f.metadata()?.len();
    let start = len.saturating_sub(max as u64);
    f.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
