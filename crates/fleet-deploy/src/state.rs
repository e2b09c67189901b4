use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::workspace::atomic_write_text;

pub const SERVERS_FILE: &str = "servers.json";
pub const STATUS_FILE: &str = "script_status.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Success,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
            RunState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One provisioned host and the role it was launched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    #[serde(rename = "ip")]
    pub address: String,
    #[serde(rename = "serviceType")]
    pub role: String,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Execution state of the workload on one `(address, role)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    #[serde(rename = "ip")]
    pub address: String,
    #[serde(rename = "serviceType")]
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// The workload command, without the shutdown/nohup wrapper.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default)]
    pub pid: u32,
    #[serde(rename = "status", default)]
    pub state: RunState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(rename = "logPath", default, skip_serializing_if = "String::is_empty")]
    pub remote_log_path: String,
    #[serde(rename = "localLog", default, skip_serializing_if = "String::is_empty")]
    pub local_log_path: String,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "is_zero_i64")]
    pub updated_at: i64,
    /// Remote log bytes already copied to `local_log_path`.
    #[serde(rename = "logSize", default, skip_serializing_if = "is_zero_u64")]
    pub synced_offset: u64,
}

impl RunStatus {
    pub fn key(&self) -> (String, String) {
        (self.address.clone(), self.role.clone())
    }

    pub fn is_monitorable(&self) -> bool {
        self.state == RunState::Running && self.pid > 0 && !self.remote_log_path.is_empty()
    }

    /// Logical name, falling back to `{role}-{address}` for records without one.
    pub fn display_name(&self) -> String {
        if self.name.trim().is_empty() {
            format!("{}-{}", self.role, self.address)
        } else {
            self.name.clone()
        }
    }
}

/// A freshly launched workload, recorded as `running` with nothing synced.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub address: String,
    pub role: String,
    pub name: String,
    pub command: String,
    pub pid: u32,
    pub remote_log_path: String,
    pub local_log_path: String,
    pub now: i64,
}

#[derive(Debug, Default)]
struct Inner {
    instances: Vec<InstanceRecord>,
    statuses: BTreeMap<(String, String), RunStatus>,
}

/// Durable roster plus run-status map, persisted as JSON in one directory.
#[derive(Debug)]
pub struct StateStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

impl StateStore {
    /// An empty store for a fresh run; nothing is written until the first mutation.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let instances: Vec<InstanceRecord> =
            read_json_list(&dir.join(SERVERS_FILE))?.unwrap_or_default();
        let list: Vec<RunStatus> = read_json_list(&dir.join(STATUS_FILE))?.unwrap_or_default();
        let statuses = list.into_iter().map(|st| (st.key(), st)).collect();
        debug!(dir = %dir.display(), "loaded state store");
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                instances,
                statuses,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn add_instances(&self, addresses: &[String], role: &str) -> Result<()> {
        let mut inner = self.lock();
        let kept = inner.instances.len();
        inner
            .instances
            .extend(addresses.iter().map(|address| InstanceRecord {
                address: address.clone(),
                role: role.to_string(),
            }));
        if let Err(e) = self.save_instances(&inner) {
            inner.instances.truncate(kept);
            return Err(e);
        }
        Ok(())
    }

    pub fn init_status(&self, run: NewRun) -> Result<RunStatus> {
        let status = RunStatus {
            address: run.address,
            role: run.role,
            name: run.name,
            command: run.command,
            pid: run.pid,
            state: RunState::Running,
            reason: String::new(),
            remote_log_path: run.remote_log_path,
            local_log_path: run.local_log_path,
            updated_at: run.now,
            synced_offset: 0,
        };
        let mut inner = self.lock();
        self.commit_status(&mut inner, status.clone())?;
        Ok(status)
    }

    /// Apply `mutate` to the record for `(address, role)`, creating it if
    /// absent, and persist. Returns a copy of the updated record; if the
    /// write fails the in-memory record is left as it was.
    pub fn update_status<F>(&self, address: &str, role: &str, mutate: F) -> Result<RunStatus>
    where
        F: FnOnce(&mut RunStatus),
    {
        let mut inner = self.lock();
        let mut updated = inner
            .statuses
            .get(&(address.to_string(), role.to_string()))
            .cloned()
            .unwrap_or_default();
        mutate(&mut updated);
        // Identity fields stay tied to the map key.
        updated.address = address.to_string();
        updated.role = role.to_string();
        self.commit_status(&mut inner, updated.clone())?;
        Ok(updated)
    }

    /// Swap `status` in and write the file, putting the previous entry back on failure.
    fn commit_status(&self, inner: &mut Inner, status: RunStatus) -> Result<()> {
        let key = status.key();
        let previous = inner.statuses.insert(key.clone(), status);
        if let Err(e) = self.save_statuses(inner) {
            match previous {
                Some(prev) => inner.statuses.insert(key, prev),
                None => inner.statuses.remove(&key),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn get_status(&self, address: &str, role: &str) -> Option<RunStatus> {
        self.lock()
            .statuses
            .get(&(address.to_string(), role.to_string()))
            .cloned()
    }

    pub fn snapshot_statuses(&self) -> Vec<RunStatus> {
        self.lock().statuses.values().cloned().collect()
    }

    pub fn snapshot_instances(&self) -> Vec<InstanceRecord> {
        self.lock().instances.clone()
    }

    fn save_instances(&self, inner: &Inner) -> Result<()> {
        write_json(&self.dir.join(SERVERS_FILE), &inner.instances)
    }

    fn save_statuses(&self, inner: &Inner) -> Result<()> {
        let list: Vec<&RunStatus> = inner.statuses.values().collect();
        write_json(&self.dir.join(STATUS_FILE), &list)
    }
}

fn read_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(Error::msg(format!(
                "failed to read {}: {e}",
                path.display()
            )));
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| Error::msg(format!("failed to parse {}: {e}", path.display())))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::msg(format!("failed to encode {}: {e}", path.display())))?;
    body.push('\n');
    atomic_write_text(path, &body)
}
