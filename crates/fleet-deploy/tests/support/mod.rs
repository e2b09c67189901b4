#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use fleet_deploy::classify::COMPLETION_SENTINEL;
use fleet_deploy::executor::CancelToken;
use fleet_deploy::provision::{ComputeProvider, LaunchSpec};
use fleet_deploy::remote::{ProcessOutput, RemoteShell};
use fleet_deploy::{Error, Result};

/// Cloud double: a launch of N instances yields ids `i-0..N` backed by
/// `addresses[0..N]`.
#[derive(Default)]
pub struct Cloud {
    pub addresses: Vec<String>,
    pub launches: Mutex<Vec<LaunchSpec>>,
    pub tags: Mutex<BTreeMap<String, String>>,
}

impl Cloud {
    pub fn new(addresses: &[&str]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }
}

impl ComputeProvider for Cloud {
    fn launch(&self, spec: &LaunchSpec, _cancel: &CancelToken) -> Result<Vec<String>> {
        self.launches.lock().expect("lock").push(spec.clone());
        Ok((0..spec.count).map(|i| format!("i-{i}")).collect())
    }

    fn await_running(&self, _ids: &[String], cancel: &CancelToken) -> Result<()> {
        cancel.check()
    }

    fn public_addresses(&self, ids: &[String], _cancel: &CancelToken) -> Result<Vec<String>> {
        Ok(ids
            .iter()
            .filter_map(|id| id.strip_prefix("i-")?.parse::<usize>().ok())
            .filter_map(|n| self.addresses.get(n).cloned())
            .collect())
    }

    fn tag(&self, id: &str, name: &str, _cancel: &CancelToken) -> Result<()> {
        self.tags
            .lock()
            .expect("lock")
            .insert(id.to_string(), name.to_string());
        Ok(())
    }

    fn find_by_address(&self, address: &str, _cancel: &CancelToken) -> Result<String> {
        self.addresses
            .iter()
            .position(|a| a == address)
            .map(|n| format!("i-{n}"))
            .ok_or_else(|| Error::msg(format!("no instance with address {address}")))
    }
}

struct Host {
    pid: u32,
    log: Vec<u8>,
    alive_polls: u32,
}

/// Shell double for a whole fleet. A detached launch "runs" instantly: the
/// host's scripted log appears in full and the pid dies after `alive_polls`
/// liveness checks.
pub struct Fleet {
    logs: HashMap<String, String>,
    alive_polls: u32,
    hosts: Mutex<HashMap<String, Host>>,
    pub commands: Mutex<Vec<(String, String)>>,
}

pub fn finished_log() -> String {
    format!("+ ./run.sh\nsyncing\n{COMPLETION_SENTINEL}\n")
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            logs: HashMap::new(),
            alive_polls: 0,
            hosts: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn with_log(mut self, address: &str, log: &str) -> Self {
        self.logs.insert(address.to_string(), log.to_string());
        self
    }

    pub fn alive_for(mut self, polls: u32) -> Self {
        self.alive_polls = polls;
        self
    }

    /// A workload already running on `address` before this process started,
    /// as found by a resumed sync.
    pub fn with_running(mut self, address: &str, pid: u32, log: &str, alive_polls: u32) -> Self {
        self.hosts.get_mut().expect("lock").insert(
            address.to_string(),
            Host {
                pid,
                log: log.as_bytes().to_vec(),
                alive_polls,
            },
        );
        self
    }

    /// Commands sent to `address` that start with `prefix`, in order.
    pub fn sent(&self, address: &str, prefix: &str) -> Vec<String> {
        self.commands
            .lock()
            .expect("lock")
            .iter()
            .filter(|(addr, cmd)| addr == address && cmd.starts_with(prefix))
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub fn launches_on(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .commands
            .lock()
            .expect("lock")
            .iter()
            .filter(|(_, cmd)| cmd.contains("nohup "))
            .map(|(addr, _)| addr.clone())
            .collect();
        out.sort();
        out
    }

    fn ok(stdout: impl Into<String>) -> ProcessOutput {
        ProcessOutput {
            stdout: stdout.into().into_bytes(),
            stderr: Vec::new(),
            code: Some(0),
        }
    }
}

impl RemoteShell for Fleet {
    fn exec(
        &self,
        address: &str,
        command: &str,
        _timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput> {
        cancel.check()?;
        self.commands
            .lock()
            .expect("lock")
            .push((address.to_string(), command.to_string()));
        let mut hosts = self.hosts.lock().expect("lock");

        if command == "true" {
            return Ok(Self::ok(""));
        }
        if command.contains("nohup ") {
            let pid = 4000 + hosts.len() as u32 + 1;
            let log = self
                .logs
                .get(address)
                .cloned()
                .unwrap_or_else(finished_log);
            hosts.insert(
                address.to_string(),
                Host {
                    pid,
                    log: log.into_bytes(),
                    alive_polls: self.alive_polls,
                },
            );
            return Ok(Self::ok(format!("Shutdown scheduled\n{pid}\n")));
        }
        let Some(host) = hosts.get_mut(address) else {
            return Ok(ProcessOutput {
                stdout: Vec::new(),
                stderr: b"ssh: connect to host: Connection refused".to_vec(),
                code: Some(255),
            });
        };
        if command.starts_with("wc -c") {
            return Ok(Self::ok(format!("{}\n", host.log.len())));
        }
        if let Some(rest) = command.strip_prefix("tail -c +") {
            let start: usize = rest
                .split_whitespace()
                .next()
                .and_then(|n| n.parse().ok())
                .unwrap_or(1);
            let from = start.saturating_sub(1).min(host.log.len());
            return Ok(ProcessOutput {
                stdout: host.log[from..].to_vec(),
                stderr: Vec::new(),
                code: Some(0),
            });
        }
        if command.starts_with("ps -p") {
            if host.alive_polls > 0 {
                host.alive_polls -= 1;
                return Ok(Self::ok(format!("{}\n", host.pid)));
            }
            return Ok(ProcessOutput {
                code: Some(1),
                ..ProcessOutput::default()
            });
        }
        Err(Error::msg(format!("unexpected command: {command}")))
    }
}

/// Write a deploy config for `count` generic instances under `root`.
pub fn write_config(root: &Path, count: u32) -> std::path::PathBuf {
    let path = root.join("deploy.toml");
    let body = format!(
        r#"
key_name = "fleet-key"
log_dir = "{logs}"
security_group_id = "sg-1"
max_parallel = 2

[timing]
poll_interval_secs = 1
ssh_wait_retries = 2
ssh_wait_interval_secs = 0

[[services]]
type = "generic"
ami = "ami-123"
instance_type = "t3.large"
tag_prefix = "ydyl"
count = {count}
remote_cmd = "./run.sh"
"#,
        logs = root.join("logs").display()
    );
    std::fs::write(&path, body).expect("write config");
    path
}
