mod doc;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

pub use doc::{ConfigDoc, load_doc};

pub const ROLE_GENERIC: &str = "generic";
pub const ROLE_OP: &str = "op";
pub const ROLE_CDK: &str = "cdk";
pub const ROLE_XJST: &str = "xjst";

const KNOWN_ROLES: &[&str] = &[ROLE_GENERIC, ROLE_OP, ROLE_CDK, ROLE_XJST];

fn default_ssh_user() -> String {
    "ubuntu".into()
}

fn default_log_dir() -> String {
    "logs".into()
}

fn default_run_duration_mins() -> u64 {
    720
}

fn default_role() -> String {
    ROLE_GENERIC.into()
}

/// Settings shared by every service batch, and everything `sync`/`restore` need.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    pub region: Option<String>,
    pub security_group_id: String,
    pub disk_size_gib: u32,
    #[serde(default = "default_run_duration_mins")]
    pub run_duration_mins: u64,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub ssh_key_dir: Option<String>,
    pub key_name: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    pub output_dir: Option<String>,
    /// Fan-out bound for dispatch and connectivity checks (0 = one thread per instance).
    pub max_parallel: usize,
    pub chain: ChainConfig,
    pub timing: TimingConfig,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            region: None,
            security_group_id: String::new(),
            disk_size_gib: 0,
            run_duration_mins: default_run_duration_mins(),
            ssh_user: default_ssh_user(),
            ssh_key_dir: None,
            key_name: String::new(),
            log_dir: default_log_dir(),
            output_dir: None,
            max_parallel: 0,
            chain: ChainConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl CommonConfig {
    pub fn log_dir(&self) -> PathBuf {
        expand_home(&self.log_dir)
    }

    pub fn output_dir(&self) -> PathBuf {
        match self
            .output_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            Some(dir) => expand_home(dir),
            None => self.log_dir().join("output"),
        }
    }

    /// `<ssh_key_dir>/<key_name>.pem`, with `ssh_key_dir` defaulting to `~/.ssh`.
    pub fn ssh_key_path(&self) -> PathBuf {
        let dir = self
            .ssh_key_dir
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("~/.ssh");
        expand_home(dir).join(format!("{}.pem", self.key_name.trim()))
    }

    pub fn validate_remote_access(&self) -> Result<()> {
        if self.ssh_user.trim().is_empty() {
            return Err(Error::msg("ssh_user is empty"));
        }
        if self.key_name.trim().is_empty() {
            return Err(Error::msg("key_name is empty"));
        }
        if self.run_duration_mins == 0 {
            return Err(Error::msg("run_duration_mins must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub l1_chain_id: String,
    pub l1_rpc_url: String,
    pub l1_vault_mnemonic: Option<String>,
    pub l1_vault_mnemonic_env: Option<String>,
    pub l1_bridge_relay_contract: String,
    pub l1_register_bridge_private_key: Option<String>,
    pub l1_register_bridge_private_key_env: Option<String>,
    pub dry_run: bool,
    pub force_deploy_l2_chain: bool,
}

impl ChainConfig {
    pub fn vault_mnemonic(&self) -> Result<String> {
        resolve_required_string_field(
            "chain.l1_vault_mnemonic",
            self.l1_vault_mnemonic.as_deref(),
            self.l1_vault_mnemonic_env.as_deref(),
        )
    }

    pub fn register_bridge_private_key(&self) -> String {
        resolve_string_field(
            self.l1_register_bridge_private_key.as_deref(),
            self.l1_register_bridge_private_key_env.as_deref(),
        )
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_secs: u64,
    pub ssh_wait_retries: u32,
    pub ssh_wait_interval_secs: u64,
    pub ssh_connect_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            ssh_wait_retries: 60,
            ssh_wait_interval_secs: 3,
            ssh_connect_timeout_secs: 10,
        }
    }
}

impl TimingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn ssh_wait_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_wait_interval_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs.max(1))
    }
}

/// One role batch: how many instances to launch and what to run on them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(rename = "type", default = "default_role")]
    pub role: String,
    pub ami: String,
    pub instance_type: String,
    pub tag_prefix: String,
    pub count: u32,
    pub remote_cmd: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            ami: String::new(),
            instance_type: String::new(),
            tag_prefix: String::new(),
            count: 0,
            remote_cmd: None,
        }
    }
}

impl ServiceConfig {
    /// The configured literal command, if any (blank counts as unset).
    pub fn literal_command(&self) -> Option<&str> {
        self.remote_cmd
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// `{tag_prefix}-{role}-{ordinal}`, ordinal starting at 1.
    pub fn instance_name(&self, ordinal: usize) -> String {
        format!("{}-{}-{}", self.tag_prefix, self.role, ordinal)
    }

    pub fn validate(&self) -> Result<()> {
        if !KNOWN_ROLES.contains(&self.role.as_str()) {
            return Err(Error::msg(format!(
                "unsupported service type '{}' (expected one of: {})",
                self.role,
                KNOWN_ROLES.join(", ")
            )));
        }
        if self.role == ROLE_XJST && self.count % 4 != 0 {
            return Err(Error::msg("xjst service count must be divisible by 4"));
        }
        if self.count > 0 {
            if self.ami.trim().is_empty() {
                return Err(Error::msg(format!("service '{}': ami is empty", self.role)));
            }
            if self.instance_type.trim().is_empty() {
                return Err(Error::msg(format!(
                    "service '{}': instance_type is empty",
                    self.role
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub services: Vec<ServiceConfig>,
}

impl DeployConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let cfg: DeployConfig = doc.deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        for svc in &self.services {
            svc.validate()?;
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<DeployConfig> {
    DeployConfig::from_doc(&load_doc(path)?)
}

pub fn expand_home(raw: &str) -> PathBuf {
    let raw = raw.trim();
    let Some(rest) = raw.strip_prefix('~') else {
        return PathBuf::from(raw);
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
        None => PathBuf::from(raw),
    }
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| resolve_env_ref(env_key))
}

fn resolve_required_string_field(
    cfg_path: &str,
    literal: Option<&str>,
    env_key: Option<&str>,
) -> Result<String> {
    resolve_string_field(literal, env_key).ok_or_else(|| {
        match env_key.map(str::trim).filter(|s| !s.is_empty()) {
            Some(k) => Error::msg(format!("{cfg_path} is empty (also checked env var '{k}')")),
            None => Error::msg(format!("{cfg_path} is empty")),
        }
    })
}
