use std::collections::BTreeMap;

use crate::config::{CommonConfig, ROLE_CDK, ROLE_OP, ServiceConfig};
use crate::error::{Error, Result};
use crate::keys::derive_private_key_hex;

/// Builds the workload command for the instance with the given 1-based ordinal.
pub type TemplateFn = fn(usize, &CommonConfig) -> Result<String>;

const L2_CHAIN_ID_BASE: usize = 10_000;

#[derive(Default)]
pub struct TemplateRegistry {
    templates: BTreeMap<&'static str, TemplateFn>,
}

impl TemplateRegistry {
    pub fn add(&mut self, role: &'static str, f: TemplateFn) -> Result<()> {
        if self.templates.contains_key(role) {
            return Err(Error::msg(format!(
                "duplicate command template for role '{role}'"
            )));
        }
        self.templates.insert(role, f);
        Ok(())
    }

    pub fn get(&self, role: &str) -> Option<TemplateFn> {
        self.templates.get(role).copied()
    }

    pub fn builtin() -> Result<Self> {
        let mut reg = Self::default();
        reg.add(ROLE_OP, op_pipe)?;
        reg.add(ROLE_CDK, cdk_pipe)?;
        Ok(reg)
    }

    /// A configured literal command wins; otherwise the role's template runs.
    pub fn build_command(
        &self,
        svc: &ServiceConfig,
        ordinal: usize,
        common: &CommonConfig,
    ) -> Result<String> {
        if let Some(cmd) = svc.literal_command() {
            return Ok(cmd.to_string());
        }
        let Some(template) = self.get(&svc.role) else {
            return Err(Error::msg(format!(
                "service type '{}' has no command template; set remote_cmd",
                svc.role
            )));
        };
        template(ordinal, common)
    }
}

fn op_pipe(ordinal: usize, common: &CommonConfig) -> Result<String> {
    chain_pipe("./op_pipe.sh", ordinal, common)
}

fn cdk_pipe(ordinal: usize, common: &CommonConfig) -> Result<String> {
    chain_pipe("./cdk_pipe.sh", ordinal, common)
}

fn chain_pipe(script: &str, ordinal: usize, common: &CommonConfig) -> Result<String> {
    let chain = &common.chain;
    let index = u32::try_from(ordinal)
        .map_err(|_| Error::msg(format!("instance ordinal {ordinal} out of range")))?;
    let vault_key = derive_private_key_hex(&chain.vault_mnemonic()?, index)
        .map_err(|e| e.context("L1_VAULT_PRIVATE_KEY"))?;
    Ok(format!(
        " git pull && GIT_SSH_COMMAND='ssh -o StrictHostKeyChecking=no' \
         git submodule update --init --recursive \
         && L2_CHAIN_ID={} L1_CHAIN_ID={} L1_RPC_URL={} \
         L1_VAULT_PRIVATE_KEY={} L1_BRIDGE_RELAY_CONTRACT={} \
         L1_REGISTER_BRIDGE_PRIVATE_KEY={} DRYRUN={} FORCE_DEPLOY_CDK={} {script}",
        L2_CHAIN_ID_BASE + ordinal,
        chain.l1_chain_id,
        chain.l1_rpc_url,
        vault_key,
        chain.l1_bridge_relay_contract,
        chain.register_bridge_private_key(),
        chain.dry_run,
        chain.force_deploy_l2_chain,
    ))
}
