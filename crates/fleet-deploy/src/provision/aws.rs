use std::process::Command;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ComputeProvider, LaunchSpec};
use crate::error::{Error, Result};
use crate::executor::CancelToken;
use crate::remote::run_captured;
use crate::remote_text::sanitize_for_log;

/// EC2 through the `aws` command-line tool; credentials come from its own chain.
#[derive(Debug, Clone, Default)]
pub struct AwsCliProvider {
    pub region: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesOutput {
    #[serde(default)]
    instances: Vec<InstanceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesOutput {
    #[serde(default)]
    reservations: Vec<ReservationDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationDoc {
    #[serde(default)]
    instances: Vec<InstanceDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceDoc {
    instance_id: Option<String>,
    public_ip_address: Option<String>,
}

impl AwsCliProvider {
    pub fn new(region: Option<String>) -> Self {
        Self {
            region: region.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
        }
    }

    fn ec2(&self, args: &[String]) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(region) = self.region.as_deref() {
            cmd.arg("--region").arg(region);
        }
        cmd.arg("ec2").args(args).arg("--output").arg("json");
        cmd
    }

    fn run(&self, what: &str, args: &[String], cancel: &CancelToken) -> Result<String> {
        debug!(op = what, args = ?args, "aws ec2");
        let out = run_captured(self.ec2(args), None, cancel)?;
        if !out.success() {
            return Err(Error::msg(format!(
                "aws ec2 {what} failed: {}",
                sanitize_for_log(&out.summary())
            )));
        }
        Ok(out.stdout_text())
    }

    fn run_json<T: DeserializeOwned>(
        &self,
        what: &str,
        args: &[String],
        cancel: &CancelToken,
    ) -> Result<T> {
        let raw = self.run(what, args, cancel)?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::msg(format!("aws ec2 {what}: unexpected output: {e}")))
    }
}

fn run_instances_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec![
        "run-instances".to_string(),
        "--image-id".into(),
        spec.image.clone(),
        "--instance-type".into(),
        spec.instance_type.clone(),
        "--count".into(),
        spec.count.to_string(),
        "--key-name".into(),
        spec.key_name.clone(),
        "--security-group-ids".into(),
        spec.security_group_id.clone(),
        "--instance-initiated-shutdown-behavior".into(),
        "terminate".into(),
    ];
    if let Some(size) = spec.disk_size_gib {
        let mapping = serde_json::json!([{
            "DeviceName": "/dev/sda1",
            "Ebs": {
                "VolumeSize": size,
                "VolumeType": "gp3",
                "DeleteOnTermination": true,
            }
        }]);
        args.push("--block-device-mappings".into());
        args.push(mapping.to_string());
    }
    args
}

fn instance_ids(out: RunInstancesOutput) -> Vec<String> {
    out.instances
        .into_iter()
        .filter_map(|i| i.instance_id)
        .collect()
}

fn public_ips(out: DescribeInstancesOutput) -> Vec<String> {
    out.reservations
        .into_iter()
        .flat_map(|r| r.instances)
        .filter_map(|i| i.public_ip_address)
        .filter(|ip| !ip.is_empty())
        .collect()
}

impl ComputeProvider for AwsCliProvider {
    fn launch(&self, spec: &LaunchSpec, cancel: &CancelToken) -> Result<Vec<String>> {
        let out: RunInstancesOutput =
            self.run_json("run-instances", &run_instances_args(spec), cancel)?;
        let ids = instance_ids(out);
        if ids.len() != spec.count as usize {
            return Err(Error::msg(format!(
                "run-instances returned {} instance(s), requested {}",
                ids.len(),
                spec.count
            )));
        }
        Ok(ids)
    }

    fn await_running(&self, ids: &[String], cancel: &CancelToken) -> Result<()> {
        let mut args = vec!["wait".to_string(), "instance-running".into(), "--instance-ids".into()];
        args.extend(ids.iter().cloned());
        self.run("wait instance-running", &args, cancel).map(|_| ())
    }

    fn public_addresses(&self, ids: &[String], cancel: &CancelToken) -> Result<Vec<String>> {
        let mut args = vec!["describe-instances".to_string(), "--instance-ids".into()];
        args.extend(ids.iter().cloned());
        let out: DescribeInstancesOutput = self.run_json("describe-instances", &args, cancel)?;
        Ok(public_ips(out))
    }

    fn tag(&self, id: &str, name: &str, cancel: &CancelToken) -> Result<()> {
        let args = vec![
            "create-tags".to_string(),
            "--resources".into(),
            id.to_string(),
            "--tags".into(),
            format!("Key=Name,Value={name}"),
        ];
        self.run("create-tags", &args, cancel).map(|_| ())
    }

    fn find_by_address(&self, address: &str, cancel: &CancelToken) -> Result<String> {
        let args = vec![
            "describe-instances".to_string(),
            "--filters".into(),
            format!("Name=ip-address,Values={address}"),
        ];
        let out: DescribeInstancesOutput = self.run_json("describe-instances", &args, cancel)?;
        out.reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .find_map(|i| i.instance_id)
            .ok_or_else(|| Error::msg(format!("no instance found with address {address}")))
    }
}
