pub mod aws;

use tracing::info;

use crate::config::{CommonConfig, ServiceConfig};
use crate::error::{Error, Result};
use crate::executor::CancelToken;

pub use aws::AwsCliProvider;

/// What to ask the compute provider for in one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image: String,
    pub instance_type: String,
    pub count: u32,
    pub security_group_id: String,
    pub key_name: String,
    /// Root volume size; `None` keeps the image default.
    pub disk_size_gib: Option<u32>,
}

impl LaunchSpec {
    pub fn for_service(svc: &ServiceConfig, common: &CommonConfig) -> Self {
        Self {
            image: svc.ami.trim().to_string(),
            instance_type: svc.instance_type.trim().to_string(),
            count: svc.count,
            security_group_id: common.security_group_id.trim().to_string(),
            key_name: common.key_name.trim().to_string(),
            disk_size_gib: (common.disk_size_gib > 0).then_some(common.disk_size_gib),
        }
    }
}

/// Narrow view of the cloud API the engine relies on.
pub trait ComputeProvider: Send + Sync {
    /// Launch `spec.count` instances; ids come back in launch order.
    fn launch(&self, spec: &LaunchSpec, cancel: &CancelToken) -> Result<Vec<String>>;
    fn await_running(&self, ids: &[String], cancel: &CancelToken) -> Result<()>;
    fn public_addresses(&self, ids: &[String], cancel: &CancelToken) -> Result<Vec<String>>;
    fn tag(&self, id: &str, name: &str, cancel: &CancelToken) -> Result<()>;
    fn find_by_address(&self, address: &str, cancel: &CancelToken) -> Result<String>;
}

pub struct Provisioner<'a> {
    provider: &'a dyn ComputeProvider,
}

impl<'a> Provisioner<'a> {
    pub fn new(provider: &'a dyn ComputeProvider) -> Self {
        Self { provider }
    }

    /// Launch one role batch and name each instance `{tag_prefix}-{role}-{n}`.
    pub fn launch_batch(
        &self,
        svc: &ServiceConfig,
        common: &CommonConfig,
        cancel: &CancelToken,
    ) -> Result<Vec<String>> {
        let spec = LaunchSpec::for_service(svc, common);
        let ids = self
            .provider
            .launch(&spec, cancel)
            .map_err(|e| {
                e.context(format!(
                    "launch {} instance(s) for '{}'",
                    spec.count, svc.role
                ))
            })?;
        for (idx, id) in ids.iter().enumerate() {
            let name = svc.instance_name(idx + 1);
            self.provider
                .tag(id, &name, cancel)
                .map_err(|e| e.context(format!("tag instance {id} as {name}")))?;
        }
        info!(role = %svc.role, ids = ?ids, "instances launched");
        Ok(ids)
    }

    pub fn await_running(&self, ids: &[String], cancel: &CancelToken) -> Result<()> {
        self.provider.await_running(ids, cancel)
    }

    pub fn resolve_addresses(&self, ids: &[String], cancel: &CancelToken) -> Result<Vec<String>> {
        let addresses: Vec<String> = self
            .provider
            .public_addresses(ids, cancel)?
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect();
        if addresses.is_empty() {
            return Err(Error::msg(format!(
                "no public address resolved for {} instance(s)",
                ids.len()
            )));
        }
        Ok(addresses)
    }

    /// Look the instance up by address and (re)apply its name tag.
    pub fn retag_by_address(
        &self,
        address: &str,
        name: &str,
        cancel: &CancelToken,
    ) -> Result<String> {
        let id = self
            .provider
            .find_by_address(address, cancel)
            .map_err(|e| e.context(format!("find instance for {address}")))?;
        self.provider
            .tag(&id, name, cancel)
            .map_err(|e| e.context(format!("tag instance {id} as {name}")))?;
        Ok(id)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// In-memory provider: instance `i-N` gets address `addresses[N]`.
    #[derive(Default)]
    pub struct StubProvider {
        pub addresses: Vec<String>,
        pub fail_tag: bool,
        pub tags: Mutex<BTreeMap<String, String>>,
        pub launched: Mutex<Vec<LaunchSpec>>,
    }

    impl StubProvider {
        pub fn with_addresses(addresses: &[&str]) -> Self {
            Self {
                addresses: addresses.iter().map(|s| s.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl ComputeProvider for StubProvider {
        fn launch(&self, spec: &LaunchSpec, _cancel: &CancelToken) -> Result<Vec<String>> {
            self.launched.lock().expect("lock").push(spec.clone());
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
            if self.fail_tag {
                return Err(Error::msg("UnauthorizedOperation"));
            }
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
}

#[cfg(test)]
mod tests {
    use super::testing::StubProvider;
    use super::*;

    fn op_service(count: u32) -> ServiceConfig {
        ServiceConfig {
            role: "op".into(),
            ami: "ami-1".into(),
            instance_type: "m6i.large".into(),
            tag_prefix: "ydyl".into(),
            count,
            remote_cmd: None,
        }
    }

    #[test]
    fn batch_is_tagged_in_launch_order() {
        let stub = StubProvider::with_addresses(&["10.0.0.1", "10.0.0.2"]);
        let common = CommonConfig {
            disk_size_gib: 200,
            ..CommonConfig::default()
        };
        let ids = Provisioner::new(&stub)
            .launch_batch(&op_service(2), &common, &CancelToken::new())
            .expect("launch");
        assert_eq!(ids, ["i-0", "i-1"]);
        let tags = stub.tags.lock().expect("lock");
        assert_eq!(tags.get("i-0").map(String::as_str), Some("ydyl-op-1"));
        assert_eq!(tags.get("i-1").map(String::as_str), Some("ydyl-op-2"));
        assert_eq!(
            stub.launched.lock().expect("lock")[0].disk_size_gib,
            Some(200)
        );
    }

    #[test]
    fn tagging_error_is_fatal() {
        let stub = StubProvider {
            fail_tag: true,
            ..StubProvider::with_addresses(&["10.0.0.1"])
        };
        let err = Provisioner::new(&stub)
            .launch_batch(&op_service(1), &CommonConfig::default(), &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("tag instance i-0"), "{err}");
    }

    #[test]
    fn zero_resolved_addresses_is_fatal() {
        let stub = StubProvider::with_addresses(&[]);
        let err = Provisioner::new(&stub)
            .resolve_addresses(&["i-0".into(), "i-1".into()], &CancelToken::new())
            .unwrap_err();
        assert!(err.to_string().contains("no public address"), "{err}");
    }
}
