//! Runtime client contract and the types that cross it.
//!
//! The orchestrator, scheduler and discovery loop only ever talk to an
//! `Arc<dyn RuntimeClient>`. The LXD REST implementation lives in [`lxd`];
//! an in-memory double for tests lives in [`mock`].

pub mod lxd;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Handle of an asynchronous runtime operation (copy, start, stop, delete).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationHandle(pub String);

/// The writable part of an instance's configuration.
///
/// Fields the runtime reports but does not accept on update are dropped on
/// read, so a fetched descriptor can be pushed back as-is.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub stateful: bool,
    #[serde(default)]
    pub description: String,
}

impl InstanceDescriptor {
    /// Override the root disk size. A zero quota leaves the devices alone and
    /// returns `false`.
    pub fn apply_disk_quota(&mut self, disk_gb: u64) -> bool {
        if disk_gb == 0 {
            return false;
        }
        let pool = self
            .devices
            .get("root")
            .and_then(|device| device.get("pool"))
            .cloned();
        let mut root = BTreeMap::new();
        root.insert("type".to_string(), "disk".to_string());
        root.insert("path".to_string(), "/".to_string());
        root.insert("size".to_string(), format!("{disk_gb}GB"));
        if let Some(pool) = pool {
            root.insert("pool".to_string(), pool);
        }
        self.devices.insert("root".to_string(), root);
        true
    }
}

/// One address reported on an instance interface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceAddress {
    /// `inet` or `inet6`.
    #[serde(default)]
    pub family: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub netmask: String,
    /// `global`, `link`, `local`...
    #[serde(default)]
    pub scope: String,
}

impl InterfaceAddress {
    pub fn new(family: &str, address: &str, scope: &str) -> Self {
        Self {
            family: family.to_string(),
            address: address.to_string(),
            netmask: String::new(),
            scope: scope.to_string(),
        }
    }
}

/// Interface name -> addresses, as seen at one point in time.
pub type NetworkState = BTreeMap<String, Vec<InterfaceAddress>>;

/// Call surface over the container runtime.
///
/// Every method maps to one runtime request. Long-running requests return an
/// [`OperationHandle`] that must be passed to [`RuntimeClient::await_completion`].
#[async_trait::async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Copy `template_name` into a new, stopped instance. `limits` are
    /// instance config keys; `user_data` is the cloud-init payload, if any.
    ///
    /// Fails if an instance called `instance_name` already exists.
    async fn copy_template(
        &self,
        template_name: &str,
        instance_name: &str,
        limits: &BTreeMap<String, String>,
        user_data: Option<&str>,
    ) -> Result<OperationHandle>;

    /// Block until the operation finishes; error if it did not succeed.
    async fn await_completion(&self, operation: &OperationHandle) -> Result<()>;

    async fn get_instance_descriptor(&self, instance_name: &str) -> Result<InstanceDescriptor>;

    async fn update_instance_descriptor(
        &self,
        instance_name: &str,
        descriptor: &InstanceDescriptor,
    ) -> Result<()>;

    async fn start_instance(&self, instance_name: &str) -> Result<OperationHandle>;

    async fn get_instance_network_state(&self, instance_name: &str) -> Result<NetworkState>;

    /// Stop (forcefully) and delete the instance. An instance that does not
    /// exist is already in the desired state and is reported as success.
    async fn force_delete(&self, instance_name: &str) -> Result<()>;

    /// Names of every instance the runtime knows about, templates included.
    async fn list_instances(&self) -> Result<Vec<String>>;
}
