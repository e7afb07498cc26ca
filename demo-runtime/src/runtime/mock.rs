//! In-memory runtime double.
//!
//! Tracks call counts via atomics and keeps a map of live instances so the
//! collision and "already absent" paths behave like the real runtime. Each
//! step can be made to fail independently.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{InstanceDescriptor, NetworkState, OperationHandle, RuntimeClient};
use crate::error::{LeaseError, Result};

#[derive(Clone, Debug, Default)]
pub struct MockInstance {
    pub template_name: String,
    pub descriptor: InstanceDescriptor,
    pub user_data: Option<String>,
    pub running: bool,
}

#[derive(Default)]
pub struct MockRuntime {
    pub instances: Mutex<BTreeMap<String, MockInstance>>,
    /// Network states returned by successive polls; once drained,
    /// `default_network` is returned.
    pub network_script: Mutex<VecDeque<NetworkState>>,
    pub default_network: Mutex<NetworkState>,
    pub updates: Mutex<Vec<(String, InstanceDescriptor)>>,
    pub deleted: Mutex<Vec<String>>,
    operations: Mutex<HashMap<String, String>>,

    pub copy_count: AtomicUsize,
    pub update_count: AtomicUsize,
    pub start_count: AtomicUsize,
    pub network_polls: AtomicUsize,
    pub force_delete_count: AtomicUsize,
    next_operation: AtomicUsize,

    pub fail_copy: AtomicBool,
    pub fail_await: AtomicBool,
    pub fail_descriptor: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_network: AtomicBool,
    pub fail_delete: AtomicBool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every poll reports this state.
    pub fn with_network(network: NetworkState) -> Self {
        let mock = Self::new();
        *mock.default_network.lock().unwrap() = network;
        mock
    }

    pub fn push_network(&self, network: NetworkState) {
        self.network_script.lock().unwrap().push_back(network);
    }

    /// Register an instance that exists outside any lease (templates,
    /// foreign instances, leftovers).
    pub fn insert_instance(&self, name: &str) {
        self.instances.lock().unwrap().insert(
            name.to_string(),
            MockInstance {
                running: true,
                ..Default::default()
            },
        );
    }

    pub fn exists(&self, name: &str) -> bool {
        self.instances.lock().unwrap().contains_key(name)
    }

    pub fn instance(&self, name: &str) -> Option<MockInstance> {
        self.instances.lock().unwrap().get(name).cloned()
    }

    pub fn deleted_names(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    fn check(&self, flag: &AtomicBool, step: &str) -> Result<()> {
        if flag.load(Ordering::Relaxed) {
            return Err(LeaseError::Runtime(format!("Mock {step} failure")));
        }
        Ok(())
    }

    fn operation(&self, kind: &str) -> OperationHandle {
        let id = self.next_operation.fetch_add(1, Ordering::Relaxed);
        let path = format!("/1.0/operations/mock-{id}");
        self.operations
            .lock()
            .unwrap()
            .insert(path.clone(), kind.to_string());
        OperationHandle(path)
    }
}

#[async_trait::async_trait]
impl RuntimeClient for MockRuntime {
    async fn copy_template(
        &self,
        template_name: &str,
        instance_name: &str,
        limits: &BTreeMap<String, String>,
        user_data: Option<&str>,
    ) -> Result<OperationHandle> {
        self.copy_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_copy, "copy")?;

        let mut instances = self.instances.lock().unwrap();
        if instances.contains_key(instance_name) {
            return Err(LeaseError::Runtime(format!(
                "Instance '{instance_name}' already exists"
            )));
        }
        instances.insert(
            instance_name.to_string(),
            MockInstance {
                template_name: template_name.to_string(),
                descriptor: InstanceDescriptor {
                    config: limits.clone(),
                    profiles: vec!["default".to_string()],
                    ..Default::default()
                },
                user_data: user_data.map(str::to_string),
                running: false,
            },
        );
        drop(instances);
        Ok(self.operation("copy"))
    }

    async fn await_completion(&self, operation: &OperationHandle) -> Result<()> {
        self.check(&self.fail_await, "await")?;
        if !self.operations.lock().unwrap().contains_key(&operation.0) {
            return Err(LeaseError::Runtime(format!(
                "Unknown operation {}",
                operation.0
            )));
        }
        Ok(())
    }

    async fn get_instance_descriptor(&self, instance_name: &str) -> Result<InstanceDescriptor> {
        self.check(&self.fail_descriptor, "descriptor")?;
        self.instances
            .lock()
            .unwrap()
            .get(instance_name)
            .map(|instance| instance.descriptor.clone())
            .ok_or_else(|| LeaseError::Runtime(format!("Instance '{instance_name}' not found")))
    }

    async fn update_instance_descriptor(
        &self,
        instance_name: &str,
        descriptor: &InstanceDescriptor,
    ) -> Result<()> {
        self.update_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_update, "update")?;
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(instance_name)
            .ok_or_else(|| LeaseError::Runtime(format!("Instance '{instance_name}' not found")))?;
        instance.descriptor = descriptor.clone();
        self.updates
            .lock()
            .unwrap()
            .push((instance_name.to_string(), descriptor.clone()));
        Ok(())
    }

    async fn start_instance(&self, instance_name: &str) -> Result<OperationHandle> {
        self.start_count.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_start, "start")?;
        let mut instances = self.instances.lock().unwrap();
        let instance = instances
            .get_mut(instance_name)
            .ok_or_else(|| LeaseError::Runtime(format!("Instance '{instance_name}' not found")))?;
        instance.running = true;
        drop(instances);
        Ok(self.operation("start"))
    }

    async fn get_instance_network_state(&self, instance_name: &str) -> Result<NetworkState> {
        self.network_polls.fetch_add(1, Ordering::Relaxed);
        self.check(&self.fail_network, "network state")?;
        if !self.exists(instance_name) {
            return Err(LeaseError::Runtime(format!(
                "Instance '{instance_name}' not found"
            )));
        }
        if let Some(next) = self.network_script.lock().unwrap().pop_front() {
            return Ok(next);
        }
        Ok(self.default_network.lock().unwrap().clone())
    }

    async fn force_delete(&self, instance_name: &str) -> Result<()> {
        self.force_delete_count.fetch_add(1, Ordering::Relaxed);
        self.deleted
            .lock()
            .unwrap()
            .push(instance_name.to_string());
        self.check(&self.fail_delete, "delete")?;
        // Absent instances count as deleted.
        self.instances.lock().unwrap().remove(instance_name);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<String>> {
        Ok(self.instances.lock().unwrap().keys().cloned().collect())
    }
}
