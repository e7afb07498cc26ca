//! Provisioning workflow: name derivation, runtime calls, discovery,
//! persistence and expiry registration, with compensating teardown on
//! failure.

use std::sync::Arc;

use blueprint_sdk::{error, info, warn};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::config::LeaseConfig;
use crate::credentials::{Credentials, cloud_init_user_data, generate_credentials};
use crate::discovery::{AddressDiscovery, AddressFamily};
use crate::error::{LeaseError, Result};
use crate::lease::{Lease, LeaseResult, LeaseState, derive_instance_name};
use crate::metrics::LeaseMetrics;
use crate::provision_progress::{ProvisionPhase, ProvisionTracker};
use crate::runtime::RuntimeClient;
use crate::scheduler::ExpiryScheduler;
use crate::store::LeaseStore;
use crate::util::now_ts;
use crate::CONSOLE_ONLY_ADDRESS;

/// Claim owner recorded while reconciliation deletes an instance.
const RECONCILE_CLAIM: &str = "reconcile";

pub struct LifecycleOrchestrator {
    runtime: Arc<dyn RuntimeClient>,
    store: Arc<dyn LeaseStore>,
    scheduler: Arc<ExpiryScheduler>,
    discovery: AddressDiscovery,
    config: LeaseConfig,
    metrics: Arc<LeaseMetrics>,
    progress: ProvisionTracker,
    /// Instance names with a provisioning flow in progress.
    in_flight: DashMap<String, String>,
}

/// Holds an instance name for the lifetime of one provisioning flow.
struct NameClaim<'a> {
    in_flight: &'a DashMap<String, String>,
    name: String,
}

impl Drop for NameClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.name);
    }
}

impl LifecycleOrchestrator {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        store: Arc<dyn LeaseStore>,
        scheduler: Arc<ExpiryScheduler>,
        config: LeaseConfig,
        metrics: Arc<LeaseMetrics>,
    ) -> Self {
        let discovery = AddressDiscovery::new(runtime.clone(), config.discovery.clone());
        Self {
            runtime,
            store,
            scheduler,
            discovery,
            config,
            metrics,
            progress: ProvisionTracker::new(),
            in_flight: DashMap::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<LeaseMetrics> {
        &self.metrics
    }

    pub fn progress(&self) -> &ProvisionTracker {
        &self.progress
    }

    pub fn scheduler(&self) -> &Arc<ExpiryScheduler> {
        &self.scheduler
    }

    /// Number of provisioning flows currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Create a leased instance of `template_name` for `owner_id`.
    ///
    /// On success the lease is persisted and its expiry armed. On failure
    /// nothing is persisted and any instance this call created has been
    /// force-deleted. A second concurrent request deriving the same instance
    /// name is rejected without touching the runtime.
    #[tracing::instrument(name = "provision", skip_all, fields(owner = owner_id, template = template_name))]
    pub async fn provision_instance(
        &self,
        owner_id: &str,
        template_name: &str,
        origin: &str,
    ) -> Result<LeaseResult> {
        let instance_name = derive_instance_name(template_name, owner_id)?;
        let lease_id = uuid::Uuid::new_v4().to_string();

        let Some(_claim) = self.claim(&instance_name, &lease_id) else {
            warn!("provision: {instance_name} already being provisioned, rejecting {origin}");
            self.metrics.record_provision_failure();
            return Err(LeaseError::Provisioning(format!(
                "Instance '{instance_name}' is already being provisioned"
            )));
        };

        info!("provision: lease {lease_id} creating {instance_name} from {template_name} for {origin}");
        self.progress.start(&lease_id, &instance_name);

        match self
            .run(&lease_id, owner_id, template_name, &instance_name, origin)
            .await
        {
            Ok(lease) => {
                self.progress.update(
                    &lease_id,
                    ProvisionPhase::Ready,
                    Some("Instance ready".into()),
                );
                self.metrics.record_provisioned();
                info!(
                    "provision: lease {lease_id} active, {instance_name} expires at {}",
                    lease.expires_at
                );
                Ok(self.lease_result(&lease))
            }
            Err(err) => {
                error!("provision: lease {lease_id} for {instance_name} failed: {err}");
                self.progress
                    .update(&lease_id, ProvisionPhase::Failed, Some(err.to_string()));
                self.metrics.record_provision_failure();
                Err(err)
            }
        }
    }

    fn claim(&self, instance_name: &str, lease_id: &str) -> Option<NameClaim<'_>> {
        match self.in_flight.entry(instance_name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(lease_id.to_string());
                Some(NameClaim {
                    in_flight: &self.in_flight,
                    name: instance_name.to_string(),
                })
            }
        }
    }

    async fn run(
        &self,
        lease_id: &str,
        owner_id: &str,
        template_name: &str,
        instance_name: &str,
        origin: &str,
    ) -> Result<Lease> {
        let credentials = self.config.network_enabled.then(generate_credentials);
        let user_data = credentials.as_ref().map(cloud_init_user_data);
        let limits = self.config.quota.instance_config();

        // A failed copy may be a collision with somebody else's live
        // instance, so nothing is deleted here.
        self.phase(lease_id, ProvisionPhase::Copying, "Copying template");
        let operation = self
            .runtime
            .copy_template(template_name, instance_name, &limits, user_data.as_deref())
            .await
            .map_err(|err| provisioning("copy", err))?;
        self.runtime
            .await_completion(&operation)
            .await
            .map_err(|err| provisioning("copy", err))?;

        // From here on the instance is ours.
        self.phase(lease_id, ProvisionPhase::Configuring, "Applying quotas");
        if let Err(err) = self.configure(instance_name).await {
            return Err(self.abort(instance_name, provisioning("configure", err)).await);
        }

        self.phase(lease_id, ProvisionPhase::Starting, "Starting instance");
        if let Err(err) = self.start(instance_name).await {
            return Err(self.abort(instance_name, provisioning("start", err)).await);
        }

        let address = if self.config.network_enabled {
            self.phase(lease_id, ProvisionPhase::Discovering, "Waiting for network");
            let family = AddressFamily::from_ipv6_only(self.config.discovery.ipv6_only);
            match self.discovery.discover(instance_name, family).await {
                Ok(Some(address)) => address,
                Ok(None) => {
                    warn!("provision: no address for {instance_name}, continuing without one");
                    self.metrics.record_discovery_timeout();
                    String::new()
                }
                Err(err) => {
                    return Err(self.abort(instance_name, provisioning("discovery", err)).await);
                }
            }
        } else {
            CONSOLE_ONLY_ADDRESS.to_string()
        };

        let created_at = now_ts();
        let Credentials { username, password } = credentials.unwrap_or_default();
        let lease = Lease {
            id: lease_id.to_string(),
            owner_id: owner_id.to_string(),
            template_name: template_name.to_string(),
            instance_name: instance_name.to_string(),
            address,
            username,
            password,
            created_at,
            expires_at: created_at + self.config.lease_duration_secs,
            origin: origin.to_string(),
            state: LeaseState::Active,
            expired_at: None,
        };

        self.phase(lease_id, ProvisionPhase::Persisting, "Recording lease");
        if let Err(err) = self.store.insert(&lease).await {
            let err = LeaseError::Persistence(format!("Failed to record lease: {err}"));
            return Err(self.abort(instance_name, err).await);
        }

        if !self
            .scheduler
            .arm(&lease.id, &lease.instance_name, lease.expires_at)
        {
            warn!("provision: lease {lease_id} was already armed");
        }

        Ok(lease)
    }

    async fn configure(&self, instance_name: &str) -> Result<()> {
        let mut descriptor = self.runtime.get_instance_descriptor(instance_name).await?;
        descriptor.apply_disk_quota(self.config.quota.disk_gb);
        self.runtime
            .update_instance_descriptor(instance_name, &descriptor)
            .await
    }

    async fn start(&self, instance_name: &str) -> Result<()> {
        let operation = self.runtime.start_instance(instance_name).await?;
        self.runtime.await_completion(&operation).await
    }

    /// Compensating teardown. Returns `err` so callers can propagate it.
    async fn abort(&self, instance_name: &str, err: LeaseError) -> LeaseError {
        warn!("provision: rolling back {instance_name}");
        if let Err(delete_err) = self.runtime.force_delete(instance_name).await {
            error!("provision: rollback of {instance_name} failed: {delete_err}");
        }
        err
    }

    fn phase(&self, lease_id: &str, phase: ProvisionPhase, message: &str) {
        self.progress.update(lease_id, phase, Some(message.to_string()));
    }

    /// The stored lease behind `lease_id`, expired ones excluded.
    ///
    /// A lease past its expiry time counts as expired even if the store still
    /// says `Active`: when marking it expired fails, the timer is gone and the
    /// record stays `Active` until the next startup recovery.
    pub async fn lease(&self, lease_id: &str) -> Result<Lease> {
        match self.store.get(lease_id).await? {
            Some(lease) if !lease.is_expired() && lease.remaining_secs(now_ts()) > 0 => Ok(lease),
            _ => Err(LeaseError::NotFound(format!("Lease '{lease_id}' not found"))),
        }
    }

    /// Result shape of a past `provision_instance`, straight from the store.
    /// Expired and overdue leases are `NotFound`.
    pub async fn get_existing_lease(&self, lease_id: &str) -> Result<LeaseResult> {
        let lease = self.lease(lease_id).await?;
        Ok(self.lease_result(&lease))
    }

    /// Caller-facing view of `lease` under this deployment's network mode.
    pub fn lease_result(&self, lease: &Lease) -> LeaseResult {
        LeaseResult::from_lease(lease, self.config.network_enabled, &self.config.fqdn_suffix)
    }

    pub async fn active_leases(&self) -> Result<Vec<Lease>> {
        self.store.list_non_expired().await
    }

    /// Remove instances left behind by failed expiry teardowns. Names with a
    /// provisioning flow in progress are left alone, and each delete holds
    /// the name so no flow can start on it meanwhile.
    pub async fn reap_leaked_instances(&self) -> Result<usize> {
        crate::reconcile::reap_leaked_instances(
            self.runtime.as_ref(),
            self.store.as_ref(),
            &self.metrics,
            |name| self.claim(name, RECONCILE_CLAIM),
        )
        .await
    }
}

fn provisioning(step: &str, err: LeaseError) -> LeaseError {
    LeaseError::Provisioning(format!("{step} failed: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiscoveryConfig, QuotaConfig};
    use crate::lease::LeaseStatus;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{InterfaceAddress, NetworkState};
    use crate::store::mock::InMemoryLeaseStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn reachable() -> NetworkState {
        let mut network = NetworkState::new();
        network.insert(
            "eth0".into(),
            vec![
                InterfaceAddress::new("inet", "169.254.1.1", "link"),
                InterfaceAddress::new("inet", "10.0.0.5", "global"),
            ],
        );
        network
    }

    fn config() -> LeaseConfig {
        LeaseConfig {
            lease_duration_secs: 120,
            quota: QuotaConfig {
                cpu: 2,
                memory_mb: 512,
                processes: 200,
                disk_gb: 0,
                nesting: true,
            },
            discovery: DiscoveryConfig {
                max_attempts: 3,
                ..DiscoveryConfig::default()
            },
            ..LeaseConfig::default()
        }
    }

    struct Harness {
        runtime: Arc<MockRuntime>,
        store: Arc<InMemoryLeaseStore>,
        orchestrator: LifecycleOrchestrator,
    }

    fn harness_with(runtime: MockRuntime, config: LeaseConfig) -> Harness {
        let runtime = Arc::new(runtime);
        let store = Arc::new(InMemoryLeaseStore::new());
        let metrics = Arc::new(LeaseMetrics::new());
        let scheduler = Arc::new(ExpiryScheduler::new(
            runtime.clone(),
            store.clone(),
            metrics.clone(),
        ));
        let orchestrator =
            LifecycleOrchestrator::new(runtime.clone(), store.clone(), scheduler, config, metrics);
        Harness {
            runtime,
            store,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(MockRuntime::with_network(reachable()), config())
    }

    #[tokio::test(start_paused = true)]
    async fn provisions_alice() {
        let h = harness();
        let before = now_ts();
        let result = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        assert!(!result.id.is_empty());
        assert!(result.expiry >= before + 120 && result.expiry <= now_ts() + 120);
        assert_eq!(result.status, LeaseStatus::Started);
        assert_eq!(result.ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(result.fqdn.as_deref(), Some("ubuntu-base-alice.lxd"));
        assert!(!result.username.as_deref().unwrap().is_empty());
        assert!(!result.password.as_deref().unwrap().is_empty());

        let stored = h.store.snapshot(&result.id).unwrap();
        assert_eq!(stored.expires_at, stored.created_at + 120);
        assert_eq!(stored.origin, "203.0.113.9");
        assert_eq!(stored.state, LeaseState::Active);
        assert!(h.orchestrator.scheduler().is_armed(&result.id));

        let instance = h.runtime.instance("ubuntu-base-alice").unwrap();
        assert!(instance.running);
        assert_eq!(instance.template_name, "ubuntu-base");
        let user_data = instance.user_data.unwrap();
        assert!(user_data.contains(result.username.as_deref().unwrap()));
        assert!(user_data.contains(result.password.as_deref().unwrap()));

        let again = h.orchestrator.get_existing_lease(&result.id).await.unwrap();
        assert_eq!(again.ip, result.ip);
        assert_eq!(again.username, result.username);
        assert_eq!(again.password, result.password);
        assert_eq!(again.fqdn, result.fqdn);
        assert_eq!(again.expiry, result.expiry);

        let progress = h.orchestrator.progress().get(&result.id).unwrap();
        assert_eq!(progress.phase, ProvisionPhase::Ready);
        assert_eq!(h.orchestrator.in_flight_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_lease_duration() {
        let h = harness();
        let result = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(200)).await;

        assert!(!h.runtime.exists("ubuntu-base-alice"));
        assert_eq!(h.runtime.force_delete_count.load(Ordering::SeqCst), 1);
        assert!(h.store.snapshot(&result.id).unwrap().is_expired());
        assert!(matches!(
            h.orchestrator.get_existing_lease(&result.id).await,
            Err(LeaseError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn quotas_reach_the_runtime() {
        let h = harness();
        h.orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        let instance = h.runtime.instance("ubuntu-base-alice").unwrap();
        let config = &instance.descriptor.config;
        assert_eq!(config.get("limits.cpu").map(String::as_str), Some("2"));
        assert_eq!(config.get("limits.memory").map(String::as_str), Some("512MB"));
        assert_eq!(config.get("limits.processes").map(String::as_str), Some("200"));
        assert_eq!(config.get("security.nesting").map(String::as_str), Some("true"));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_disk_quota_leaves_devices_alone() {
        let h = harness();
        h.orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        let updates = h.runtime.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].1.devices.contains_key("root"));
    }

    #[tokio::test(start_paused = true)]
    async fn disk_quota_sets_root_size() {
        let mut config = config();
        config.quota.disk_gb = 5;
        let h = harness_with(MockRuntime::with_network(reachable()), config);
        h.orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        let updates = h.runtime.updates.lock().unwrap().clone();
        let root = updates[0].1.devices.get("root").unwrap();
        assert_eq!(root.get("size").map(String::as_str), Some("5GB"));
        assert_eq!(root.get("path").map(String::as_str), Some("/"));
    }

    #[tokio::test(start_paused = true)]
    async fn copy_failure_deletes_nothing() {
        let h = harness();
        h.runtime.fail_copy.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap_err();

        assert!(matches!(err, LeaseError::Provisioning(_)));
        assert_eq!(h.runtime.force_delete_count.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.insert_count.load(Ordering::SeqCst), 0);
        assert_eq!(h.orchestrator.scheduler().armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn later_failures_roll_back() {
        for step in ["descriptor", "update", "start", "network"] {
            let h = harness();
            let flag = match step {
                "descriptor" => &h.runtime.fail_descriptor,
                "update" => &h.runtime.fail_update,
                "start" => &h.runtime.fail_start,
                _ => &h.runtime.fail_network,
            };
            flag.store(true, Ordering::SeqCst);

            let err = h
                .orchestrator
                .provision_instance("alice", "ubuntu-base", "203.0.113.9")
                .await
                .unwrap_err();

            assert!(matches!(err, LeaseError::Provisioning(_)), "{step}");
            assert!(!h.runtime.exists("ubuntu-base-alice"), "{step}");
            assert_eq!(
                h.runtime.deleted_names(),
                vec!["ubuntu-base-alice".to_string()],
                "{step}"
            );
            assert_eq!(h.store.insert_count.load(Ordering::SeqCst), 0, "{step}");
            assert_eq!(h.orchestrator.scheduler().armed_count(), 0, "{step}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_rolls_back() {
        let h = harness();
        h.store.fail_insert.store(true, Ordering::SeqCst);

        let err = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap_err();

        assert!(matches!(err, LeaseError::Persistence(_)));
        assert!(err.is_provisioning_failure());
        assert!(!h.runtime.exists("ubuntu-base-alice"));
        assert_eq!(h.orchestrator.scheduler().armed_count(), 0);
        assert_eq!(
            h.orchestrator.metrics().provision_failures.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_timeout_keeps_lease() {
        let h = harness_with(MockRuntime::new(), config());
        let result = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        assert_eq!(result.ip.as_deref(), Some(""));
        assert!(h.runtime.exists("ubuntu-base-alice"));
        assert!(h.orchestrator.scheduler().is_armed(&result.id));
        assert_eq!(
            h.orchestrator.metrics().discovery_timeouts.load(Ordering::SeqCst),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn console_only_skips_network() {
        let mut config = config();
        config.network_enabled = false;
        let h = harness_with(MockRuntime::new(), config);

        let result = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap();

        assert!(result.ip.is_none());
        assert!(result.username.is_none());
        assert!(result.password.is_none());
        assert!(result.fqdn.is_none());
        assert_eq!(h.runtime.network_polls.load(Ordering::SeqCst), 0);
        assert!(h.runtime.instance("ubuntu-base-alice").unwrap().user_data.is_none());
        assert_eq!(
            h.store.snapshot(&result.id).unwrap().address,
            CONSOLE_ONLY_ADDRESS
        );
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_same_name_rejected() {
        let h = harness();
        let (first, second) = tokio::join!(
            h.orchestrator
                .provision_instance("alice", "ubuntu-base", "203.0.113.9"),
            h.orchestrator
                .provision_instance("alice", "ubuntu-base", "203.0.113.10"),
        );

        assert!(first.is_ok());
        assert!(matches!(second, Err(LeaseError::Provisioning(_))));
        assert_eq!(h.runtime.copy_count.load(Ordering::SeqCst), 1);
        assert!(h.runtime.exists("ubuntu-base-alice"));
        assert_eq!(h.runtime.force_delete_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn existing_instance_collides_without_delete() {
        let h = harness();
        h.runtime.insert_instance("ubuntu-base-alice");

        let err = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap_err();

        assert!(matches!(err, LeaseError::Provisioning(_)));
        assert!(h.runtime.exists("ubuntu-base-alice"));
        assert_eq!(h.runtime.force_delete_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_owner_is_validation_error() {
        let h = harness();
        let err = h
            .orchestrator
            .provision_instance("al ice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Validation(_)));
        assert_eq!(h.runtime.copy_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_lease_not_found() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.get_existing_lease("missing").await,
            Err(LeaseError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn overdue_active_lease_not_found() {
        let h = harness();
        let now = now_ts();
        h.store.seed(Lease {
            id: "stuck".into(),
            owner_id: "alice".into(),
            template_name: "ubuntu-base".into(),
            instance_name: "ubuntu-base-alice".into(),
            address: "10.0.0.5".into(),
            username: "u".into(),
            password: "p".into(),
            created_at: now - 130,
            expires_at: now - 10,
            origin: "203.0.113.9".into(),
            state: LeaseState::Active,
            expired_at: None,
        });
        assert!(matches!(
            h.orchestrator.get_existing_lease("stuck").await,
            Err(LeaseError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_holds_name_against_provisioning() {
        let h = harness();
        let _claim = h.orchestrator.claim("ubuntu-base-alice", RECONCILE_CLAIM).unwrap();
        let err = h
            .orchestrator
            .provision_instance("alice", "ubuntu-base", "203.0.113.9")
            .await
            .unwrap_err();
        assert!(matches!(err, LeaseError::Provisioning(_)));
        assert_eq!(h.runtime.copy_count.load(Ordering::SeqCst), 0);
    }
}
