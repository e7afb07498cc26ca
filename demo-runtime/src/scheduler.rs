//! One-shot expiry timers for active leases.
//!
//! Each armed lease gets its own lightweight tokio task that sleeps until
//! `expires_at` and then tears the instance down. The set of armed lease ids
//! is kept in a map so a lease can never be armed twice.

use std::sync::Arc;
use std::time::Duration;

use blueprint_sdk::{error, info, warn};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

use crate::error::Result;
use crate::metrics::LeaseMetrics;
use crate::runtime::RuntimeClient;
use crate::store::LeaseStore;
use crate::util::now_ts;

/// What `recover_on_startup` did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Past-due leases torn down before serving.
    pub torn_down: usize,
    /// Leases with time left, armed for the remainder.
    pub armed: usize,
}

pub struct ExpiryScheduler {
    runtime: Arc<dyn RuntimeClient>,
    store: Arc<dyn LeaseStore>,
    metrics: Arc<LeaseMetrics>,
    /// lease id -> fire time (unix seconds) for timers that have not fired.
    armed: DashMap<String, u64>,
}

impl ExpiryScheduler {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        store: Arc<dyn LeaseStore>,
        metrics: Arc<LeaseMetrics>,
    ) -> Self {
        Self {
            runtime,
            store,
            metrics,
            armed: DashMap::new(),
        }
    }

    /// Schedule teardown of `instance_name` at `fire_at` (unix seconds).
    ///
    /// Returns `false` without scheduling anything if `lease_id` already has
    /// a pending timer. A `fire_at` in the past fires on the next tick.
    pub fn arm(self: &Arc<Self>, lease_id: &str, instance_name: &str, fire_at: u64) -> bool {
        match self.armed.entry(lease_id.to_string()) {
            Entry::Occupied(_) => {
                warn!("expiry: lease {lease_id} already armed, ignoring second arm");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(fire_at);
                let delay = Duration::from_secs(fire_at.saturating_sub(now_ts()));
                let scheduler = Arc::clone(self);
                let lease_id = lease_id.to_string();
                let instance_name = instance_name.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    scheduler.expire(&lease_id, &instance_name).await;
                    scheduler.armed.remove(&lease_id);
                });
                true
            }
        }
    }

    pub fn is_armed(&self, lease_id: &str) -> bool {
        self.armed.contains_key(lease_id)
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Timer-fired teardown. Returns whether both steps succeeded.
    pub async fn expire(&self, lease_id: &str, instance_name: &str) -> bool {
        info!("expiry: lease {lease_id} due, deleting {instance_name}");
        let (clean, marked) = self.teardown(lease_id, instance_name).await;
        if marked {
            self.metrics.record_expired();
        }
        clean
    }

    /// Force-delete then mark expired. Both steps always run; failures are
    /// logged and not retried. Returns `(both succeeded, marked expired)`.
    async fn teardown(&self, lease_id: &str, instance_name: &str) -> (bool, bool) {
        let mut clean = true;

        if let Err(err) = self.runtime.force_delete(instance_name).await {
            error!("expiry: failed to delete {instance_name} for lease {lease_id}: {err}");
            clean = false;
        }

        let marked = match self.store.mark_expired(lease_id).await {
            Ok(()) => true,
            Err(err) => {
                error!("expiry: failed to mark lease {lease_id} expired: {err}");
                clean = false;
                false
            }
        };

        if !clean {
            self.metrics.record_teardown_failure();
        }
        (clean, marked)
    }

    /// Re-establish expiry for every non-expired lease in the store.
    ///
    /// Past-due leases are torn down before this returns; the rest are armed
    /// for their remaining time. Must complete before new provisioning
    /// requests are accepted.
    #[tracing::instrument(name = "recover", skip(self))]
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<RecoveryReport> {
        let leases = self.store.list_non_expired().await?;
        let now = now_ts();
        let mut report = RecoveryReport::default();

        for lease in leases {
            if lease.expires_at <= now {
                info!(
                    "recover: lease {} expired {}s ago, deleting {}",
                    lease.id,
                    now - lease.expires_at,
                    lease.instance_name
                );
                let (_, marked) = self.teardown(&lease.id, &lease.instance_name).await;
                if marked {
                    self.metrics.record_recovered_expired();
                }
                report.torn_down += 1;
            } else if self.arm(&lease.id, &lease.instance_name, lease.expires_at) {
                info!(
                    "recover: lease {} re-armed, {}s remaining",
                    lease.id,
                    lease.remaining_secs(now)
                );
                self.metrics.record_recovered_armed();
                report.armed += 1;
            }
        }

        info!(
            "recover: {} lease(s) torn down, {} re-armed",
            report.torn_down, report.armed
        );
        Ok(report)
    }
}
