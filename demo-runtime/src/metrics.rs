//! Lease lifecycle counters.
//!
//! Plain atomics read periodically by the status endpoint; relaxed ordering
//! is enough since no decision is taken on their values.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct LeaseMetrics {
    /// Leases successfully provisioned since startup.
    pub provisioned: AtomicU64,
    /// Provisioning flows that ended in an error.
    pub provision_failures: AtomicU64,
    /// Provisions that went ahead without an address.
    pub discovery_timeouts: AtomicU64,
    /// Leases transitioned to Expired (timer or recovery).
    pub expired: AtomicU64,
    /// Expiry teardowns where the delete or the store write failed.
    pub teardown_failures: AtomicU64,
    /// Past-due leases torn down during startup recovery.
    pub recovered_expired: AtomicU64,
    /// Leases re-armed during startup recovery.
    pub recovered_armed: AtomicU64,
    /// Leftover instances of expired leases removed by reconciliation.
    pub leaked_reaped: AtomicU64,
    pub active_leases: AtomicU64,
    pub peak_leases: AtomicU64,
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_provisioned(&self) {
        self.provisioned.fetch_add(1, Ordering::Relaxed);
        self.lease_activated();
    }

    pub fn record_provision_failure(&self) {
        self.provision_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery_timeout(&self) {
        self.discovery_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_leases
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_teardown_failure(&self) {
        self.teardown_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A past-due lease torn down at startup was never counted as active in
    /// this process, so only the totals move.
    pub fn record_recovered_expired(&self) {
        self.recovered_expired.fetch_add(1, Ordering::Relaxed);
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    /// A lease found still running at startup counts as active again.
    pub fn record_recovered_armed(&self) {
        self.recovered_armed.fetch_add(1, Ordering::Relaxed);
        self.lease_activated();
    }

    pub fn record_leaked_reaped(&self) {
        self.leaked_reaped.fetch_add(1, Ordering::Relaxed);
    }

    fn lease_activated(&self) {
        let current = self.active_leases.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_leases.fetch_max(current, Ordering::Relaxed);
    }

    /// All counters as key-value pairs.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        vec![
            ("provisioned".into(), self.provisioned.load(Ordering::Relaxed)),
            (
                "provision_failures".into(),
                self.provision_failures.load(Ordering::Relaxed),
            ),
            (
                "discovery_timeouts".into(),
                self.discovery_timeouts.load(Ordering::Relaxed),
            ),
            ("expired".into(), self.expired.load(Ordering::Relaxed)),
            (
                "teardown_failures".into(),
                self.teardown_failures.load(Ordering::Relaxed),
            ),
            (
                "recovered_expired".into(),
                self.recovered_expired.load(Ordering::Relaxed),
            ),
            (
                "recovered_armed".into(),
                self.recovered_armed.load(Ordering::Relaxed),
            ),
            (
                "leaked_reaped".into(),
                self.leaked_reaped.load(Ordering::Relaxed),
            ),
            (
                "active_leases".into(),
                self.active_leases.load(Ordering::Relaxed),
            ),
            ("peak_leases".into(), self.peak_leases.load(Ordering::Relaxed)),
        ]
    }
}
