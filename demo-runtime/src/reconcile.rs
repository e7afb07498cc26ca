//! Cleanup of instances whose expiry teardown did not take.
//!
//! Expiry is best-effort: a failed force-delete still marks the lease
//! expired. This pass re-scans the runtime and removes instances that only
//! expired leases point at.

use std::collections::HashSet;

use blueprint_sdk::{error, info};

use crate::error::Result;
use crate::metrics::LeaseMetrics;
use crate::runtime::RuntimeClient;
use crate::store::LeaseStore;

/// Force-delete runtime instances named by an expired lease and by no live
/// lease. Returns how many instances were removed.
///
/// `claim` reserves a name against provisioning for the duration of one
/// delete; names it cannot reserve (a provisioning flow holds them) are
/// skipped. Once reserved, the store is read again so a lease persisted
/// after the initial scan keeps its instance.
///
/// Instances no lease knows about, templates included, are never touched.
pub async fn reap_leaked_instances<F, G>(
    runtime: &dyn RuntimeClient,
    store: &dyn LeaseStore,
    metrics: &LeaseMetrics,
    claim: F,
) -> Result<usize>
where
    F: Fn(&str) -> Option<G>,
{
    let instances = runtime.list_instances().await?;
    let leases = store.list().await?;

    let mut expired = HashSet::new();
    let mut live = HashSet::new();
    for lease in &leases {
        if lease.is_expired() {
            expired.insert(lease.instance_name.as_str());
        } else {
            live.insert(lease.instance_name.as_str());
        }
    }

    let mut reaped = 0;
    for name in instances {
        if !expired.contains(name.as_str()) || live.contains(name.as_str()) {
            continue;
        }
        let Some(_guard) = claim(&name) else {
            continue;
        };
        let now_live = store
            .list_non_expired()
            .await?
            .iter()
            .any(|lease| lease.instance_name == name);
        if now_live {
            info!("reconcile: {name} was re-leased during the scan, keeping it");
            continue;
        }
        info!("reconcile: deleting leaked instance {name}");
        match runtime.force_delete(&name).await {
            Ok(()) => {
                metrics.record_leaked_reaped();
                reaped += 1;
            }
            Err(err) => error!("reconcile: failed to delete {name}: {err}"),
        }
    }
    Ok(reaped)
}
