//! In-memory progress tracking for in-flight provisioning flows.
//!
//! A lease is in the logical `Provisioning` state exactly while it has a
//! non-terminal entry here; operators poll this instead of waiting for the
//! flow to finish.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::lease::LeaseState;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionPhase {
    Queued,
    Copying,
    Configuring,
    Starting,
    Discovering,
    Persisting,
    Ready,
    Failed,
}

impl ProvisionPhase {
    /// Progress percentage (0–100) for UI rendering.
    pub fn progress_pct(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Copying => 15,
            Self::Configuring => 35,
            Self::Starting => 50,
            Self::Discovering => 70,
            Self::Persisting => 90,
            Self::Ready => 100,
            Self::Failed => 0,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Lease state implied by this phase. A failed flow never produced a lease.
    pub fn lease_state(self) -> Option<LeaseState> {
        match self {
            Self::Ready => Some(LeaseState::Active),
            Self::Failed => None,
            _ => Some(LeaseState::Provisioning),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProvisionStatus {
    pub lease_id: String,
    pub instance_name: String,
    pub phase: ProvisionPhase,
    pub message: Option<String>,
    pub started_at: u64,
    pub updated_at: u64,
    pub progress_pct: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_state: Option<LeaseState>,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct ProvisionTracker {
    provisions: Mutex<HashMap<String, ProvisionStatus>>,
}

impl ProvisionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin tracking a new provision.
    pub fn start(&self, lease_id: &str, instance_name: &str) -> ProvisionStatus {
        let now = crate::util::now_ts();
        let status = ProvisionStatus {
            lease_id: lease_id.to_string(),
            instance_name: instance_name.to_string(),
            phase: ProvisionPhase::Queued,
            message: Some("Queued for provisioning".into()),
            started_at: now,
            updated_at: now,
            progress_pct: 0,
            lease_state: ProvisionPhase::Queued.lease_state(),
        };
        self.provisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(lease_id.to_string(), status.clone());
        status
    }

    /// Move a provision to `phase`. Returns the updated status.
    pub fn update(
        &self,
        lease_id: &str,
        phase: ProvisionPhase,
        message: Option<String>,
    ) -> Option<ProvisionStatus> {
        let now = crate::util::now_ts();
        let mut map = self.provisions.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.get_mut(lease_id)?;
        entry.phase = phase;
        entry.progress_pct = phase.progress_pct();
        entry.lease_state = phase.lease_state();
        entry.updated_at = now;
        if let Some(msg) = message {
            entry.message = Some(msg);
        }
        Some(entry.clone())
    }

    pub fn get(&self, lease_id: &str) -> Option<ProvisionStatus> {
        self.provisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(lease_id)
            .cloned()
    }

    /// Provisions that have not reached a terminal phase.
    pub fn list_active(&self) -> Vec<ProvisionStatus> {
        self.provisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|s| !s.phase.is_terminal())
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<ProvisionStatus> {
        self.provisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Remove terminal provisions older than `max_age_secs`.
    pub fn gc(&self, max_age_secs: u64) {
        let cutoff = crate::util::now_ts().saturating_sub(max_age_secs);
        self.provisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, s| !s.phase.is_terminal() || s.updated_at > cutoff);
    }
}
