//! Lease store contract and its file-backed implementation.

use std::path::{Path, PathBuf};

pub use blueprint_sdk::stores::local_database::{Error as StoreError, LocalDatabase};

use crate::error::{LeaseError, Result};
use crate::lease::{Lease, LeaseState};

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        LeaseError::Storage(err.to_string())
    }
}

/// Durable record of leases.
///
/// Implementations serialize their own writes and give read-your-writes
/// consistency per lease id. Records are never deleted through this trait.
#[async_trait::async_trait]
pub trait LeaseStore: Send + Sync {
    async fn insert(&self, lease: &Lease) -> Result<()>;

    /// `Ok(None)` when no lease has this id.
    async fn get(&self, lease_id: &str) -> Result<Option<Lease>>;

    /// Transition to `Expired`. Marking an already expired lease is a no-op.
    async fn mark_expired(&self, lease_id: &str) -> Result<()>;

    async fn list_non_expired(&self) -> Result<Vec<Lease>>;

    /// Every lease, expired ones included.
    async fn list(&self) -> Result<Vec<Lease>>;
}

/// Create the state directory with owner-only permissions if it is missing.
pub fn ensure_state_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|err| {
            LeaseError::Storage(format!("Failed to create {}: {err}", dir.display()))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).ok();
        }
    }
    Ok(())
}

/// Thin bridge from `LocalDatabase` to [`LeaseError`]. Keys are lease ids.
pub struct PersistentStore<V> {
    db: LocalDatabase<V>,
}

impl<V> PersistentStore<V>
where
    V: serde::Serialize + serde::de::DeserializeOwned + Clone,
{
    pub fn open(path: PathBuf) -> Result<Self> {
        let db = LocalDatabase::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.db.get(key)?)
    }

    pub fn values(&self) -> Result<Vec<V>> {
        Ok(self.db.values()?)
    }

    pub fn insert(&self, key: String, value: V) -> Result<()> {
        Ok(self.db.set(&key, value)?)
    }

    pub fn update<F>(&self, key: &str, f: F) -> Result<bool>
    where
        F: FnOnce(&mut V),
    {
        Ok(self.db.update(key, f)?)
    }
}

/// Leases kept in `leases.json` under the state directory.
pub struct LocalLeaseStore {
    leases: PersistentStore<Lease>,
}

impl LocalLeaseStore {
    pub fn open(state_dir: &Path) -> Result<Self> {
        ensure_state_dir(state_dir)?;
        let leases = PersistentStore::open(state_dir.join("leases.json"))?;
        Ok(Self { leases })
    }
}

#[async_trait::async_trait]
impl LeaseStore for LocalLeaseStore {
    async fn insert(&self, lease: &Lease) -> Result<()> {
        if self.leases.get(&lease.id)?.is_some() {
            return Err(LeaseError::Storage(format!(
                "Lease '{}' already exists",
                lease.id
            )));
        }
        self.leases.insert(lease.id.clone(), lease.clone())
    }

    async fn get(&self, lease_id: &str) -> Result<Option<Lease>> {
        self.leases.get(lease_id)
    }

    async fn mark_expired(&self, lease_id: &str) -> Result<()> {
        let now = crate::util::now_ts();
        let found = self.leases.update(lease_id, |lease| {
            if lease.state != LeaseState::Expired {
                lease.state = LeaseState::Expired;
                lease.expired_at = Some(now);
            }
        })?;
        if !found {
            return Err(LeaseError::NotFound(format!("Lease '{lease_id}' not found")));
        }
        Ok(())
    }

    async fn list_non_expired(&self) -> Result<Vec<Lease>> {
        Ok(self
            .leases
            .values()?
            .into_iter()
            .filter(|lease| !lease.is_expired())
            .collect())
    }

    async fn list(&self) -> Result<Vec<Lease>> {
        self.leases.values()
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// In-memory lease store with failure injection.
    #[derive(Default)]
    pub struct InMemoryLeaseStore {
        pub leases: DashMap<String, Lease>,
        pub insert_count: AtomicUsize,
        pub mark_expired_count: AtomicUsize,
        pub fail_insert: AtomicBool,
        pub fail_mark_expired: AtomicBool,
        pub fail_list: AtomicBool,
    }

    impl InMemoryLeaseStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Seed a lease directly, bypassing failure injection.
        pub fn seed(&self, lease: Lease) {
            self.leases.insert(lease.id.clone(), lease);
        }

        pub fn snapshot(&self, lease_id: &str) -> Option<Lease> {
            self.leases.get(lease_id).map(|entry| entry.value().clone())
        }
    }

    #[async_trait::async_trait]
    impl LeaseStore for InMemoryLeaseStore {
        async fn insert(&self, lease: &Lease) -> Result<()> {
            self.insert_count.fetch_add(1, Ordering::Relaxed);
            if self.fail_insert.load(Ordering::Relaxed) {
                return Err(LeaseError::Storage("Mock insert failure".into()));
            }
            if self.leases.contains_key(&lease.id) {
                return Err(LeaseError::Storage(format!(
                    "Lease '{}' already exists",
                    lease.id
                )));
            }
            self.leases.insert(lease.id.clone(), lease.clone());
            Ok(())
        }

        async fn get(&self, lease_id: &str) -> Result<Option<Lease>> {
            Ok(self.snapshot(lease_id))
        }

        async fn mark_expired(&self, lease_id: &str) -> Result<()> {
            self.mark_expired_count.fetch_add(1, Ordering::Relaxed);
            if self.fail_mark_expired.load(Ordering::Relaxed) {
                return Err(LeaseError::Storage("Mock mark_expired failure".into()));
            }
            let mut entry = self
                .leases
                .get_mut(lease_id)
                .ok_or_else(|| LeaseError::NotFound(format!("Lease '{lease_id}' not found")))?;
            if entry.state != LeaseState::Expired {
                entry.state = LeaseState::Expired;
                entry.expired_at = Some(crate::util::now_ts());
            }
            Ok(())
        }

        async fn list_non_expired(&self) -> Result<Vec<Lease>> {
            if self.fail_list.load(Ordering::Relaxed) {
                return Err(LeaseError::Storage("Mock list failure".into()));
            }
            Ok(self
                .leases
                .iter()
                .filter(|entry| !entry.is_expired())
                .map(|entry| entry.value().clone())
                .collect())
        }

        async fn list(&self) -> Result<Vec<Lease>> {
            if self.fail_list.load(Ordering::Relaxed) {
                return Err(LeaseError::Storage("Mock list failure".into()));
            }
            Ok(self.leases.iter().map(|entry| entry.value().clone()).collect())
        }
    }
}
