use serde::{Deserialize, Serialize, Serializer};

use crate::error::Result;
use crate::util::{validate_instance_name, validate_name, validate_owner};

/// Logical lease state. Only `Active` and `Expired` are ever persisted;
/// `Provisioning` covers the in-flight window before the store write and is
/// derived from the provisioning progress phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseState {
    Provisioning,
    #[default]
    Active,
    Expired,
}

/// Durable record of one leased instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub owner_id: String,
    pub template_name: String,
    pub instance_name: String,
    /// Empty when discovery timed out, `console-only` when network access is off.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub state: LeaseState,
    #[serde(default)]
    pub expired_at: Option<u64>,
}

impl Lease {
    pub fn is_expired(&self) -> bool {
        self.state == LeaseState::Expired
    }

    /// Seconds left on the lease at `now`; zero once it is due.
    pub fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }
}

/// Derive the runtime instance name for a template/owner pair.
///
/// The mapping is deterministic so a second concurrent request from the same
/// owner for the same template collides instead of creating a twin.
pub fn derive_instance_name(template_name: &str, owner_id: &str) -> Result<String> {
    validate_name(template_name, "template name")?;
    validate_owner(owner_id)?;
    let name = format!("{template_name}-{owner_id}");
    validate_instance_name(&name)?;
    Ok(name)
}

/// Status codes reported to callers, numbered as the public API has always
/// numbered them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseStatus {
    Started,
    InvalidTerms,
    ServerFull,
    QuotaReached,
    UserBanned,
    UnknownError,
}

impl LeaseStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Started => 0,
            Self::InvalidTerms => 1,
            Self::ServerFull => 2,
            Self::QuotaReached => 3,
            Self::UserBanned => 4,
            Self::UnknownError => 5,
        }
    }
}

impl Serialize for LeaseStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

/// What callers get back for a provisioned or looked-up lease.
///
/// Network fields are present only when the deployment exposes instances on
/// the network.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LeaseResult {
    pub id: String,
    pub expiry: u64,
    pub status: LeaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
}

impl LeaseResult {
    pub fn from_lease(lease: &Lease, network_enabled: bool, fqdn_suffix: &str) -> Self {
        let mut result = LeaseResult {
            id: lease.id.clone(),
            expiry: lease.expires_at,
            status: LeaseStatus::Started,
            ip: None,
            username: None,
            password: None,
            fqdn: None,
        };
        if network_enabled {
            result.ip = Some(lease.address.clone());
            result.username = Some(lease.username.clone());
            result.password = Some(lease.password.clone());
            result.fqdn = Some(format!("{}{fqdn_suffix}", lease.instance_name));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeaseError;

    fn sample_lease() -> Lease {
        Lease {
            id: "3f1c".into(),
            owner_id: "alice".into(),
            template_name: "ubuntu-base".into(),
            instance_name: "ubuntu-base-alice".into(),
            address: "10.0.0.5".into(),
            username: "brave".into(),
            password: "quiet-otter-1234".into(),
            created_at: 1_700_000_000,
            expires_at: 1_700_000_120,
            origin: "203.0.113.9".into(),
            state: LeaseState::Active,
            expired_at: None,
        }
    }

    #[test]
    fn instance_name_is_deterministic() {
        let a = derive_instance_name("ubuntu-base", "alice").unwrap();
        let b = derive_instance_name("ubuntu-base", "alice").unwrap();
        assert_eq!(a, "ubuntu-base-alice");
        assert_eq!(a, b);
        assert_ne!(a, derive_instance_name("ubuntu-base", "bob").unwrap());
    }

    #[test]
    fn instance_name_rejects_bad_owner() {
        assert!(derive_instance_name("ubuntu-base", "../etc").is_err());
        assert!(derive_instance_name("ubuntu-base", "").is_err());
        assert!(derive_instance_name("9lives", "alice").is_err());
    }

    #[test]
    fn distinct_pairs_never_share_a_name() {
        let name = derive_instance_name("ubuntu-base", "alice").unwrap();
        assert_eq!(name, "ubuntu-base-alice");
        assert!(matches!(
            derive_instance_name("ubuntu", "base-alice"),
            Err(LeaseError::Validation(_))
        ));
    }

    #[test]
    fn result_with_network_fields() {
        let result = LeaseResult::from_lease(&sample_lease(), true, ".lxd");
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["id"], "3f1c");
        assert_eq!(json["expiry"], 1_700_000_120u64);
        assert_eq!(json["status"], 0);
        assert_eq!(json["ip"], "10.0.0.5");
        assert_eq!(json["username"], "brave");
        assert_eq!(json["fqdn"], "ubuntu-base-alice.lxd");
    }

    #[test]
    fn console_only_result_hides_network_fields() {
        let result = LeaseResult::from_lease(&sample_lease(), false, ".lxd");
        let json = serde_json::to_value(&result).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 3);
        assert!(object.contains_key("id"));
        assert!(object.contains_key("expiry"));
        assert!(object.contains_key("status"));
    }

    #[test]
    fn status_codes() {
        assert_eq!(LeaseStatus::Started.code(), 0);
        assert_eq!(LeaseStatus::ServerFull.code(), 2);
        assert_eq!(LeaseStatus::UserBanned.code(), 4);
        assert_eq!(LeaseStatus::UnknownError.code(), 5);
    }

    #[test]
    fn lease_record_defaults_missing_fields() {
        let json = r#"{
            "id": "x", "owner_id": "o", "template_name": "t", "instance_name": "t-o",
            "created_at": 1, "expires_at": 2
        }"#;
        let lease: Lease = serde_json::from_str(json).unwrap();
        assert_eq!(lease.state, LeaseState::Active);
        assert!(lease.address.is_empty());
        assert_eq!(lease.remaining_secs(5), 0);
    }
}
