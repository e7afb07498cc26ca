//! Who may start a new lease right now.

use demo_runtime::{Lease, LeaseStatus};

use crate::config::ServerConfig;

/// Admission decision for one create request.
pub struct Admission<'a> {
    config: &'a ServerConfig,
}

impl<'a> Admission<'a> {
    pub fn new(config: &'a ServerConfig) -> Self {
        Self { config }
    }

    /// `LeaseStatus::Started` when the request may proceed, otherwise the
    /// status to report. `active` are the non-expired leases, `in_flight` the
    /// number of provisioning flows not yet persisted.
    pub fn check(&self, origin: &str, active: &[Lease], in_flight: usize) -> LeaseStatus {
        if self.config.banned_origins.iter().any(|banned| banned == origin) {
            return LeaseStatus::UserBanned;
        }
        if self.config.maintenance {
            return LeaseStatus::ServerFull;
        }
        if self.config.max_instances > 0 && active.len() + in_flight >= self.config.max_instances {
            return LeaseStatus::ServerFull;
        }
        if self.config.max_per_origin > 0 {
            let from_origin = active.iter().filter(|lease| lease.origin == origin).count();
            if from_origin >= self.config.max_per_origin {
                return LeaseStatus::QuotaReached;
            }
        }
        LeaseStatus::Started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use demo_runtime::LeaseState;

    fn lease(origin: &str) -> Lease {
        Lease {
            id: format!("lease-{origin}"),
            owner_id: "alice".into(),
            template_name: "ubuntu-base".into(),
            instance_name: "ubuntu-base-alice".into(),
            address: String::new(),
            username: String::new(),
            password: String::new(),
            created_at: 0,
            expires_at: 120,
            origin: origin.to_string(),
            state: LeaseState::Active,
            expired_at: None,
        }
    }

    #[test]
    fn open_server_admits() {
        let config = ServerConfig::default();
        let status = Admission::new(&config).check("203.0.113.9", &[lease("203.0.113.9")], 3);
        assert_eq!(status, LeaseStatus::Started);
    }

    #[test]
    fn banned_origin_wins_over_everything() {
        let config = ServerConfig {
            banned_origins: vec!["198.51.100.7".into()],
            maintenance: true,
            ..ServerConfig::default()
        };
        let status = Admission::new(&config).check("198.51.100.7", &[], 0);
        assert_eq!(status, LeaseStatus::UserBanned);
    }

    #[test]
    fn maintenance_is_full() {
        let config = ServerConfig {
            maintenance: true,
            ..ServerConfig::default()
        };
        assert_eq!(
            Admission::new(&config).check("203.0.113.9", &[], 0),
            LeaseStatus::ServerFull
        );
    }

    #[test]
    fn instance_cap_counts_in_flight() {
        let config = ServerConfig {
            max_instances: 2,
            ..ServerConfig::default()
        };
        let admission = Admission::new(&config);
        assert_eq!(
            admission.check("203.0.113.9", &[lease("a")], 0),
            LeaseStatus::Started
        );
        assert_eq!(
            admission.check("203.0.113.9", &[lease("a")], 1),
            LeaseStatus::ServerFull
        );
    }

    #[test]
    fn per_origin_cap() {
        let config = ServerConfig {
            max_per_origin: 1,
            ..ServerConfig::default()
        };
        let admission = Admission::new(&config);
        let active = [lease("203.0.113.9")];
        assert_eq!(
            admission.check("203.0.113.9", &active, 0),
            LeaseStatus::QuotaReached
        );
        assert_eq!(
            admission.check("203.0.113.10", &active, 0),
            LeaseStatus::Started
        );
    }
}
