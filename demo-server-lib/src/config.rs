//! Server-side settings: listen address, admission caps, background loops.

use std::net::SocketAddr;

use demo_runtime::config::parse_or;
use demo_runtime::util::split_list;

pub const DEFAULT_API_ADDR: &str = "0.0.0.0:8080";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub api_addr: SocketAddr,
    /// Cap on concurrent instances, provisioning ones included. 0 = no cap.
    pub max_instances: usize,
    /// Cap on concurrent leases per request origin. 0 = no cap.
    pub max_per_origin: usize,
    pub banned_origins: Vec<String>,
    /// Take the request origin from `x-forwarded-for` instead of the peer
    /// address. Only safe behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    pub maintenance: bool,
    /// Seconds between leak reconciliation passes. 0 disables the loop.
    pub reconcile_interval_secs: u64,
    /// Age after which finished provision progress entries are dropped.
    pub provision_gc_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_instances: 0,
            max_per_origin: 0,
            banned_origins: Vec::new(),
            trust_forwarded_for: false,
            maintenance: false,
            reconcile_interval_secs: 0,
            provision_gc_secs: 3600,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        ServerConfig {
            api_addr: parse_or(&lookup, "LEASE_API_ADDR", defaults.api_addr),
            max_instances: parse_or(&lookup, "LEASE_MAX_INSTANCES", 0),
            max_per_origin: parse_or(&lookup, "LEASE_MAX_PER_ORIGIN", 0),
            banned_origins: lookup("LEASE_BANNED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            trust_forwarded_for: parse_or(&lookup, "LEASE_TRUST_FORWARDED_FOR", false),
            maintenance: parse_or(&lookup, "LEASE_MAINTENANCE", false),
            reconcile_interval_secs: parse_or(&lookup, "LEASE_RECONCILE_INTERVAL", 0),
            provision_gc_secs: parse_or(
                &lookup,
                "LEASE_PROVISION_GC_SECS",
                defaults.provision_gc_secs,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = ServerConfig::from_lookup(|_| None);
        assert_eq!(config.api_addr.to_string(), DEFAULT_API_ADDR);
        assert_eq!(config.max_instances, 0);
        assert!(config.banned_origins.is_empty());
        assert!(!config.maintenance);
        assert!(!config.trust_forwarded_for);
    }

    #[test]
    fn overrides() {
        let vars: HashMap<&str, &str> = [
            ("LEASE_API_ADDR", "127.0.0.1:9000"),
            ("LEASE_MAX_INSTANCES", "10"),
            ("LEASE_MAX_PER_ORIGIN", "2"),
            ("LEASE_BANNED_ORIGINS", "198.51.100.1, 198.51.100.2"),
            ("LEASE_MAINTENANCE", "true"),
            ("LEASE_RECONCILE_INTERVAL", "300"),
            ("LEASE_TRUST_FORWARDED_FOR", "true"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.api_addr.port(), 9000);
        assert_eq!(config.max_instances, 10);
        assert_eq!(config.max_per_origin, 2);
        assert_eq!(
            config.banned_origins,
            vec!["198.51.100.1".to_string(), "198.51.100.2".to_string()]
        );
        assert!(config.maintenance);
        assert_eq!(config.reconcile_interval_secs, 300);
        assert!(config.trust_forwarded_for);
    }

    #[test]
    fn bad_addr_falls_back() {
        let config = ServerConfig::from_lookup(|key| {
            (key == "LEASE_API_ADDR").then(|| "not-an-addr".to_string())
        });
        assert_eq!(config.api_addr.to_string(), DEFAULT_API_ADDR);
    }
}
