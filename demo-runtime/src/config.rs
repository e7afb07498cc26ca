//! Lease configuration loaded once at startup from environment variables.
//!
//! Values are parsed into plain structs and handed to the orchestrator and
//! scheduler by the caller; nothing here is cached globally. Every loader
//! also accepts a lookup closure so it can be exercised without touching the
//! process environment.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::util::split_list;
use crate::{DEFAULT_FQDN_SUFFIX, DEFAULT_LEASE_DURATION_SECS};

/// Parse `key` through `lookup`, falling back to `default` when the key is
/// unset or does not parse.
pub fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

/// Resource ceilings applied to every new instance. Zero means "no limit".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QuotaConfig {
    pub cpu: u64,
    pub memory_mb: u64,
    pub processes: u64,
    pub disk_gb: u64,
    pub nesting: bool,
}

impl QuotaConfig {
    /// Instance configuration keys for the quotas that are actually set.
    ///
    /// Disk size is not part of this map: it is a device override applied
    /// after the copy (see [`crate::runtime::InstanceDescriptor::apply_disk_quota`]).
    pub fn instance_config(&self) -> BTreeMap<String, String> {
        let mut config = BTreeMap::new();
        if self.nesting {
            config.insert("security.nesting".to_string(), "true".to_string());
        }
        if self.cpu > 0 {
            config.insert("limits.cpu".to_string(), self.cpu.to_string());
        }
        if self.memory_mb > 0 {
            config.insert("limits.memory".to_string(), format!("{}MB", self.memory_mb));
        }
        if self.processes > 0 {
            config.insert("limits.processes".to_string(), self.processes.to_string());
        }
        config
    }
}

/// Address discovery polling policy.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// Wait before the first poll so the instance can bring up networking.
    pub grace: Duration,
    pub interval: Duration,
    pub max_attempts: u32,
    /// Interfaces considered at all; everything else is ignored.
    pub interfaces: Vec<String>,
    pub ipv6_only: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(2000),
            interval: Duration::from_millis(500),
            max_attempts: 30,
            interfaces: vec!["eth0".to_string(), "lxcbr0".to_string()],
            ipv6_only: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeaseConfig {
    pub lease_duration_secs: u64,
    pub quota: QuotaConfig,
    /// When false the deployment is console-only: no credentials, no address.
    pub network_enabled: bool,
    pub fqdn_suffix: String,
    pub discovery: DiscoveryConfig,
    pub state_dir: PathBuf,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration_secs: DEFAULT_LEASE_DURATION_SECS,
            quota: QuotaConfig {
                nesting: true,
                ..Default::default()
            },
            network_enabled: true,
            fqdn_suffix: DEFAULT_FQDN_SUFFIX.to_string(),
            discovery: DiscoveryConfig::default(),
            state_dir: PathBuf::from("lease-state"),
        }
    }
}

impl LeaseConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let discovery_defaults = DiscoveryConfig::default();

        let quota = QuotaConfig {
            cpu: parse_or(&lookup, "LEASE_QUOTA_CPU", 0),
            memory_mb: parse_or(&lookup, "LEASE_QUOTA_RAM_MB", 0),
            processes: parse_or(&lookup, "LEASE_QUOTA_PROCESSES", 0),
            disk_gb: parse_or(&lookup, "LEASE_QUOTA_DISK_GB", 0),
            nesting: parse_or(&lookup, "LEASE_NESTING", true),
        };

        let interfaces = lookup("LEASE_INTERFACES")
            .map(|v| split_list(&v))
            .filter(|list| !list.is_empty())
            .unwrap_or(discovery_defaults.interfaces);

        let discovery = DiscoveryConfig {
            grace: Duration::from_millis(parse_or(
                &lookup,
                "LEASE_DISCOVERY_GRACE_MS",
                discovery_defaults.grace.as_millis() as u64,
            )),
            interval: Duration::from_millis(parse_or(
                &lookup,
                "LEASE_DISCOVERY_INTERVAL_MS",
                discovery_defaults.interval.as_millis() as u64,
            )),
            max_attempts: parse_or(
                &lookup,
                "LEASE_DISCOVERY_ATTEMPTS",
                discovery_defaults.max_attempts,
            ),
            interfaces,
            ipv6_only: parse_or(&lookup, "LEASE_IPV6_ONLY", false),
        };

        let console_only: bool = parse_or(&lookup, "LEASE_CONSOLE_ONLY", false);
        let fqdn_suffix = lookup("LEASE_FQDN_SUFFIX")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.fqdn_suffix);
        let state_dir = lookup("LEASE_STATE_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.state_dir);

        LeaseConfig {
            lease_duration_secs: parse_or(
                &lookup,
                "LEASE_DURATION_SECS",
                defaults.lease_duration_secs,
            ),
            quota,
            network_enabled: !console_only,
            fqdn_suffix,
            discovery,
            state_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = LeaseConfig::from_lookup(|_| None);
        assert_eq!(config.lease_duration_secs, DEFAULT_LEASE_DURATION_SECS);
        assert!(config.network_enabled);
        assert!(config.quota.nesting);
        assert_eq!(config.quota.disk_gb, 0);
        assert_eq!(config.fqdn_suffix, ".lxd");
        assert_eq!(config.discovery.max_attempts, 30);
        assert_eq!(config.discovery.interfaces, vec!["eth0", "lxcbr0"]);
    }

    #[test]
    fn reads_overrides() {
        let config = LeaseConfig::from_lookup(lookup_from(&[
            ("LEASE_DURATION_SECS", "120"),
            ("LEASE_QUOTA_CPU", "2"),
            ("LEASE_QUOTA_RAM_MB", "512"),
            ("LEASE_QUOTA_DISK_GB", "5"),
            ("LEASE_CONSOLE_ONLY", "true"),
            ("LEASE_IPV6_ONLY", "true"),
            ("LEASE_INTERFACES", "eth1"),
            ("LEASE_DISCOVERY_ATTEMPTS", "4"),
        ]));
        assert_eq!(config.lease_duration_secs, 120);
        assert_eq!(config.quota.cpu, 2);
        assert_eq!(config.quota.memory_mb, 512);
        assert_eq!(config.quota.disk_gb, 5);
        assert!(!config.network_enabled);
        assert!(config.discovery.ipv6_only);
        assert_eq!(config.discovery.interfaces, vec!["eth1"]);
        assert_eq!(config.discovery.max_attempts, 4);
    }

    #[test]
    fn garbage_values_fall_back() {
        let config = LeaseConfig::from_lookup(lookup_from(&[
            ("LEASE_DURATION_SECS", "soon"),
            ("LEASE_INTERFACES", " , "),
        ]));
        assert_eq!(config.lease_duration_secs, DEFAULT_LEASE_DURATION_SECS);
        assert_eq!(config.discovery.interfaces, vec!["eth0", "lxcbr0"]);
    }

    #[test]
    fn quota_map_skips_zero_values() {
        let quota = QuotaConfig {
            cpu: 0,
            memory_mb: 256,
            processes: 0,
            disk_gb: 10,
            nesting: false,
        };
        let config = quota.instance_config();
        assert_eq!(config.len(), 1);
        assert_eq!(config.get("limits.memory").map(String::as_str), Some("256MB"));
        assert!(!config.contains_key("limits.cpu"));
        assert!(!config.contains_key("security.nesting"));
    }

    #[test]
    fn quota_map_full() {
        let quota = QuotaConfig {
            cpu: 2,
            memory_mb: 1024,
            processes: 200,
            disk_gb: 0,
            nesting: true,
        };
        let config = quota.instance_config();
        assert_eq!(config["limits.cpu"], "2");
        assert_eq!(config["limits.processes"], "200");
        assert_eq!(config["security.nesting"], "true");
    }
}
