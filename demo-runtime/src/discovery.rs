//! Bounded polling for a freshly started instance's network address.

use std::sync::Arc;

use blueprint_sdk::{info, warn};

use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::runtime::{NetworkState, RuntimeClient};

const GLOBAL_SCOPE: &str = "global";
const INET6: &str = "inet6";

/// Which address families discovery may return.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AddressFamily {
    #[default]
    Any,
    Ipv6Only,
}

impl AddressFamily {
    pub fn from_ipv6_only(ipv6_only: bool) -> Self {
        if ipv6_only {
            AddressFamily::Ipv6Only
        } else {
            AddressFamily::Any
        }
    }
}

pub struct AddressDiscovery {
    runtime: Arc<dyn RuntimeClient>,
    config: DiscoveryConfig,
}

impl AddressDiscovery {
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: DiscoveryConfig) -> Self {
        Self { runtime, config }
    }

    /// Wait out the grace period, then poll until an address passes the
    /// filters or the attempts run out.
    ///
    /// `Ok(None)` means the window elapsed without a usable address. Errors
    /// from the runtime abort the loop immediately.
    pub async fn discover(
        &self,
        instance_name: &str,
        family: AddressFamily,
    ) -> Result<Option<String>> {
        tokio::time::sleep(self.config.grace).await;

        for attempt in 1..=self.config.max_attempts {
            let network = self.runtime.get_instance_network_state(instance_name).await?;
            if let Some(address) = select_address(&network, &self.config.interfaces, family) {
                info!("discovery: {instance_name} reachable at {address} (attempt {attempt})");
                return Ok(Some(address));
            }
            if attempt < self.config.max_attempts {
                tokio::time::sleep(self.config.interval).await;
            }
        }

        warn!(
            "discovery: no usable address for {instance_name} after {} attempts",
            self.config.max_attempts
        );
        Ok(None)
    }
}

/// First address on an allow-listed interface that is non-empty,
/// global-scoped and, for `Ipv6Only`, an `inet6` address.
///
/// Interfaces are visited in allow-list order.
pub fn select_address(
    network: &NetworkState,
    interfaces: &[String],
    family: AddressFamily,
) -> Option<String> {
    interfaces
        .iter()
        .filter_map(|iface| network.get(iface))
        .flatten()
        .find(|addr| {
            !addr.address.is_empty()
                && addr.scope == GLOBAL_SCOPE
                && (family == AddressFamily::Any || addr.family == INET6)
        })
        .map(|addr| addr.address.clone())
}
