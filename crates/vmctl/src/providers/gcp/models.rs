//! `gcloud compute --format json` reply models.

use serde::Deserialize;

// ============================================================================
// Instances
// ============================================================================

/// Compute Engine instance, as returned by `describe`, `create` and `list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    /// Numeric id, rendered as a string.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// `PROVISIONING`, `STAGING`, `RUNNING`, `STOPPING`, `TERMINATED`, ...
    pub status: String,
    /// Machine type URL.
    #[serde(default)]
    pub machine_type: String,
    /// Zone URL.
    #[serde(default)]
    pub zone: String,
    /// Creation timestamp (RFC 3339).
    #[serde(default)]
    pub creation_timestamp: String,
    /// Network interfaces.
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl Instance {
    /// External NAT address of the first interface.
    pub fn nat_ip(&self) -> Option<&str> {
        self.network_interfaces
            .first()?
            .access_configs
            .first()?
            .nat_ip
            .as_deref()
    }
}

/// Network interface.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// External access configurations.
    #[serde(default)]
    pub access_configs: Vec<AccessConfig>,
}

/// External access configuration.
#[derive(Debug, Deserialize)]
pub struct AccessConfig {
    /// Ephemeral or static external address; absent while stopped.
    #[serde(rename = "natIP")]
    pub nat_ip: Option<String>,
}

/// Last path segment of a resource URL.
pub fn short_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

// ============================================================================
// Zones
// ============================================================================

/// Zone.
#[derive(Debug, Deserialize)]
pub struct Zone {
    /// Zone name, e.g. `us-west1-b`.
    pub name: String,
    /// `UP` or `DOWN`.
    #[serde(default)]
    pub status: String,
}

// ============================================================================
// Firewall rules
// ============================================================================

/// VPC firewall rule.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    /// Rule name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// `INGRESS` or `EGRESS`.
    #[serde(default)]
    pub direction: String,
    /// Allowed protocols and ports.
    #[serde(default)]
    pub allowed: Vec<Allowed>,
    /// Source CIDRs.
    #[serde(default)]
    pub source_ranges: Vec<String>,
}

/// Allowed protocol entry.
#[derive(Debug, Deserialize)]
pub struct Allowed {
    /// `tcp`, `udp`, `icmp`, `all`.
    #[serde(rename = "IPProtocol")]
    pub ip_protocol: String,
    /// Ports or ranges (`22`, `8000-8080`).
    #[serde(default)]
    pub ports: Vec<String>,
}
