//! `az --output json` reply models.

use serde::Deserialize;

// ============================================================================
// Virtual machines
// ============================================================================

/// `az vm get-instance-view` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceViewOutput {
    /// Resource id.
    pub id: String,
    /// Instance view.
    #[serde(default)]
    pub instance_view: Option<InstanceView>,
}

impl InstanceViewOutput {
    /// `PowerState/*` code, if reported yet.
    pub fn power_state(&self) -> Option<&str> {
        self.instance_view
            .as_ref()?
            .statuses
            .iter()
            .find_map(|s| s.code.strip_prefix("PowerState/"))
    }
}

/// Instance view.
#[derive(Debug, Default, Deserialize)]
pub struct InstanceView {
    /// Provisioning and power status codes.
    #[serde(default)]
    pub statuses: Vec<Status>,
}

/// Status code entry.
#[derive(Debug, Deserialize)]
pub struct Status {
    /// `ProvisioningState/succeeded`, `PowerState/running`, ...
    pub code: String,
}

/// `az vm create` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmCreateOutput {
    /// Resource id.
    pub id: String,
    /// Public address.
    #[serde(default)]
    pub public_ip_address: Option<String>,
}

/// `az vm show -d` / `az vm list -d` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmDetails {
    /// Resource id.
    pub id: String,
    /// VM name.
    pub name: String,
    /// Location.
    #[serde(default)]
    pub location: String,
    /// Public addresses, comma separated.
    #[serde(default)]
    pub public_ips: Option<String>,
    /// `VM running`, `VM deallocated`, ...
    #[serde(default)]
    pub power_state: Option<String>,
    /// Hardware profile.
    #[serde(default)]
    pub hardware_profile: Option<HardwareProfile>,
    /// Creation time (RFC 3339).
    #[serde(default)]
    pub time_created: Option<String>,
}

impl VmDetails {
    /// First public address.
    pub fn public_ip(&self) -> Option<&str> {
        self.public_ips
            .as_deref()?
            .split(',')
            .map(str::trim)
            .find(|ip| !ip.is_empty())
    }
}

/// Hardware profile.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    /// VM size.
    pub vm_size: String,
}

/// Location.
#[derive(Debug, Deserialize)]
pub struct Location {
    /// Location name, e.g. `westus2`.
    pub name: String,
}

// ============================================================================
// Network security groups
// ============================================================================

/// Network security group.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSecurityGroup {
    /// Resource id.
    pub id: String,
    /// Name.
    pub name: String,
    /// User-defined rules.
    #[serde(default)]
    pub security_rules: Vec<NsgRule>,
}

/// `az network nsg create` reply.
#[derive(Debug, Deserialize)]
pub struct NsgCreateOutput {
    /// Created group.
    #[serde(rename = "NewNSG")]
    pub new_nsg: NetworkSecurityGroup,
}

/// NSG rule.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NsgRule {
    /// Rule name.
    pub name: String,
    /// `Tcp`, `Icmp`, `*`.
    pub protocol: String,
    /// `Inbound` or `Outbound`.
    pub direction: String,
    /// Single port or range (`22`, `8000-8080`, `*`).
    #[serde(default)]
    pub destination_port_range: Option<String>,
    /// Source prefix.
    #[serde(default)]
    pub source_address_prefix: Option<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
}
