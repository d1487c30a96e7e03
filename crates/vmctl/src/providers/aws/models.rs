//! `aws ec2` JSON reply models.
//!
//! Only the fields the adapter reads are modelled; everything else in the
//! (large) replies is ignored.

use serde::Deserialize;

// ============================================================================
// Instances
// ============================================================================

/// `describe-instance-status` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstanceStatusOutput {
    /// One entry per matching instance; empty for stopped instances.
    #[serde(default)]
    pub instance_statuses: Vec<InstanceStatus>,
}

/// Status entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceStatus {
    /// Instance id.
    pub instance_id: Option<String>,
    /// Run state.
    pub instance_state: InstanceState,
}

/// EC2 instance state.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceState {
    /// `pending`, `running`, `stopping`, `stopped`, `shutting-down`, `terminated`.
    pub name: String,
}

/// `describe-instances` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesOutput {
    /// Reservations, each holding one or more instances.
    #[serde(default)]
    pub reservations: Vec<Reservation>,
}

impl DescribeInstancesOutput {
    /// All instances across reservations.
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.reservations.iter().flat_map(|r| r.instances.iter())
    }
}

/// Reservation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Reservation {
    /// Instances.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

/// EC2 instance.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Instance {
    /// Instance id.
    pub instance_id: String,
    /// Instance type.
    pub instance_type: Option<String>,
    /// Run state.
    pub state: Option<InstanceState>,
    /// Public IPv4 address.
    pub public_ip_address: Option<String>,
    /// Public DNS name.
    pub public_dns_name: Option<String>,
    /// Key pair name.
    pub key_name: Option<String>,
    /// Launch time (RFC 3339).
    pub launch_time: Option<String>,
    /// Placement.
    pub placement: Option<Placement>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl Instance {
    /// Value of the `Name` tag.
    pub fn name_tag(&self) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.key == "Name")
            .map(|t| t.value.as_str())
    }
}

/// Placement.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Placement {
    /// Availability zone.
    pub availability_zone: Option<String>,
}

/// Resource tag.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    /// Key.
    pub key: String,
    /// Value.
    pub value: String,
}

/// `run-instances` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RunInstancesOutput {
    /// Launched instances.
    #[serde(default)]
    pub instances: Vec<Instance>,
}

// ============================================================================
// Images, regions, VPCs
// ============================================================================

/// `describe-images` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeImagesOutput {
    /// Matching images.
    #[serde(default)]
    pub images: Vec<Image>,
}

/// AMI.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    /// AMI id.
    pub image_id: String,
    /// Image name.
    pub name: Option<String>,
    /// Creation date, used to pick the newest match.
    pub creation_date: Option<String>,
}

/// `describe-regions` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeRegionsOutput {
    /// Regions.
    #[serde(default)]
    pub regions: Vec<Region>,
}

/// Region.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Region {
    /// Region name.
    pub region_name: String,
}

/// `describe-vpcs` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeVpcsOutput {
    /// VPCs.
    #[serde(default)]
    pub vpcs: Vec<Vpc>,
}

/// VPC.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Vpc {
    /// VPC id.
    pub vpc_id: String,
    /// Whether this is the account's default VPC.
    #[serde(default)]
    pub is_default: bool,
}

// ============================================================================
// Security groups
// ============================================================================

/// `describe-security-groups` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSecurityGroupsOutput {
    /// Groups.
    #[serde(default)]
    pub security_groups: Vec<SecurityGroup>,
}

/// Security group.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroup {
    /// Group id.
    pub group_id: String,
    /// Group name.
    pub group_name: String,
    /// Description.
    pub description: Option<String>,
    /// Ingress permissions.
    #[serde(default)]
    pub ip_permissions: Vec<IpPermission>,
}

/// Ingress permission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpPermission {
    /// `tcp`, `icmp`, or `-1` for all.
    pub ip_protocol: String,
    /// First port (ICMP type for ICMP).
    pub from_port: Option<i32>,
    /// Last port.
    pub to_port: Option<i32>,
    /// Source ranges.
    #[serde(default)]
    pub ip_ranges: Vec<IpRange>,
}

/// IPv4 range of a permission.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpRange {
    /// CIDR.
    pub cidr_ip: String,
    /// Description.
    pub description: Option<String>,
}

/// `create-security-group` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSecurityGroupOutput {
    /// New group id.
    pub group_id: String,
}
