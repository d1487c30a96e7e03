//! `aliyun ecs` JSON reply models.
//!
//! ECS wraps every list in an object named after the element type, e.g.
//! `{"Images": {"Image": [...]}}`.

use serde::Deserialize;

// ============================================================================
// Instances
// ============================================================================

/// `DescribeInstanceAttribute` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceAttribute {
    /// Instance id.
    pub instance_id: String,
    /// Instance name.
    #[serde(default)]
    pub instance_name: Option<String>,
    /// `Pending`, `Starting`, `Running`, `Stopping`, `Stopped`.
    pub status: String,
    /// Public addresses.
    #[serde(default)]
    pub public_ip_address: IpAddressSet,
}

/// Address list wrapper.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpAddressSet {
    /// Addresses.
    #[serde(default)]
    pub ip_address: Vec<String>,
}

/// `CreateInstance` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateInstanceOutput {
    /// New instance id.
    pub instance_id: String,
}

/// `AllocatePublicIpAddress` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AllocatePublicIpOutput {
    /// Allocated address.
    pub ip_address: String,
}

/// `DescribeInstances` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeInstancesOutput {
    /// Instances.
    pub instances: InstanceSet,
}

/// Instance list wrapper.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceSet {
    /// Instances.
    #[serde(default)]
    pub instance: Vec<InstanceEntry>,
}

/// One `DescribeInstances` entry.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InstanceEntry {
    /// Instance id.
    pub instance_id: String,
    /// Instance name.
    #[serde(default)]
    pub instance_name: String,
    /// Instance type.
    #[serde(default)]
    pub instance_type: String,
    /// Zone.
    #[serde(default)]
    pub zone_id: String,
    /// Creation time (ISO 8601).
    #[serde(default)]
    pub creation_time: String,
    /// Status.
    pub status: String,
}

// ============================================================================
// Images, regions
// ============================================================================

/// `DescribeImages` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeImagesOutput {
    /// Images.
    pub images: ImageSet,
}

/// Image list wrapper.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSet {
    /// Images.
    #[serde(default)]
    pub image: Vec<Image>,
}

/// Image.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    /// Image id.
    pub image_id: String,
}

/// `DescribeRegions` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeRegionsOutput {
    /// Regions.
    pub regions: RegionSet,
}

/// Region list wrapper.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegionSet {
    /// Regions.
    #[serde(default)]
    pub region: Vec<Region>,
}

/// Region.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Region {
    /// Region id, e.g. `us-west-1`.
    pub region_id: String,
}

// ============================================================================
// Security groups
// ============================================================================

/// `DescribeSecurityGroups` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeSecurityGroupsOutput {
    /// Groups.
    pub security_groups: SecurityGroupSet,
}

/// Group list wrapper.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroupSet {
    /// Groups.
    #[serde(default)]
    pub security_group: Vec<SecurityGroup>,
}

/// Security group.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SecurityGroup {
    /// Group id.
    pub security_group_id: String,
    /// Group name.
    #[serde(default)]
    pub security_group_name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
}

/// `CreateSecurityGroup` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateSecurityGroupOutput {
    /// New group id.
    pub security_group_id: String,
}
