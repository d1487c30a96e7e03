//! Alibaba Cloud ECS adapter over the `aliyun` CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    AllocatePublicIpOutput, CreateInstanceOutput, CreateSecurityGroupOutput,
    DescribeImagesOutput, DescribeInstancesOutput, DescribeRegionsOutput,
    DescribeSecurityGroupsOutput, InstanceAttribute,
};
use crate::descriptor::{Direction, SecurityGroupDescriptor, SecurityRule, VmDescriptor};
use crate::error::VmError;
use crate::providers::traits::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};
use crate::retry::{with_linear_backoff, RetryPolicy};
use crate::runner::{decode, exec, extract_error_message, CommandLine, CommandRunner};

const CREATE_TIMEOUT: Duration = Duration::from_secs(240);
const STOP_TIMEOUT: Duration = Duration::from_secs(240);

/// ECS list calls return 10 entries unless asked; 50 is the maximum.
const PAGE_SIZE: &str = "50";

/// Alibaba Cloud ECS provider.
#[derive(Clone)]
pub struct Alibaba {
    runner: Arc<dyn CommandRunner>,
}

impl Alibaba {
    /// Create an adapter running `aliyun` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// `aliyun ecs <action> [--RegionId <region>]`.
    fn ecs(vm: &VmDescriptor, action: &str) -> CommandLine {
        let cmd = CommandLine::new("aliyun").args(["ecs", action]);
        match vm.region() {
            Some(region) => cmd.opt("--RegionId", region),
            None => cmd,
        }
    }

    async fn json<T: DeserializeOwned>(&self, cmd: &CommandLine) -> Result<T, VmError> {
        let body = exec(self.runner.as_ref(), cmd).await?;
        decode(&body)
    }

    fn instance_id(vm: &VmDescriptor) -> Result<&str, VmError> {
        vm.id()
            .ok_or_else(|| VmError::NoVmDefined(ProviderKind::Alibaba.to_string()))
    }

    async fn instance_action(&self, vm: &VmDescriptor, action: &str) -> Result<(), VmError> {
        let cmd = Self::ecs(vm, action).opt("--InstanceId", Self::instance_id(vm)?);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    /// Instance attributes, or `None` if ECS does not know the id.
    async fn describe_instance(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Option<InstanceAttribute>, VmError> {
        let id = Self::instance_id(vm)?;
        let cmd = Self::ecs(vm, "DescribeInstanceAttribute").opt("--InstanceId", id);
        let output = self.runner.run(&cmd).await?;
        if !output.success() {
            // The error code (`InvalidInstanceId.NotFound`) is not part of the message.
            if output.stdout.contains("NotFound") || output.stderr.contains("NotFound") {
                return Ok(None);
            }
            return Err(VmError::ProviderRejected(extract_error_message(
                &output.stdout,
                &output.stderr,
            )));
        }
        let attribute: InstanceAttribute = decode(&output.stdout)?;
        if attribute.instance_id != id {
            return Ok(None);
        }
        Ok(Some(attribute))
    }

    /// Allocate a public address, retrying while the new instance settles.
    async fn allocate_public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        let id = Self::instance_id(vm)?;
        let cmd = Self::ecs(vm, "AllocatePublicIpAddress").opt("--InstanceId", id);
        let reply: AllocatePublicIpOutput =
            with_linear_backoff(&RetryPolicy::IP_ALLOCATION, "allocate public IP", || {
                self.json(&cmd)
            })
            .await?;
        info!(vm_id = %id, ip = %reply.ip_address, "Allocated public IP");
        Ok(reply.ip_address)
    }

    fn authorize(vm: &VmDescriptor, group_id: &str, rule: &SecurityRule) -> CommandLine {
        let (action, cidr_flag) = match rule.direction {
            Direction::Ingress => ("AuthorizeSecurityGroup", "--SourceCidrIp"),
            Direction::Egress => ("AuthorizeSecurityGroupEgress", "--DestCidrIp"),
        };
        Self::ecs(vm, action)
            .opt("--SecurityGroupId", group_id)
            .opt("--IpProtocol", rule.protocol.to_string())
            .opt("--PortRange", rule.port_range())
            .opt(cidr_flag, rule.cidr.clone())
            .opt("--Policy", "accept")
            .opt("--Description", rule.description.clone())
    }

    async fn describe_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<DescribeSecurityGroupsOutput, VmError> {
        self.json(&Self::ecs(vm, "DescribeSecurityGroups").opt("--PageSize", PAGE_SIZE))
            .await
    }
}

/// Map an ECS status into the normalized set.
pub(crate) fn map_status(status: &str) -> RunState {
    match status {
        "Pending" | "Starting" => RunState::Pending,
        "Running" => RunState::Running,
        "Stopping" => RunState::Stopping,
        "Stopped" => RunState::Stopped,
        _ => RunState::Unknown,
    }
}

#[async_trait]
impl ProviderAdapter for Alibaba {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Alibaba
    }

    fn traits(&self) -> ProviderTraits {
        ProviderTraits {
            pingable: true,
            auto_starts_on_create: false,
            stop_transient_state: RunState::Stopping,
            reassigns_ip_on_stop: false,
            requires_stop_before_delete: true,
            termination_observable: false,
            key_extension: ".pem",
            needs_public_key: false,
            create_timeout: CREATE_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
            post_create_settle: Duration::ZERO,
        }
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults::new(
            "us-west-1",
            "ecs.gn5-c4g1.xlarge",
            "NVIDIA GPU Cloud Virtual Machine Image",
            "root",
            true,
            &[
                ("image_owner_alias", "marketplace"),
                ("bandwidth_out", "10"),
                ("charge_type", "PostPaid"),
            ],
        )
    }

    async fn resolve_image(&self, vm: &VmDescriptor) -> Result<Option<String>, VmError> {
        if let Some(id) = vm.image_id() {
            return Ok(Some(id.to_string()));
        }
        let name = vm
            .image_name()
            .ok_or_else(|| VmError::Config("no image name configured".to_string()))?;
        let cmd = Self::ecs(vm, "DescribeImages")
            .opt("--ImageName", name)
            .opt("--ImageOwnerAlias", vm.option_or("image_owner_alias", "marketplace"));
        let reply: DescribeImagesOutput = self.json(&cmd).await?;
        let image = reply
            .images
            .image
            .into_iter()
            .next()
            .ok_or_else(|| VmError::ProviderRejected(format!("no image named '{name}'")))?;
        debug!(image_name = %name, image_id = %image.image_id, "Resolved image");
        Ok(Some(image.image_id))
    }

    async fn create_instance(&self, vm: &VmDescriptor) -> Result<CreatedInstance, VmError> {
        let missing = |field: &str| VmError::Config(format!("{field} is not set"));
        let cmd = Self::ecs(vm, "CreateInstance")
            .opt("--ImageId", vm.image_id().ok_or_else(|| missing("image_id"))?)
            .opt(
                "--SecurityGroupId",
                vm.security_group_id()
                    .ok_or_else(|| missing("security_group_id"))?,
            )
            .opt(
                "--InstanceType",
                vm.instance_type().ok_or_else(|| missing("instance_type"))?,
            )
            .opt("--InstanceName", vm.name().ok_or_else(|| missing("name"))?)
            .opt("--InternetMaxBandwidthOut", vm.option_or("bandwidth_out", "10"))
            .opt("--InstanceChargeType", vm.option_or("charge_type", "PostPaid"))
            .opt("--KeyPairName", vm.key_name().ok_or_else(|| missing("key_name"))?);

        let reply: CreateInstanceOutput = self.json(&cmd).await?;
        let id = reply.instance_id;
        info!(vm_id = %id, "ECS instance created");

        // Instances created through the API get no public address by default.
        let created = VmDescriptor {
            id: Some(id.clone()),
            ..vm.clone()
        };
        let ip = match self.allocate_public_ip(&created).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(vm_id = %id, error = %e, "Public IP allocation failed, will retry once running");
                None
            }
        };
        Ok(CreatedInstance { id, ip })
    }

    async fn run_state(&self, vm: &VmDescriptor) -> Result<RunState, VmError> {
        Ok(match self.describe_instance(vm).await? {
            Some(attribute) => map_status(&attribute.status),
            None => RunState::NotExist,
        })
    }

    async fn public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        let id = Self::instance_id(vm)?;
        let attribute = self
            .describe_instance(vm)
            .await?
            .ok_or_else(|| VmError::ProviderRejected(format!("instance {id} not found")))?;

        if let (Some(expected), Some(actual)) = (vm.name(), attribute.instance_name.as_deref()) {
            if expected != actual {
                return Err(VmError::IntegrityMismatch {
                    field: "name".to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        match attribute.public_ip_address.ip_address.into_iter().next() {
            Some(ip) => {
                if let Some(recorded) = vm.ip() {
                    if recorded != ip {
                        warn!(vm_id = %id, recorded, ip = %ip, "Public IP moved");
                    }
                }
                Ok(ip)
            }
            None => self.allocate_public_ip(vm).await,
        }
    }

    async fn start_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "StartInstance").await
    }

    async fn stop_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "StopInstance").await
    }

    async fn restart_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "RebootInstance").await
    }

    async fn delete_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "DeleteInstance").await
    }

    async fn find_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError> {
        Ok(self
            .describe_security_groups(vm)
            .await?
            .security_groups
            .security_group
            .into_iter()
            .find(|g| g.security_group_name == name)
            .map(|g| g.security_group_id))
    }

    async fn create_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
        rules: &[SecurityRule],
    ) -> Result<String, VmError> {
        let cmd = Self::ecs(vm, "CreateSecurityGroup").opt("--SecurityGroupName", name);
        let cmd = match vm.option("vpc_id") {
            Some(vpc) => cmd.opt("--VpcId", vpc),
            None => cmd,
        };
        let reply: CreateSecurityGroupOutput = self.json(&cmd).await?;
        let id = reply.security_group_id;

        for rule in rules {
            exec(self.runner.as_ref(), &Self::authorize(vm, &id, rule)).await?;
            debug!(
                group_id = %id,
                direction = ?rule.direction,
                protocol = %rule.protocol,
                ports = %rule.port_range(),
                "Added rule"
            );
        }
        Ok(id)
    }

    async fn try_delete_security_group(
        &self,
        vm: &VmDescriptor,
        id: &str,
    ) -> Result<(), VmError> {
        let cmd = Self::ecs(vm, "DeleteSecurityGroup").opt("--SecurityGroupId", id);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn list_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroupDescriptor>, VmError> {
        Ok(self
            .describe_security_groups(vm)
            .await?
            .security_groups
            .security_group
            .into_iter()
            .map(|g| SecurityGroupDescriptor {
                id: g.security_group_id,
                name: g.security_group_name,
                description: g.description,
                rules: Vec::new(),
            })
            .collect())
    }

    async fn list_running(&self, vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError> {
        let cmd = Self::ecs(vm, "DescribeInstances")
            .opt("--PageSize", PAGE_SIZE)
            .opt("--Status", "Running");
        let reply: DescribeInstancesOutput = self.json(&cmd).await?;
        Ok(reply
            .instances
            .instance
            .into_iter()
            .filter(|i| i.status == "Running")
            .map(|i| InstanceSummary {
                launched: i.creation_time.chars().take(10).collect(),
                id: i.instance_id,
                name: i.instance_name,
                instance_type: i.instance_type,
                zone: i.zone_id,
            })
            .collect())
    }

    async fn list_regions(&self, vm: &VmDescriptor) -> Result<Vec<String>, VmError> {
        let reply: DescribeRegionsOutput = self.json(&Self::ecs(vm, "DescribeRegions")).await?;
        Ok(reply.regions.region.into_iter().map(|r| r.region_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::{fail, is, ok, ScriptedRunner};

    fn vm() -> VmDescriptor {
        let mut vm = VmDescriptor {
            id: Some("i-rj9a0iw25hryafj0fm4v".to_string()),
            name: Some("newton-gn5".to_string()),
            region: Some("us-west-1".to_string()),
            ..Default::default()
        };
        vm.merge_defaults(&Alibaba::new(Arc::new(ScriptedRunner::new(|_| ok("")))).defaults().descriptor);
        vm
    }

    fn attribute(status: &str, ip: &str) -> String {
        format!(
            r#"{{"InstanceId": "i-rj9a0iw25hryafj0fm4v", "InstanceName": "newton-gn5",
                "Status": "{status}", "PublicIpAddress": {{"IpAddress": [{ip}]}}}}"#
        )
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_status("Starting"), RunState::Pending);
        assert_eq!(map_status("Running"), RunState::Running);
        assert_eq!(map_status("Stopped"), RunState::Stopped);
        assert_eq!(map_status("Expired"), RunState::Unknown);
    }

    #[tokio::test]
    async fn test_run_state_not_found() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            fail("ERROR: SDK.ServerError\nErrorCode: InvalidInstanceId.NotFound\nMessage: The specified InstanceId does not exist.")
        }));
        let ali = Alibaba::new(runner);
        assert_eq!(ali.run_state(&vm()).await.unwrap(), RunState::NotExist);
    }

    #[tokio::test]
    async fn test_run_state_other_errors_propagate() {
        let runner = Arc::new(ScriptedRunner::new(|_| fail("connection reset by peer")));
        let ali = Alibaba::new(runner);
        assert!(matches!(
            ali.run_state(&vm()).await.unwrap_err(),
            VmError::ProviderRejected(_)
        ));
    }

    #[tokio::test]
    async fn test_run_state_maps_status() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok(&attribute("Stopping", ""))));
        let ali = Alibaba::new(runner.clone());
        assert_eq!(ali.run_state(&vm()).await.unwrap(), RunState::Stopping);
        assert_eq!(runner.count("--InstanceId i-rj9a0iw25hryafj0fm4v"), 1);
    }

    #[tokio::test]
    async fn test_resolve_image_skips_lookup_when_id_recorded() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("{}")));
        let ali = Alibaba::new(runner.clone());
        let mut vm = vm();
        vm.image_id = Some("m-123".to_string());

        assert_eq!(ali.resolve_image(&vm).await.unwrap().as_deref(), Some("m-123"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_image_uses_owner_alias() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            ok(r#"{"Images": {"Image": [{"ImageId": "m-rj9gjqbdwtwlhtgqjeov"}]}}"#)
        }));
        let ali = Alibaba::new(runner.clone());
        let image = ali.resolve_image(&vm()).await.unwrap();
        assert_eq!(image.as_deref(), Some("m-rj9gjqbdwtwlhtgqjeov"));
        assert_eq!(runner.count("--ImageOwnerAlias marketplace"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_ip_allocation() {
        let allocations = Arc::new(AtomicU32::new(0));
        let seen = allocations.clone();
        let runner = Arc::new(ScriptedRunner::new(move |cmd| {
            if is(cmd, &["CreateInstance"]) {
                ok(r#"{"InstanceId": "i-new"}"#)
            } else if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                fail("IncorrectInstanceStatus")
            } else {
                ok(r#"{"IpAddress": "47.88.1.2"}"#)
            }
        }));
        let ali = Alibaba::new(runner.clone());
        let mut vm = vm();
        vm.id = None;
        vm.image_id = Some("m-1".to_string());
        vm.security_group_id = Some("sg-1".to_string());

        let created = ali.create_instance(&vm).await.unwrap();

        assert_eq!(created.id, "i-new");
        assert_eq!(created.ip.as_deref(), Some("47.88.1.2"));
        assert_eq!(runner.count("AllocatePublicIpAddress --RegionId us-west-1 --InstanceId i-new"), 3);
        assert_eq!(runner.count("--InstanceChargeType PostPaid"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_survives_failed_ip_allocation() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if is(cmd, &["CreateInstance"]) {
                ok(r#"{"InstanceId": "i-new"}"#)
            } else {
                fail("IncorrectInstanceStatus")
            }
        }));
        let ali = Alibaba::new(runner.clone());
        let mut vm = vm();
        vm.image_id = Some("m-1".to_string());
        vm.security_group_id = Some("sg-1".to_string());

        let created = ali.create_instance(&vm).await.unwrap();
        assert_eq!(created.id, "i-new");
        assert_eq!(created.ip, None);
        assert_eq!(runner.count("AllocatePublicIpAddress"), 4);
    }

    #[tokio::test]
    async fn test_public_ip_checks_instance_name() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok(&attribute("Running", r#""47.88.1.2""#))));
        let ali = Alibaba::new(runner);

        assert_eq!(ali.public_ip(&vm()).await.unwrap(), "47.88.1.2");

        let mut renamed = vm();
        renamed.name = Some("someone-else".to_string());
        assert!(matches!(
            ali.public_ip(&renamed).await.unwrap_err(),
            VmError::IntegrityMismatch { ref field, .. } if field == "name"
        ));
    }

    #[tokio::test]
    async fn test_public_ip_allocates_when_missing() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if is(cmd, &["AllocatePublicIpAddress"]) {
                ok(r#"{"IpAddress": "47.88.9.9"}"#)
            } else {
                ok(&attribute("Running", ""))
            }
        }));
        let ali = Alibaba::new(runner.clone());
        assert_eq!(ali.public_ip(&vm()).await.unwrap(), "47.88.9.9");
        assert_eq!(runner.count("AllocatePublicIpAddress"), 1);
    }

    #[tokio::test]
    async fn test_create_security_group_adds_ingress_and_egress() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if is(cmd, &["CreateSecurityGroup"]) {
                ok(r#"{"SecurityGroupId": "sg-rj999tz2kpxehy7obsjn"}"#)
            } else {
                ok("{}")
            }
        }));
        let ali = Alibaba::new(runner.clone());

        let id = ali
            .create_security_group(&vm(), "NvidiaSG", &SecurityRule::defaults())
            .await
            .unwrap();

        assert_eq!(id, "sg-rj999tz2kpxehy7obsjn");
        assert_eq!(runner.count("AuthorizeSecurityGroup --"), 4);
        assert_eq!(runner.count("AuthorizeSecurityGroupEgress"), 1);
        assert_eq!(runner.count("--IpProtocol icmp --PortRange -1/-1"), 1);
        assert_eq!(runner.count("--DestCidrIp 0.0.0.0/0"), 1);
    }

    #[tokio::test]
    async fn test_list_running() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            ok(r#"{"TotalCount": 1, "Instances": {"Instance": [{
                "InstanceId": "i-1", "InstanceName": "gpu", "InstanceType": "ecs.gn5-c4g1.xlarge",
                "ZoneId": "us-west-1a", "CreationTime": "2024-02-03T04:05Z", "Status": "Running"}]}}"#)
        }));
        let ali = Alibaba::new(runner);
        let running = ali.list_running(&vm()).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].launched, "2024-02-03");
        assert_eq!(running[0].zone, "us-west-1a");
    }
}
