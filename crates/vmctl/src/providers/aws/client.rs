//! Amazon EC2 adapter over the `aws` CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    CreateSecurityGroupOutput, DescribeImagesOutput, DescribeInstanceStatusOutput,
    DescribeInstancesOutput, DescribeRegionsOutput, DescribeSecurityGroupsOutput,
    DescribeVpcsOutput, Instance, IpPermission, RunInstancesOutput, SecurityGroup,
};
use crate::descriptor::{Direction, Protocol, SecurityGroupDescriptor, SecurityRule, VmDescriptor};
use crate::error::VmError;
use crate::providers::traits::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};
use crate::runner::{decode, exec, CommandLine, CommandRunner};

/// Create / start / terminate ceiling.
const CREATE_TIMEOUT: Duration = Duration::from_secs(240);

/// Stop / ping ceiling.
const STOP_TIMEOUT: Duration = Duration::from_secs(240);

/// Error codes meaning the instance id is unknown to EC2.
const NOT_FOUND_CODES: &[&str] = &["InvalidInstanceID.NotFound", "InvalidInstanceID.Malformed"];

/// AWS EC2 provider.
#[derive(Clone)]
pub struct Aws {
    runner: Arc<dyn CommandRunner>,
}

impl Aws {
    /// Create an adapter running `aws` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// `aws ec2 <action> --output json [--region <region>]`.
    fn ec2(vm: &VmDescriptor, action: &str) -> CommandLine {
        let cmd = CommandLine::new("aws")
            .args(["ec2", action])
            .opt("--output", "json");
        match vm.region() {
            Some(region) => cmd.opt("--region", region),
            None => cmd,
        }
    }

    async fn json<T: DeserializeOwned>(&self, cmd: &CommandLine) -> Result<T, VmError> {
        let body = exec(self.runner.as_ref(), cmd).await?;
        decode(&body)
    }

    fn instance_id(vm: &VmDescriptor) -> Result<&str, VmError> {
        vm.id()
            .ok_or_else(|| VmError::NoVmDefined(ProviderKind::Aws.to_string()))
    }

    /// First instance in the reply, or `None` if EC2 no longer knows the id.
    /// Callers check the returned id against the recorded one.
    async fn describe_instance(&self, vm: &VmDescriptor) -> Result<Option<Instance>, VmError> {
        let id = Self::instance_id(vm)?;
        let cmd = Self::ec2(vm, "describe-instances").opt("--instance-ids", id);
        let output = self.runner.run_checked(&cmd).await?;
        if let Some(message) = &output.error_message {
            if is_not_found(message) {
                return Ok(None);
            }
        }
        let reply: DescribeInstancesOutput = decode(&output.into_stdout()?)?;
        Ok(reply
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .next())
    }

    async fn default_vpc(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        if let Some(vpc) = vm.option("vpc_id") {
            return Ok(vpc.to_string());
        }
        let reply: DescribeVpcsOutput = self.json(&Self::ec2(vm, "describe-vpcs")).await?;
        let vpc = reply
            .vpcs
            .iter()
            .find(|v| v.is_default)
            .or_else(|| reply.vpcs.first())
            .ok_or_else(|| VmError::ProviderRejected("no VPC found in region".to_string()))?;
        debug!(vpc_id = %vpc.vpc_id, "Using VPC");
        Ok(vpc.vpc_id.clone())
    }

    async fn tag_name(&self, vm: &VmDescriptor, resource: &str, name: &str) -> Result<(), VmError> {
        let cmd = Self::ec2(vm, "create-tags")
            .opt("--resources", resource)
            .opt("--tags", format!("Key=Name,Value={name}"));
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    /// `--ip-permissions` JSON for one ingress rule.
    fn ip_permission(rule: &SecurityRule) -> serde_json::Value {
        let (protocol, from, to) = match rule.protocol {
            Protocol::Tcp => (
                "tcp",
                rule.from_port.map_or(-1, i32::from),
                rule.to_port.map_or(-1, i32::from),
            ),
            // Echo request type 8, any code.
            Protocol::Icmp => ("icmp", 8, -1),
            Protocol::All => ("-1", -1, -1),
        };
        serde_json::json!([{
            "IpProtocol": protocol,
            "FromPort": from,
            "ToPort": to,
            "IpRanges": [{ "CidrIp": rule.cidr, "Description": rule.description }],
        }])
    }

    fn to_rules(permission: &IpPermission) -> Vec<SecurityRule> {
        let protocol = match permission.ip_protocol.as_str() {
            "tcp" => Protocol::Tcp,
            "icmp" => Protocol::Icmp,
            _ => Protocol::All,
        };
        let port = |p: Option<i32>| p.and_then(|p| u16::try_from(p).ok());
        permission
            .ip_ranges
            .iter()
            .map(|range| SecurityRule {
                protocol,
                from_port: if protocol == Protocol::Tcp {
                    port(permission.from_port)
                } else {
                    None
                },
                to_port: if protocol == Protocol::Tcp {
                    port(permission.to_port)
                } else {
                    None
                },
                cidr: range.cidr_ip.clone(),
                direction: Direction::Ingress,
                description: range.description.clone().unwrap_or_default(),
            })
            .collect()
    }

    fn to_security_group(group: &SecurityGroup) -> SecurityGroupDescriptor {
        SecurityGroupDescriptor {
            id: group.group_id.clone(),
            name: group.group_name.clone(),
            description: group.description.clone(),
            rules: group.ip_permissions.iter().flat_map(Self::to_rules).collect(),
        }
    }

    async fn describe_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroup>, VmError> {
        let reply: DescribeSecurityGroupsOutput =
            self.json(&Self::ec2(vm, "describe-security-groups")).await?;
        Ok(reply.security_groups)
    }
}

fn is_not_found(message: &str) -> bool {
    NOT_FOUND_CODES.iter().any(|code| message.contains(code))
}

/// Map an EC2 state name into the normalized set.
pub(crate) fn map_state(name: &str) -> RunState {
    match name {
        "pending" => RunState::Pending,
        "running" => RunState::Running,
        "stopping" | "shutting-down" => RunState::Stopping,
        "stopped" => RunState::Stopped,
        "terminated" => RunState::NotExist,
        _ => RunState::Unknown,
    }
}

#[async_trait]
impl ProviderAdapter for Aws {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn traits(&self) -> ProviderTraits {
        ProviderTraits {
            pingable: true,
            auto_starts_on_create: true,
            stop_transient_state: RunState::Stopping,
            reassigns_ip_on_stop: true,
            requires_stop_before_delete: false,
            termination_observable: true,
            key_extension: ".pem",
            needs_public_key: false,
            create_timeout: CREATE_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
            post_create_settle: Duration::ZERO,
        }
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults::new(
            "us-west-2",
            "p3.2xlarge",
            "NVIDIA Volta Deep Learning AMI*",
            "ubuntu",
            true,
            &[],
        )
    }

    async fn resolve_image(&self, vm: &VmDescriptor) -> Result<Option<String>, VmError> {
        let name = vm
            .image_name()
            .ok_or_else(|| VmError::Config("no image name configured".to_string()))?;
        let cmd = Self::ec2(vm, "describe-images")
            .opt("--filters", format!("Name=name,Values={name}"));
        let reply: DescribeImagesOutput = self.json(&cmd).await?;

        // Wildcard names can match several releases; take the newest.
        let image = reply
            .images
            .iter()
            .max_by(|a, b| a.creation_date.cmp(&b.creation_date))
            .ok_or_else(|| VmError::ProviderRejected(format!("no image named '{name}'")))?;
        debug!(
            image_name = %name,
            matched = image.name.as_deref().unwrap_or_default(),
            image_id = %image.image_id,
            "Resolved image"
        );
        Ok(Some(image.image_id.clone()))
    }

    async fn create_instance(&self, vm: &VmDescriptor) -> Result<CreatedInstance, VmError> {
        let missing = |field: &str| VmError::Config(format!("{field} is not set"));
        let cmd = Self::ec2(vm, "run-instances")
            .opt("--image-id", vm.image_id().ok_or_else(|| missing("image_id"))?)
            .opt(
                "--instance-type",
                vm.instance_type().ok_or_else(|| missing("instance_type"))?,
            )
            .opt("--key-name", vm.key_name().ok_or_else(|| missing("key_name"))?)
            .opt(
                "--security-group-ids",
                vm.security_group_id()
                    .ok_or_else(|| missing("security_group_id"))?,
            );

        let reply: RunInstancesOutput = self.json(&cmd).await?;
        let instance = reply.instances.first().ok_or_else(|| VmError::MalformedResponse {
            message: "run-instances returned no instance".to_string(),
            body: String::new(),
        })?;
        let id = instance.instance_id.clone();
        info!(vm_id = %id, "EC2 instance launched");

        if let Some(name) = vm.name() {
            if let Err(e) = self.tag_name(vm, &id, name).await {
                warn!(vm_id = %id, error = %e, "Could not tag instance");
            }
        }

        // The public address only shows up once the instance is running.
        Ok(CreatedInstance { id, ip: None })
    }

    async fn run_state(&self, vm: &VmDescriptor) -> Result<RunState, VmError> {
        let id = Self::instance_id(vm)?;
        let cmd = Self::ec2(vm, "describe-instance-status").opt("--instance-ids", id);
        let output = self.runner.run_checked(&cmd).await?;
        if let Some(message) = &output.error_message {
            if is_not_found(message) {
                return Ok(RunState::NotExist);
            }
        }
        let reply: DescribeInstanceStatusOutput = decode(&output.into_stdout()?)?;
        if let Some(status) = reply.instance_statuses.first() {
            return Ok(map_state(&status.instance_state.name));
        }

        // Only running instances are listed by default; ask for the full record.
        match self.describe_instance(vm).await?.filter(|i| i.instance_id == id) {
            Some(instance) => Ok(instance
                .state
                .as_ref()
                .map_or(RunState::Unknown, |s| map_state(&s.name))),
            None => Ok(RunState::NotExist),
        }
    }

    async fn public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        let id = Self::instance_id(vm)?;
        let instance = self
            .describe_instance(vm)
            .await?
            .ok_or_else(|| VmError::ProviderRejected(format!("instance {id} not found")))?;

        if instance.instance_id != id {
            return Err(VmError::IntegrityMismatch {
                field: "id".to_string(),
                expected: id.to_string(),
                actual: instance.instance_id,
            });
        }
        if let (Some(expected), Some(actual)) = (vm.key_name(), instance.key_name.as_deref()) {
            if expected != actual {
                return Err(VmError::IntegrityMismatch {
                    field: "key_name".to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        instance
            .public_ip_address
            .filter(|ip| !ip.is_empty())
            .or_else(|| instance.public_dns_name.filter(|dns| !dns.is_empty()))
            .ok_or_else(|| VmError::ProviderRejected(format!("instance {id} has no public address")))
    }

    async fn start_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let cmd = Self::ec2(vm, "start-instances").opt("--instance-ids", Self::instance_id(vm)?);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn stop_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let cmd = Self::ec2(vm, "stop-instances").opt("--instance-ids", Self::instance_id(vm)?);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn restart_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let cmd = Self::ec2(vm, "reboot-instances").opt("--instance-ids", Self::instance_id(vm)?);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn delete_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let cmd =
            Self::ec2(vm, "terminate-instances").opt("--instance-ids", Self::instance_id(vm)?);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn find_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError> {
        Ok(self
            .describe_security_groups(vm)
            .await?
            .into_iter()
            .find(|g| g.group_name == name)
            .map(|g| g.group_id))
    }

    async fn create_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
        rules: &[SecurityRule],
    ) -> Result<String, VmError> {
        let vpc = self.default_vpc(vm).await?;
        let description = format!("NSG generated for {}", vm.name().unwrap_or(name));
        let cmd = Self::ec2(vm, "create-security-group")
            .opt("--group-name", name)
            .opt("--description", description)
            .opt("--vpc-id", vpc);
        let reply: CreateSecurityGroupOutput = self.json(&cmd).await?;
        let id = reply.group_id;

        self.tag_name(vm, &id, name).await?;

        // New VPC groups already allow all egress.
        for rule in rules.iter().filter(|r| r.direction == Direction::Ingress) {
            let cmd = Self::ec2(vm, "authorize-security-group-ingress")
                .opt("--group-id", id.clone())
                .opt("--ip-permissions", Self::ip_permission(rule).to_string());
            exec(self.runner.as_ref(), &cmd).await?;
            debug!(group_id = %id, protocol = %rule.protocol, ports = %rule.port_range(), "Added ingress rule");
        }
        Ok(id)
    }

    async fn try_delete_security_group(
        &self,
        vm: &VmDescriptor,
        id: &str,
    ) -> Result<(), VmError> {
        let cmd = Self::ec2(vm, "delete-security-group").opt("--group-id", id);
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
            .iter()
            .map(Self::to_security_group)
            .collect())
    }

    async fn list_running(&self, vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError> {
        let reply: DescribeInstancesOutput = self.json(&Self::ec2(vm, "describe-instances")).await?;
        Ok(reply
            .instances()
            .filter(|i| i.state.as_ref().is_some_and(|s| s.name == "running"))
            .map(|i| InstanceSummary {
                id: i.instance_id.clone(),
                name: i.name_tag().unwrap_or_default().to_string(),
                instance_type: i.instance_type.clone().unwrap_or_default(),
                zone: i
                    .placement
                    .as_ref()
                    .and_then(|p| p.availability_zone.clone())
                    .unwrap_or_default(),
                launched: i
                    .launch_time
                    .as_deref()
                    .map(|t| t.chars().take(10).collect())
                    .unwrap_or_default(),
            })
            .collect())
    }

    async fn list_regions(&self, vm: &VmDescriptor) -> Result<Vec<String>, VmError> {
        let reply: DescribeRegionsOutput = self.json(&Self::ec2(vm, "describe-regions")).await?;
        Ok(reply.regions.into_iter().map(|r| r.region_name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fail, is, ok, ScriptedRunner};

    fn vm() -> VmDescriptor {
        VmDescriptor {
            id: Some("i-0abc".to_string()),
            region: Some("us-west-2".to_string()),
            key_name: Some("my-key".to_string()),
            ..Default::default()
        }
    }

    const DESCRIBE_RUNNING: &str = r#"{
        "Reservations": [{
            "Instances": [{
                "InstanceId": "i-0abc",
                "InstanceType": "p3.2xlarge",
                "State": {"Code": 16, "Name": "running"},
                "PublicIpAddress": "198.51.100.7",
                "PublicDnsName": "ec2-198-51-100-7.us-west-2.compute.amazonaws.com",
                "KeyName": "my-key",
                "LaunchTime": "2024-03-01T10:00:00+00:00",
                "Placement": {"AvailabilityZone": "us-west-2a"},
                "Tags": [{"Key": "Name", "Value": "gpu-box"}]
            }]
        }]
    }"#;

    #[test]
    fn test_state_mapping() {
        assert_eq!(map_state("running"), RunState::Running);
        assert_eq!(map_state("shutting-down"), RunState::Stopping);
        assert_eq!(map_state("terminated"), RunState::NotExist);
        assert_eq!(map_state("rebooting"), RunState::Unknown);
    }

    #[tokio::test]
    async fn test_run_state_from_instance_status() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            ok(r#"{"InstanceStatuses": [{"InstanceId": "i-0abc", "InstanceState": {"Name": "pending"}}]}"#)
        }));
        let aws = Aws::new(runner.clone());
        assert_eq!(aws.run_state(&vm()).await.unwrap(), RunState::Pending);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_run_state_falls_back_to_describe_instances() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if is(cmd, &["describe-instance-status"]) {
                ok(r#"{"InstanceStatuses": []}"#)
            } else {
                ok(&DESCRIBE_RUNNING.replace("running", "stopped"))
            }
        }));
        let aws = Aws::new(runner);
        assert_eq!(aws.run_state(&vm()).await.unwrap(), RunState::Stopped);
    }

    #[tokio::test]
    async fn test_run_state_empty_reservations_is_not_exist() {
        let runner = Arc::new(ScriptedRunner::new(|cmd| {
            if is(cmd, &["describe-instance-status"]) {
                ok(r#"{"InstanceStatuses": []}"#)
            } else {
                ok(r#"{"Reservations": []}"#)
            }
        }));
        let aws = Aws::new(runner);
        assert_eq!(aws.run_state(&vm()).await.unwrap(), RunState::NotExist);
    }

    #[tokio::test]
    async fn test_run_state_unknown_id_is_not_exist() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            fail("An error occurred (InvalidInstanceID.NotFound) when calling the DescribeInstanceStatus operation: The instance ID 'i-0abc' does not exist")
        }));
        let aws = Aws::new(runner);
        assert_eq!(aws.run_state(&vm()).await.unwrap(), RunState::NotExist);
    }

    #[tokio::test]
    async fn test_other_failures_are_rejections() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            fail("An error occurred (AuthFailure) when calling the DescribeInstanceStatus operation")
        }));
        let aws = Aws::new(runner);
        let err = aws.run_state(&vm()).await.unwrap_err();
        assert!(matches!(err, VmError::ProviderRejected(ref m) if m.contains("AuthFailure")));
    }

    #[tokio::test]
    async fn test_public_ip_cross_checks_key_name() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok(DESCRIBE_RUNNING)));
        let aws = Aws::new(runner);

        assert_eq!(aws.public_ip(&vm()).await.unwrap(), "198.51.100.7");

        let mut other = vm();
        other.key_name = Some("someone-elses-key".to_string());
        let err = aws.public_ip(&other).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::IntegrityMismatch { ref field, ref actual, .. } if field == "key_name" && actual == "my-key"
        ));
    }

    #[tokio::test]
    async fn test_public_ip_rejects_different_instance_id() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            ok(&DESCRIBE_RUNNING.replace("i-0abc", "i-0fff"))
        }));
        let aws = Aws::new(runner);

        let err = aws.public_ip(&vm()).await.unwrap_err();
        assert!(matches!(
            err,
            VmError::IntegrityMismatch { ref field, ref expected, ref actual }
                if field == "id" && expected == "i-0abc" && actual == "i-0fff"
        ));
    }

    #[tokio::test]
    async fn test_malformed_reply_keeps_body() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("<html>proxy error</html>")));
        let aws = Aws::new(runner);
        let err = aws.list_regions(&vm()).await.unwrap_err();
        assert!(matches!(err, VmError::MalformedResponse { ref body, .. } if body.contains("proxy")));
    }

    #[tokio::test]
    async fn test_ensure_security_group_creates_once() {
        let created = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = created.clone();
        let runner = Arc::new(ScriptedRunner::new(move |cmd| {
            use std::sync::atomic::Ordering;
            if is(cmd, &["describe-security-groups"]) {
                if flag.load(Ordering::SeqCst) {
                    ok(r#"{"SecurityGroups": [{"GroupId": "sg-new", "GroupName": "me-vmctl-nsg"}]}"#)
                } else {
                    ok(r#"{"SecurityGroups": [{"GroupId": "sg-other", "GroupName": "me-vmctl-nsg-old"}]}"#)
                }
            } else if is(cmd, &["describe-vpcs"]) {
                ok(r#"{"Vpcs": [{"VpcId": "vpc-1", "IsDefault": true}]}"#)
            } else if is(cmd, &["create-security-group"]) {
                flag.store(true, Ordering::SeqCst);
                ok(r#"{"GroupId": "sg-new"}"#)
            } else {
                ok("{}")
            }
        }));
        let aws = Aws::new(runner.clone());

        let first = aws.ensure_security_group(&vm(), "me-vmctl-nsg").await.unwrap();
        let second = aws.ensure_security_group(&vm(), "me-vmctl-nsg").await.unwrap();

        assert_eq!(first, "sg-new");
        assert_eq!(second, "sg-new");
        assert_eq!(runner.count("create-security-group"), 1);
        // SSH, HTTPS, DIGITS and ICMP; egress is left at the VPC default.
        assert_eq!(runner.count("authorize-security-group-ingress"), 4);
        assert_eq!(runner.count("--vpc-id vpc-1"), 1);
    }

    #[test]
    fn test_icmp_permission_uses_echo_type() {
        let icmp = SecurityRule::defaults()
            .into_iter()
            .find(|r| r.protocol == Protocol::Icmp)
            .unwrap();
        let permission = Aws::ip_permission(&icmp);
        assert_eq!(permission[0]["IpProtocol"], "icmp");
        assert_eq!(permission[0]["FromPort"], 8);
        assert_eq!(permission[0]["ToPort"], -1);
    }

    #[tokio::test]
    async fn test_list_running_filters_state() {
        let body = r#"{"Reservations": [
            {"Instances": [{
                "InstanceId": "i-0abc",
                "InstanceType": "p3.2xlarge",
                "State": {"Name": "running"},
                "LaunchTime": "2024-03-01T10:00:00+00:00",
                "Placement": {"AvailabilityZone": "us-west-2a"},
                "Tags": [{"Key": "Name", "Value": "gpu-box"}]
            }]},
            {"Instances": [{"InstanceId": "i-stopped", "State": {"Name": "stopped"}}]}
        ]}"#;
        let runner = Arc::new(ScriptedRunner::new(move |_| ok(body)));
        let aws = Aws::new(runner);

        let running = aws.list_running(&vm()).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "i-0abc");
        assert_eq!(running[0].name, "gpu-box");
        assert_eq!(running[0].zone, "us-west-2a");
        assert_eq!(running[0].launched, "2024-03-01");
    }
}
