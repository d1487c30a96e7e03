//! Google Compute Engine adapter over the `gcloud` CLI.
//!
//! Compute Engine addresses instances by name within a zone, so the
//! descriptor's `region` holds a zone (`us-west1-b`) and the numeric id is
//! only used to cross-check replies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::models::{short_name, FirewallRule, Instance, Zone};
use crate::descriptor::{
    expand_home, Direction, Protocol, SecurityGroupDescriptor, SecurityRule, VmDescriptor,
};
use crate::error::VmError;
use crate::providers::traits::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};
use crate::runner::{decode, exec, extract_error_message, CommandLine, CommandRunner};

const CREATE_TIMEOUT: Duration = Duration::from_secs(120);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

/// Base delay before the first probe of a new instance.
const SETTLE_BASE: Duration = Duration::from_secs(10);

/// Additional settle delay per attached GPU.
const SETTLE_PER_ACCELERATOR: Duration = Duration::from_secs(10);

/// Google Cloud provider.
#[derive(Clone)]
pub struct Gcp {
    runner: Arc<dyn CommandRunner>,
}

impl Gcp {
    /// Create an adapter running `gcloud` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// `gcloud compute <group> <action> --format json --quiet [--project <p>]`.
    fn compute(vm: &VmDescriptor, group: &str, action: &str) -> CommandLine {
        let cmd = CommandLine::new("gcloud")
            .args(["compute", group, action])
            .opt("--format", "json")
            .arg("--quiet");
        match vm.option("project") {
            Some(project) => cmd.opt("--project", project),
            None => cmd,
        }
    }

    /// `gcloud compute instances <action> <name> --zone <zone>`.
    fn instance(vm: &VmDescriptor, action: &str) -> Result<CommandLine, VmError> {
        let name = vm
            .name()
            .ok_or_else(|| VmError::Config("instance name is not set".to_string()))?;
        let zone = vm
            .region()
            .ok_or_else(|| VmError::Config("zone is not set".to_string()))?;
        Ok(Self::compute(vm, "instances", action)
            .arg(name)
            .opt("--zone", zone))
    }

    async fn json<T: DeserializeOwned>(&self, cmd: &CommandLine) -> Result<T, VmError> {
        let body = exec(self.runner.as_ref(), cmd).await?;
        decode(&body)
    }

    async fn instance_action(&self, vm: &VmDescriptor, action: &str) -> Result<(), VmError> {
        if !vm.has_vm() {
            return Err(VmError::NoVmDefined(ProviderKind::Gcp.to_string()));
        }
        exec(self.runner.as_ref(), &Self::instance(vm, action)?).await?;
        Ok(())
    }

    /// Instance record, or `None` if the name is unknown in the zone.
    async fn describe(&self, vm: &VmDescriptor) -> Result<Option<Instance>, VmError> {
        let output = self.runner.run(&Self::instance(vm, "describe")?).await?;
        if !output.success() {
            if output.stderr.contains("was not found") {
                return Ok(None);
            }
            return Err(VmError::ProviderRejected(extract_error_message(
                &output.stdout,
                &output.stderr,
            )));
        }
        decode(&output.stdout).map(Some)
    }

    fn accelerator(vm: &VmDescriptor) -> Option<(&str, u32)> {
        let kind = vm.option("accelerator_type")?;
        let count = vm.option("accelerator_count")?.parse::<u32>().ok()?;
        (count > 0).then_some((kind, count))
    }

    /// `ssh-keys` metadata: `USER:<public key>`.
    async fn ssh_keys_metadata(vm: &VmDescriptor) -> Result<String, VmError> {
        let user = vm
            .user()
            .ok_or_else(|| VmError::Config("no SSH user configured".to_string()))?;
        let private = vm
            .key_file()
            .ok_or_else(|| VmError::Config("key file is not resolved".to_string()))?;
        let public = expand_home(&format!("{private}.pub"));
        let key = tokio::fs::read_to_string(&public)
            .await
            .map_err(|_| VmError::KeyFileMissing(public.display().to_string()))?;
        Ok(format!("ssh-keys={user}:{}", key.trim()))
    }

    /// `--allow` value for the ingress rules.
    fn allow_list(rules: &[SecurityRule]) -> String {
        rules
            .iter()
            .filter(|r| r.direction == Direction::Ingress)
            .map(|r| match (r.protocol, r.from_port, r.to_port) {
                (Protocol::Tcp, Some(from), Some(to)) if from == to => format!("tcp:{from}"),
                (Protocol::Tcp, Some(from), Some(to)) => format!("tcp:{from}-{to}"),
                (Protocol::Tcp, _, _) => "tcp".to_string(),
                (Protocol::Icmp, _, _) => "icmp".to_string(),
                (Protocol::All, _, _) => "all".to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn to_rules(rule: &FirewallRule) -> Vec<SecurityRule> {
        let direction = if rule.direction == "EGRESS" {
            Direction::Egress
        } else {
            Direction::Ingress
        };
        let cidr = rule
            .source_ranges
            .first()
            .cloned()
            .unwrap_or_else(|| "0.0.0.0/0".to_string());
        let description = rule.description.clone().unwrap_or_default();

        let mut rules = Vec::new();
        for allowed in &rule.allowed {
            let protocol = match allowed.ip_protocol.as_str() {
                "tcp" => Protocol::Tcp,
                "icmp" => Protocol::Icmp,
                _ => Protocol::All,
            };
            let ranges: Vec<(Option<u16>, Option<u16>)> = if allowed.ports.is_empty() {
                vec![(None, None)]
            } else {
                allowed.ports.iter().map(|p| parse_port_range(p)).collect()
            };
            for (from_port, to_port) in ranges {
                rules.push(SecurityRule {
                    protocol,
                    from_port,
                    to_port,
                    cidr: cidr.clone(),
                    direction,
                    description: description.clone(),
                });
            }
        }
        rules
    }

    async fn firewall_rules(&self, vm: &VmDescriptor) -> Result<Vec<FirewallRule>, VmError> {
        self.json(&Self::compute(vm, "firewall-rules", "list")).await
    }
}

/// `22` or `8000-8080`.
fn parse_port_range(ports: &str) -> (Option<u16>, Option<u16>) {
    match ports.split_once('-') {
        Some((from, to)) => (from.parse().ok(), to.parse().ok()),
        None => {
            let port = ports.parse().ok();
            (port, port)
        }
    }
}

/// Map a Compute Engine status into the normalized set.
pub(crate) fn map_status(status: &str) -> RunState {
    match status {
        "PROVISIONING" | "STAGING" => RunState::Pending,
        "RUNNING" => RunState::Running,
        "STOPPING" | "SUSPENDING" => RunState::Stopping,
        "TERMINATED" | "STOPPED" | "SUSPENDED" => RunState::Stopped,
        _ => RunState::Unknown,
    }
}

#[async_trait]
impl ProviderAdapter for Gcp {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gcp
    }

    fn traits(&self) -> ProviderTraits {
        ProviderTraits {
            pingable: true,
            auto_starts_on_create: true,
            // `instances stop` returns once the instance is down.
            stop_transient_state: RunState::Stopped,
            reassigns_ip_on_stop: true,
            requires_stop_before_delete: false,
            termination_observable: true,
            key_extension: "",
            needs_public_key: true,
            create_timeout: CREATE_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
            post_create_settle: SETTLE_BASE,
        }
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults::new(
            "us-west1-b",
            "n1-standard-1",
            "nvidia-gpu-cloud-image",
            "ubuntu",
            true,
            &[
                ("project", ""),
                ("image_project", "nvidia-ngc-public"),
                ("service_account", ""),
                ("maintenance_policy", "TERMINATE"),
                ("subnet", "default"),
                ("boot_disk_size", "32"),
                ("boot_disk_type", "pd-standard"),
                ("min_cpu_platform", "Automatic"),
                ("accelerator_type", "nvidia-tesla-p100"),
                ("accelerator_count", "0"),
            ],
        )
    }

    /// External connectivity lags behind `RUNNING`, more so with GPUs attached.
    fn post_create_settle(&self, vm: &VmDescriptor) -> Duration {
        let gpus = Self::accelerator(vm).map_or(0, |(_, count)| count);
        SETTLE_BASE + SETTLE_PER_ACCELERATOR * gpus
    }

    async fn resolve_image(&self, _vm: &VmDescriptor) -> Result<Option<String>, VmError> {
        // Images are referenced by name together with --image-project.
        Ok(None)
    }

    async fn create_instance(&self, vm: &VmDescriptor) -> Result<CreatedInstance, VmError> {
        let missing = |field: &str| VmError::Config(format!("{field} is not set"));
        let name = vm.name().ok_or_else(|| missing("name"))?;

        let mut cmd = Self::instance(vm, "create")?
            .opt(
                "--machine-type",
                vm.instance_type().ok_or_else(|| missing("instance_type"))?,
            )
            .opt("--subnet", vm.option_or("subnet", "default"))
            .opt("--metadata", Self::ssh_keys_metadata(vm).await?)
            .opt(
                "--maintenance-policy",
                vm.option_or("maintenance_policy", "TERMINATE"),
            );
        if let Some(account) = vm.option("service_account") {
            cmd = cmd.opt("--service-account", account);
        }
        if let Some((kind, count)) = Self::accelerator(vm) {
            cmd = cmd.opt("--accelerator", format!("type={kind},count={count}"));
        }
        cmd = cmd
            .opt("--min-cpu-platform", vm.option_or("min_cpu_platform", "Automatic"))
            .opt("--image", vm.image_name().ok_or_else(|| missing("image_name"))?)
            .opt("--image-project", vm.option_or("image_project", "nvidia-ngc-public"))
            .opt("--boot-disk-size", vm.option_or("boot_disk_size", "32"))
            .opt("--boot-disk-type", vm.option_or("boot_disk_type", "pd-standard"))
            .opt("--boot-disk-device-name", name);
        if let Some(tag) = vm.security_group_name() {
            cmd = cmd.opt("--tags", tag);
        }

        let created: Vec<Instance> = self.json(&cmd).await?;
        let instance = created.into_iter().next().ok_or_else(|| VmError::MalformedResponse {
            message: "create returned no instance".to_string(),
            body: String::new(),
        })?;
        if instance.name != name {
            return Err(VmError::IntegrityMismatch {
                field: "name".to_string(),
                expected: name.to_string(),
                actual: instance.name,
            });
        }
        info!(vm_id = %instance.id, name, "Compute Engine instance created");

        Ok(CreatedInstance {
            ip: instance.nat_ip().map(ToString::to_string),
            id: instance.id,
        })
    }

    async fn run_state(&self, vm: &VmDescriptor) -> Result<RunState, VmError> {
        Ok(match self.describe(vm).await? {
            Some(instance) => map_status(&instance.status),
            None => RunState::NotExist,
        })
    }

    async fn public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        let name = vm.name().unwrap_or_default();
        let instance = self
            .describe(vm)
            .await?
            .ok_or_else(|| VmError::ProviderRejected(format!("instance '{name}' not found")))?;

        if let Some(expected) = vm.id() {
            if expected != instance.id {
                return Err(VmError::IntegrityMismatch {
                    field: "id".to_string(),
                    expected: expected.to_string(),
                    actual: instance.id,
                });
            }
        }
        instance
            .nat_ip()
            .map(ToString::to_string)
            .ok_or_else(|| VmError::ProviderRejected(format!("instance '{name}' has no external IP")))
    }

    async fn start_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "start").await
    }

    async fn stop_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "stop").await
    }

    async fn restart_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "reset").await
    }

    async fn delete_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.instance_action(vm, "delete").await
    }

    /// Firewall rules are global, so the rule name doubles as its id.
    async fn find_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError> {
        Ok(self
            .firewall_rules(vm)
            .await?
            .into_iter()
            .find(|r| r.name == name)
            .map(|r| r.name))
    }

    /// Creates a firewall rule that applies to instances tagged `name`.
    async fn create_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
        rules: &[SecurityRule],
    ) -> Result<String, VmError> {
        let sources = rules
            .iter()
            .find(|r| r.direction == Direction::Ingress)
            .map_or("0.0.0.0/0", |r| r.cidr.as_str());
        let cmd = Self::compute(vm, "firewall-rules", "create")
            .arg(name)
            .opt("--allow", Self::allow_list(rules))
            .opt("--source-ranges", sources)
            .opt("--target-tags", name)
            .opt("--description", format!("vmctl rules for instances tagged {name}"));
        exec(self.runner.as_ref(), &cmd).await?;
        debug!(rule = name, "Created firewall rule");
        Ok(name.to_string())
    }

    async fn try_delete_security_group(
        &self,
        vm: &VmDescriptor,
        id: &str,
    ) -> Result<(), VmError> {
        let cmd = Self::compute(vm, "firewall-rules", "delete").arg(id);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn list_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroupDescriptor>, VmError> {
        Ok(self
            .firewall_rules(vm)
            .await?
            .iter()
            .map(|r| SecurityGroupDescriptor {
                id: r.name.clone(),
                name: r.name.clone(),
                description: r.description.clone(),
                rules: Self::to_rules(r),
            })
            .collect())
    }

    async fn list_running(&self, vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError> {
        let cmd = Self::compute(vm, "instances", "list").opt("--filter", "status=RUNNING");
        let instances: Vec<Instance> = self.json(&cmd).await?;
        Ok(instances
            .into_iter()
            .filter(|i| i.status == "RUNNING")
            .map(|i| InstanceSummary {
                instance_type: short_name(&i.machine_type).to_string(),
                zone: short_name(&i.zone).to_string(),
                launched: i.creation_timestamp.chars().take(10).collect(),
                id: i.id,
                name: i.name,
            })
            .collect())
    }

    /// Zones rather than regions: instances are placed in a zone.
    async fn list_regions(&self, vm: &VmDescriptor) -> Result<Vec<String>, VmError> {
        let zones: Vec<Zone> = self.json(&Self::compute(vm, "zones", "list")).await?;
        Ok(zones
            .into_iter()
            .filter(|z| z.status == "UP")
            .map(|z| z.name)
            .collect())
    }
}
