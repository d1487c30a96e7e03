//! Azure Compute adapter over the `az` CLI.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::models::{
    InstanceViewOutput, Location, NetworkSecurityGroup, NsgCreateOutput, NsgRule,
    VmCreateOutput, VmDetails,
};
use crate::descriptor::{Direction, Protocol, SecurityGroupDescriptor, SecurityRule, VmDescriptor};
use crate::error::VmError;
use crate::providers::traits::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};
use crate::runner::{decode, exec, extract_error_message, CommandLine, CommandRunner};

const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const STOP_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_RESOURCE_GROUP: &str = "vmctl-rg";

/// Priority of the first NSG rule; later rules step by 10.
const FIRST_RULE_PRIORITY: u32 = 1000;

/// Microsoft Azure provider.
#[derive(Clone)]
pub struct Azure {
    runner: Arc<dyn CommandRunner>,
}

impl Azure {
    /// Create an adapter running `az` through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Public IP resource created alongside the VM.
    fn public_ip_name(vm_name: &str) -> String {
        format!("{vm_name}-ip")
    }

    fn resource_group(vm: &VmDescriptor) -> &str {
        vm.option_or("resource_group", DEFAULT_RESOURCE_GROUP)
    }

    /// `az <words...> --output json`.
    fn az<'a>(words: impl IntoIterator<Item = &'a str>) -> CommandLine {
        CommandLine::new("az").args(words).opt("--output", "json")
    }

    /// `az vm <action> --resource-group <rg> --name <name>`.
    fn vm_command(vm: &VmDescriptor, action: &str) -> Result<CommandLine, VmError> {
        let name = vm
            .name()
            .ok_or_else(|| VmError::Config("instance name is not set".to_string()))?;
        Ok(Self::az(["vm", action])
            .opt("--resource-group", Self::resource_group(vm))
            .opt("--name", name))
    }

    async fn json<T: DeserializeOwned>(&self, cmd: &CommandLine) -> Result<T, VmError> {
        let body = exec(self.runner.as_ref(), cmd).await?;
        decode(&body)
    }

    /// Run a query whose "not found" answer is `None`.
    async fn lookup<T: DeserializeOwned>(&self, cmd: &CommandLine) -> Result<Option<T>, VmError> {
        let output = self.runner.run(cmd).await?;
        if !output.success() {
            if is_not_found(&output.stderr) || is_not_found(&output.stdout) {
                return Ok(None);
            }
            return Err(VmError::ProviderRejected(extract_error_message(
                &output.stdout,
                &output.stderr,
            )));
        }
        decode(&output.stdout).map(Some)
    }

    /// Fire-and-forget lifecycle request; the controller polls for the result.
    async fn vm_action(&self, vm: &VmDescriptor, action: &str, extra: &[&str]) -> Result<(), VmError> {
        if !vm.has_vm() {
            return Err(VmError::NoVmDefined(ProviderKind::Azure.to_string()));
        }
        let cmd = Self::vm_command(vm, action)?
            .args(extra.iter().copied())
            .arg("--no-wait");
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    /// `az group create` is idempotent.
    async fn ensure_resource_group(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let location = vm
            .region()
            .ok_or_else(|| VmError::Config("location is not set".to_string()))?;
        let cmd = Self::az(["group", "create"])
            .opt("--name", Self::resource_group(vm))
            .opt("--location", location);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    fn rule_command(
        vm: &VmDescriptor,
        nsg: &str,
        rule: &SecurityRule,
        priority: u32,
    ) -> CommandLine {
        let (direction, prefix_flag) = match rule.direction {
            Direction::Ingress => ("Inbound", "--source-address-prefixes"),
            Direction::Egress => ("Outbound", "--destination-address-prefixes"),
        };
        let (protocol, ports) = match (rule.protocol, rule.from_port, rule.to_port) {
            (Protocol::Tcp, Some(from), Some(to)) if from == to => ("Tcp", from.to_string()),
            (Protocol::Tcp, Some(from), Some(to)) => ("Tcp", format!("{from}-{to}")),
            (Protocol::Tcp, _, _) => ("Tcp", "*".to_string()),
            (Protocol::Icmp, _, _) => ("Icmp", "*".to_string()),
            (Protocol::All, _, _) => ("*", "*".to_string()),
        };
        let rule_name = match rule.from_port {
            Some(port) => format!("{}-{port}", rule.protocol),
            None => format!("{}-{}", rule.protocol, direction.to_lowercase()),
        };
        Self::az(["network", "nsg", "rule", "create"])
            .opt("--resource-group", Self::resource_group(vm))
            .opt("--nsg-name", nsg)
            .opt("--name", rule_name)
            .opt("--priority", priority.to_string())
            .opt("--direction", direction)
            .opt("--access", "Allow")
            .opt("--protocol", protocol)
            .opt("--destination-port-ranges", ports)
            .opt(prefix_flag, rule.cidr.clone())
            .opt("--description", rule.description.clone())
    }

    fn to_rule(rule: &NsgRule) -> SecurityRule {
        let protocol = match rule.protocol.as_str() {
            "Tcp" => Protocol::Tcp,
            "Icmp" => Protocol::Icmp,
            _ => Protocol::All,
        };
        let (from_port, to_port) = match rule.destination_port_range.as_deref() {
            Some(range) => match range.split_once('-') {
                Some((from, to)) => (from.parse().ok(), to.parse().ok()),
                None => {
                    let port = range.parse().ok();
                    (port, port)
                }
            },
            None => (None, None),
        };
        SecurityRule {
            protocol,
            from_port,
            to_port,
            cidr: rule
                .source_address_prefix
                .clone()
                .unwrap_or_else(|| "*".to_string()),
            direction: if rule.direction == "Outbound" {
                Direction::Egress
            } else {
                Direction::Ingress
            },
            description: rule
                .description
                .clone()
                .unwrap_or_else(|| rule.name.clone()),
        }
    }

    async fn list_nsgs(&self, vm: &VmDescriptor) -> Result<Vec<NetworkSecurityGroup>, VmError> {
        let cmd = Self::az(["network", "nsg", "list"])
            .opt("--resource-group", Self::resource_group(vm));
        Ok(self.lookup(&cmd).await?.unwrap_or_default())
    }
}

fn is_not_found(text: &str) -> bool {
    text.contains("NotFound") || text.contains("was not found") || text.contains("could not be found")
}

/// Map a `PowerState/*` code into the normalized set.
pub(crate) fn map_power_state(state: Option<&str>) -> RunState {
    match state {
        // Not reported until provisioning completes.
        None | Some("starting") => RunState::Pending,
        Some("running") => RunState::Running,
        Some("stopping" | "deallocating") => RunState::Stopping,
        Some("stopped" | "deallocated") => RunState::Stopped,
        Some(_) => RunState::Unknown,
    }
}

#[async_trait]
impl ProviderAdapter for Azure {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Azure
    }

    fn traits(&self) -> ProviderTraits {
        ProviderTraits {
            pingable: true,
            auto_starts_on_create: true,
            stop_transient_state: RunState::Stopping,
            reassigns_ip_on_stop: true,
            requires_stop_before_delete: false,
            termination_observable: true,
            key_extension: "",
            needs_public_key: true,
            create_timeout: CREATE_TIMEOUT,
            stop_timeout: STOP_TIMEOUT,
            post_create_settle: Duration::ZERO,
        }
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults::new(
            "westus2",
            "Standard_NC6s_v3",
            "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest",
            "azureuser",
            true,
            &[("resource_group", DEFAULT_RESOURCE_GROUP)],
        )
    }

    async fn resolve_image(&self, _vm: &VmDescriptor) -> Result<Option<String>, VmError> {
        // `az vm create --image` takes URNs and aliases directly.
        Ok(None)
    }

    async fn create_instance(&self, vm: &VmDescriptor) -> Result<CreatedInstance, VmError> {
        let missing = |field: &str| VmError::Config(format!("{field} is not set"));
        let key_file = vm.key_file().ok_or_else(|| missing("key_file"))?;

        self.ensure_resource_group(vm).await?;

        let name = vm.name().ok_or_else(|| missing("name"))?;
        let mut cmd = Self::vm_command(vm, "create")?
            .opt("--location", vm.region().ok_or_else(|| missing("location"))?)
            .opt("--size", vm.instance_type().ok_or_else(|| missing("instance_type"))?)
            .opt("--image", vm.image_name().ok_or_else(|| missing("image_name"))?)
            .opt("--admin-username", vm.user().ok_or_else(|| missing("user"))?)
            .opt("--ssh-key-values", format!("{key_file}.pub"))
            .opt("--public-ip-sku", "Standard")
            .opt("--public-ip-address", Self::public_ip_name(name))
            .opt("--nic-delete-option", "Delete")
            .opt("--os-disk-delete-option", "Delete");
        if let Some(nsg) = vm.security_group_name() {
            cmd = cmd.opt("--nsg", nsg);
        }

        let created: VmCreateOutput = self.json(&cmd).await?;
        info!(vm_id = %created.id, "Azure VM created");
        Ok(CreatedInstance {
            id: created.id,
            ip: created.public_ip_address.filter(|ip| !ip.is_empty()),
        })
    }

    async fn run_state(&self, vm: &VmDescriptor) -> Result<RunState, VmError> {
        let cmd = Self::vm_command(vm, "get-instance-view")?;
        Ok(match self.lookup::<InstanceViewOutput>(&cmd).await? {
            Some(view) => map_power_state(view.power_state()),
            None => RunState::NotExist,
        })
    }

    async fn public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        let name = vm.name().unwrap_or_default();
        let cmd = Self::vm_command(vm, "show")?.arg("--show-details");
        let details: VmDetails = self
            .lookup(&cmd)
            .await?
            .ok_or_else(|| VmError::ProviderRejected(format!("VM '{name}' not found")))?;

        if let Some(expected) = vm.id() {
            // Resource ids are case-insensitive and the CLI does not preserve case.
            if !expected.eq_ignore_ascii_case(&details.id) {
                return Err(VmError::IntegrityMismatch {
                    field: "id".to_string(),
                    expected: expected.to_string(),
                    actual: details.id,
                });
            }
        }
        details
            .public_ip()
            .map(ToString::to_string)
            .ok_or_else(|| VmError::ProviderRejected(format!("VM '{name}' has no public IP")))
    }

    async fn start_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.vm_action(vm, "start", &[]).await
    }

    /// Deallocates, so compute is no longer billed.
    async fn stop_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.vm_action(vm, "deallocate", &[]).await
    }

    async fn restart_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.vm_action(vm, "restart", &[]).await
    }

    /// Waits for the VM delete, which also removes its NIC and OS disk, then
    /// releases the public IP so the NSG is no longer referenced.
    async fn delete_instance(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        if !vm.has_vm() {
            return Err(VmError::NoVmDefined(ProviderKind::Azure.to_string()));
        }
        let cmd = Self::vm_command(vm, "delete")?.arg("--yes");
        exec(self.runner.as_ref(), &cmd).await?;

        let name = vm.name().unwrap_or_default();
        let ip_name = Self::public_ip_name(name);
        let cmd = Self::az(["network", "public-ip", "delete"])
            .opt("--resource-group", Self::resource_group(vm))
            .opt("--name", ip_name.clone());
        if let Some(error) = self.runner.run_checked(&cmd).await?.error_message {
            warn!(public_ip = %ip_name, error = %error, "Could not delete public IP");
        }
        Ok(())
    }

    async fn find_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError> {
        let cmd = Self::az(["network", "nsg", "show"])
            .opt("--resource-group", Self::resource_group(vm))
            .opt("--name", name);
        Ok(self
            .lookup::<NetworkSecurityGroup>(&cmd)
            .await?
            .filter(|nsg| nsg.name == name)
            .map(|nsg| nsg.id))
    }

    async fn create_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
        rules: &[SecurityRule],
    ) -> Result<String, VmError> {
        self.ensure_resource_group(vm).await?;
        let location = vm.region().unwrap_or_default();
        let cmd = Self::az(["network", "nsg", "create"])
            .opt("--resource-group", Self::resource_group(vm))
            .opt("--name", name)
            .opt("--location", location);
        let created: NsgCreateOutput = self.json(&cmd).await?;
        let id = created.new_nsg.id;

        // Outbound traffic is allowed by the default rules.
        let inbound = rules.iter().filter(|r| r.direction == Direction::Ingress);
        for (priority, rule) in (FIRST_RULE_PRIORITY..).step_by(10).zip(inbound) {
            exec(self.runner.as_ref(), &Self::rule_command(vm, name, rule, priority)).await?;
            debug!(nsg = name, priority, protocol = %rule.protocol, ports = %rule.port_range(), "Added NSG rule");
        }
        Ok(id)
    }

    async fn try_delete_security_group(
        &self,
        _vm: &VmDescriptor,
        id: &str,
    ) -> Result<(), VmError> {
        let cmd = CommandLine::new("az")
            .args(["network", "nsg", "delete"])
            .opt("--ids", id);
        exec(self.runner.as_ref(), &cmd).await?;
        Ok(())
    }

    async fn list_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroupDescriptor>, VmError> {
        Ok(self
            .list_nsgs(vm)
            .await?
            .into_iter()
            .map(|nsg| SecurityGroupDescriptor {
                rules: nsg.security_rules.iter().map(Self::to_rule).collect(),
                id: nsg.id,
                name: nsg.name,
                description: None,
            })
            .collect())
    }

    async fn list_running(&self, _vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError> {
        let vms: Vec<VmDetails> = self.json(&Self::az(["vm", "list"]).arg("--show-details")).await?;
        Ok(vms
            .into_iter()
            .filter(|v| v.power_state.as_deref() == Some("VM running"))
            .map(|v| InstanceSummary {
                instance_type: v
                    .hardware_profile
                    .as_ref()
                    .map(|h| h.vm_size.clone())
                    .unwrap_or_default(),
                launched: v
                    .time_created
                    .as_deref()
                    .map(|t| t.chars().take(10).collect())
                    .unwrap_or_default(),
                zone: v.location,
                id: v.id,
                name: v.name,
            })
            .collect())
    }

    async fn list_regions(&self, _vm: &VmDescriptor) -> Result<Vec<String>, VmError> {
        let locations: Vec<Location> = self.json(&Self::az(["account", "list-locations"])).await?;
        Ok(locations.into_iter().map(|l| l.name).collect())
    }
}
