//! Provider adapter trait and common types.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::descriptor::{SecurityGroupDescriptor, SecurityRule, VmDescriptor};
use crate::error::VmError;
use crate::retry::{with_linear_backoff, RetryPolicy};

/// Supported cloud service providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Amazon Web Services (`aws`).
    Aws,
    /// Alibaba Cloud (`aliyun`).
    Alibaba,
    /// Google Cloud Platform (`gcloud`).
    Gcp,
    /// Microsoft Azure (`az`).
    Azure,
}

impl ProviderKind {
    /// Short name used for state directories and messages.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Alibaba => "alibaba",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        }
    }

    /// Provider CLI binary.
    #[must_use]
    pub fn binary(self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Alibaba => "aliyun",
            Self::Gcp => "gcloud",
            Self::Azure => "az",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Normalized instance run state.
///
/// Every adapter maps its provider's raw status vocabulary into this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// No such instance (never created, or terminated).
    NotExist,
    /// Being provisioned or starting.
    Pending,
    /// Running.
    Running,
    /// Being stopped.
    Stopping,
    /// Stopped.
    Stopped,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotExist => write!(f, "not_exist"),
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Static lifecycle behavior of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTraits {
    /// Instances created by this tool answer ICMP echo.
    pub pingable: bool,
    /// The create call also boots the instance.
    pub auto_starts_on_create: bool,
    /// State reported immediately after a stop request is accepted.
    pub stop_transient_state: RunState,
    /// The public address changes across stop/start.
    pub reassigns_ip_on_stop: bool,
    /// Deletion requires a stopped instance.
    pub requires_stop_before_delete: bool,
    /// `NotExist` becomes observable after deletion.
    pub termination_observable: bool,
    /// Private key file extension appended to `key_path + key_name`.
    pub key_extension: &'static str,
    /// A public key (`.pub`) companion must also exist.
    pub needs_public_key: bool,
    /// Ceiling for create / start / delete convergence.
    pub create_timeout: Duration,
    /// Ceiling for stop convergence and ping transitions.
    pub stop_timeout: Duration,
    /// Delay after create before the first probe.
    pub post_create_settle: Duration,
}

/// Built-in defaults, the lowest configuration layer.
#[derive(Debug, Clone)]
pub struct ProviderDefaults {
    /// Default descriptor values.
    pub descriptor: VmDescriptor,
}

impl ProviderDefaults {
    /// Defaults shared by every provider, plus the provider's own values.
    #[must_use]
    pub fn new(
        region: &str,
        instance_type: &str,
        image_name: &str,
        user: &str,
        pingable: bool,
        options: &[(&str, &str)],
    ) -> Self {
        let user_name = std::env::var("USER").unwrap_or_else(|_| "vmctl".to_string());
        Self {
            descriptor: VmDescriptor {
                region: Some(region.to_string()),
                instance_type: Some(instance_type.to_string()),
                image_name: Some(image_name.to_string()),
                user: Some(user.to_string()),
                key_name: Some("my-security-key-name".to_string()),
                key_path: Some("~/.ssh/".to_string()),
                security_group_name: Some(format!("{user_name}-vmctl-nsg")),
                pingable,
                options: options
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect::<BTreeMap<_, _>>(),
                ..Default::default()
            },
        }
    }
}

/// Result of a create call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreatedInstance {
    /// Provider instance id.
    pub id: String,
    /// Public address, when returned by the create call itself.
    pub ip: Option<String>,
}

/// One running instance, for `showrunning`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSummary {
    /// Provider id.
    pub id: String,
    /// Name / Name tag.
    pub name: String,
    /// Machine size.
    pub instance_type: String,
    /// Zone or region.
    pub zone: String,
    /// Launch date (`YYYY-MM-DD`).
    pub launched: String,
}

/// Translates lifecycle intents into one provider's CLI vocabulary.
///
/// Operations never wait for convergence; that is the controller's job.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Which provider this is.
    fn kind(&self) -> ProviderKind;

    /// Static lifecycle behavior.
    fn traits(&self) -> ProviderTraits;

    /// Built-in configuration defaults.
    fn defaults(&self) -> ProviderDefaults;

    /// Delay after create before the first probe of this VM.
    fn post_create_settle(&self, _vm: &VmDescriptor) -> Duration {
        self.traits().post_create_settle
    }

    /// Whether the provider CLI is discoverable on `PATH`.
    fn check_tooling(&self) -> bool {
        which::which(self.kind().binary()).is_ok()
    }

    /// Resolve the image name into a provider image id, if the provider needs one.
    async fn resolve_image(&self, vm: &VmDescriptor) -> Result<Option<String>, VmError>;

    /// Allocate compute (and, where separate, the public IP).
    async fn create_instance(&self, vm: &VmDescriptor) -> Result<CreatedInstance, VmError>;

    /// Current normalized state; "not found" is [`RunState::NotExist`].
    async fn run_state(&self, vm: &VmDescriptor) -> Result<RunState, VmError>;

    /// Public address, queried and cross-validated when not already stable.
    async fn public_ip(&self, vm: &VmDescriptor) -> Result<String, VmError>;

    /// Issue a start request.
    async fn start_instance(&self, vm: &VmDescriptor) -> Result<(), VmError>;

    /// Issue a stop request.
    async fn stop_instance(&self, vm: &VmDescriptor) -> Result<(), VmError>;

    /// Issue a restart request.
    async fn restart_instance(&self, vm: &VmDescriptor) -> Result<(), VmError>;

    /// Issue a delete request.
    async fn delete_instance(&self, vm: &VmDescriptor) -> Result<(), VmError>;

    /// Id of the security group with exactly this name, if it exists.
    async fn find_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError>;

    /// Create a security group with the given rules, returning its id.
    async fn create_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
        rules: &[SecurityRule],
    ) -> Result<String, VmError>;

    /// Single deletion attempt.
    async fn try_delete_security_group(&self, vm: &VmDescriptor, id: &str)
        -> Result<(), VmError>;

    /// All security groups visible in the configured region.
    async fn list_security_groups(
        &self,
        vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroupDescriptor>, VmError>;

    /// Running instances in the account.
    async fn list_running(&self, vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError>;

    /// Region names.
    async fn list_regions(&self, vm: &VmDescriptor) -> Result<Vec<String>, VmError>;

    /// Return the id of the named group, creating it with the default rules if absent.
    async fn ensure_security_group(
        &self,
        vm: &VmDescriptor,
        name: &str,
    ) -> Result<String, VmError> {
        if name.is_empty() {
            return Err(VmError::Config("security group name is empty".to_string()));
        }
        if let Some(id) = self.find_security_group(vm, name).await? {
            tracing::debug!(name, id = %id, "Security group exists");
            return Ok(id);
        }
        let id = self
            .create_security_group(vm, name, &SecurityRule::defaults())
            .await?;
        tracing::info!(name, id = %id, "Created security group");
        Ok(id)
    }

    /// Best-effort deletion, retried while the provider releases attachments.
    async fn delete_security_group(&self, vm: &VmDescriptor, id: &str) -> Result<(), VmError> {
        with_linear_backoff(&RetryPolicy::SECURITY_GROUP_DELETE, "delete security group", || {
            self.try_delete_security_group(vm, id)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::NotExist.to_string(), "not_exist");
        assert_eq!(RunState::Stopping.to_string(), "stopping");
    }

    #[test]
    fn test_provider_binaries() {
        assert_eq!(ProviderKind::Alibaba.binary(), "aliyun");
        assert_eq!(ProviderKind::Gcp.binary(), "gcloud");
        assert_eq!(ProviderKind::Azure.name(), "azure");
    }
}
