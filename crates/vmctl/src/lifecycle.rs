//! VM lifecycle state machine.
//!
//! ```text
//! Absent -> Creating -> Running <-> Stopping/Starting <-> Stopped -> Deleting -> Absent
//!                       Running -> Restarting -> Running
//! ```
//!
//! Only terminal states are persisted (through the descriptor's `id`).
//! Transient states are observed by polling the provider, never stored.
//! Every wait is bounded; the only retries are the adapter-level ones in
//! [`crate::retry`].

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::descriptor::{SecurityGroupDescriptor, VmDescriptor};
use crate::error::VmError;
use crate::probe::{Reachability, SshTarget};
use crate::providers::{InstanceSummary, ProviderAdapter, RunState};
use crate::runner::CommandOutput;
use crate::state::{DescriptorStore, RegionCache};

/// Interval between run-state polls.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Settle delay used by restart when the provider cannot be pinged.
pub const RESTART_SETTLE: Duration = Duration::from_secs(5);

/// Command run over SSH to decide a host is fully up.
pub const SSH_PROBE_COMMAND: &str = "uname -a";

/// SSH wait used by `boottime` before querying the host.
const BOOTTIME_SSH_TIMEOUT: Duration = Duration::from_secs(10);

/// Boot time breakdown reported by `systemd-analyze`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootTime {
    /// Kernel phase, e.g. `3.582s`.
    pub kernel: String,
    /// Userspace phase.
    pub userspace: String,
    /// Total.
    pub total: String,
}

impl BootTime {
    /// Parse `Startup finished in 3.582s (kernel) + 5.972s (userspace) = 9.555s`.
    ///
    /// # Errors
    /// Returns [`VmError::MalformedResponse`] if the line is not in that shape.
    pub fn parse(output: &str) -> Result<Self, VmError> {
        let malformed = || VmError::MalformedResponse {
            message: "unexpected systemd-analyze output".to_string(),
            body: output.to_string(),
        };
        let line = output
            .lines()
            .find(|l| l.contains("Startup finished"))
            .ok_or_else(malformed)?;
        let tokens: Vec<&str> = line.split_whitespace().collect();

        let before = |label: &str| {
            tokens
                .iter()
                .position(|t| *t == label)
                .filter(|&i| i > 0)
                .map(|i| tokens[i - 1].to_string())
        };
        let kernel = before("(kernel)").ok_or_else(malformed)?;
        let userspace = before("(userspace)").ok_or_else(malformed)?;
        let total = tokens
            .iter()
            .position(|t| *t == "=")
            .and_then(|i| tokens.get(i + 1))
            .map(ToString::to_string)
            .ok_or_else(malformed)?;

        Ok(Self {
            kernel,
            userspace,
            total,
        })
    }
}

/// Drives one VM through its lifecycle on one provider.
pub struct VmController {
    provider: Box<dyn ProviderAdapter>,
    probe: Box<dyn Reachability>,
    store: Box<dyn DescriptorStore>,
    regions: Option<RegionCache>,
    overrides: VmDescriptor,
    timeout: Option<Duration>,
    poll_interval: Duration,
    restart_settle: Duration,
}

impl VmController {
    /// Create a controller from its collaborators.
    #[must_use]
    pub fn new(
        provider: Box<dyn ProviderAdapter>,
        probe: Box<dyn Reachability>,
        store: Box<dyn DescriptorStore>,
    ) -> Self {
        Self {
            provider,
            probe,
            store,
            regions: None,
            overrides: VmDescriptor::default(),
            timeout: None,
            poll_interval: STATUS_POLL_INTERVAL,
            restart_settle: RESTART_SETTLE,
        }
    }

    /// Use a region cache for `showregions`, region validation and `clean`.
    #[must_use]
    pub fn with_region_cache(mut self, regions: RegionCache) -> Self {
        self.regions = Some(regions);
        self
    }

    /// Values that take precedence over the persisted descriptor.
    #[must_use]
    pub fn with_overrides(mut self, overrides: VmDescriptor) -> Self {
        self.overrides = overrides;
        self
    }

    /// Replace every provider timeout with a single ceiling.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Provider adapter in use.
    #[must_use]
    pub fn provider(&self) -> &dyn ProviderAdapter {
        self.provider.as_ref()
    }

    fn create_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or_else(|| self.provider.traits().create_timeout)
    }

    fn stop_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.provider.traits().stop_timeout)
    }

    /// Effective descriptor: overrides, then the persisted record, then defaults.
    ///
    /// # Errors
    /// Returns an error if the persisted record cannot be read.
    pub fn load(&self) -> Result<VmDescriptor, VmError> {
        let stored = self.store.load()?;
        let mut vm = self.overrides.clone();
        vm.merge_defaults(&stored);
        vm.merge_defaults(&self.provider.defaults().descriptor);
        vm.pingable = self.provider.traits().pingable;
        Ok(vm)
    }

    fn require_vm(&self, vm: &VmDescriptor) -> Result<String, VmError> {
        vm.id()
            .map(ToString::to_string)
            .ok_or_else(|| VmError::NoVmDefined(self.provider.kind().to_string()))
    }

    /// Known address, or the provider's answer, which is recorded.
    async fn current_ip(&self, vm: &mut VmDescriptor) -> Result<String, VmError> {
        if let Some(ip) = vm.ip() {
            return Ok(ip.to_string());
        }
        let ip = self.provider.public_ip(vm).await?;
        vm.ip = Some(ip.clone());
        Ok(ip)
    }

    fn ssh_target(vm: &VmDescriptor, ip: &str) -> Result<SshTarget, VmError> {
        let user = vm
            .user()
            .ok_or_else(|| VmError::Config("no SSH user configured".to_string()))?;
        Ok(SshTarget {
            ip: ip.to_string(),
            user: user.to_string(),
            key_file: vm.key_file().map(ToString::to_string),
        })
    }

    /// Resolve `key_path + key_name + extension` and check it exists.
    fn resolve_key_file(&self, vm: &mut VmDescriptor) -> Result<(), VmError> {
        let traits = self.provider.traits();
        let path = vm
            .key_file_candidate(traits.key_extension)
            .ok_or_else(|| VmError::Config("no key name configured".to_string()))?;
        if !path.exists() {
            return Err(VmError::KeyFileMissing(path.display().to_string()));
        }
        if traits.needs_public_key {
            let public = format!("{}.pub", path.display());
            if !Path::new(&public).exists() {
                return Err(VmError::KeyFileMissing(public));
            }
        }
        debug!(key_file = %path.display(), "Using SSH key");
        vm.key_file = Some(path.display().to_string());
        Ok(())
    }

    async fn validate_region(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        let (Some(region), Some(cache)) = (self.overrides.region(), &self.regions) else {
            return Ok(());
        };
        let regions = cache.get_or_fetch(self.provider.as_ref(), vm).await?;
        if regions.iter().any(|r| r == region) {
            Ok(())
        } else {
            Err(VmError::Config(format!(
                "invalid region '{region}' for {}, see 'showregions'",
                self.provider.kind()
            )))
        }
    }

    fn default_name(&self) -> String {
        let user = std::env::var("USER").unwrap_or_else(|_| "vmctl".to_string());
        format!(
            "{}-{}-{}",
            user.to_lowercase(),
            self.provider.kind(),
            chrono::Local::now().format("%Y%m%d-%H%M%S")
        )
    }

    /// Poll the run state until it equals `desired`.
    ///
    /// The first check is immediate; the call returns [`VmError::Timeout`]
    /// no later than `timeout` plus one poll interval.
    ///
    /// # Errors
    /// Returns an error on timeout or if a status query fails.
    pub async fn wait_for_run_status(
        &self,
        vm: &VmDescriptor,
        desired: RunState,
        timeout: Duration,
    ) -> Result<(), VmError> {
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let state = self.provider.run_state(vm).await?;
            debug!(%state, %desired, elapsed_ms = start.elapsed().as_millis(), "Run state poll");
            if state == desired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(%state, %desired, "Run state wait timed out");
                return Err(VmError::Timeout {
                    operation: format!("instance to become {desired} (last seen {state})"),
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for running, then an address, then ping (if supported), then SSH.
    ///
    /// # Errors
    /// Returns the first stage failure.
    pub async fn wait_until_fully_reachable(
        &self,
        vm: &mut VmDescriptor,
        timeout: Duration,
    ) -> Result<(), VmError> {
        self.wait_for_run_status(vm, RunState::Running, timeout)
            .await?;

        let previous = vm.ip().map(ToString::to_string);
        let ip = self.provider.public_ip(vm).await?;
        if previous.as_deref() != Some(ip.as_str()) {
            info!(ip = %ip, "Public address assigned");
            self.probe.remove_known_host(&ip).await;
        }
        vm.ip = Some(ip.clone());

        if vm.pingable {
            self.probe.wait_for_ping_state(&ip, true, timeout).await?;
        }

        let target = Self::ssh_target(vm, &ip)?;
        self.probe
            .wait_for_ssh(&target, SSH_PROBE_COMMAND, timeout)
            .await?;
        info!(ip = %ip, "Instance is fully reachable");
        Ok(())
    }

    /// Provision a new VM and return once it is fully reachable.
    ///
    /// The id is persisted as soon as the provider returns it, so a failure
    /// later in the sequence still leaves a descriptor `delete` can act on.
    ///
    /// # Errors
    /// Returns [`VmError::AlreadyExists`] if a VM is recorded, or the first
    /// failing step.
    pub async fn create(&self) -> Result<VmDescriptor, VmError> {
        let mut vm = self.load()?;
        if let Some(id) = vm.id() {
            return Err(VmError::AlreadyExists(id.to_string()));
        }
        let traits = self.provider.traits();
        let timeout = self.create_timeout();

        self.validate_region(&vm).await?;
        vm.ip = None;
        self.resolve_key_file(&mut vm)?;

        if vm.security_group_id().is_none() {
            let name = vm
                .security_group_name()
                .ok_or_else(|| VmError::Config("security group name is empty".to_string()))?
                .to_string();
            let id = self.provider.ensure_security_group(&vm, &name).await?;
            vm.security_group_id = Some(id);
        }

        if let Some(image_id) = self.provider.resolve_image(&vm).await? {
            vm.image_id = Some(image_id);
        }
        if vm.name().is_none() {
            vm.name = Some(self.default_name());
        }

        info!(
            provider = %self.provider.kind(),
            name = ?vm.name(),
            instance_type = ?vm.instance_type(),
            region = ?vm.region(),
            "Creating instance"
        );
        let created = self.provider.create_instance(&vm).await?;
        vm.id = Some(created.id.clone());
        vm.ip = created.ip;
        self.store.save(&vm)?;
        info!(vm_id = %created.id, ip = ?vm.ip(), "Instance created");

        let settle = self.provider.post_create_settle(&vm);
        if !settle.is_zero() {
            debug!(delay_secs = settle.as_secs(), "Waiting for instance to settle");
            tokio::time::sleep(settle).await;
        }
        if let Some(ip) = vm.ip() {
            self.probe.remove_known_host(ip).await;
        }

        if !traits.auto_starts_on_create {
            self.wait_for_run_status(&vm, RunState::Stopped, timeout)
                .await?;
            info!(vm_id = %created.id, "Starting instance");
            self.provider.start_instance(&vm).await?;
        }

        self.wait_until_fully_reachable(&mut vm, timeout).await?;
        self.store.save(&vm)?;
        Ok(vm)
    }

    /// Start a stopped VM and return once it is fully reachable.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] without contacting the provider if
    /// no VM is recorded, or [`VmError::InvalidState`] if the VM cannot be
    /// started from its current state.
    pub async fn start(&self) -> Result<VmDescriptor, VmError> {
        let mut vm = self.load()?;
        let id = self.require_vm(&vm)?;

        match self.provider.run_state(&vm).await? {
            RunState::Running => {
                info!(vm_id = %id, "Instance is already running");
                return Ok(vm);
            }
            RunState::Stopped | RunState::NotExist => {}
            state => {
                return Err(VmError::InvalidState {
                    operation: "start".to_string(),
                    state,
                })
            }
        }

        info!(vm_id = %id, "Starting instance");
        self.provider.start_instance(&vm).await?;
        self.wait_until_fully_reachable(&mut vm, self.create_timeout())
            .await?;
        self.store.save(&vm)?;
        Ok(vm)
    }

    /// Stop a running VM and return once it is stopped.
    ///
    /// # Errors
    /// Returns [`VmError::StopNotHonored`] if the provider does not report
    /// its transient stopping state right after accepting the request.
    pub async fn stop(&self) -> Result<VmDescriptor, VmError> {
        let mut vm = self.load()?;
        let id = self.require_vm(&vm)?;
        self.require_running(&vm, "stop").await?;

        self.stop_and_wait(&mut vm, &id).await?;
        self.store.save(&vm)?;
        Ok(vm)
    }

    async fn require_running(&self, vm: &VmDescriptor, operation: &str) -> Result<(), VmError> {
        match self.provider.run_state(vm).await? {
            RunState::Running => Ok(()),
            state => Err(VmError::InvalidState {
                operation: operation.to_string(),
                state,
            }),
        }
    }

    async fn stop_and_wait(&self, vm: &mut VmDescriptor, id: &str) -> Result<(), VmError> {
        let traits = self.provider.traits();

        info!(vm_id = %id, "Stopping instance");
        self.provider.stop_instance(vm).await?;

        let state = self.provider.run_state(vm).await?;
        if state != traits.stop_transient_state {
            return Err(VmError::StopNotHonored(state));
        }
        self.wait_for_run_status(vm, RunState::Stopped, self.stop_timeout())
            .await?;

        if traits.reassigns_ip_on_stop {
            vm.ip = None;
        }
        info!(vm_id = %id, "Instance stopped");
        Ok(())
    }

    /// Restart a running VM and return once it is fully reachable again.
    ///
    /// # Errors
    /// Returns [`VmError::Timeout`] if a pingable host never went unreachable.
    pub async fn restart(&self) -> Result<VmDescriptor, VmError> {
        let mut vm = self.load()?;
        let id = self.require_vm(&vm)?;
        self.require_running(&vm, "restart").await?;
        let ip = self.current_ip(&mut vm).await?;

        info!(vm_id = %id, "Restarting instance");
        self.provider.restart_instance(&vm).await?;

        if vm.pingable {
            self.probe
                .wait_for_ping_state(&ip, false, self.stop_timeout())
                .await
                .map_err(|e| match e {
                    VmError::Timeout { elapsed_secs, .. } => VmError::Timeout {
                        operation: format!("{ip} to go unreachable (it never went down, did the VM restart?)"),
                        elapsed_secs,
                    },
                    other => other,
                })?;
        } else {
            // No reliable signal that the host went down; fall back to a fixed delay.
            warn!(
                vm_id = %id,
                delay_secs = self.restart_settle.as_secs(),
                "Provider does not permit ping, cannot confirm the restart took effect"
            );
            tokio::time::sleep(self.restart_settle).await;
        }

        self.wait_until_fully_reachable(&mut vm, self.create_timeout())
            .await?;
        self.store.save(&vm)?;
        Ok(vm)
    }

    /// Delete the VM and clear the persisted descriptor.
    ///
    /// The security group is kept unless `with_security_group` is set, in
    /// which case its deletion is best-effort.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] if no VM is recorded, or the provider
    /// error if the delete request fails.
    pub async fn delete(&self, with_security_group: bool) -> Result<(), VmError> {
        let mut vm = self.load()?;
        let id = self.require_vm(&vm)?;
        let traits = self.provider.traits();

        if traits.requires_stop_before_delete
            && self.provider.run_state(&vm).await? == RunState::Running
        {
            if let Err(e) = self.stop_and_wait(&mut vm, &id).await {
                warn!(vm_id = %id, error = %e, "Stop before delete failed, deleting anyway");
            }
        }

        info!(vm_id = %id, "Deleting instance");
        self.provider.delete_instance(&vm).await?;
        if traits.termination_observable {
            self.wait_for_run_status(&vm, RunState::NotExist, self.create_timeout())
                .await?;
        }

        if let Some(ip) = vm.ip() {
            self.probe.remove_known_host(ip).await;
        }
        self.store.clear()?;
        info!(vm_id = %id, "Instance deleted");

        if with_security_group {
            if let Some(group) = vm.security_group_id() {
                match self.provider.delete_security_group(&vm, group).await {
                    Ok(()) => info!(security_group = %group, "Deleted security group"),
                    Err(e) => warn!(security_group = %group, error = %e, "Could not delete security group"),
                }
            }
        }
        Ok(())
    }

    /// Normalized run state.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] if no VM is recorded.
    pub async fn status(&self) -> Result<RunState, VmError> {
        let vm = self.load()?;
        self.require_vm(&vm)?;
        self.provider.run_state(&vm).await
    }

    /// Recorded VM and security group.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] if no VM is recorded.
    pub fn show(&self) -> Result<VmDescriptor, VmError> {
        let vm = self.load()?;
        self.require_vm(&vm)?;
        Ok(vm)
    }

    /// Public address, queried and recorded if not yet known.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] if no VM is recorded.
    pub async fn show_ip(&self) -> Result<String, VmError> {
        let mut vm = self.load()?;
        self.require_vm(&vm)?;
        if let Some(ip) = vm.ip() {
            return Ok(ip.to_string());
        }
        let ip = self.current_ip(&mut vm).await?;
        self.store.save(&vm)?;
        Ok(ip)
    }

    /// Run `argv` on the VM, or open an interactive session when empty.
    ///
    /// # Errors
    /// Returns [`VmError::NoVmDefined`] if no VM is recorded.
    pub async fn ssh(&self, argv: &[String]) -> Result<CommandOutput, VmError> {
        let mut vm = self.load()?;
        self.require_vm(&vm)?;
        let ip = self.current_ip(&mut vm).await?;
        let target = Self::ssh_target(&vm, &ip)?;

        if argv.is_empty() {
            let code = self.probe.ssh_interactive(&target).await?;
            return Ok(CommandOutput {
                code,
                ..CommandOutput::default()
            });
        }
        self.probe.ssh(&target, argv).await
    }

    /// Three-echo ping of the VM.
    ///
    /// # Errors
    /// Returns [`VmError::NotPingable`] if the provider network drops ICMP.
    pub async fn ping(&self) -> Result<CommandOutput, VmError> {
        if !self.provider.traits().pingable {
            return Err(VmError::NotPingable(self.provider.kind().to_string()));
        }
        let mut vm = self.load()?;
        self.require_vm(&vm)?;
        let ip = self.current_ip(&mut vm).await?;
        self.probe.ping_report(&ip).await
    }

    /// Kernel, userspace and total boot time.
    ///
    /// # Errors
    /// Returns an error if SSH is unavailable or the output does not parse.
    pub async fn boot_time(&self) -> Result<BootTime, VmError> {
        let mut vm = self.load()?;
        self.require_vm(&vm)?;
        let ip = self.current_ip(&mut vm).await?;
        let target = Self::ssh_target(&vm, &ip)?;

        self.probe
            .wait_for_ssh(&target, SSH_PROBE_COMMAND, BOOTTIME_SSH_TIMEOUT)
            .await?;
        let output = self
            .probe
            .ssh(&target, &["systemd-analyze".to_string()])
            .await?;
        if !output.success() {
            return Err(VmError::ProviderRejected(output.stderr.trim().to_string()));
        }
        BootTime::parse(&output.stdout)
    }

    /// Running instances in the account.
    ///
    /// # Errors
    /// Returns the provider error.
    pub async fn show_running(&self) -> Result<Vec<InstanceSummary>, VmError> {
        let vm = self.load()?;
        self.provider.list_running(&vm).await
    }

    /// Region names, from the cache when available.
    ///
    /// # Errors
    /// Returns the provider error, or a cache write failure.
    pub async fn show_regions(&self) -> Result<Vec<String>, VmError> {
        let vm = self.load()?;
        match &self.regions {
            Some(cache) => cache.get_or_fetch(self.provider.as_ref(), &vm).await,
            None => self.provider.list_regions(&vm).await,
        }
    }

    /// Security groups in the configured region.
    ///
    /// # Errors
    /// Returns the provider error.
    pub async fn show_security_groups(&self) -> Result<Vec<SecurityGroupDescriptor>, VmError> {
        let vm = self.load()?;
        self.provider.list_security_groups(&vm).await
    }

    /// Create the configured security group if absent and record its id.
    ///
    /// # Errors
    /// Returns [`VmError::Config`] if no group name is configured.
    pub async fn create_security_group(&self) -> Result<String, VmError> {
        let mut vm = self.load()?;
        if let Some(id) = vm.security_group_id() {
            info!(security_group = %id, "Security group already recorded");
            return Ok(id.to_string());
        }
        let name = vm
            .security_group_name()
            .ok_or_else(|| VmError::Config("security group name is empty".to_string()))?
            .to_string();
        let id = self.provider.ensure_security_group(&vm, &name).await?;
        vm.security_group_id = Some(id.clone());
        self.store.save(&vm)?;
        Ok(id)
    }

    /// Delete the recorded (or named) security group.
    ///
    /// Returns the deleted id, or `None` if there was nothing to delete.
    ///
    /// # Errors
    /// Returns the last provider error once retries are exhausted.
    pub async fn delete_security_group(&self) -> Result<Option<String>, VmError> {
        let mut vm = self.load()?;
        let id = match vm.security_group_id() {
            Some(id) => Some(id.to_string()),
            None => match vm.security_group_name() {
                Some(name) => self.provider.find_security_group(&vm, name).await?,
                None => None,
            },
        };
        let Some(id) = id else {
            info!("No security group to delete");
            return Ok(None);
        };

        self.provider.delete_security_group(&vm, &id).await?;
        vm.security_group_id = None;
        self.store.save(&vm)?;
        info!(security_group = %id, "Deleted security group");
        Ok(Some(id))
    }

    /// Persisted descriptor as pretty JSON, or `None` if nothing is stored.
    ///
    /// # Errors
    /// Returns an error if the record cannot be read.
    pub fn show_args(&self) -> Result<Option<String>, VmError> {
        let stored = self.store.load()?;
        if stored == VmDescriptor::default() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string_pretty(&stored)?))
    }

    /// Forget local state: known-hosts entry, descriptor and region cache.
    ///
    /// # Errors
    /// Returns an error if a state file cannot be removed.
    pub async fn clean(&self) -> Result<(), VmError> {
        let stored = self.store.load()?;
        if let Some(ip) = stored.ip() {
            self.probe.remove_known_host(ip).await;
        }
        self.store.clear()?;
        if let Some(cache) = &self.regions {
            cache.invalidate()?;
        }
        info!(provider = %self.provider.kind(), "Cleaned local state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeCloud, FakeProbe, MemoryStore};

    struct Fixture {
        cloud: FakeCloud,
        probe: FakeProbe,
        store: MemoryStore,
        _keys: tempfile::TempDir,
        controller: VmController,
    }

    fn fixture(cloud: FakeCloud) -> Fixture {
        let keys = tempfile::tempdir().unwrap();
        std::fs::write(keys.path().join("test-key.pem"), "key").unwrap();

        let probe = FakeProbe::default();
        let store = MemoryStore::default();
        let overrides = VmDescriptor {
            key_name: Some("test-key".to_string()),
            key_path: Some(format!("{}/", keys.path().display())),
            ..Default::default()
        };
        let controller = VmController::new(
            Box::new(cloud.clone()),
            Box::new(probe.clone()),
            Box::new(store.clone()),
        )
        .with_overrides(overrides);

        Fixture {
            cloud,
            probe,
            store,
            _keys: keys,
            controller,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_persists_and_reaches_ssh() {
        let f = fixture(FakeCloud::new());

        let vm = f.controller.create().await.unwrap();

        assert_eq!(vm.id(), Some("i-1"));
        assert_eq!(vm.ip(), Some("203.0.113.10"));
        assert_eq!(vm.security_group_id(), Some("sg-1"));
        assert!(vm.key_file().unwrap().ends_with("test-key.pem"));
        assert_eq!(f.store.snapshot().unwrap().id(), Some("i-1"));
        assert_eq!(f.probe.ssh_probes(), 1);
        assert_eq!(f.cloud.count("start"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_with_recorded_id_fails_without_provider_calls() {
        let f = fixture(FakeCloud::new());
        f.store.put(VmDescriptor {
            id: Some("i-9".to_string()),
            ..Default::default()
        });

        let err = f.controller.create().await.unwrap_err();
        assert!(matches!(err, VmError::AlreadyExists(ref id) if id == "i-9"));
        assert!(f.cloud.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_missing_key_file_fails_before_provider_calls() {
        let cloud = FakeCloud::new();
        let controller = VmController::new(
            Box::new(cloud.clone()),
            Box::new(FakeProbe::default()),
            Box::new(MemoryStore::default()),
        )
        .with_overrides(VmDescriptor {
            key_name: Some("absent".to_string()),
            key_path: Some("/nonexistent/".to_string()),
            ..Default::default()
        });

        let err = controller.create().await.unwrap_err();
        assert!(matches!(err, VmError::KeyFileMissing(ref p) if p == "/nonexistent/absent.pem"));
        assert!(cloud.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_starts_when_provider_does_not_auto_start() {
        let cloud = FakeCloud::new().manual_start();
        let f = fixture(cloud);

        let vm = f.controller.create().await.unwrap();

        assert_eq!(f.cloud.count("start"), 1);
        assert_eq!(vm.ip(), Some("203.0.113.10"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_reuses_recorded_security_group() {
        let f = fixture(FakeCloud::new());
        f.store.put(VmDescriptor {
            security_group_id: Some("sg-existing".to_string()),
            ..Default::default()
        });

        let vm = f.controller.create().await.unwrap();
        assert_eq!(vm.security_group_id(), Some("sg-existing"));
        assert_eq!(f.cloud.count("find_sg"), 0);
        assert_eq!(f.cloud.count("create_sg"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_after_id_keeps_descriptor() {
        let f = fixture(FakeCloud::new());
        f.probe.set_ssh_available(false);

        let err = f.controller.create().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(f.store.snapshot().unwrap().id(), Some("i-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_after_failed_create_clears_descriptor() {
        let f = fixture(FakeCloud::new());
        f.probe.set_ssh_available(false);
        assert!(f.controller.create().await.is_err());

        f.controller.delete(false).await.unwrap();
        assert_eq!(f.cloud.count("delete"), 1);
        assert_eq!(f.cloud.state(), RunState::NotExist);
        assert!(f.store.snapshot().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_vm_makes_no_provider_calls() {
        let f = fixture(FakeCloud::new());

        let err = f.controller.start().await.unwrap_err();
        assert!(matches!(err, VmError::NoVmDefined(_)));
        assert!(f.cloud.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_running_instance_is_a_no_op() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        let probes = f.probe.ssh_probes();

        f.controller.start().await.unwrap();
        assert_eq!(f.cloud.count("start"), 0);
        assert_eq!(f.probe.ssh_probes(), probes);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_while_stopping_is_invalid() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        f.cloud.set_state(RunState::Stopping);

        let err = f.controller.start().await.unwrap_err();
        assert!(matches!(
            err,
            VmError::InvalidState {
                state: RunState::Stopping,
                ..
            }
        ));
        assert_eq!(f.cloud.count("start"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_reassigns_address() {
        let f = fixture(FakeCloud::new().reassigning_ip());
        f.controller.create().await.unwrap();

        let stopped = f.controller.stop().await.unwrap();
        assert_eq!(stopped.ip(), None);
        assert_eq!(f.store.snapshot().unwrap().ip(), None);

        let started = f.controller.start().await.unwrap();
        assert_eq!(started.ip(), Some("203.0.113.11"));
        assert!(f.probe.known_hosts_removed().contains(&"203.0.113.11".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_not_honored_fails_without_polling() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        f.cloud.ignore_stop();
        let before = f.cloud.count("run_state");
        let start = Instant::now();

        let err = f.controller.stop().await.unwrap_err();

        assert!(matches!(err, VmError::StopNotHonored(RunState::Running)));
        // One check before the request, one right after it.
        assert_eq!(f.cloud.count("run_state") - before, 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_requires_running() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        f.cloud.set_state(RunState::Stopped);

        let err = f.controller.stop().await.unwrap_err();
        assert!(matches!(err, VmError::InvalidState { .. }));
        assert_eq!(f.cloud.count("stop"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_run_status_checks_immediately() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        let vm = f.controller.load().unwrap();
        let start = Instant::now();

        f.controller
            .wait_for_run_status(&vm, RunState::Running, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_run_status_timeout_bound() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        let vm = f.controller.load().unwrap();
        let timeout = Duration::from_secs(7);
        let start = Instant::now();

        let err = f
            .controller
            .wait_for_run_status(&vm, RunState::Stopped, timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() <= timeout + STATUS_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_waits_for_ping_to_drop() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();

        f.controller.restart().await.unwrap();
        assert_eq!(f.cloud.count("restart"), 1);
        assert_eq!(f.probe.ping_waits(), vec![true, false, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_never_went_down_is_reported() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        f.probe.set_stays_up(true);

        let err = f.controller.restart().await.unwrap_err();
        assert!(matches!(err, VmError::Timeout { ref operation, .. } if operation.contains("never went down")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_without_ping_uses_settle_delay() {
        let f = fixture(FakeCloud::new().not_pingable());
        f.controller.create().await.unwrap();
        let start = Instant::now();

        f.controller.restart().await.unwrap();
        assert!(start.elapsed() >= RESTART_SETTLE);
        assert!(f.probe.ping_waits().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_delete_leaves_store_empty() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();

        f.controller.delete(false).await.unwrap();

        assert!(f.store.snapshot().is_none());
        assert_eq!(f.cloud.state(), RunState::NotExist);
        assert!(f.probe.known_hosts_removed().contains(&"203.0.113.10".to_string()));
        assert_eq!(f.cloud.count("delete_sg"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_stops_first_when_required() {
        let f = fixture(FakeCloud::new().stop_before_delete());
        f.controller.create().await.unwrap();

        f.controller.delete(true).await.unwrap();

        let calls = f.cloud.calls();
        let stop = calls.iter().position(|c| c == "stop").unwrap();
        let delete = calls.iter().position(|c| c == "delete").unwrap();
        assert!(stop < delete);
        assert_eq!(f.cloud.count("delete_sg"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_and_show_ip() {
        let f = fixture(FakeCloud::new());
        assert!(matches!(
            f.controller.status().await,
            Err(VmError::NoVmDefined(_))
        ));

        f.controller.create().await.unwrap();
        assert_eq!(f.controller.status().await.unwrap(), RunState::Running);
        assert_eq!(f.controller.show_ip().await.unwrap(), "203.0.113.10");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_on_unpingable_provider() {
        let f = fixture(FakeCloud::new().not_pingable());
        let err = f.controller.ping().await.unwrap_err();
        assert!(matches!(err, VmError::NotPingable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_group_commands() {
        let f = fixture(FakeCloud::new());

        let id = f.controller.create_security_group().await.unwrap();
        assert_eq!(id, "sg-1");
        assert_eq!(f.controller.create_security_group().await.unwrap(), "sg-1");
        assert_eq!(f.cloud.count("create_sg"), 1);

        assert_eq!(
            f.controller.delete_security_group().await.unwrap(),
            Some("sg-1".to_string())
        );
        assert_eq!(f.controller.delete_security_group().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_forgets_everything() {
        let f = fixture(FakeCloud::new());
        f.controller.create().await.unwrap();
        assert!(f.controller.show_args().unwrap().is_some());

        f.controller.clean().await.unwrap();
        assert!(f.store.snapshot().is_none());
        assert!(f.controller.show_args().unwrap().is_none());
    }

    #[test]
    fn test_boot_time_parse() {
        let boot = BootTime::parse(
            "Startup finished in 3.582s (kernel) + 5.972s (userspace) = 9.555s\n\
             graphical.target reached after 5.9s in userspace\n",
        )
        .unwrap();
        assert_eq!(boot.kernel, "3.582s");
        assert_eq!(boot.userspace, "5.972s");
        assert_eq!(boot.total, "9.555s");

        assert!(matches!(
            BootTime::parse("command not found"),
            Err(VmError::MalformedResponse { .. })
        ));
    }
}
