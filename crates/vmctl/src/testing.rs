//! Test doubles: a scripted command runner for adapter and probe tests, and
//! an in-memory cloud, probe and store for controller tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::descriptor::{SecurityGroupDescriptor, SecurityRule, VmDescriptor};
use crate::error::VmError;
use crate::probe::{Reachability, SshTarget};
use crate::providers::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};
use crate::runner::{CommandLine, CommandOutput, CommandRunner};
use crate::state::DescriptorStore;

type Responder = Box<dyn Fn(&CommandLine) -> CommandOutput + Send + Sync>;

/// Answers every command through a closure and records what was run.
pub struct ScriptedRunner {
    responder: Responder,
    calls: Mutex<Vec<CommandLine>>,
}

impl ScriptedRunner {
    pub fn new(responder: impl Fn(&CommandLine) -> CommandOutput + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Rendered command lines, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(CommandLine::rendered)
            .collect()
    }

    /// Number of recorded commands whose unquoted line contains `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| plain(c).contains(needle))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, cmd: &CommandLine) -> Result<CommandOutput, VmError> {
        self.calls.lock().unwrap().push(cmd.clone());
        Ok((self.responder)(cmd))
    }

    async fn run_interactive(&self, cmd: &CommandLine) -> Result<i32, VmError> {
        Ok(self.run(cmd).await?.code)
    }
}

/// Successful output with the given stdout.
pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

/// Failed output with the given stderr.
pub fn fail(stderr: &str) -> CommandOutput {
    CommandOutput {
        code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// Program and arguments joined by single spaces, without shell quoting.
pub fn plain(cmd: &CommandLine) -> String {
    std::iter::once(cmd.program())
        .chain(cmd.arguments().iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether the command's unquoted line contains every needle.
pub fn is(cmd: &CommandLine, needles: &[&str]) -> bool {
    let line = plain(cmd);
    needles.iter().all(|n| line.contains(n))
}

#[derive(Default)]
struct CloudState {
    instance: Option<Instance>,
    next_ip: u8,
    groups: Vec<(String, String)>,
    next_group: u32,
    ignore_stop: bool,
    calls: Vec<String>,
}

struct Instance {
    state: RunState,
    ip: Option<String>,
    stopping_polls: u32,
    /// Set through `FakeCloud::set_state`: polls report the state unchanged.
    pinned: bool,
}

/// Simulated provider: one instance, state changes driven by requests.
///
/// A stop request reports [`RunState::Stopping`] for two polls before
/// settling on [`RunState::Stopped`].
#[derive(Clone)]
pub struct FakeCloud {
    inner: Arc<Mutex<CloudState>>,
    traits: ProviderTraits,
}

impl FakeCloud {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(CloudState {
                next_ip: 10,
                ..CloudState::default()
            })),
            traits: ProviderTraits {
                pingable: true,
                auto_starts_on_create: true,
                stop_transient_state: RunState::Stopping,
                reassigns_ip_on_stop: false,
                requires_stop_before_delete: false,
                termination_observable: true,
                key_extension: ".pem",
                needs_public_key: false,
                create_timeout: Duration::from_secs(60),
                stop_timeout: Duration::from_secs(60),
                post_create_settle: Duration::ZERO,
            },
        }
    }

    pub fn manual_start(mut self) -> Self {
        self.traits.auto_starts_on_create = false;
        self
    }

    pub fn reassigning_ip(mut self) -> Self {
        self.traits.reassigns_ip_on_stop = true;
        self
    }

    pub fn not_pingable(mut self) -> Self {
        self.traits.pingable = false;
        self
    }

    pub fn stop_before_delete(mut self) -> Self {
        self.traits.requires_stop_before_delete = true;
        self
    }

    /// Accept stop requests without acting on them.
    pub fn ignore_stop(&self) {
        self.inner.lock().unwrap().ignore_stop = true;
    }

    /// Force the instance into `state` until the next lifecycle request.
    pub fn set_state(&self, state: RunState) {
        if let Some(instance) = self.inner.lock().unwrap().instance.as_mut() {
            instance.state = state;
            instance.stopping_polls = 0;
            instance.pinned = true;
        }
    }

    pub fn state(&self) -> RunState {
        self.inner
            .lock()
            .unwrap()
            .instance
            .as_ref()
            .map_or(RunState::NotExist, |i| i.state)
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    /// Number of recorded operations named exactly `op`.
    pub fn count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| *c == op)
            .count()
    }

    fn note(&self, op: &str) {
        self.inner.lock().unwrap().calls.push(op.to_string());
    }

    fn record(&self, op: &str) -> std::sync::MutexGuard<'_, CloudState> {
        let mut state = self.inner.lock().unwrap();
        state.calls.push(op.to_string());
        state
    }
}

fn allocate_ip(state: &mut CloudState) -> String {
    let ip = format!("203.0.113.{}", state.next_ip);
    state.next_ip += 1;
    ip
}

#[async_trait]
impl ProviderAdapter for FakeCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aws
    }

    fn traits(&self) -> ProviderTraits {
        self.traits.clone()
    }

    fn defaults(&self) -> ProviderDefaults {
        ProviderDefaults::new("test-region-1", "gpu.small", "test-image", "ubuntu", true, &[])
    }

    fn check_tooling(&self) -> bool {
        true
    }

    async fn resolve_image(&self, _vm: &VmDescriptor) -> Result<Option<String>, VmError> {
        self.note("resolve_image");
        Ok(Some("img-1".to_string()))
    }

    async fn create_instance(&self, _vm: &VmDescriptor) -> Result<CreatedInstance, VmError> {
        let mut state = self.record("create");
        let ip = allocate_ip(&mut state);
        let initial = if self.traits.auto_starts_on_create {
            RunState::Running
        } else {
            RunState::Stopped
        };
        state.instance = Some(Instance {
            state: initial,
            ip: Some(ip.clone()),
            stopping_polls: 0,
            pinned: false,
        });
        Ok(CreatedInstance {
            id: "i-1".to_string(),
            ip: Some(ip),
        })
    }

    async fn run_state(&self, _vm: &VmDescriptor) -> Result<RunState, VmError> {
        let mut state = self.record("run_state");
        let Some(instance) = state.instance.as_mut() else {
            return Ok(RunState::NotExist);
        };
        if instance.state == RunState::Stopping && !instance.pinned {
            if instance.stopping_polls == 0 {
                instance.state = RunState::Stopped;
            } else {
                instance.stopping_polls -= 1;
            }
        }
        Ok(instance.state)
    }

    async fn public_ip(&self, _vm: &VmDescriptor) -> Result<String, VmError> {
        let mut state = self.record("public_ip");
        let current = state.instance.as_ref().and_then(|i| i.ip.clone());
        match current {
            Some(ip) => Ok(ip),
            None => {
                let ip = allocate_ip(&mut state);
                if let Some(instance) = state.instance.as_mut() {
                    instance.ip = Some(ip.clone());
                }
                Ok(ip)
            }
        }
    }

    async fn start_instance(&self, _vm: &VmDescriptor) -> Result<(), VmError> {
        let mut state = self.record("start");
        if let Some(instance) = state.instance.as_mut() {
            instance.state = RunState::Running;
            instance.pinned = false;
        }
        Ok(())
    }

    async fn stop_instance(&self, _vm: &VmDescriptor) -> Result<(), VmError> {
        let mut state = self.record("stop");
        if state.ignore_stop {
            return Ok(());
        }
        let reassign = self.traits.reassigns_ip_on_stop;
        if let Some(instance) = state.instance.as_mut() {
            instance.state = RunState::Stopping;
            instance.stopping_polls = 2;
            instance.pinned = false;
            if reassign {
                instance.ip = None;
            }
        }
        Ok(())
    }

    async fn restart_instance(&self, _vm: &VmDescriptor) -> Result<(), VmError> {
        self.note("restart");
        Ok(())
    }

    async fn delete_instance(&self, _vm: &VmDescriptor) -> Result<(), VmError> {
        self.record("delete").instance = None;
        Ok(())
    }

    async fn find_security_group(
        &self,
        _vm: &VmDescriptor,
        name: &str,
    ) -> Result<Option<String>, VmError> {
        let state = self.record("find_sg");
        Ok(state
            .groups
            .iter()
            .find(|(_, n)| n == name)
            .map(|(id, _)| id.clone()))
    }

    async fn create_security_group(
        &self,
        _vm: &VmDescriptor,
        name: &str,
        _rules: &[SecurityRule],
    ) -> Result<String, VmError> {
        let mut state = self.record("create_sg");
        state.next_group += 1;
        let id = format!("sg-{}", state.next_group);
        state.groups.push((id.clone(), name.to_string()));
        Ok(id)
    }

    async fn try_delete_security_group(
        &self,
        _vm: &VmDescriptor,
        id: &str,
    ) -> Result<(), VmError> {
        self.record("delete_sg").groups.retain(|(g, _)| g != id);
        Ok(())
    }

    async fn list_security_groups(
        &self,
        _vm: &VmDescriptor,
    ) -> Result<Vec<SecurityGroupDescriptor>, VmError> {
        let state = self.record("list_sg");
        Ok(state
            .groups
            .iter()
            .map(|(id, name)| SecurityGroupDescriptor {
                id: id.clone(),
                name: name.clone(),
                description: None,
                rules: Vec::new(),
            })
            .collect())
    }

    async fn list_running(&self, _vm: &VmDescriptor) -> Result<Vec<InstanceSummary>, VmError> {
        self.note("list_running");
        Ok(Vec::new())
    }

    async fn list_regions(&self, _vm: &VmDescriptor) -> Result<Vec<String>, VmError> {
        self.note("list_regions");
        Ok(vec!["test-region-1".to_string(), "test-region-2".to_string()])
    }
}

#[derive(Default)]
struct ProbeState {
    ssh_unavailable: bool,
    stays_up: bool,
    ping_waits: Vec<bool>,
    ssh_probes: usize,
    known_hosts_removed: Vec<String>,
}

/// Reachability double that answers instantly and records what was asked.
#[derive(Clone, Default)]
pub struct FakeProbe {
    inner: Arc<Mutex<ProbeState>>,
}

impl FakeProbe {
    pub fn set_ssh_available(&self, available: bool) {
        self.inner.lock().unwrap().ssh_unavailable = !available;
    }

    /// Never stop answering ping.
    pub fn set_stays_up(&self, stays_up: bool) {
        self.inner.lock().unwrap().stays_up = stays_up;
    }

    /// Desired states of every ping wait, in order.
    pub fn ping_waits(&self) -> Vec<bool> {
        self.inner.lock().unwrap().ping_waits.clone()
    }

    pub fn ssh_probes(&self) -> usize {
        self.inner.lock().unwrap().ssh_probes
    }

    pub fn known_hosts_removed(&self) -> Vec<String> {
        self.inner.lock().unwrap().known_hosts_removed.clone()
    }
}

#[async_trait]
impl Reachability for FakeProbe {
    async fn ping(&self, _ip: &str) -> Result<bool, VmError> {
        Ok(true)
    }

    async fn wait_for_ping_state(
        &self,
        ip: &str,
        desired: bool,
        timeout: Duration,
    ) -> Result<(), VmError> {
        let mut state = self.inner.lock().unwrap();
        state.ping_waits.push(desired);
        if !desired && state.stays_up {
            return Err(VmError::Timeout {
                operation: format!("{ip} to stop answering ping"),
                elapsed_secs: timeout.as_secs(),
            });
        }
        Ok(())
    }

    async fn wait_for_ssh(
        &self,
        target: &SshTarget,
        _probe_command: &str,
        timeout: Duration,
    ) -> Result<(), VmError> {
        let mut state = self.inner.lock().unwrap();
        state.ssh_probes += 1;
        if state.ssh_unavailable {
            return Err(VmError::Timeout {
                operation: format!("SSH on {}", target.ip),
                elapsed_secs: timeout.as_secs(),
            });
        }
        Ok(())
    }

    async fn ssh(&self, _target: &SshTarget, argv: &[String]) -> Result<CommandOutput, VmError> {
        Ok(ok(&argv.join(" ")))
    }

    async fn ssh_interactive(&self, _target: &SshTarget) -> Result<i32, VmError> {
        Ok(0)
    }

    async fn ping_report(&self, ip: &str) -> Result<CommandOutput, VmError> {
        Ok(ok(&format!("3 packets transmitted to {ip}, 3 received")))
    }

    async fn remove_known_host(&self, ip: &str) {
        self.inner
            .lock()
            .unwrap()
            .known_hosts_removed
            .push(ip.to_string());
    }
}

/// In-memory [`DescriptorStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Option<VmDescriptor>>>,
}

impl MemoryStore {
    pub fn put(&self, vm: VmDescriptor) {
        *self.inner.lock().unwrap() = Some(vm);
    }

    pub fn snapshot(&self) -> Option<VmDescriptor> {
        self.inner.lock().unwrap().clone()
    }
}

impl DescriptorStore for MemoryStore {
    fn load(&self) -> Result<VmDescriptor, VmError> {
        Ok(self.snapshot().unwrap_or_default())
    }

    fn save(&self, vm: &VmDescriptor) -> Result<(), VmError> {
        self.put(vm.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), VmError> {
        *self.inner.lock().unwrap() = None;
        Ok(())
    }
}
