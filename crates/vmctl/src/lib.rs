//! Single-VM lifecycle management across cloud provider CLIs.
//!
//! `vmctl` creates, starts, stops, restarts and deletes one GPU virtual
//! machine per provider, driving each provider's own command-line tool
//! (`aws`, `aliyun`, `gcloud`, `az`) and waiting until the machine is
//! actually usable: running, addressable, answering ping, accepting SSH.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌─────────────────┐
//! │ vmctl (CLI)  │──►│   VmController   │──►│ ProviderAdapter │──► aws / aliyun /
//! └──────────────┘   │  state machine,  │   └─────────────────┘    gcloud / az
//!                    │  convergence     │   ┌─────────────────┐
//!                    │  polling         │──►│  Reachability   │──► ping / ssh
//!                    └────────┬─────────┘   └─────────────────┘
//!                             │
//!                             ▼
//!                    ┌──────────────────┐
//!                    │ DescriptorStore  │  .vmctl/<provider>/descriptor.json
//!                    └──────────────────┘
//! ```
//!
//! Every external process goes through a [`CommandRunner`], which is also
//! the seam the tests replace.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vmctl::{providers, CommandLog, JsonFileStore, Probe, ProviderKind, ShellRunner, StateLayout, VmController};
//!
//! let layout = StateLayout::new(".vmctl".as_ref(), ProviderKind::Aws);
//! let runner = Arc::new(ShellRunner::new(CommandLog::open(layout.command_log())?));
//! let controller = VmController::new(
//!     providers::build(ProviderKind::Aws, runner.clone()),
//!     Box::new(Probe::new(runner)),
//!     Box::new(JsonFileStore::new(layout.descriptor_file())),
//! );
//!
//! let vm = controller.create().await?;
//! controller.stop().await?;
//! controller.delete(true).await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod descriptor;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod probe;
pub mod providers;
pub mod retry;
pub mod runner;
pub mod state;

#[cfg(test)]
mod testing;

pub use descriptor::{SecurityGroupDescriptor, SecurityRule, VmDescriptor};
pub use error::VmError;
pub use lifecycle::{BootTime, VmController};
pub use logging::LogConfig;
pub use probe::{Probe, Reachability, SshTarget};
pub use providers::{ProviderAdapter, ProviderKind, RunState};
pub use runner::{CommandLog, CommandRunner, ShellRunner};
pub use state::{DescriptorStore, JsonFileStore, RegionCache, StateLayout};
