//! Cloud provider adapters.
//!
//! This module contains the [`ProviderAdapter`] trait and one implementation
//! per supported CSP, each driving that provider's CLI through a
//! [`CommandRunner`].

pub mod alibaba;
pub mod aws;
pub mod azure;
pub mod gcp;
pub mod traits;

use std::sync::Arc;

pub use traits::{
    CreatedInstance, InstanceSummary, ProviderAdapter, ProviderDefaults, ProviderKind,
    ProviderTraits, RunState,
};

use crate::runner::CommandRunner;

/// Adapter for `kind`, running its CLI through `runner`.
#[must_use]
pub fn build(kind: ProviderKind, runner: Arc<dyn CommandRunner>) -> Box<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Aws => Box::new(aws::Aws::new(runner)),
        ProviderKind::Alibaba => Box::new(alibaba::Alibaba::new(runner)),
        ProviderKind::Gcp => Box::new(gcp::Gcp::new(runner)),
        ProviderKind::Azure => Box::new(azure::Azure::new(runner)),
    }
}
