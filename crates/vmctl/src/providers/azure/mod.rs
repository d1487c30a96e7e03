//! Microsoft Azure provider.
//!
//! Implements [`ProviderAdapter`](crate::providers::ProviderAdapter) on top
//! of the `az` CLI. Everything lives in one resource group (option
//! `resource_group`, default `vmctl-rg`), created on first use.
//!
//! Stopping deallocates the VM, which releases its dynamic public address.

mod client;
mod models;

pub use client::Azure;
