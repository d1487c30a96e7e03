//! Alibaba Cloud ECS provider.
//!
//! Implements [`ProviderAdapter`](crate::providers::ProviderAdapter) on top
//! of the `aliyun` CLI.
//!
//! ECS differs from the other providers in three ways the controller relies
//! on [`ProviderTraits`](crate::providers::ProviderTraits) to express:
//!
//! - `CreateInstance` leaves the instance stopped; it is started explicitly.
//! - The public address is allocated separately after creation.
//! - Running instances cannot be deleted; they are stopped first.
//!
//! Provider options: `image_owner_alias`, `bandwidth_out`, `charge_type`,
//! `vpc_id`.

mod client;
mod models;

pub use client::Alibaba;
