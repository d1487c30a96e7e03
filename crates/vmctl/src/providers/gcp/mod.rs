//! Google Compute Engine provider.
//!
//! Implements [`ProviderAdapter`](crate::providers::ProviderAdapter) on top
//! of `gcloud compute`. Instances are addressed by name in a zone; the
//! descriptor's `region` field holds that zone.
//!
//! The security group is a VPC firewall rule applied through a network tag
//! of the same name, which `create` attaches to the instance.
//!
//! Provider options: `project`, `image_project`, `service_account`,
//! `maintenance_policy`, `subnet`, `boot_disk_size`, `boot_disk_type`,
//! `min_cpu_platform`, `accelerator_type`, `accelerator_count`.

mod client;
mod models;

pub use client::Gcp;
