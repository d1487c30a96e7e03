//! Amazon EC2 provider.
//!
//! Implements [`ProviderAdapter`](crate::providers::ProviderAdapter) on top
//! of the `aws` CLI (`aws ec2 ... --output json`).
//!
//! ## Behavior
//!
//! - Instances boot as part of `run-instances`.
//! - The public address changes across stop/start, so it is re-queried.
//! - Terminated instances report `terminated`, then disappear.
//! - Security groups are created in the default VPC unless the `vpc_id`
//!   option names another one.
//!
//! ## Example
//!
//! ```ignore
//! use vmctl::providers::aws::Aws;
//! use vmctl::runner::{CommandLog, ShellRunner};
//!
//! let aws = Aws::new(Arc::new(ShellRunner::new(CommandLog::disabled())));
//! let state = aws.run_state(&vm).await?;
//! ```

mod client;
mod models;

pub use client::Aws;
