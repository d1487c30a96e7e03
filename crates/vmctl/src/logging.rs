//! Diagnostic logging setup.
//!
//! Diagnostics go to stderr so command output on stdout stays scriptable.
//! The external command record is separate; see
//! [`CommandLog`](crate::runner::CommandLog).

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Subscriber configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// Number of `-v` flags.
    pub verbosity: u8,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
}

impl LogConfig {
    /// Filter directive for the configured verbosity.
    #[must_use]
    pub fn directive(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "vmctl=info,warn",
            2 => "vmctl=debug,info",
            _ => "vmctl=trace,debug",
        }
    }

    /// Install the global subscriber. `RUST_LOG`, when set, wins over `-v`.
    ///
    /// # Errors
    /// Returns an error if a global subscriber is already installed.
    pub fn init(&self) -> Result<(), TryInitError> {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive()));

        let text = (!self.json).then(|| fmt::layer().with_writer(std::io::stderr));
        let json = self
            .json
            .then(|| fmt::layer().json().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(text)
            .with(json)
            .with(filter)
            .try_init()
    }
}
