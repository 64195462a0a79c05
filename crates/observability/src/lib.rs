//! Process-wide tracing setup for hosts embedding the chronicle runtime.
//!
//! The runtime crates only emit `tracing` events; installing a subscriber is left
//! to the host binary (or a test) through [`init`] / [`init_with`].

/// Initialize tracing with the configuration found in the environment.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init_with(&self::tracing::TracingConfig::from_env());
}

pub use self::tracing::{LogFormat, TracingConfig, init_with};

/// Tracing configuration (filters, output format).
pub mod tracing;
