//! Tracing subscriber setup for hosts and demos
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call. [`init`] is a convenience for binaries and tests.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive` (e.g. `"trueno_ab=info"`) when it is unset.
///
/// Safe to call more than once: later calls leave the first subscriber in
/// place and return `false`.
pub fn init(default_directive: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
