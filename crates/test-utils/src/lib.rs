//! Shared test utilities for the meowkey crates.
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`CrashInjector`] - Deterministic crash points for the header commit
//! - [`strategies`] - Proptest generators for identifiers, payloads and workloads

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod strategies;
