//! Infrastructure shared by the Tether crates: settings loading, the
//! host-side clock, device path ids, logging setup and the common error type.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod helpers;

pub use config::{load_json_config, load_json_config_or_default};
pub use error::{Error, Result};
pub use helpers::{env_bool, monotonic_ns, path_id};

use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber. `RUST_LOG` wins; otherwise
/// everything at `info` and above is printed.
pub fn init_tracing() {
    init_tracing_with_default("info");
}

/// Like [`init_tracing`] with a caller-chosen fallback filter, e.g.
/// `"tether_core=debug,info"`.
pub fn init_tracing_with_default(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .init();
}
