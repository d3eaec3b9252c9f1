//! Process-wide tracing setup. Carried as ambient stack regardless of
//! spec.md's Non-goals, grounded on the CLI binaries' `tracing_subscriber`
//! bootstrap (`cli/golem-cli/src/main.rs`).

use tracing_subscriber::EnvFilter;

/// Installs a `fmt` subscriber honoring `RUST_LOG`, falling back to `info`
/// for this crate and `warn` for everything else.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,scheduler=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
