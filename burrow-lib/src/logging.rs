use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info";

/// Initialise tracing output on stderr.
///
/// Stderr is used deliberately: in `priv` mode stdout carries the helper
/// wire protocol. `RUST_LOG` overrides the level given on the command line.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
