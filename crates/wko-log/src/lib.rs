// ABOUTME: Shared logging setup for the wko supervisor
// ABOUTME: init_for() for the CLI and daemon, init_test() for test binaries

use tracing_subscriber::EnvFilter;

/// Crate-filtered logging to stderr. Default: INFO for the named crate, WARN for everything else.
/// Keeps HTTP client chatter out of supervisor output.
pub fn init_for(crate_name: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(crate_filter(crate_name))
        .with_writer(std::io::stderr)
        .init();
}

/// Logging for test binaries. Safe to call from every test; only the first call installs.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn crate_filter(crate_name: &str) -> EnvFilter {
    let directive = format!("{crate_name}=info");
    EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into())
        .add_directive(
            directive
                .parse()
                .unwrap_or_else(|_| tracing::Level::INFO.into()),
        )
}
