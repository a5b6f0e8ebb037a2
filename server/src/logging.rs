use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` controls filtering and
/// defaults to `info` for the gateway crates.
pub fn init() {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| EnvFilter::new("info,gateway_server=info")),
		)
		.with_target(false)
		.init();
}
