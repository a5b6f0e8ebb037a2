use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Parser, Debug, Clone, Default)]
#[clap(version, about = "Bitcoin blockchain query and notification gateway")]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config", help = "Path to a toml settings file")]
	pub config_path: Option<PathBuf>,

	#[clap(long, help = "Print the effective settings and exit")]
	pub show_config: bool,

	#[clap(long, help = "Bind address for the public query router")]
	pub query_endpoint: Option<String>,

	#[clap(long, help = "Bind address for the curve-secured query router")]
	pub secure_query_endpoint: Option<String>,

	#[clap(long, help = "Bind address for the heartbeat publisher")]
	pub heartbeat_endpoint: Option<String>,

	#[clap(long, help = "Bind address for the block publisher")]
	pub block_publish_endpoint: Option<String>,

	#[clap(long, help = "Bind address for the transaction publisher")]
	pub transaction_publish_endpoint: Option<String>,

	#[clap(long, help = "Number of query worker threads")]
	pub query_workers: Option<usize>,

	#[clap(long, help = "Seconds between heartbeat pulses")]
	pub heartbeat_interval_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Server {
	pub query_endpoint: String,
	pub secure_query_endpoint: Option<String>,
	pub heartbeat_endpoint: String,
	pub block_publish_endpoint: String,
	pub transaction_publish_endpoint: String,
	pub queries_enabled: bool,
	pub publisher_enabled: bool,
	pub query_workers: usize,
	pub heartbeat_interval_seconds: u64,
	pub subscription_expiration_minutes: u64,
	pub subscription_limit: usize,
	/// Z85 encoded curve secret key. Required whenever a secure endpoint or
	/// client key list is configured.
	pub server_private_key: Option<String>,
	/// Z85 encoded client keys admitted on the secure endpoint. Empty means
	/// any key that completes the handshake.
	pub client_public_keys: Vec<String>,
	/// Source addresses admitted on any endpoint. Empty means all.
	pub client_addresses: Vec<String>,
	/// Source addresses rejected on any endpoint. Checked first.
	pub blacklists: Vec<String>,
}

impl Default for Server {
	fn default() -> Self {
		Server {
			query_endpoint: "tcp://*:9091".to_string(),
			secure_query_endpoint: None,
			heartbeat_endpoint: "tcp://*:9092".to_string(),
			block_publish_endpoint: "tcp://*:9093".to_string(),
			transaction_publish_endpoint: "tcp://*:9094".to_string(),
			queries_enabled: true,
			publisher_enabled: true,
			query_workers: 4,
			heartbeat_interval_seconds: 5,
			subscription_expiration_minutes: 10,
			subscription_limit: 100_000_000,
			server_private_key: None,
			client_public_keys: vec![],
			client_addresses: vec![],
			blacklists: vec![],
		}
	}
}

impl Server {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_secs(self.heartbeat_interval_seconds)
	}

	pub fn subscription_expiration(&self) -> Duration {
		Duration::from_secs(self.subscription_expiration_minutes * 60)
	}
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
	pub server: Server,
}

impl Settings {
	/// Defaults, overridden by the (optional) settings file, overridden by
	/// `GATEWAY__SERVER__*` environment variables, overridden by the
	/// command line.
	pub fn new(opts: &CommandLineOptions) -> anyhow::Result<Self> {
		let mut builder = Config::builder();

		if let Some(path) = &opts.config_path {
			builder = builder.add_source(File::from(path.clone()));
		}

		let mut settings: Settings = builder
			.add_source(Environment::with_prefix("GATEWAY").separator("__"))
			.build()
			.context("Failed to assemble configuration sources")?
			.try_deserialize()
			.context("Failed to deserialize settings")?;

		settings.apply_command_line_options(opts);
		settings.validate()?;
		Ok(settings)
	}

	fn apply_command_line_options(&mut self, opts: &CommandLineOptions) {
		let server = &mut self.server;
		if let Some(endpoint) = &opts.query_endpoint {
			server.query_endpoint = endpoint.clone();
		}
		if let Some(endpoint) = &opts.secure_query_endpoint {
			server.secure_query_endpoint = Some(endpoint.clone());
		}
		if let Some(endpoint) = &opts.heartbeat_endpoint {
			server.heartbeat_endpoint = endpoint.clone();
		}
		if let Some(endpoint) = &opts.block_publish_endpoint {
			server.block_publish_endpoint = endpoint.clone();
		}
		if let Some(endpoint) = &opts.transaction_publish_endpoint {
			server.transaction_publish_endpoint = endpoint.clone();
		}
		if let Some(count) = opts.query_workers {
			server.query_workers = count;
		}
		if let Some(seconds) = opts.heartbeat_interval_seconds {
			server.heartbeat_interval_seconds = seconds;
		}
	}

	pub fn validate(&self) -> anyhow::Result<()> {
		if self.server.secure_query_endpoint.is_some() &&
			self.server.server_private_key.is_none()
		{
			anyhow::bail!("A secure query endpoint requires server_private_key");
		}
		if !self.server.client_public_keys.is_empty() &&
			self.server.server_private_key.is_none()
		{
			anyhow::bail!("Client authentication requires server_private_key");
		}
		if self.server.query_workers == 0 {
			anyhow::bail!("query_workers must be at least 1");
		}
		Ok(())
	}
}
