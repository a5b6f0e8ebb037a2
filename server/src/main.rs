use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use gateway_server::{
	logging,
	node::memory::MemoryNode,
	server::ServerNode,
	settings::{CommandLineOptions, Settings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let opts = CommandLineOptions::parse();
	let settings = Settings::new(&opts).context("Failed to load settings")?;

	if opts.show_config {
		println!("{settings:#?}");
		return Ok(())
	}

	logging::init();

	let node = Arc::new(MemoryNode::new());
	let mut server = ServerNode::new(settings, node).context("Failed to assemble the server")?;
	server.start().context("Failed to start the server")?;

	tokio::signal::ctrl_c().await.context("Failed to listen for shutdown")?;
	info!("Shutting down");
	server.stop().await;
	Ok(())
}
