mod auth;
mod config;
mod error;
mod graph;
mod schema;
mod server;
mod tools;

use std::sync::Arc;

use anyhow::{Context, Result};
use config::Config;
use server::ToolServer;
use tokio::io::BufReader;

const CONFIG_ENV: &str = "GRAPH_TOOLSERVER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config_path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)?;

    init_logging(&config);
    match &config.loaded_from {
        Some(path) => log::info!("Starting Graph tool server (config: {})", path.display()),
        None => log::info!("Starting Graph tool server (no config file at {config_path}, using defaults)"),
    }

    let server = Arc::new(ToolServer::bootstrap(&config).context("failed to start tool server")?);

    // stdout carries responses only; logs go to stderr
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let result = server::serve(Arc::clone(&server), stdin, stdout).await;

    server.close();
    result
}

/// `RUST_LOG` wins; otherwise the configured level applies.
fn init_logging(config: &Config) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters(&config.logging.level),
    };
    builder.init();
}
