// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh Discovery Server
//!
//! Queue-routing registry for the message mesh. Peers connect over TCP,
//! register an endpoint and declare the queues they consume and produce;
//! every reply carries the current bindings so peers can wire up routes.
//!
//! # Usage
//!
//! ```bash
//! # Start server on default port (9999)
//! mesh-discovery-server
//!
//! # Custom port and first auto-assigned peer port
//! mesh-discovery-server --port 7410 --first-port 20000
//!
//! # From a config file
//! mesh-discovery-server --config server.json
//! ```

use clap::Parser;
use mesh_discovery::{DiscoveryServer, ServerConfig};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Mesh Discovery Server - queue bindings registry for the message mesh
#[derive(Parser, Debug)]
#[command(name = "mesh-discovery-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "9999")]
    port: u16,

    /// Bind address (0.0.0.0 for all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Configuration file (JSON format)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// First port handed to peers that register without one
    #[arg(long, default_value = "6000")]
    first_port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let config = if let Some(config_path) = args.config {
        info!("Loading config from {:?}", config_path);
        ServerConfig::from_file(&config_path)?
    } else {
        ServerConfig {
            bind_address: args.bind,
            port: args.port,
            first_auto_port: args.first_port,
            ..Default::default()
        }
    };

    info!("+----------------------------------------------------+");
    info!(
        "|       Mesh Discovery Server v{}                 |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+----------------------------------------------------+");
    info!(
        "|  Bind:   {:40} |",
        format!("{}:{}", config.bind_address, config.port)
    );
    info!(
        "|  Ports:  {:40} |",
        format!("auto-assign from {}", config.first_auto_port)
    );
    info!("+----------------------------------------------------+");

    let server = DiscoveryServer::new(config)?;
    server.restore().await;

    let server_handle = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received, stopping server...");
        server_handle.shutdown();
    });

    server.run().await?;
    server.persist().await;

    info!("Discovery server stopped");
    Ok(())
}
