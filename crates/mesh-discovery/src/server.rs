// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Discovery Server core implementation.

use crate::config::ServerConfig;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

pub mod connection;
pub mod graph;
pub mod protocol;
pub mod registry;

pub use connection::{ClientConnection, ConnectionError};
pub use graph::{BindingGraph, ChannelGraph, NodeKind, VisNode};
pub use protocol::{DiscoveryMessage, DiscoveryState, ProtocolError};
pub use registry::{
    BindingTable, ProcessingFault, QueueDirection, QueueRegistry, SessionId, TransportId,
};

/// Discovery Server - tracks which peers are bound to which queues.
#[derive(Clone)]
pub struct DiscoveryServer {
    config: Arc<ServerConfig>,
    registry: Arc<RwLock<QueueRegistry>>,
    shutdown: Arc<watch::Sender<bool>>,
    running: Arc<AtomicBool>,
}

impl DiscoveryServer {
    /// Create a new discovery server.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let registry = QueueRegistry::with_first_port(config.first_auto_port);

        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(RwLock::new(registry)),
            shutdown: Arc::new(watch::channel(false).0),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = SocketAddr::new(self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;

        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown, one task per session.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let mut shutdown = self.shutdown.subscribe();

        match listener.local_addr() {
            Ok(addr) => info!("Discovery server listening on {}", addr),
            Err(e) => warn!("Discovery server listening on unknown address: {}", e),
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            info!("New connection from {}", peer_addr);

                            if self.config.tcp_nodelay {
                                if let Err(e) = stream.set_nodelay(true) {
                                    debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                                }
                            }

                            let registry = self.registry.clone();
                            let config = self.config.clone();
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                Self::handle_connection(stream, peer_addr, registry, config, shutdown)
                                    .await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = stopped(&mut shutdown) => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run one session: request, response, repeat until the peer goes away.
    ///
    /// The session's bindings are dropped on every exit path.
    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        registry: Arc<RwLock<QueueRegistry>>,
        config: Arc<ServerConfig>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let session = SessionId::from(peer_addr);
        let mut conn = ClientConnection::new(stream, peer_addr, config.max_message_size);

        loop {
            tokio::select! {
                result = conn.read_message() => {
                    match result {
                        Ok(Some(msg)) => {
                            let response = Self::process_message(&registry, &session, &msg).await;
                            if let Err(e) = conn.send_message(&response).await {
                                warn!("Write error to {}: {}", peer_addr, e);
                                break;
                            }
                        }
                        Ok(None) => {
                            info!("Connection closed: {}", peer_addr);
                            break;
                        }
                        Err(e) => {
                            warn!("Read error from {}: {}", peer_addr, e);
                            break;
                        }
                    }
                }
                _ = stopped(&mut shutdown) => {
                    debug!("Connection handler shutting down: {}", peer_addr);
                    break;
                }
            }
        }

        let mut reg = registry.write().await;
        if let Some(transport) = reg.disconnect(&session) {
            info!("Removed {} on disconnect of {}", transport, session);
        }
    }

    /// Apply one request under the registry lock. Faults become an `Error`
    /// response; the session carries on.
    async fn process_message(
        registry: &RwLock<QueueRegistry>,
        session: &SessionId,
        msg: &DiscoveryMessage,
    ) -> DiscoveryMessage {
        debug!(
            "Rx [{}]: {:?} port={} host={}",
            session, msg.state, msg.port, msg.host
        );

        let result = registry.write().await.process(session, msg);
        match result {
            Ok(response) => response,
            Err(e) => {
                warn!("Bad message from {} ({}): {}", session, msg.host, e);
                DiscoveryMessage::error(msg.host.clone())
            }
        }
    }

    /// Signal the server and every open session to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Check if server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of sessions that have registered a transport.
    pub async fn session_count(&self) -> usize {
        self.registry.read().await.session_count()
    }

    /// Current input (consumer) bindings as a JSON object.
    pub async fn input_queues_json(&self) -> Result<String, ServerError> {
        Ok(self.registry.read().await.input_queues().to_json()?)
    }

    /// Current output (producer) bindings as a JSON object.
    pub async fn output_queues_json(&self) -> Result<String, ServerError> {
        Ok(self.registry.read().await.output_queues().to_json()?)
    }

    /// Binding graph as a JSON node array.
    pub async fn binding_graph_json(&self) -> Result<String, ServerError> {
        Ok(self.binding_graph().await.to_json()?)
    }

    /// Binding graph wrapped in the `meshRoutes()` page function.
    pub async fn mesh_routes_script(&self) -> Result<String, ServerError> {
        Ok(self.binding_graph().await.to_script()?)
    }

    /// Producer -> consumer routes as a DOT digraph.
    pub async fn routing_digraph(&self) -> String {
        let reg = self.registry.read().await;
        graph::routing_digraph(reg.input_queues(), reg.output_queues())
    }

    /// Per-peer connector view as a JSON node array.
    pub async fn channel_graph_json(&self) -> Result<String, ServerError> {
        let reg = self.registry.read().await;
        Ok(ChannelGraph::build(reg.input_queues(), reg.output_queues()).to_json()?)
    }

    async fn binding_graph(&self) -> BindingGraph {
        let reg = self.registry.read().await;
        BindingGraph::build(reg.input_queues(), reg.output_queues())
    }

    /// Load saved bindings (no-op: nothing is persisted).
    pub async fn restore(&self) {
        self.registry.write().await.restore();
    }

    /// Save bindings (no-op: nothing is persisted).
    pub async fn persist(&self) {
        self.registry.read().await.persist();
    }
}

/// Resolves once shutdown has been signalled.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without a stop: nothing can signal us any more.
        std::future::pending::<()>().await;
    }
}

/// Server error types.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
