//! Connections the engine sends frames over
//!
//! A [`Connection`] is anything that can carry one text frame to a peer node.
//! The engine never owns sockets; it looks connections up in the
//! [`ConnectionRegistry`] by destination node id.

pub mod channel;
pub mod websocket;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info};

use crate::ocpp::NodeId;

pub use channel::ChannelConnection;
pub use websocket::WebSocketConnection;

/// Transport-level failures
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Frame rejected: {0}")]
    Rejected(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("No route to {0}")]
    NoRoute(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Low-level result of handing one frame to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    ConnectionClosed,
    Rejected(String),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

impl From<&Result<(), TransportError>> for SendOutcome {
    fn from(result: &Result<(), TransportError>) -> Self {
        match result {
            Ok(()) => SendOutcome::Sent,
            Err(TransportError::ConnectionClosed) => SendOutcome::ConnectionClosed,
            Err(e) => SendOutcome::Rejected(e.to_string()),
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Sent => f.write_str("sent"),
            SendOutcome::ConnectionClosed => f.write_str("connection closed"),
            SendOutcome::Rejected(reason) => write!(f, "rejected: {}", reason),
        }
    }
}

/// One bidirectional link to a peer node
#[async_trait]
pub trait Connection: Send + Sync {
    /// Unique id of this connection instance
    fn id(&self) -> &str;

    /// Node id of the remote end
    fn peer(&self) -> &str;

    /// Queue one text frame for transmission
    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    fn is_closed(&self) -> bool;
}

/// Destination node id -> connection, with a default uplink route
#[derive(Default)]
pub struct ConnectionRegistry {
    routes: RwLock<HashMap<NodeId, Arc<dyn Connection>>>,
    uplink: RwLock<Option<Arc<dyn Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for the connection's peer over it, replacing any older link
    pub fn register(&self, connection: Arc<dyn Connection>) {
        info!("Registered connection {} to {}", connection.id(), connection.peer());
        self.routes
            .write()
            .insert(connection.peer().to_string(), connection);
    }

    /// Use `connection` for every destination without a direct route
    pub fn set_uplink(&self, connection: Arc<dyn Connection>) {
        info!("Uplink set to {} via {}", connection.peer(), connection.id());
        self.register(connection.clone());
        *self.uplink.write() = Some(connection);
    }

    /// Forget a connection; later registrations for the same peer are kept
    pub fn remove(&self, connection_id: &str) {
        self.routes.write().retain(|_, conn| conn.id() != connection_id);

        let mut uplink = self.uplink.write();
        if uplink.as_ref().map_or(false, |conn| conn.id() == connection_id) {
            *uplink = None;
        }
        debug!("Removed connection {}", connection_id);
    }

    /// Connection for `destination`: a direct route, else the uplink
    pub fn route(&self, destination: Option<&str>) -> Option<Arc<dyn Connection>> {
        if let Some(node) = destination {
            if let Some(conn) = self.routes.read().get(node) {
                if !conn.is_closed() {
                    return Some(conn.clone());
                }
            }
        }
        self.uplink.read().clone().filter(|conn| !conn.is_closed())
    }

    /// Node ids with a direct route
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.routes.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    /// Every registered connection
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.routes.read().values().cloned().collect()
    }
}
