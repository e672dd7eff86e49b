//! Message correlation and delivery engine
//!
//! One engine instance serves every connection of a node. It is written once
//! and parameterised by [`OcppRequest`] descriptors:
//!
//! ```text
//!  send::<Req>() ─► encode ─► sign ─► route ─► register ─► transmit
//!                                                  │
//!  frame in ─► Frame::parse ─┬─ CALLRESULT/CALLERROR ─► CorrelationTable::resolve
//!                            └─ CALL ─► receive::<Req>() ─► decode ─► verify
//!                                        ─► processor ─► sign ─► transmit reply
//! ```
//!
//! Neither direction returns errors to its caller: every failure becomes an
//! [`Outcome`] (outbound) or an error reply (inbound).

pub mod correlation;
pub mod events;
pub mod inbound;
pub mod outbound;
pub mod outcome;
pub mod signature;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, NetworkingMode};
use crate::ocpp::codec::{CustomHooks, OcppRequest};
use crate::ocpp::frame::{Call, Routing};
use crate::ocpp::messages::{register_catalog, CatalogRegistry};
use crate::ocpp::{Destination, NetworkPath, NodeId};
use crate::transport::{Connection, ConnectionRegistry};

pub use correlation::{CorrelationError, CorrelationTable, PendingHandle, Resolution};
pub use events::{BoxError, EventFanout, EventKind, ExchangeEvent};
pub use inbound::{ProcessorContext, ProcessorResult};
pub use outbound::SendOptions;
pub use outcome::{Outcome, RemoteError, ResponseEnvelope, ResultCode, SendRequestState, TransportFailure};
pub use signature::{generate_key, key_from_hex, KeyedSignaturePolicy, NoSignatures, SignatureError, SignaturePolicy, VerificationMode};

/// Type-erased inbound pipeline for one action
type ReceiveFn = for<'a> fn(&'a Engine, Call, Arc<dyn Connection>) -> BoxFuture<'a, ()>;

fn receive_boxed<Req: OcppRequest>(
    engine: &Engine,
    call: Call,
    connection: Arc<dyn Connection>,
) -> BoxFuture<'_, ()> {
    engine.receive::<Req>(call, connection).boxed()
}

/// The exchange engine
pub struct Engine {
    node_id: NodeId,
    config: EngineConfig,
    correlation: Arc<CorrelationTable>,
    signatures: Arc<dyn SignaturePolicy>,
    events: EventFanout,
    hooks: Arc<CustomHooks>,
    connections: ConnectionRegistry,
    receivers: RwLock<HashMap<&'static str, ReceiveFn>>,
    processors: RwLock<HashMap<&'static str, Box<dyn Any + Send + Sync>>>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Create an engine with every catalog message installed
    pub fn new(
        node_id: impl Into<NodeId>,
        config: EngineConfig,
        signatures: Arc<dyn SignaturePolicy>,
        hooks: CustomHooks,
    ) -> Self {
        let engine = Self {
            node_id: node_id.into(),
            config,
            correlation: Arc::new(CorrelationTable::new()),
            signatures,
            events: EventFanout::new(),
            hooks: Arc::new(hooks),
            connections: ConnectionRegistry::new(),
            receivers: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        };
        register_catalog(&engine);
        engine
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn correlation(&self) -> &Arc<CorrelationTable> {
        &self.correlation
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn events(&self) -> &EventFanout {
        &self.events
    }

    /// Token cancelled on shutdown; processors get child tokens of it
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Make `Req` dispatchable by its action name
    pub fn register_descriptor<Req: OcppRequest>(&self) {
        self.receivers
            .write()
            .insert(Req::ACTION, receive_boxed::<Req> as ReceiveFn);
    }

    /// Actions with an installed descriptor
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.receivers.read().keys().copied().collect();
        actions.sort_unstable();
        actions
    }

    /// Handle one inbound text frame on its own task
    pub fn dispatch_frame(self: &Arc<Self>, connection: Arc<dyn Connection>, text: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.handle_frame(connection, text).await;
        });
    }

    /// A connection went away: fail its pending calls and drop its route
    pub fn connection_closed(&self, connection_id: &str) {
        let failed = self.correlation.fail_connection(connection_id);
        self.connections.remove(connection_id);
        info!(
            "Connection {} closed, {} pending request(s) failed",
            connection_id, failed
        );
    }

    /// Periodically resolve overdue calls whose waiters are no longer polled
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let expired = engine.correlation.expire_timeouts();
                        if !expired.is_empty() {
                            warn!("Expired {} overdue request(s)", expired.len());
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Cancel processors and background tasks
    pub fn shutdown(&self) {
        info!("Shutting down engine {}", self.node_id);
        self.shutdown.cancel();
    }

    /// Routing header for an outgoing frame, present only in overlay mode
    fn routing(&self, destination: Option<Destination>, network_path: &NetworkPath) -> Option<Routing> {
        match self.config.networking_mode {
            NetworkingMode::Standard => None,
            NetworkingMode::OverlayNetwork => Some(Routing {
                destination,
                network_path: network_path.clone(),
            }),
        }
    }
}

impl CatalogRegistry for Engine {
    fn register<Req: OcppRequest>(&self) {
        self.register_descriptor::<Req>();
    }
}

/// Best-effort text of a caught panic
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
