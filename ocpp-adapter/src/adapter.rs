//! Networking-node adapter
//!
//! Owns one [`Engine`] and the transports feeding it.
//!
//! ```text
//!          CSMS
//!           ▲ uplink (WebSocket client)
//!           │
//! ┌─────────┴─────────────────────┐
//! │  Adapter                      │
//! │  ┌─────────┐   ┌───────────┐  │
//! │  │ Engine  │◄─►│ Transports│  │
//! │  └─────────┘   └───────────┘  │
//! └─────────┬─────────────────────┘
//!           │ listener (WebSocket server)
//!           ▼
//!   Charging stations
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::AdapterConfig;
use crate::engine::{
    BoxError, Engine, ExchangeEvent, NoSignatures, ProcessorContext, ProcessorResult,
    ResponseEnvelope, SendOptions, SignaturePolicy,
};
use crate::error::{AdapterError, Result};
use crate::ocpp::{CustomHooks, NodeId, OcppRequest};
use crate::transport::{channel, websocket, ChannelConnection};

/// How often overdue requests are swept
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A networking node: one engine plus its connections
pub struct Adapter {
    config: AdapterConfig,
    engine: Arc<Engine>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Adapter {
    /// Adapter without message signatures
    pub fn new(config: AdapterConfig) -> Self {
        AdapterBuilder::from_config(config).build()
    }

    pub fn builder(node_id: impl Into<NodeId>) -> AdapterBuilder {
        AdapterBuilder::new(node_id)
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        self.engine.node_id()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Send a request and wait for its outcome
    pub async fn send<Req: OcppRequest>(
        &self,
        request: &Req,
        options: SendOptions,
    ) -> ResponseEnvelope<Req::Response> {
        self.engine.send(request, options).await
    }

    /// Send one request to several nodes concurrently
    pub async fn broadcast<Req: OcppRequest>(
        &self,
        request: &Req,
        destinations: &[NodeId],
    ) -> Vec<(NodeId, ResponseEnvelope<Req::Response>)> {
        self.engine
            .broadcast(request, destinations, SendOptions::default())
            .await
    }

    /// Install the processor answering `Req`
    pub fn on_request<Req, F, Fut>(&self, processor: F)
    where
        Req: OcppRequest,
        F: Fn(ProcessorContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessorResult<Req::Response>> + Send + 'static,
    {
        self.engine.on_request::<Req, F, Fut>(processor);
    }

    /// Observe every exchange event
    pub fn subscribe<F, Fut>(&self, observer: F)
    where
        F: Fn(ExchangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.engine.events().subscribe(observer);
    }

    /// Serve an in-process link; `uplink` makes it the default route
    pub fn attach_channel(
        &self,
        connection: Arc<ChannelConnection>,
        inbox: mpsc::Receiver<String>,
        uplink: bool,
    ) -> JoinHandle<()> {
        channel::serve(&self.engine, connection, inbox, uplink)
    }

    /// Start the configured transports and the timeout sweeper.
    ///
    /// Returns the listener's bound address when one is configured.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let settings = &self.config.websocket;
        if settings.uplink_url.is_none() && settings.listen_addr.is_none() {
            return Err(AdapterError::Config(
                "neither an uplink URL nor a listen address is configured".to_string(),
            ));
        }

        let mut tasks = Vec::new();
        if settings.uplink_url.is_some() {
            tasks.push(tokio::spawn(websocket::run_uplink(
                self.engine.clone(),
                settings.clone(),
            )));
        }

        let mut bound = None;
        if let Some(addr) = &settings.listen_addr {
            let (local, handle) = websocket::listen(&self.engine, settings, addr).await?;
            bound = Some(local);
            tasks.push(handle);
        }

        tasks.push(self.engine.spawn_sweeper(SWEEP_INTERVAL));
        self.tasks.lock().extend(tasks);

        info!("Node {} started", self.node_id());
        Ok(bound)
    }

    /// Cancel processors and stop every background task
    pub async fn shutdown(&self) {
        self.engine.shutdown();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Builder for the adapter
pub struct AdapterBuilder {
    config: AdapterConfig,
    signatures: Option<Arc<dyn SignaturePolicy>>,
    hooks: CustomHooks,
}

impl AdapterBuilder {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self::from_config(AdapterConfig::new(node_id))
    }

    pub fn from_config(config: AdapterConfig) -> Self {
        Self {
            config,
            signatures: None,
            hooks: CustomHooks::new(),
        }
    }

    /// Adjust the configuration in place
    pub fn configure(mut self, f: impl FnOnce(AdapterConfig) -> AdapterConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Signature policy for both directions
    pub fn signatures(mut self, policy: impl SignaturePolicy + 'static) -> Self {
        self.signatures = Some(Arc::new(policy));
        self
    }

    /// Custom serializers and parsers
    pub fn hooks(mut self, hooks: CustomHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> Adapter {
        let signatures = self
            .signatures
            .unwrap_or_else(|| Arc::new(NoSignatures) as Arc<dyn SignaturePolicy>);
        let engine = Engine::new(
            self.config.node_id.clone(),
            self.config.engine.clone(),
            signatures,
            self.hooks,
        );

        Adapter {
            config: self.config,
            engine: Arc::new(engine),
            tasks: Mutex::new(Vec::new()),
        }
    }
}
