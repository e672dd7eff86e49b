//! # OCPP Networking Node Adapter
//!
//! Message correlation and delivery engine for OCPP 2.0.1/2.1 networking
//! nodes: local controllers and relays that sit between charging stations
//! and a CSMS.
//!
//! ## Architecture
//!
//! ```text
//! CSMS (Backend)
//!       │ OCPP-J over WebSocket
//!       ▼
//! ┌─────────────────────────────────┐
//! │    ocpp-adapter                 │
//! │  ┌───────────┐  ┌────────────┐  │
//! │  │ Transport │◄►│  Engine    │  │
//! │  │ WS / chan │  │ correlate  │  │
//! │  └───────────┘  │ sign/verify│  │
//! │                 │ processors │  │
//! │                 └────────────┘  │
//! └─────────────┬───────────────────┘
//!               │ OCPP-J over WebSocket
//!               ▼
//!       Charging stations
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_adapter::{Adapter, AdapterConfig, ProcessorContext, ProcessorResult, SendOptions};
//! use ocpp_adapter::ocpp::messages::{HeartbeatRequest, HeartbeatResponse};
//!
//! async fn heartbeat(_: ProcessorContext, _: HeartbeatRequest) -> ProcessorResult<HeartbeatResponse> {
//!     Ok(Some(HeartbeatResponse::now()))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AdapterConfig::new("NN-001")
//!         .with_uplink("ws://localhost:8180/ocpp", "NN-001")
//!         .with_listener("0.0.0.0:9000");
//!
//!     let adapter = Adapter::new(config);
//!     adapter.on_request::<HeartbeatRequest, _, _>(heartbeat);
//!     adapter.start().await?;
//!
//!     let envelope = adapter.send(&HeartbeatRequest::default(), SendOptions::default()).await;
//!     println!("{}", envelope.outcome.code());
//!
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod engine;
pub mod error;
pub mod ocpp;
pub mod transport;

pub use adapter::{Adapter, AdapterBuilder};
pub use config::{AdapterConfig, EngineConfig, NetworkingMode, WebSocketSettings};
pub use engine::{
    Engine, EventKind, ExchangeEvent, KeyedSignaturePolicy, NoSignatures, Outcome,
    ProcessorContext, ProcessorResult, ResponseEnvelope, ResultCode, SendOptions,
    SignaturePolicy, VerificationMode,
};
pub use error::{AdapterError, Result};
pub use ocpp::{ErrorCode, OcppRequest, RequestId};
pub use transport::{ChannelConnection, Connection};
