//! OCPP networking node - CLI for the OCPP adapter
//!
//! Sits between charging stations and a CSMS: accepts stations on a local
//! listener, answers their boot and heartbeat traffic, and registers itself
//! with the CSMS over the uplink.
//!
//! # Usage
//!
//! ```bash
//! # Local controller accepting stations only
//! ocpp-nn-node --name NN-001 --listen 0.0.0.0:9000
//!
//! # Also register with a CSMS
//! ocpp-nn-node --name NN-001 --listen 0.0.0.0:9000 \
//!     --csms-url ws://localhost:8180/steve/websocket/CentralSystemService
//!
//! # Sign requests and insist on signed traffic
//! ocpp-nn-node --name NN-001 --listen 0.0.0.0:9000 \
//!     --signing-key <64 hex chars> --require-signatures
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::Parser;
use ocpp_adapter::engine::{generate_key, key_from_hex, BoxError};
use ocpp_adapter::ocpp::messages::{
    BootNotificationRequest, BootNotificationResponse, HeartbeatRequest, HeartbeatResponse,
    StatusNotificationRequest, StatusNotificationResponse,
};
use ocpp_adapter::ocpp::{BootReason, ChargingStationInfo, Extensions, RegistrationStatus};
use ocpp_adapter::{
    Adapter, AdapterBuilder, AdapterConfig, ExchangeEvent, KeyedSignaturePolicy, NetworkingMode, Outcome,
    ProcessorContext, ProcessorResult, SendOptions, VerificationMode,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// OCPP 2.0.1/2.1 networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Node id, also presented as station id to the CSMS
    #[arg(short, long)]
    name: String,

    /// Upstream CSMS WebSocket URL (without station id)
    #[arg(long)]
    csms_url: Option<String>,

    /// Listen address for downstream stations
    #[arg(long)]
    listen: Option<String>,

    /// Use overlay-network framing (routing object on every frame)
    #[arg(long)]
    overlay: bool,

    /// Heartbeat interval handed to stations, in seconds
    #[arg(long, default_value = "300")]
    heartbeat_interval: i32,

    /// Request timeout, in seconds
    #[arg(long, default_value = "30")]
    request_timeout: u64,

    /// Ed25519 signing key seed (hex); a fresh key is generated when signing without one
    #[arg(long)]
    signing_key: Option<String>,

    /// Sign outgoing requests and responses
    #[arg(long)]
    sign: bool,

    /// Reject unsigned traffic
    #[arg(long)]
    require_signatures: bool,

    /// Vendor name reported at boot
    #[arg(long, default_value = "Elektrokombinacija")]
    vendor: String,

    /// Model name reported at boot
    #[arg(long, default_value = "NN-OCPP")]
    model: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging; RUST_LOG overrides --log-level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║           OCPP Networking Node                               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Node:     {:<50} ║", args.name);
    println!("║  CSMS:     {:<50} ║", truncate(args.csms_url.as_deref().unwrap_or("-"), 50));
    println!("║  Listen:   {:<50} ║", args.listen.as_deref().unwrap_or("-"));
    println!("║  Overlay:  {:<50} ║", args.overlay);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = AdapterConfig::new(&args.name)
        .with_request_timeout(Duration::from_secs(args.request_timeout));
    if let Some(url) = &args.csms_url {
        config = config.with_uplink(url, &args.name);
    }
    if let Some(addr) = &args.listen {
        config = config.with_listener(addr);
    }
    if args.overlay {
        config = config.with_networking_mode(NetworkingMode::OverlayNetwork);
    }

    let mode = if args.require_signatures {
        VerificationMode::Require
    } else {
        VerificationMode::VerifyIfPresent
    };
    let policy = if args.sign || args.signing_key.is_some() {
        let key = match &args.signing_key {
            Some(seed) => key_from_hex(seed)?,
            None => generate_key(),
        };
        let policy = KeyedSignaturePolicy::signing(key, mode);
        info!("Signing with key {}", policy.key_id().unwrap_or("-"));
        policy
    } else {
        KeyedSignaturePolicy::verifier(mode)
    };

    let adapter = Arc::new(AdapterBuilder::from_config(config).signatures(policy).build());
    install_processors(&adapter, args.heartbeat_interval);

    adapter.subscribe(log_exchange);

    if let Some(addr) = adapter.start().await? {
        info!("Accepting stations on ws://{}/<stationId>", addr);
    }

    if args.csms_url.is_some() {
        let info = ChargingStationInfo {
            model: args.model.clone(),
            vendor_name: args.vendor.clone(),
            serial_number: None,
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };
        tokio::spawn(register_with_csms(adapter.clone(), info));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    adapter.shutdown().await;

    Ok(())
}

/// Answer station boot, heartbeat and status traffic locally
fn install_processors(adapter: &Adapter, heartbeat_interval: i32) {
    adapter.on_request::<BootNotificationRequest, _, _>(move |ctx, request| {
        on_boot(ctx, request, heartbeat_interval)
    });
    adapter.on_request::<HeartbeatRequest, _, _>(on_heartbeat);
    adapter.on_request::<StatusNotificationRequest, _, _>(on_status);
}

async fn on_boot(
    ctx: ProcessorContext,
    request: BootNotificationRequest,
    heartbeat_interval: i32,
) -> ProcessorResult<BootNotificationResponse> {
    info!(
        "Station {} booted ({} {}, {:?})",
        ctx.sender,
        request.charging_station.vendor_name,
        request.charging_station.model,
        request.reason
    );
    Ok(Some(BootNotificationResponse {
        current_time: Utc::now(),
        interval: heartbeat_interval,
        status: RegistrationStatus::Accepted,
        status_info: None,
        ext: Extensions::default(),
    }))
}

async fn on_heartbeat(ctx: ProcessorContext, _: HeartbeatRequest) -> ProcessorResult<HeartbeatResponse> {
    debug!("Heartbeat from {}", ctx.sender);
    Ok(Some(HeartbeatResponse::now()))
}

async fn on_status(
    ctx: ProcessorContext,
    request: StatusNotificationRequest,
) -> ProcessorResult<StatusNotificationResponse> {
    info!(
        "Station {} EVSE {}/{} is {:?}",
        ctx.sender, request.evse_id, request.connector_id, request.connector_status
    );
    Ok(Some(StatusNotificationResponse {
        ext: Extensions::default(),
    }))
}

async fn log_exchange(event: ExchangeEvent) -> Result<(), BoxError> {
    debug!(
        "{:?} {} {} via {}",
        event.kind,
        event.action.as_deref().unwrap_or("-"),
        event.request_id,
        event.connection_id.as_deref().unwrap_or("-")
    );
    Ok(())
}

/// Boot against the CSMS until accepted, then keep heartbeating
async fn register_with_csms(adapter: Arc<Adapter>, info: ChargingStationInfo) {
    let shutdown = adapter.engine().shutdown_token().clone();
    let request = BootNotificationRequest::new(info, BootReason::PowerUp);
    let mut interval = Duration::from_secs(10);

    loop {
        let envelope = adapter.send(&request, SendOptions::default()).await;
        match envelope.outcome {
            Outcome::Ok(response) => {
                interval = Duration::from_secs(response.interval.max(1) as u64);
                if response.status == RegistrationStatus::Accepted {
                    info!("Registered with CSMS, heartbeat every {:?}", interval);
                    break;
                }
                warn!("CSMS answered boot with {:?}", response.status);
            }
            other => warn!("Boot notification failed: {}", other.code()),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let envelope = adapter.send(&HeartbeatRequest::default(), SendOptions::default()).await;
        match envelope.outcome.into_response() {
            Some(response) => debug!("CSMS time {}", response.current_time),
            None => error!("Heartbeat {} to CSMS failed", envelope.request_id),
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len - 3])
    }
}
