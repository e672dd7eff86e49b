//! OCPP-J over WebSocket
//!
//! Handles:
//! - Uplink connection to a CSMS with subprotocol negotiation
//! - Automatic reconnection with exponential backoff
//! - Accepting downstream stations (`ws://host/<path>/<stationId>`)
//! - One writer task per socket; inbound text frames go to the engine
//!
//! Correlation, signing and processing all live in the engine; a socket only
//! moves text frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Connection, TransportError};
use crate::config::WebSocketSettings;
use crate::engine::Engine;
use crate::ocpp::NodeId;

const OUTBOUND_CAPACITY: usize = 64;

/// Sending half of a WebSocket, served by a dedicated writer task
pub struct WebSocketConnection {
    id: String,
    peer: NodeId,
    tx: mpsc::Sender<Message>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.tx
            .send(Message::text(text))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Attach an open socket to the engine.
///
/// The connection is routable as soon as this returns. The handle completes
/// once the socket is closed and its pending requests have been failed.
pub fn serve<S>(
    engine: &Arc<Engine>,
    stream: WebSocketStream<S>,
    peer: NodeId,
    uplink: bool,
) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_CAPACITY);
    let closing = CancellationToken::new();

    let connection: Arc<dyn Connection> = Arc::new(WebSocketConnection {
        id: format!("ws-{}", Uuid::new_v4()),
        peer,
        tx,
    });
    if uplink {
        engine.connections().set_uplink(connection.clone());
    } else {
        engine.connections().register(connection.clone());
    }

    let writer_closing = closing.clone();
    let connection_id = connection.id().to_string();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_closing.cancelled() => break,
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = sink.send(message).await {
                        error!("Failed to write to {}: {}", connection_id, e);
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    let engine = engine.clone();
    tokio::spawn(async move {
        let shutdown = engine.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Closing {} on shutdown", connection.id());
                    break;
                }
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received from {}: {}", connection.peer(), text);
                        engine.dispatch_frame(connection.clone(), text);
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!("Ignoring binary frame from {}", connection.peer());
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("WebSocket to {} closed by peer", connection.peer());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("WebSocket error on {}: {}", connection.id(), e);
                        break;
                    }
                    None => {
                        info!("WebSocket stream to {} ended", connection.peer());
                        break;
                    }
                }
            }
        }

        closing.cancel();
        engine.connection_closed(connection.id());
    })
}

/// Connect once to the configured CSMS and serve the socket as the uplink
pub async fn connect(
    engine: &Arc<Engine>,
    settings: &WebSocketSettings,
) -> Result<JoinHandle<()>, TransportError> {
    let base = settings
        .uplink_url
        .as_deref()
        .ok_or_else(|| TransportError::NoRoute("uplink".to_string()))?;
    let url = build_ocpp_url(base, &settings.station_id);

    let mut request = url.as_str().into_client_request()?;
    let offered = HeaderValue::from_str(&settings.subprotocols.join(", "))
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, offered);

    let (stream, response) =
        connect_async_with_config(request, Some(socket_config(settings)), false).await?;

    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    match accepted {
        Some(protocol) => info!("WebSocket connected to {} using {}", url, protocol),
        None => warn!("CSMS at {} did not select a subprotocol", url),
    }

    Ok(serve(engine, stream, settings.uplink_node_id.clone(), true))
}

/// Keep the uplink connected until the engine shuts down
pub async fn run_uplink(engine: Arc<Engine>, settings: WebSocketSettings) {
    let shutdown = engine.shutdown_token().clone();
    let mut delay = settings.reconnect_delay;

    loop {
        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            attempt = connect(&engine, &settings) => attempt,
        };
        match attempt {
            Ok(session) => {
                delay = settings.reconnect_delay;
                let _ = session.await;
                info!("Uplink to {} disconnected", settings.uplink_node_id);
            }
            Err(e) => error!("Uplink connection failed: {}", e),
        }

        if shutdown.is_cancelled() {
            break;
        }

        info!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_backoff(delay, settings.max_reconnect_delay);
    }
    debug!("Uplink loop stopped");
}

/// Accept downstream stations on `addr`.
///
/// Returns the bound address and the accept loop, which stops on shutdown.
pub async fn listen(
    engine: &Arc<Engine>,
    settings: &WebSocketSettings,
    addr: &str,
) -> Result<(SocketAddr, JoinHandle<()>), TransportError> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!("Listening for stations on {}", local);

    let engine = engine.clone();
    let supported = Arc::new(settings.subprotocols.clone());
    let config = socket_config(settings);

    let handle = tokio::spawn(async move {
        let shutdown = engine.shutdown_token().clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tokio::spawn(accept_station(
                            engine.clone(),
                            stream,
                            remote,
                            supported.clone(),
                            config.clone(),
                        ));
                    }
                    Err(e) => error!("Accept failed: {}", e),
                }
            }
        }
        debug!("Listener on {} stopped", local);
    });

    Ok((local, handle))
}

async fn accept_station(
    engine: Arc<Engine>,
    stream: TcpStream,
    remote: SocketAddr,
    supported: Arc<Vec<String>>,
    config: WebSocketConfig,
) {
    let mut station = None;
    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let Some(id) = station_id_from_path(request.uri().path()) else {
            return Err(reject(StatusCode::NOT_FOUND, "missing station id"));
        };

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        match negotiate_subprotocol(offered, &supported) {
            Some(protocol) => {
                let value = HeaderValue::from_str(&protocol)
                    .map_err(|_| reject(StatusCode::BAD_REQUEST, "invalid subprotocol"))?;
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
            None if offered.is_some() => {
                return Err(reject(StatusCode::BAD_REQUEST, "no supported OCPP subprotocol"));
            }
            None => warn!("Station {} offered no subprotocol", id),
        }

        station = Some(id.to_string());
        Ok(response)
    };

    match accept_hdr_async_with_config(stream, callback, Some(config)).await {
        Ok(socket) => {
            let Some(station) = station else { return };
            info!("Station {} connected from {}", station, remote);
            serve(&engine, socket, station, false);
        }
        Err(e) => warn!("Handshake with {} failed: {}", remote, e),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn socket_config(settings: &WebSocketSettings) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(settings.max_message_size),
        max_frame_size: Some(settings.max_message_size),
        ..Default::default()
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

/// Last non-empty path segment of the upgrade request
pub fn station_id_from_path(path: &str) -> Option<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).last()
}

/// Our most preferred subprotocol among those the client offered
pub fn negotiate_subprotocol(offered: Option<&str>, supported: &[String]) -> Option<String> {
    let offered: Vec<&str> = offered?.split(',').map(str::trim).collect();
    supported
        .iter()
        .find(|protocol| offered.contains(&protocol.as_str()))
        .cloned()
}

/// Double the delay, capped at `max`
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", "NN-001");
        assert_eq!(url, "ws://localhost:8180/steve/websocket/CentralSystemService/NN-001");

        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", "NN-001");
        assert_eq!(url, "ws://localhost:8180/steve/websocket/CentralSystemService/NN-001");
    }

    #[test]
    fn test_station_id_from_path() {
        assert_eq!(station_id_from_path("/ocpp/CS001"), Some("CS001"));
        assert_eq!(station_id_from_path("/ocpp/CS001/"), Some("CS001"));
        assert_eq!(station_id_from_path("/"), None);
    }

    #[test]
    fn test_negotiate_prefers_our_order() {
        let supported = vec!["ocpp2.1".to_string(), "ocpp2.0.1".to_string()];

        assert_eq!(
            negotiate_subprotocol(Some("ocpp2.0.1, ocpp2.1"), &supported).as_deref(),
            Some("ocpp2.1")
        );
        assert_eq!(
            negotiate_subprotocol(Some("ocpp2.0.1"), &supported).as_deref(),
            Some("ocpp2.0.1")
        );
        assert_eq!(negotiate_subprotocol(Some("ocpp1.6"), &supported), None);
        assert_eq!(negotiate_subprotocol(None, &supported), None);
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = Duration::from_secs(300);
        assert_eq!(next_backoff(Duration::from_secs(5), max), Duration::from_secs(10));
        assert_eq!(next_backoff(Duration::from_secs(200), max), max);
    }
}
