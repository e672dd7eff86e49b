//! Outbound pipeline: encode, sign, route, register, transmit, await, verify

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use futures_util::FutureExt;
use tracing::{debug, error, warn};

use super::correlation::Resolution;
use super::events::{EventKind, ExchangeEvent};
use super::outcome::{Outcome, RemoteError, ResponseEnvelope, SendRequestState, TransportFailure};
use super::{panic_message, Engine};
use crate::error::AdapterError;
use crate::ocpp::codec::{self, DecodeContext, OcppRequest};
use crate::ocpp::frame::{Call, CallError, CallResult, ErrorCode, Frame};
use crate::ocpp::{Destination, EventTrackingId, NetworkPath, NodeId, RequestId};
use crate::transport::{Connection, SendOutcome, TransportError};

/// Per-call overrides for `send`
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Target node; `None` uses the uplink
    pub destination: Option<NodeId>,
    /// Path so far; defaults to this node alone
    pub network_path: Option<NetworkPath>,
    /// Overrides the configured request timeout
    pub timeout: Option<Duration>,
    /// Overrides the generated request id
    pub request_id: Option<RequestId>,
    pub event_tracking_id: Option<EventTrackingId>,
}

impl SendOptions {
    pub fn to(destination: impl Into<NodeId>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_network_path(mut self, network_path: NetworkPath) -> Self {
        self.network_path = Some(network_path);
        self
    }

    pub fn with_event_tracking_id(mut self, event_tracking_id: EventTrackingId) -> Self {
        self.event_tracking_id = Some(event_tracking_id);
        self
    }
}

/// Identity of one outbound exchange, shared by its stages
struct Exchange<'a> {
    request_id: &'a RequestId,
    event_tracking_id: EventTrackingId,
    timeout: Duration,
}

impl Engine {
    /// Send a request and wait for its single outcome.
    ///
    /// Never fails and never panics: errors, timeouts and panics inside the
    /// pipeline are all reported through the envelope's `outcome`.
    pub async fn send<Req: OcppRequest>(
        &self,
        request: &Req,
        options: SendOptions,
    ) -> ResponseEnvelope<Req::Response> {
        let request_id = options.request_id.clone().unwrap_or_default();
        let event_tracking_id = options.event_tracking_id.unwrap_or_default();
        let request_timestamp = Utc::now();
        let exchange = Exchange {
            request_id: &request_id,
            event_tracking_id,
            timeout: options.timeout.unwrap_or(self.config.request_timeout),
        };

        let mut state = None;
        let result = AssertUnwindSafe(self.exchange(request, &options, &exchange, &mut state))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => Outcome::Exception(e.to_string()),
            Err(panic) => Outcome::Exception(panic_message(&*panic)),
        };

        match &outcome {
            Outcome::Ok(_) => debug!("{} {} completed", Req::ACTION, request_id),
            Outcome::Exception(reason) => error!("{} {} failed: {}", Req::ACTION, request_id, reason),
            Outcome::TransportFailure(failure) => {
                warn!("{} {} not answered: {}", Req::ACTION, request_id, failure)
            }
            other => warn!("{} {} ended with {}", Req::ACTION, request_id, other.code()),
        }

        ResponseEnvelope {
            request_id,
            action: Req::ACTION,
            event_tracking_id,
            request_timestamp,
            response_timestamp: Utc::now(),
            state,
            outcome,
        }
    }

    /// Send the same request to every node in `destinations`, each under its own id
    pub async fn broadcast<Req: OcppRequest>(
        &self,
        request: &Req,
        destinations: &[NodeId],
        options: SendOptions,
    ) -> Vec<(NodeId, ResponseEnvelope<Req::Response>)> {
        let sends = destinations.iter().map(|node| {
            let options = SendOptions {
                destination: Some(node.clone()),
                request_id: None,
                ..options.clone()
            };
            async move { (node.clone(), self.send(request, options).await) }
        });
        join_all(sends).await
    }

    async fn exchange<Req: OcppRequest>(
        &self,
        request: &Req,
        options: &SendOptions,
        exchange: &Exchange<'_>,
        state: &mut Option<SendRequestState>,
    ) -> Result<Outcome<Req::Response>, AdapterError> {
        let mut payload = codec::encode(request, self.hooks.serializer::<Req>())?;

        if let Err(e) = self.signatures.sign_request(Req::ACTION, &mut payload) {
            return Ok(Outcome::SignatureError(e.to_string()));
        }

        let connection = match self.connections.route(options.destination.as_deref()) {
            Some(connection) => connection,
            None => {
                let target = options.destination.as_deref().unwrap_or("uplink");
                return Ok(Outcome::TransportFailure(TransportFailure::NoRoute(
                    target.to_string(),
                )));
            }
        };

        let network_path = options
            .network_path
            .clone()
            .unwrap_or_else(|| NetworkPath::from_source(self.node_id.clone()));
        let destination = options.destination.clone().map(Destination::Node);

        let frame = Frame::Call(Call {
            message_id: exchange.request_id.clone(),
            action: Req::ACTION.to_string(),
            payload: payload.clone(),
            routing: self.routing(destination, &network_path),
        });
        let text = frame.to_text()?;

        let handle = self.correlation.register(
            exchange.request_id.clone(),
            Req::ACTION,
            connection.id(),
            exchange.timeout,
        )?;

        debug!("Sending {} {} via {}", Req::ACTION, exchange.request_id, connection.id());
        let sent = connection.send_text(text).await;
        let send_outcome = SendOutcome::from(&sent);
        *state = Some(SendRequestState::new(send_outcome.clone()));

        self.events.emit(
            ExchangeEvent::new(EventKind::RequestSent, exchange.request_id.clone(), exchange.event_tracking_id)
                .action(Req::ACTION)
                .connection(connection.id())
                .path(network_path)
                .payload(payload)
                .outcome(send_outcome),
        );

        match sent {
            Ok(()) => {}
            Err(TransportError::ConnectionClosed) => self.connection_closed(connection.id()),
            Err(e) => warn!("Send of {} failed: {}", exchange.request_id, e),
        }

        let issued_at = handle.issued_at();
        let resolution = handle.wait().await;
        let runtime = (Utc::now() - issued_at).to_std().unwrap_or_default();

        let outcome = match resolution {
            Resolution::Response(result) => {
                self.accept_response::<Req>(result, &connection, exchange, runtime, state)
                    .await
            }
            Resolution::RequestError(error) => {
                if let Some(state) = state.as_mut() {
                    state.response_timestamp = Some(Utc::now());
                    state.is_valid_json_request_error = true;
                    if let Some(routing) = &error.routing {
                        state.destination_received = routing.destination.clone();
                        state.network_path_received = Some(routing.network_path.clone());
                    }
                }
                self.events.emit(
                    ExchangeEvent::new(
                        EventKind::RequestErrorReceived,
                        exchange.request_id.clone(),
                        exchange.event_tracking_id,
                    )
                    .action(Req::ACTION)
                    .connection(connection.id())
                    .payload(error.error_details.clone())
                    .runtime(runtime),
                );
                Outcome::RequestError(RemoteError {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                })
            }
            Resolution::Malformed(reason) => {
                warn!("Reply to {} {} is malformed: {}", Req::ACTION, exchange.request_id, reason);
                Outcome::FormationViolation(reason)
            }
            Resolution::Timeout => {
                Outcome::TransportFailure(TransportFailure::Timeout(exchange.timeout))
            }
            Resolution::ConnectionClosed => {
                Outcome::TransportFailure(TransportFailure::ConnectionClosed)
            }
        };

        Ok(outcome)
    }

    /// Decode and verify a correlated response
    async fn accept_response<Req: OcppRequest>(
        &self,
        result: CallResult,
        connection: &Arc<dyn Connection>,
        exchange: &Exchange<'_>,
        runtime: Duration,
        state: &mut Option<SendRequestState>,
    ) -> Outcome<Req::Response> {
        let routing = result.routing.clone().unwrap_or_default();
        let response_timestamp = Utc::now();

        if let Some(state) = state.as_mut() {
            state.response_timestamp = Some(response_timestamp);
            if result.routing.is_some() {
                state.destination_received = routing.destination.clone();
                state.network_path_received = Some(routing.network_path.clone());
            }
        }

        self.events.emit(
            ExchangeEvent::new(
                EventKind::ResponseReceived,
                exchange.request_id.clone(),
                exchange.event_tracking_id,
            )
            .action(Req::ACTION)
            .connection(connection.id())
            .path(routing.network_path.clone())
            .payload(result.payload.clone())
            .runtime(runtime),
        );

        let context = DecodeContext {
            request_id: exchange.request_id.clone(),
            destination: routing.destination.clone(),
            network_path: routing.network_path.clone(),
            timestamp: response_timestamp,
            timeout: Some(exchange.timeout),
            event_tracking_id: exchange.event_tracking_id,
        };

        let decoded = match codec::try_decode::<Req::Response>(
            &result.payload,
            context,
            self.hooks.parser::<Req::Response>(),
        ) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Response to {} {} is malformed: {}", Req::ACTION, exchange.request_id, e);
                self.send_response_error(connection, &result, ErrorCode::FormatViolation, &e.to_string(), exchange)
                    .await;
                return Outcome::FormationViolation(e.to_string());
            }
        };

        if let Some(state) = state.as_mut() {
            state.is_valid_json_response = true;
        }

        if let Err(e) = self.signatures.verify_response(Req::ACTION, &result.payload) {
            warn!("Response to {} {} failed verification: {}", Req::ACTION, exchange.request_id, e);
            self.send_response_error(connection, &result, ErrorCode::SecurityError, &e.to_string(), exchange)
                .await;
            return Outcome::SignatureError(e.to_string());
        }

        Outcome::Ok(decoded.payload)
    }

    /// Answer a bad response with CALLRESULTERROR, when enabled
    async fn send_response_error(
        &self,
        connection: &Arc<dyn Connection>,
        result: &CallResult,
        code: ErrorCode,
        description: &str,
        exchange: &Exchange<'_>,
    ) {
        if !self.config.send_response_errors {
            return;
        }

        let routing = result.routing.as_ref().and_then(|routing| {
            let reply_path = routing.network_path.reversed();
            let destination = routing.network_path.source().map(Destination::node);
            self.routing(destination, &reply_path)
        });
        let error = CallError::new(result.message_id.clone(), code, description).with_routing(routing);
        let details = error.error_details.clone();

        let outcome = self.transmit(connection, &Frame::CallResultError(error)).await;
        self.events.emit(
            ExchangeEvent::new(
                EventKind::ResponseErrorSent,
                exchange.request_id.clone(),
                exchange.event_tracking_id,
            )
            .connection(connection.id())
            .payload(details)
            .outcome(outcome),
        );
    }

    /// Render and send one frame, treating a closed connection as gone
    pub(crate) async fn transmit(&self, connection: &Arc<dyn Connection>, frame: &Frame) -> SendOutcome {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to render frame {}: {}", frame.message_id(), e);
                return SendOutcome::Rejected(e.to_string());
            }
        };

        let sent = connection.send_text(text).await;
        let outcome = SendOutcome::from(&sent);
        match sent {
            Ok(()) => debug!("Sent {:?} {} via {}", frame.message_type(), frame.message_id(), connection.id()),
            Err(TransportError::ConnectionClosed) => self.connection_closed(connection.id()),
            Err(e) => error!("Failed to send {} via {}: {}", frame.message_id(), connection.id(), e),
        }
        outcome
    }
}
