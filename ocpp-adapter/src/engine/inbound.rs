//! Inbound pipeline: parse, verify, process, sign, reply
//!
//! Every CALL gets exactly one reply. The reply is the first of: a
//! decode failure, a signature failure, the processor's answer, or a
//! generic failure when there is no processor or it produced nothing.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlation::Resolution;
use super::events::{BoxError, EventKind, ExchangeEvent};
use super::{panic_message, Engine};
use crate::ocpp::codec::{self, DecodeContext, OcppRequest};
use crate::ocpp::frame::{Call, CallError, CallResult, ErrorCode, Frame, FrameError, Routing};
use crate::ocpp::{Destination, EventTrackingId, NetworkPath, NodeId, RequestId};
use crate::transport::Connection;

/// What a processor returns: `Ok(None)` means "no answer"
pub type ProcessorResult<R> = Result<Option<R>, BoxError>;

type Processor<Req> = Arc<
    dyn Fn(ProcessorContext, Req) -> BoxFuture<'static, ProcessorResult<<Req as OcppRequest>::Response>>
        + Send
        + Sync,
>;

/// Everything a processor knows about the request it is handling
#[derive(Clone)]
pub struct ProcessorContext {
    pub timestamp: DateTime<Utc>,
    /// Node the request came from
    pub sender: NodeId,
    pub connection: Arc<dyn Connection>,
    pub request_id: RequestId,
    pub destination: Option<Destination>,
    pub network_path: NetworkPath,
    pub event_tracking_id: EventTrackingId,
    /// Cancelled on shutdown or when the processor overruns its time
    pub cancellation: CancellationToken,
}

/// Reply to an inbound request, before signing and framing
#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Response(Value),
    Error {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl Reply {
    fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        Reply::Error {
            code,
            description: description.into(),
            details: Value::Object(Map::new()),
        }
    }
}

impl Engine {
    /// Install the processor for `Req`, replacing any earlier one
    pub fn on_request<Req, F, Fut>(&self, processor: F)
    where
        Req: OcppRequest,
        F: Fn(ProcessorContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessorResult<Req::Response>> + Send + 'static,
    {
        self.register_descriptor::<Req>();

        let processor: Processor<Req> = Arc::new(move |ctx, request| processor(ctx, request).boxed());
        let replaced = self
            .processors
            .write()
            .insert(Req::ACTION, Box::new(processor))
            .is_some();

        if replaced {
            warn!("Replaced processor for {}", Req::ACTION);
        } else {
            debug!("Registered processor for {}", Req::ACTION);
        }
    }

    fn processor<Req: OcppRequest>(&self) -> Option<Processor<Req>> {
        self.processors
            .read()
            .get(Req::ACTION)
            .and_then(|processor| processor.downcast_ref::<Processor<Req>>())
            .cloned()
    }

    /// Route one inbound text frame
    pub async fn handle_frame(&self, connection: Arc<dyn Connection>, text: String) {
        let frame = match Frame::parse(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject_frame(&connection, e).await;
                return;
            }
        };

        match frame {
            Frame::Call(call) => {
                let receive = self.receivers.read().get(call.action.as_str()).copied();
                match receive {
                    Some(receive) => receive(self, call, connection).await,
                    None => self.reject_unknown_action(&connection, call).await,
                }
            }
            Frame::CallResult(result) => {
                let request_id = result.message_id.clone();
                if !self.correlation.resolve(&request_id, Resolution::Response(result)) {
                    warn!("Response {} matches no pending request", request_id);
                }
            }
            Frame::CallError(error) => {
                let request_id = error.message_id.clone();
                if !self.correlation.resolve(&request_id, Resolution::RequestError(error)) {
                    warn!("Request error {} matches no pending request", request_id);
                }
            }
            Frame::CallResultError(error) => {
                warn!(
                    "Peer rejected our response {}: {} {}",
                    error.message_id, error.error_code, error.error_description
                );
                self.events.emit(
                    ExchangeEvent::new(
                        EventKind::ResponseErrorReceived,
                        error.message_id.clone(),
                        EventTrackingId::new(),
                    )
                    .connection(connection.id())
                    .payload(error.error_details),
                );
            }
        }
    }

    /// Inbound pipeline for one request type
    pub(crate) async fn receive<Req: OcppRequest>(&self, call: Call, connection: Arc<dyn Connection>) {
        let received_at = Utc::now();
        let event_tracking_id = EventTrackingId::new();
        let routing = call.routing.clone().unwrap_or_default();
        let network_path = if routing.network_path.is_empty() {
            NetworkPath::from_source(connection.peer())
        } else {
            routing.network_path.clone()
        };

        debug!("Received {} {} from {}", Req::ACTION, call.message_id, connection.peer());

        let reply = AssertUnwindSafe(self.process::<Req>(
            &call,
            &connection,
            received_at,
            event_tracking_id,
            &routing,
            &network_path,
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Reply::error(ErrorCode::InternalError, panic_message(&*panic)));

        let reply = match reply {
            Reply::Response(mut payload) => match self.signatures.sign_response(Req::ACTION, &mut payload) {
                Ok(()) => Reply::Response(payload),
                Err(e) => Reply::error(ErrorCode::SecurityError, e.to_string()),
            },
            error => error,
        };

        let reply_path = network_path.reversed();
        let reply_routing = self.routing(network_path.source().map(Destination::node), &reply_path);

        let (kind, frame, payload) = match reply {
            Reply::Response(payload) => (
                EventKind::ResponseSent,
                Frame::CallResult(CallResult {
                    message_id: call.message_id.clone(),
                    payload: payload.clone(),
                    routing: reply_routing,
                }),
                payload,
            ),
            Reply::Error { code, description, details } => {
                info!("Answering {} {} with {}: {}", Req::ACTION, call.message_id, code, description);
                (
                    EventKind::RequestErrorSent,
                    Frame::CallError(
                        CallError::new(call.message_id.clone(), code, description)
                            .with_details(details.clone())
                            .with_routing(reply_routing),
                    ),
                    details,
                )
            }
        };

        let outcome = self.transmit(&connection, &frame).await;
        let runtime = (Utc::now() - received_at).to_std().unwrap_or_default();

        self.events.emit(
            ExchangeEvent::new(kind, call.message_id, event_tracking_id)
                .action(Req::ACTION)
                .connection(connection.id())
                .path(reply_path)
                .payload(payload)
                .outcome(outcome)
                .runtime(runtime),
        );
    }

    async fn process<Req: OcppRequest>(
        &self,
        call: &Call,
        connection: &Arc<dyn Connection>,
        received_at: DateTime<Utc>,
        event_tracking_id: EventTrackingId,
        routing: &Routing,
        network_path: &NetworkPath,
    ) -> Reply {
        let context = DecodeContext {
            request_id: call.message_id.clone(),
            destination: routing.destination.clone(),
            network_path: network_path.clone(),
            timestamp: received_at,
            timeout: None,
            event_tracking_id,
        };

        let decoded = match codec::try_decode::<Req>(&call.payload, context, self.hooks.parser::<Req>()) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Could not parse {} {}: {}", Req::ACTION, call.message_id, e);
                return Reply::error(ErrorCode::FormatViolation, e.to_string());
            }
        };

        let rejected = self
            .signatures
            .verify_request(Req::ACTION, &call.payload)
            .err()
            .map(|e| {
                warn!("{} {} failed verification: {}", Req::ACTION, call.message_id, e);
                Reply::error(ErrorCode::SecurityError, e.to_string())
            });

        self.events.emit(
            ExchangeEvent::new(EventKind::RequestReceived, call.message_id.clone(), event_tracking_id)
                .action(Req::ACTION)
                .connection(connection.id())
                .path(network_path.clone())
                .payload(call.payload.clone()),
        );

        if let Some(reply) = rejected {
            return reply;
        }

        let processor = match self.processor::<Req>() {
            Some(processor) => processor,
            None => {
                return Reply::error(
                    ErrorCode::NotImplemented,
                    format!("No processor registered for {}", Req::ACTION),
                )
            }
        };

        let cancellation = self.shutdown.child_token();
        let ctx = ProcessorContext {
            timestamp: received_at,
            sender: network_path.source().unwrap_or(connection.peer()).to_string(),
            connection: connection.clone(),
            request_id: call.message_id.clone(),
            destination: routing.destination.clone(),
            network_path: network_path.clone(),
            event_tracking_id,
            cancellation: cancellation.clone(),
        };

        let invocation = AssertUnwindSafe(processor(ctx, decoded.payload)).catch_unwind();
        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                return Reply::error(ErrorCode::GenericError, "Cancelled before the processor finished");
            }
            result = tokio::time::timeout(self.config.processor_timeout, invocation) => result,
        };

        match result {
            Ok(Ok(Ok(Some(response)))) => {
                match codec::encode(&response, self.hooks.serializer::<Req::Response>()) {
                    Ok(payload) => Reply::Response(payload),
                    Err(e) => Reply::error(ErrorCode::InternalError, e.to_string()),
                }
            }
            Ok(Ok(Ok(None))) => Reply::error(
                ErrorCode::GenericError,
                format!("Processor for {} produced no response", Req::ACTION),
            ),
            Ok(Ok(Err(e))) => Reply::error(ErrorCode::InternalError, e.to_string()),
            Ok(Err(panic)) => Reply::error(ErrorCode::InternalError, panic_message(&*panic)),
            Err(_) => {
                cancellation.cancel();
                Reply::error(ErrorCode::GenericError, "Processor timed out")
            }
        }
    }

    async fn reject_unknown_action(&self, connection: &Arc<dyn Connection>, call: Call) {
        warn!("No descriptor for action {} ({})", call.action, call.message_id);
        let error = CallError::new(
            call.message_id.clone(),
            ErrorCode::NotImplemented,
            format!("Unknown action {}", call.action),
        );
        let outcome = self.transmit(connection, &Frame::CallError(error)).await;

        self.events.emit(
            ExchangeEvent::new(EventKind::RequestErrorSent, call.message_id, EventTrackingId::new())
                .action(call.action)
                .connection(connection.id())
                .outcome(outcome),
        );
    }

    /// Answer a frame that could not be parsed, unless it was itself a reply
    async fn reject_frame(&self, connection: &Arc<dyn Connection>, error: FrameError) {
        let code = match error.reply_code() {
            Some(code) => code,
            None => {
                warn!("Dropping malformed reply from {}: {}", connection.peer(), error);
                if let Some(request_id) = error.answered_call() {
                    self.correlation
                        .resolve(request_id, Resolution::Malformed(error.to_string()));
                }
                return;
            }
        };

        let request_id = error
            .message_id()
            .cloned()
            .unwrap_or_else(|| RequestId::from("-1"));
        warn!("Could not parse frame {} from {}: {}", request_id, connection.peer(), error);

        let reply = CallError::new(request_id.clone(), code, error.to_string());
        let outcome = self.transmit(connection, &Frame::CallError(reply)).await;

        self.events.emit(
            ExchangeEvent::new(EventKind::RequestErrorSent, request_id, EventTrackingId::new())
                .connection(connection.id())
                .outcome(outcome),
        );
    }
}
