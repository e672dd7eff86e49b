//! What an outbound exchange can end in

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::ocpp::{Destination, ErrorCode, EventTrackingId, NetworkPath, RequestId};
use crate::transport::SendOutcome;

/// Error reported by the counterparty, propagated as-is
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

/// The request could not be delivered or answered in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFailure {
    Timeout(Duration),
    ConnectionClosed,
    NoRoute(String),
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFailure::Timeout(after) => write!(f, "timed out after {:?}", after),
            TransportFailure::ConnectionClosed => f.write_str("connection closed"),
            TransportFailure::NoRoute(node) => write!(f, "no route to {}", node),
        }
    }
}

/// Exactly one per outbound call
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<R> {
    Ok(R),
    SignatureError(String),
    FormationViolation(String),
    RequestError(RemoteError),
    TransportFailure(TransportFailure),
    Exception(String),
}

/// Outcome without its payload, for logs and events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    SignatureError,
    FormationViolation,
    RequestError,
    TransportFailure,
    Exception,
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl<R> Outcome<R> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn response(&self) -> Option<&R> {
        match self {
            Outcome::Ok(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_response(self) -> Option<R> {
        match self {
            Outcome::Ok(response) => Some(response),
            _ => None,
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            Outcome::Ok(_) => ResultCode::Ok,
            Outcome::SignatureError(_) => ResultCode::SignatureError,
            Outcome::FormationViolation(_) => ResultCode::FormationViolation,
            Outcome::RequestError(_) => ResultCode::RequestError,
            Outcome::TransportFailure(_) => ResultCode::TransportFailure,
            Outcome::Exception(_) => ResultCode::Exception,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Outcome::TransportFailure(TransportFailure::Timeout(_)))
    }
}

/// Transport-level facts gathered while a request was in flight
#[derive(Debug, Clone)]
pub struct SendRequestState {
    pub sent_at: DateTime<Utc>,
    pub send_outcome: SendOutcome,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub destination_received: Option<Destination>,
    pub network_path_received: Option<NetworkPath>,
    pub is_valid_json_response: bool,
    pub is_valid_json_request_error: bool,
}

impl SendRequestState {
    pub fn new(send_outcome: SendOutcome) -> Self {
        Self {
            sent_at: Utc::now(),
            send_outcome,
            response_timestamp: None,
            destination_received: None,
            network_path_received: None,
            is_valid_json_response: false,
            is_valid_json_request_error: false,
        }
    }
}

/// Result of `send`: the outcome plus everything known about the exchange
#[derive(Debug, Clone)]
pub struct ResponseEnvelope<R> {
    pub request_id: RequestId,
    pub action: &'static str,
    pub event_tracking_id: EventTrackingId,
    pub request_timestamp: DateTime<Utc>,
    pub response_timestamp: DateTime<Utc>,
    /// `None` when nothing was handed to a connection
    pub state: Option<SendRequestState>,
    pub outcome: Outcome<R>,
}

impl<R> ResponseEnvelope<R> {
    pub fn runtime(&self) -> Duration {
        (self.response_timestamp - self.request_timestamp)
            .to_std()
            .unwrap_or_default()
    }
}
