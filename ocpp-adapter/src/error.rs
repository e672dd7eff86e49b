//! Top-level error type
//!
//! Pipelines fold these into outcomes and error replies; they only reach
//! callers from setup paths (connecting, listening).

use thiserror::Error;

use crate::engine::{CorrelationError, SignatureError};
use crate::ocpp::{CodecError, FrameError};
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    #[error(transparent)]
    Signature(#[from] SignatureError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;
