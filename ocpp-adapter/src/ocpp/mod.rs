//! OCPP 2.0.1/2.1 protocol layer
//!
//! - `types`: identity, extension block and shared data types
//! - `frame`: OCPP-J framing (CALL, CALLRESULT, CALLERROR, CALLRESULTERROR)
//! - `codec`: payload encode/decode, custom hooks, canonical form
//! - `messages`: the request/response catalog

pub mod codec;
pub mod frame;
pub mod messages;
pub mod types;

pub use codec::{CodecError, CustomHooks, DecodeContext, Decoded, OcppPayload, OcppRequest};
pub use frame::{Call, CallError, CallResult, ErrorCode, Frame, FrameError, MessageType, Routing};
pub use types::*;
