//! OCPP 2.0.1/2.1 request and response payloads
//!
//! Each message is a plain serde struct with a flattened [`Extensions`]
//! block. The table at the bottom binds every request to its action name
//! and response type; nothing else is per-message.
//!
//! [`Extensions`]: crate::ocpp::types::Extensions

mod data_transfer;
mod provisioning;
mod reservation;
mod security;
mod smart_charging;
mod transactions;

pub use data_transfer::*;
pub use provisioning::*;
pub use reservation::*;
pub use security::*;
pub use smart_charging::*;
pub use transactions::*;

use super::codec::OcppRequest;

/// Something request descriptors can be installed into
pub trait CatalogRegistry {
    fn register<Req: OcppRequest>(&self);
}

macro_rules! catalog {
    ($($request:ident => $response:ident, $action:literal;)*) => {
        $(
            impl OcppRequest for $request {
                const ACTION: &'static str = $action;
                type Response = $response;
            }
        )*

        /// Every action in the catalog
        pub const ACTIONS: &[&str] = &[$($action),*];

        /// Install every catalog request into `registry`
        pub fn register_catalog<R: CatalogRegistry>(registry: &R) {
            $(registry.register::<$request>();)*
        }
    };
}

catalog! {
    BootNotificationRequest => BootNotificationResponse, "BootNotification";
    HeartbeatRequest => HeartbeatResponse, "Heartbeat";
    StatusNotificationRequest => StatusNotificationResponse, "StatusNotification";
    ResetRequest => ResetResponse, "Reset";
    GetVariablesRequest => GetVariablesResponse, "GetVariables";
    SetVariablesRequest => SetVariablesResponse, "SetVariables";
    CertificateSignedRequest => CertificateSignedResponse, "CertificateSigned";
    SignCertificateRequest => SignCertificateResponse, "SignCertificate";
    RequestStartTransactionRequest => RequestStartTransactionResponse, "RequestStartTransaction";
    RequestStopTransactionRequest => RequestStopTransactionResponse, "RequestStopTransaction";
    MeterValuesRequest => MeterValuesResponse, "MeterValues";
    SetChargingProfileRequest => SetChargingProfileResponse, "SetChargingProfile";
    ReserveNowRequest => ReserveNowResponse, "ReserveNow";
    CancelReservationRequest => CancelReservationResponse, "CancelReservation";
    DataTransferRequest => DataTransferResponse, "DataTransfer";
}
