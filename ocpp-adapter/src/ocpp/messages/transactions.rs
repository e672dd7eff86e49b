//! Remote transaction control and metering

use serde::{Deserialize, Serialize};

use crate::ocpp::codec::{check_max_len, CodecError, OcppPayload};
use crate::ocpp::types::*;

/// RequestStartTransaction request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartTransactionRequest {
    pub id_token: IdToken,
    pub remote_start_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charging_profile: Option<ChargingProfile>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for RequestStartTransactionRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("idToken.idToken", &self.id_token.id_token, 36)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStartTransactionResponse {
    pub status: RequestStartStopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for RequestStartTransactionResponse {}

/// RequestStopTransaction request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStopTransactionRequest {
    pub transaction_id: String,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for RequestStopTransactionRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("transactionId", &self.transaction_id, 36)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStopTransactionResponse {
    pub status: RequestStartStopStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for RequestStopTransactionResponse {}

/// MeterValues request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub evse_id: i32,
    pub meter_value: Vec<MeterValue>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for MeterValuesRequest {
    fn validate(&self) -> Result<(), CodecError> {
        if self.meter_value.is_empty() {
            return Err(CodecError::Constraint {
                field: "meterValue",
                reason: "must contain at least one entry".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeterValuesResponse {
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for MeterValuesResponse {}
