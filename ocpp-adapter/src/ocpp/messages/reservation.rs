//! Reservations

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ocpp::codec::OcppPayload;
use crate::ocpp::types::*;

/// ReserveNow request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowRequest {
    pub id: i32,
    pub expiry_date_time: DateTime<Utc>,
    pub id_token: IdToken,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for ReserveNowRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveNowResponse {
    pub status: ReservationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for ReserveNowResponse {}

/// CancelReservation request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationRequest {
    pub reservation_id: i32,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for CancelReservationRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelReservationResponse {
    pub status: GenericStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for CancelReservationResponse {}
