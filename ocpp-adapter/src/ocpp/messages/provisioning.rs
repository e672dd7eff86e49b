//! Provisioning: boot, heartbeat, status, reset and device-model variables

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ocpp::codec::{check_max_len, CodecError, OcppPayload};
use crate::ocpp::types::*;

/// BootNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charging_station: ChargingStationInfo,
    pub reason: BootReason,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl BootNotificationRequest {
    pub fn new(charging_station: ChargingStationInfo, reason: BootReason) -> Self {
        Self {
            charging_station,
            reason,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for BootNotificationRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("chargingStation.model", &self.charging_station.model, 20)?;
        check_max_len("chargingStation.vendorName", &self.charging_station.vendor_name, 50)
    }
}

/// BootNotification response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    pub interval: i32,
    pub status: RegistrationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for BootNotificationResponse {}

/// Heartbeat request (CS -> CSMS)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for HeartbeatRequest {}

/// Heartbeat response (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl HeartbeatResponse {
    pub fn now() -> Self {
        Self {
            current_time: Utc::now(),
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for HeartbeatResponse {}

/// StatusNotification request (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: DateTime<Utc>,
    pub connector_status: ConnectorStatus,
    pub evse_id: i32,
    pub connector_id: i32,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for StatusNotificationRequest {}

/// StatusNotification response (CSMS -> CS)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for StatusNotificationResponse {}

/// Reset request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub reset_type: ResetType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evse_id: Option<i32>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl ResetRequest {
    pub fn new(reset_type: ResetType) -> Self {
        Self {
            reset_type,
            evse_id: None,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for ResetRequest {}

/// Reset response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetResponse {
    pub status: ResetStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl ResetResponse {
    pub fn new(status: ResetStatus) -> Self {
        Self {
            status,
            status_info: None,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for ResetResponse {}

/// One variable to read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableData {
    pub component: Component,
    pub variable: Variable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
}

/// GetVariables request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesRequest {
    pub get_variable_data: Vec<GetVariableData>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl GetVariablesRequest {
    pub fn new(get_variable_data: Vec<GetVariableData>) -> Self {
        Self {
            get_variable_data,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for GetVariablesRequest {
    fn validate(&self) -> Result<(), CodecError> {
        if self.get_variable_data.is_empty() {
            return Err(CodecError::Constraint {
                field: "getVariableData",
                reason: "must contain at least one entry".to_string(),
            });
        }
        Ok(())
    }
}

/// Result of reading one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariableResult {
    pub attribute_status: GetVariableStatus,
    pub component: Component,
    pub variable: Variable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_value: Option<String>,
}

/// GetVariables response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetVariablesResponse {
    pub get_variable_result: Vec<GetVariableResult>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for GetVariablesResponse {}

/// One variable to write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableData {
    pub attribute_value: String,
    pub component: Component,
    pub variable: Variable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
}

/// SetVariables request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesRequest {
    pub set_variable_data: Vec<SetVariableData>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SetVariablesRequest {
    fn validate(&self) -> Result<(), CodecError> {
        for data in &self.set_variable_data {
            check_max_len("setVariableData.attributeValue", &data.attribute_value, 1000)?;
        }
        Ok(())
    }
}

/// Result of writing one variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariableResult {
    pub attribute_status: SetVariableStatus,
    pub component: Component,
    pub variable: Variable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_type: Option<AttributeType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attribute_status_info: Option<StatusInfo>,
}

/// SetVariables response (CS -> CSMS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetVariablesResponse {
    pub set_variable_result: Vec<SetVariableResult>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SetVariablesResponse {}
