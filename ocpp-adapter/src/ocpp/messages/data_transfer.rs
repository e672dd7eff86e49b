//! Vendor-specific data transfer

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ocpp::codec::{check_max_len, CodecError, OcppPayload};
use crate::ocpp::types::*;

/// DataTransfer request (either direction)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl DataTransferRequest {
    pub fn new(vendor_id: impl Into<String>) -> Self {
        Self {
            vendor_id: vendor_id.into(),
            message_id: None,
            data: None,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for DataTransferRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("vendorId", &self.vendor_id, 255)?;
        if let Some(message_id) = &self.message_id {
            check_max_len("messageId", message_id, 50)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferResponse {
    pub status: DataTransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl DataTransferResponse {
    pub fn new(status: DataTransferStatus) -> Self {
        Self {
            status,
            data: None,
            status_info: None,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for DataTransferResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::codec::{encode, parse};
    use serde_json::json;

    #[test]
    fn test_data_carries_arbitrary_json() {
        let mut request = DataTransferRequest::new("com.elektrokombinacija");
        request.data = Some(json!({"soc": [41, 42], "mode": "v2g"}));

        let json = encode(&request, None).unwrap();
        assert_eq!(json["data"]["soc"][1], 42);
        assert_eq!(parse::<DataTransferRequest>(&json).unwrap(), request);
    }

    #[test]
    fn test_vendor_id_bound() {
        let vendor = "v".repeat(256);
        assert!(parse::<DataTransferRequest>(&json!({"vendorId": vendor})).is_err());
    }
}
