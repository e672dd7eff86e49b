//! Smart charging

use serde::{Deserialize, Serialize};

use crate::ocpp::codec::{CodecError, OcppPayload};
use crate::ocpp::types::*;

/// SetChargingProfile request (CSMS -> CS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileRequest {
    pub evse_id: i32,
    pub charging_profile: ChargingProfile,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SetChargingProfileRequest {
    fn validate(&self) -> Result<(), CodecError> {
        let schedules = self.charging_profile.charging_schedule.len();
        if !(1..=3).contains(&schedules) {
            return Err(CodecError::Constraint {
                field: "chargingProfile.chargingSchedule",
                reason: format!("must contain 1 to 3 schedules (got {})", schedules),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetChargingProfileResponse {
    pub status: ChargingProfileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SetChargingProfileResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::codec::parse;
    use serde_json::json;

    fn profile(schedules: serde_json::Value) -> serde_json::Value {
        json!({
            "evseId": 1,
            "chargingProfile": {
                "id": 1,
                "stackLevel": 0,
                "chargingProfilePurpose": "TxDefaultProfile",
                "chargingProfileKind": "Absolute",
                "chargingSchedule": schedules
            }
        })
    }

    #[test]
    fn test_set_charging_profile_parse() {
        let request: SetChargingProfileRequest = parse(&profile(json!([{
            "id": 1,
            "chargingRateUnit": "W",
            "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 11000.0}]
        }])))
        .unwrap();

        let schedule = &request.charging_profile.charging_schedule[0];
        assert_eq!(schedule.charging_rate_unit, ChargingRateUnit::W);
        assert_eq!(schedule.charging_schedule_period[0].limit, 11000.0);
    }

    #[test]
    fn test_set_charging_profile_requires_schedule() {
        assert!(parse::<SetChargingProfileRequest>(&profile(json!([]))).is_err());
    }
}
