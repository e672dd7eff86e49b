//! Certificate management

use serde::{Deserialize, Serialize};

use crate::ocpp::codec::{check_max_len, CodecError, OcppPayload};
use crate::ocpp::types::*;

const MAX_CERTIFICATE_CHAIN_LEN: usize = 10_000;
const MAX_CSR_LEN: usize = 5_500;

/// CertificateSigned request (CSMS -> CS): a PEM chain signed from an earlier CSR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSignedRequest {
    pub certificate_chain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_type: Option<CertificateSigningUse>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl CertificateSignedRequest {
    pub fn new(certificate_chain: impl Into<String>) -> Self {
        Self {
            certificate_chain: certificate_chain.into(),
            certificate_type: None,
            ext: Extensions::default(),
        }
    }
}

impl OcppPayload for CertificateSignedRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("certificateChain", &self.certificate_chain, MAX_CERTIFICATE_CHAIN_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSignedResponse {
    pub status: CertificateSignedStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for CertificateSignedResponse {}

/// SignCertificate request (CS -> CSMS): a PEM-encoded CSR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCertificateRequest {
    pub csr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_type: Option<CertificateSigningUse>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SignCertificateRequest {
    fn validate(&self) -> Result<(), CodecError> {
        check_max_len("csr", &self.csr, MAX_CSR_LEN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignCertificateResponse {
    pub status: GenericStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_info: Option<StatusInfo>,
    #[serde(flatten)]
    pub ext: Extensions,
}

impl OcppPayload for SignCertificateResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::codec::parse;
    use serde_json::json;

    #[test]
    fn test_certificate_chain_at_limit_decodes() {
        let chain = "A".repeat(MAX_CERTIFICATE_CHAIN_LEN);
        let request: CertificateSignedRequest =
            parse(&json!({"certificateChain": chain, "certificateType": "V2GCertificate"})).unwrap();
        assert_eq!(request.certificate_chain.len(), 10_000);
        assert_eq!(request.certificate_type, Some(CertificateSigningUse::V2GCertificate));
    }

    #[test]
    fn test_certificate_chain_over_limit_fails() {
        let chain = "A".repeat(MAX_CERTIFICATE_CHAIN_LEN + 1);
        let err = parse::<CertificateSignedRequest>(&json!({"certificateChain": chain})).unwrap_err();
        assert!(matches!(err, CodecError::Constraint { field: "certificateChain", .. }));
    }

    #[test]
    fn test_csr_over_limit_fails() {
        let csr = "B".repeat(MAX_CSR_LEN + 1);
        assert!(parse::<SignCertificateRequest>(&json!({"csr": csr})).is_err());
    }
}
