//! Message signing and verification
//!
//! A policy signs and checks the `signatures` block of request and response
//! payloads. Signatures cover the canonical payload bytes (the payload
//! object without `signatures`, keys sorted) so they are independent of the
//! typed decode.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ocpp::codec::canonical_bytes;
use crate::ocpp::types::Signature;

const SIGNING_METHOD: &str = "Ed25519";
const ENCODING_METHOD: &str = "base64";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Message is not signed")]
    Missing,

    #[error("Unknown signing key: {0}")]
    UnknownKey(String),

    #[error("Signature verification failed for key {0}")]
    Invalid(String),

    #[error("Malformed signature block: {0}")]
    Malformed(String),
}

/// Signs outbound payloads and verifies inbound ones
pub trait SignaturePolicy: Send + Sync {
    fn sign_request(&self, action: &str, payload: &mut Value) -> Result<(), SignatureError>;
    fn verify_request(&self, action: &str, payload: &Value) -> Result<(), SignatureError>;
    fn sign_response(&self, action: &str, payload: &mut Value) -> Result<(), SignatureError>;
    fn verify_response(&self, action: &str, payload: &Value) -> Result<(), SignatureError>;
}

/// Unsigned deployments: nothing is signed, nothing is checked
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSignatures;

impl SignaturePolicy for NoSignatures {
    fn sign_request(&self, _action: &str, _payload: &mut Value) -> Result<(), SignatureError> {
        Ok(())
    }

    fn verify_request(&self, _action: &str, _payload: &Value) -> Result<(), SignatureError> {
        Ok(())
    }

    fn sign_response(&self, _action: &str, _payload: &mut Value) -> Result<(), SignatureError> {
        Ok(())
    }

    fn verify_response(&self, _action: &str, _payload: &Value) -> Result<(), SignatureError> {
        Ok(())
    }
}

/// How inbound signature blocks are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerificationMode {
    /// Accept anything
    Ignore,
    /// Check signatures that are present, accept unsigned payloads
    #[default]
    VerifyIfPresent,
    /// Reject unsigned payloads
    Require,
}

/// Fresh random signing key
pub fn generate_key() -> SigningKey {
    SigningKey::generate(&mut rand::rngs::OsRng)
}

/// Signing key from a 64-character hex seed
pub fn key_from_hex(seed: &str) -> Result<SigningKey, SignatureError> {
    let bytes = hex::decode(seed.trim()).map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| SignatureError::Malformed("seed must be 32 bytes".to_string()))?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Key id for a public key: first 16 hex chars of its SHA-256
pub fn key_id(key: &VerifyingKey) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(16);
    id
}

/// Ed25519 policy with an optional signing key and a set of trusted keys
pub struct KeyedSignaturePolicy {
    signer: Option<(String, SigningKey)>,
    trusted: HashMap<String, VerifyingKey>,
    mode: VerificationMode,
    sign_requests: bool,
    sign_responses: bool,
}

impl KeyedSignaturePolicy {
    /// Verify-only policy
    pub fn verifier(mode: VerificationMode) -> Self {
        Self {
            signer: None,
            trusted: HashMap::new(),
            mode,
            sign_requests: false,
            sign_responses: false,
        }
    }

    /// Sign requests and responses with `key`; the key's own public half is trusted
    pub fn signing(key: SigningKey, mode: VerificationMode) -> Self {
        let verifying = key.verifying_key();
        let id = key_id(&verifying);
        let mut policy = Self::verifier(mode).trust(verifying);
        policy.signer = Some((id, key));
        policy.sign_requests = true;
        policy.sign_responses = true;
        policy
    }

    /// Accept signatures made by `key`
    pub fn trust(mut self, key: VerifyingKey) -> Self {
        self.trusted.insert(key_id(&key), key);
        self
    }

    /// Choose which directions get signed
    pub fn sign(mut self, requests: bool, responses: bool) -> Self {
        self.sign_requests = requests;
        self.sign_responses = responses;
        self
    }

    /// Id of the signing key, if any
    pub fn key_id(&self) -> Option<&str> {
        self.signer.as_ref().map(|(id, _)| id.as_str())
    }

    fn append_signature(&self, payload: &mut Value) -> Result<(), SignatureError> {
        let (id, key) = match &self.signer {
            Some(signer) => signer,
            None => return Err(SignatureError::Signing("no signing key configured".to_string())),
        };

        let bytes = canonical_bytes(payload).map_err(|e| SignatureError::Signing(e.to_string()))?;
        let signature: Ed25519Signature = key.sign(&bytes);

        let entry = Signature {
            key_id: id.clone(),
            value: BASE64.encode(signature.to_bytes()),
            signing_method: Some(SIGNING_METHOD.to_string()),
            encoding_method: Some(ENCODING_METHOD.to_string()),
            custom_data: None,
        };
        let entry = serde_json::to_value(entry).map_err(|e| SignatureError::Signing(e.to_string()))?;

        let object = payload
            .as_object_mut()
            .ok_or_else(|| SignatureError::Signing("payload is not an object".to_string()))?;
        match object
            .entry("signatures")
            .or_insert_with(|| Value::Array(Vec::new()))
        {
            Value::Array(signatures) => signatures.push(entry),
            _ => return Err(SignatureError::Malformed("signatures is not an array".to_string())),
        }
        Ok(())
    }

    fn check(&self, payload: &Value) -> Result<(), SignatureError> {
        if self.mode == VerificationMode::Ignore {
            return Ok(());
        }

        let signatures: Vec<Signature> = match payload.get("signatures") {
            None => Vec::new(),
            Some(block) => serde_json::from_value(block.clone())
                .map_err(|e| SignatureError::Malformed(e.to_string()))?,
        };

        if signatures.is_empty() {
            return match self.mode {
                VerificationMode::Require => Err(SignatureError::Missing),
                _ => Ok(()),
            };
        }

        let bytes = canonical_bytes(payload).map_err(|e| SignatureError::Malformed(e.to_string()))?;

        for entry in &signatures {
            let key = self
                .trusted
                .get(&entry.key_id)
                .ok_or_else(|| SignatureError::UnknownKey(entry.key_id.clone()))?;

            let raw = BASE64
                .decode(entry.value.trim())
                .map_err(|e| SignatureError::Malformed(e.to_string()))?;
            let raw: [u8; 64] = raw
                .as_slice()
                .try_into()
                .map_err(|_| SignatureError::Malformed(format!("signature length {}", raw.len())))?;

            key.verify(&bytes, &Ed25519Signature::from_bytes(&raw))
                .map_err(|_| SignatureError::Invalid(entry.key_id.clone()))?;
        }
        Ok(())
    }
}

impl SignaturePolicy for KeyedSignaturePolicy {
    fn sign_request(&self, _action: &str, payload: &mut Value) -> Result<(), SignatureError> {
        if self.sign_requests {
            self.append_signature(payload)?;
        }
        Ok(())
    }

    fn verify_request(&self, _action: &str, payload: &Value) -> Result<(), SignatureError> {
        self.check(payload)
    }

    fn sign_response(&self, _action: &str, payload: &mut Value) -> Result<(), SignatureError> {
        if self.sign_responses {
            self.append_signature(payload)?;
        }
        Ok(())
    }

    fn verify_response(&self, _action: &str, payload: &Value) -> Result<(), SignatureError> {
        self.check(payload)
    }
}
