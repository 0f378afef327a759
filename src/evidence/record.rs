//! Content hashing and Ed25519 signing for evidence records.
//!
//! Hashing is SHA-256 over UTF-8 canonical JSON of the hash inputs, stored
//! as lowercase hex. Signing covers the canonical serialization of the
//! record with the `signature` and `signing_key_id` fields removed.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::model::{CompletionRequest, CompletionResponse, EvidenceRecord};

/// The pieces hashed into an evidence record's `request_hash`/`response_hash`.
pub struct HashInputs;

impl HashInputs {
    /// SHA-256 of the canonical JSON of the request, as lowercase hex.
    #[must_use]
    pub fn hash_request(request: &CompletionRequest) -> String {
        let canonical = canonical_json(request);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// SHA-256 of the canonical JSON of the response, as lowercase hex.
    #[must_use]
    pub fn hash_response(response: &CompletionResponse) -> String {
        let canonical = canonical_json(response);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}

/// Serializes to a `serde_json::Value` first so map keys sort
/// lexicographically (the default, non-`preserve_order` `serde_json::Map`),
/// giving a stable byte representation independent of struct field order.
fn canonical_json<T: serde::Serialize>(value: &T) -> String {
    let as_value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
    serde_json::to_string(&as_value).unwrap_or_default()
}

/// Signs and verifies evidence records with a single Ed25519 keypair.
///
/// Key rotation is out of scope; the record captures the key id used so a
/// verifier can look up the matching public key out of band.
pub struct EvidenceSigner {
    key_id: String,
    signing_key: SigningKey,
}

impl EvidenceSigner {
    /// Construct a signer from a 32-byte Ed25519 seed and a key id.
    #[must_use]
    pub fn new(key_id: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// The key id this signer stamps onto records it signs.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// The corresponding public key, for verification.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign `record`, returning a lowercase-hex signature. The record's own
    /// `signature` and `signing_key_id` fields are excluded from the signed
    /// payload.
    #[must_use]
    pub fn sign(&self, record: &EvidenceRecord) -> String {
        let payload = signable_bytes(record);
        let signature = self.signing_key.sign(&payload);
        hex::encode(signature.to_bytes())
    }
}

/// Verify `record.signature` against `verifying_key`.
#[must_use]
pub fn verify(record: &EvidenceRecord, verifying_key: &VerifyingKey) -> bool {
    let Ok(sig_bytes) = hex::decode(&record.signature) else {
        return false;
    };
    let Ok(sig_array): Result<[u8; 64], _> = sig_bytes.try_into() else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_array);
    let payload = signable_bytes(record);
    verifying_key.verify(&payload, &signature).is_ok()
}

fn signable_bytes(record: &EvidenceRecord) -> Vec<u8> {
    let mut value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
    if let Some(obj) = value.as_object_mut() {
        obj.remove("signature");
        obj.remove("signing_key_id");
    }
    serde_json::to_vec(&value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolicyAction;
    use chrono::Utc;

    fn sample_record(signature: String, key_id: String) -> EvidenceRecord {
        EvidenceRecord {
            id: "r1".into(),
            request_timestamp: Utc::now(),
            user_id: "u1".into(),
            api_key_id: "k1".into(),
            model: "gpt-4".into(),
            provider: "openai".into(),
            policy_decision: PolicyAction::Allow,
            block_reason: None,
            policy_version: "v1".into(),
            prompt_tokens: 10,
            completion_tokens: 20,
            total_tokens: 30,
            actual_cost: 0.01,
            request_hash: "abc".into(),
            response_hash: "def".into(),
            signature,
            signing_key_id: key_id,
        }
    }

    #[test]
    fn sign_then_verify_succeeds() {
        let signer = EvidenceSigner::new("key-1", &[7u8; 32]);
        let mut record = sample_record(String::new(), signer.key_id().to_owned());
        record.signature = signer.sign(&record);
        assert!(verify(&record, &signer.verifying_key()));
    }

    #[test]
    fn tampered_record_fails_verification() {
        let signer = EvidenceSigner::new("key-1", &[7u8; 32]);
        let mut record = sample_record(String::new(), signer.key_id().to_owned());
        record.signature = signer.sign(&record);
        record.actual_cost = 999.0;
        assert!(!verify(&record, &signer.verifying_key()));
    }

    #[test]
    fn hash_is_stable_for_identical_inputs() {
        let req = CompletionRequest {
            model: "gpt-4".into(),
            messages: vec![],
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            presence_penalty: None,
            frequency_penalty: None,
            user: None,
            tools: None,
            tool_choice: None,
            stream: false,
            metadata: Default::default(),
        };
        assert_eq!(HashInputs::hash_request(&req), HashInputs::hash_request(&req));
    }
}
