//! Signed JSON for the Tessera identity service.
//!
//! A signed object is any JSON map carrying a `signatures` field of the form
//! `{server_name: {"ed25519:<version>": "<unpadded base64>"}}`. The signature
//! covers the canonical encoding of the object with `signatures` and
//! `unsigned` removed: keys sorted bytewise, no insignificant whitespace.
//! Associations, invite attestations, and X-Matrix request envelopes are
//! all signed this way.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde_json::{Map, Value};
use tessera_types::SIGNING_ALGORITHM;
use thiserror::Error;

/// A JSON object that can carry signatures.
pub type SignedJson = Map<String, Value>;

/// Errors from signing and verification.
#[derive(Debug, Error)]
pub enum SigningError {
    /// The message had no usable `signatures` map, or a signature did not
    /// verify.
    #[error("signature verification failed: {0}")]
    VerificationFailed(String),
    /// No signature from the server under a key ID we know.
    #[error("no matching signature from {server}")]
    NoMatchingSignature { server: String },
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decodes base64 with or without padding.
pub fn decode_base64(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD_NO_PAD.decode(input.trim_end_matches('='))
}

/// Encodes bytes as unpadded standard base64.
pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Canonical encoding of a JSON value: object keys sorted, compact output.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, SigningError> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// Bytes covered by a signature on `message`.
fn signable_bytes(message: &SignedJson) -> Result<Vec<u8>, SigningError> {
    let mut stripped = message.clone();
    stripped.remove("signatures");
    stripped.remove("unsigned");
    canonical_json(&Value::Object(stripped))
}

/// Builds a key ID such as `ed25519:0`.
pub fn key_id(version: &str) -> String {
    format!("{SIGNING_ALGORITHM}:{version}")
}

/// This server's long-term signing identity.
#[derive(Clone)]
pub struct ServerKey {
    signing_key: SigningKey,
    version: String,
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("key_id", &self.key_id())
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl ServerKey {
    /// Wraps an existing ed25519 key.
    pub fn new(signing_key: SigningKey, version: impl Into<String>) -> Self {
        Self {
            signing_key,
            version: version.into(),
        }
    }

    /// Generates a fresh random key.
    pub fn generate(version: impl Into<String>) -> Self {
        Self::new(SigningKey::generate(&mut OsRng), version)
    }

    /// Loads a key from the base64 encoding of its 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] if the input is not base64 or not
    /// exactly 32 bytes.
    pub fn from_seed_base64(seed: &str, version: impl Into<String>) -> Result<Self, SigningError> {
        let bytes = decode_base64(seed).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("seed must be 32 bytes".to_string()))?;
        Ok(Self::new(SigningKey::from_bytes(&seed), version))
    }

    /// Base64 of the private seed, suitable for the config file.
    pub fn seed_base64(&self) -> String {
        encode_base64(self.signing_key.as_bytes())
    }

    /// Algorithm plus version, e.g. `ed25519:0`.
    pub fn key_id(&self) -> String {
        key_id(&self.version)
    }

    pub fn public_key_base64(&self) -> String {
        encode_base64(self.signing_key.verifying_key().as_bytes())
    }

    /// The matching public half.
    pub fn verify_key(&self) -> VerifyKey {
        VerifyKey {
            key: self.signing_key.verifying_key(),
            key_id: self.key_id(),
        }
    }

    /// Signs `message` in place under `server_name`.
    ///
    /// Existing signatures, including ones from other servers, are kept.
    pub fn sign(&self, message: &mut SignedJson, server_name: &str) -> Result<(), SigningError> {
        let bytes = signable_bytes(message)?;
        let signature = encode_base64(&self.signing_key.sign(&bytes).to_bytes());

        let signatures = message
            .entry("signatures")
            .or_insert_with(|| Value::Object(Map::new()));
        if !signatures.is_object() {
            *signatures = Value::Object(Map::new());
        }
        if let Value::Object(by_server) = signatures {
            let entry = by_server
                .entry(server_name.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(by_key) = entry {
                by_key.insert(self.key_id(), Value::String(signature));
            }
        }
        Ok(())
    }

    /// Returns `true` when `message` already carries a signature from
    /// `server_name`.
    pub fn is_signed_by(message: &SignedJson, server_name: &str) -> bool {
        message
            .get("signatures")
            .and_then(Value::as_object)
            .is_some_and(|sigs| sigs.contains_key(server_name))
    }
}

/// A public key able to check signatures made under one key ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey {
    key: VerifyingKey,
    key_id: String,
}

impl VerifyKey {
    /// Decodes a base64 ed25519 public key.
    ///
    /// # Errors
    ///
    /// Returns [`SigningError::InvalidKey`] for bad base64, a wrong length, or
    /// a point that is not a valid public key.
    pub fn from_base64(key_id: impl Into<String>, public_key: &str) -> Result<Self, SigningError> {
        let bytes =
            decode_base64(public_key).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SigningError::InvalidKey("public key must be 32 bytes".to_string()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SigningError::InvalidKey(e.to_string()))?;
        Ok(Self {
            key,
            key_id: key_id.into(),
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn public_key_base64(&self) -> String {
        encode_base64(self.key.as_bytes())
    }

    /// Checks the signature `server_name` made on `message` with this key.
    ///
    /// # Errors
    ///
    /// - [`SigningError::VerificationFailed`] when `signatures` is missing or
    ///   malformed, or the signature does not match.
    /// - [`SigningError::NoMatchingSignature`] when the server has not signed
    ///   under this key ID.
    pub fn verify(&self, message: &SignedJson, server_name: &str) -> Result<(), SigningError> {
        let signatures = message
            .get("signatures")
            .and_then(Value::as_object)
            .ok_or_else(|| SigningError::VerificationFailed("no signatures".to_string()))?;

        let encoded = signatures
            .get(server_name)
            .and_then(Value::as_object)
            .and_then(|by_key| by_key.get(&self.key_id))
            .and_then(Value::as_str)
            .ok_or_else(|| SigningError::NoMatchingSignature {
                server: server_name.to_string(),
            })?;

        let raw = decode_base64(encoded)
            .map_err(|e| SigningError::VerificationFailed(format!("signature encoding: {e}")))?;
        let raw: [u8; 64] = raw
            .try_into()
            .map_err(|_| SigningError::VerificationFailed("signature length".to_string()))?;
        let signature = Signature::from_bytes(&raw);

        self.key
            .verify(&signable_bytes(message)?, &signature)
            .map_err(|e| SigningError::VerificationFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> SignedJson {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": true, "x": null}], "c": "é"}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":{"c":"é","z":[3,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn sign_then_verify() {
        let key = ServerKey::generate("0");
        let mut msg = object(json!({"mxid": "@a:hs", "token": "t"}));
        key.sign(&mut msg, "id.example").unwrap();

        assert!(ServerKey::is_signed_by(&msg, "id.example"));
        key.verify_key().verify(&msg, "id.example").unwrap();
    }

    #[test]
    fn signing_ignores_unsigned_and_keeps_other_signatures() {
        let ours = ServerKey::generate("0");
        let theirs = ServerKey::generate("1");
        let mut msg = object(json!({"a": 1}));
        theirs.sign(&mut msg, "other").unwrap();
        ours.sign(&mut msg, "us").unwrap();
        msg.insert("unsigned".to_string(), json!({"age": 5}));

        ours.verify_key().verify(&msg, "us").unwrap();
        theirs.verify_key().verify(&msg, "other").unwrap();
    }

    #[test]
    fn tampered_message_fails() {
        let key = ServerKey::generate("0");
        let mut msg = object(json!({"mxid": "@a:hs"}));
        key.sign(&mut msg, "hs").unwrap();
        msg.insert("mxid".to_string(), json!("@evil:hs"));

        assert!(matches!(
            key.verify_key().verify(&msg, "hs"),
            Err(SigningError::VerificationFailed(_))
        ));
    }

    #[test]
    fn missing_signatures_and_unknown_server() {
        let key = ServerKey::generate("0");
        let bare = object(json!({"a": 1}));
        assert!(matches!(
            key.verify_key().verify(&bare, "hs"),
            Err(SigningError::VerificationFailed(_))
        ));

        let mut signed = bare.clone();
        key.sign(&mut signed, "hs").unwrap();
        assert!(matches!(
            key.verify_key().verify(&signed, "elsewhere"),
            Err(SigningError::NoMatchingSignature { .. })
        ));
    }

    #[test]
    fn seed_round_trip_preserves_identity() {
        let key = ServerKey::generate("3");
        let restored = ServerKey::from_seed_base64(&key.seed_base64(), "3").unwrap();
        assert_eq!(restored.public_key_base64(), key.public_key_base64());
        assert_eq!(restored.key_id(), "ed25519:3");

        let vk = VerifyKey::from_base64("ed25519:3", &key.public_key_base64()).unwrap();
        assert_eq!(vk, key.verify_key());
        assert!(ServerKey::from_seed_base64("c2hvcnQ", "0").is_err());
    }
}
