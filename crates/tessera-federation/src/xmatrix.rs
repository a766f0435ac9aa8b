//! `Authorization: X-Matrix origin=...,key=...,sig=...` request signing.

use serde_json::{json, Map, Value};
use tessera_signing::{SignedJson, SigningError};
use thiserror::Error;

use crate::keys::ServerKeys;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XMatrixError {
    #[error("missing Authorization header")]
    MissingHeader,
    #[error("authorization scheme is not X-Matrix")]
    WrongScheme,
    #[error("X-Matrix header missing {}", .0.join(","))]
    MissingFields(Vec<&'static str>),
    #[error("no key {key} published by {origin}")]
    UnknownKey { origin: String, key: String },
    #[error("request signature invalid: {0}")]
    BadSignature(String),
}

/// The parsed fields of an X-Matrix header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMatrixAuth {
    pub origin: String,
    pub key: String,
    pub sig: String,
}

impl XMatrixAuth {
    /// Parses an `Authorization` header value. Values may be quoted.
    pub fn parse(header: Option<&str>) -> Result<Self, XMatrixError> {
        let header = header.ok_or(XMatrixError::MissingHeader)?;
        let params = header
            .strip_prefix("X-Matrix")
            .ok_or(XMatrixError::WrongScheme)?;

        let (mut origin, mut key, mut sig) = (String::new(), String::new(), String::new());
        for pair in params.trim().split(',') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match name.trim() {
                "origin" => origin = value,
                "key" => key = value,
                "sig" => sig = value,
                _ => {}
            }
        }

        let missing: Vec<&'static str> = [("origin", &origin), ("key", &key), ("sig", &sig)]
            .into_iter()
            .filter(|(_, v)| v.is_empty())
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            return Err(XMatrixError::MissingFields(missing));
        }
        Ok(Self { origin, key, sig })
    }

    /// The object the origin signed for this request.
    pub fn signed_request(
        &self,
        method: &str,
        uri: &str,
        destination: &str,
        content: Value,
    ) -> SignedJson {
        let mut by_key = Map::new();
        by_key.insert(self.key.clone(), Value::String(self.sig.clone()));
        let mut signatures = Map::new();
        signatures.insert(self.origin.clone(), Value::Object(by_key));

        match json!({
            "method": method,
            "uri": uri,
            "destination_is": destination,
            "content": content,
            "signatures": signatures,
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Checks the request signature against the origin's published keys.
    pub fn verify(&self, keys: &ServerKeys, request: &SignedJson) -> Result<(), XMatrixError> {
        let verify_key = keys
            .verify_key(&self.key)
            .ok_or_else(|| XMatrixError::UnknownKey {
                origin: self.origin.clone(),
                key: self.key.clone(),
            })?;
        verify_key
            .verify(request, &self.origin)
            .map_err(|e: SigningError| XMatrixError::BadSignature(e.to_string()))
    }
}

/// Produces an X-Matrix header for an outgoing request.
pub fn authorization_header(
    key: &tessera_signing::ServerKey,
    origin: &str,
    method: &str,
    uri: &str,
    destination: &str,
    content: Value,
) -> Result<String, SigningError> {
    let mut request = match json!({
        "method": method,
        "uri": uri,
        "destination_is": destination,
        "content": content,
    }) {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    key.sign(&mut request, origin)?;
    let sig = request
        .get("signatures")
        .and_then(|s| s.get(origin))
        .and_then(|s| s.get(key.key_id()))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(format!(
        "X-Matrix origin={origin},key=\"{}\",sig=\"{sig}\"",
        key.key_id()
    ))
}
