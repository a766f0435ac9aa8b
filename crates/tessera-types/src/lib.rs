//! Shared types, error codes, and constants for the Tessera identity service.
//!
//! Every other crate in the workspace builds on the definitions here: the
//! third-party identifier [`Medium`], the [`Association`] record that binds
//! one to a user ID, validation sessions, invite tokens, and replication
//! peers. Keeping them in one leaf crate prevents circular dependencies
//! between the store, the replication protocol, and the server.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use rand::distributions::{Alphanumeric, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Validity span given to a fresh binding: one hundred years, in milliseconds.
pub const ASSOCIATION_LIFETIME_MS: i64 = 100 * 365 * 24 * 60 * 60 * 1000;

/// How long a client has to submit a token after the session was last touched.
pub const SESSION_VALIDATION_TIMEOUT_MS: i64 = 24 * 60 * 60 * 1000;

/// How long a validated session stays usable for a later bind.
pub const SESSION_VALIDATION_LIFETIME_MS: i64 = 24 * 60 * 60 * 1000;

/// Port used for federation traffic when nothing else is known.
pub const DEFAULT_FEDERATION_PORT: u16 = 8448;

/// Port used for peer replication when the peer record has none.
pub const DEFAULT_REPLICATION_PORT: u16 = 1001;

/// Signing algorithm used for every server and ephemeral key.
pub const SIGNING_ALGORITHM: &str = "ed25519";

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random string of ASCII letters and digits.
pub fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Random string of decimal digits.
pub fn random_digits(len: usize) -> String {
    let digits = Uniform::new_inclusive(b'0', b'9');
    rand::thread_rng()
        .sample_iter(digits)
        .take(len)
        .map(char::from)
        .collect()
}

/// The kind of third-party identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Medium {
    /// An email address.
    Email,
    /// A phone number in MSISDN form.
    Msisdn,
}

impl Medium {
    /// Returns the wire name of this medium.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Msisdn => "msisdn",
        }
    }

    /// The spelling of `address` used for storage and comparison.
    ///
    /// Email addresses are trimmed and ASCII-lowercased, matching SQLite's
    /// `lower()`; phone numbers are kept as given.
    pub fn normalize_address(self, address: &str) -> String {
        match self {
            Self::Email => address.trim().to_ascii_lowercase(),
            Self::Msisdn => address.to_string(),
        }
    }

    /// Generates a verification token: 32 alphanumerics for email, six digits
    /// for phone numbers.
    pub fn generate_token(self) -> String {
        match self {
            Self::Email => random_alphanumeric(32),
            Self::Msisdn => random_digits(6),
        }
    }
}

impl fmt::Display for Medium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a known [`Medium`].
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown medium: {0}")]
pub struct UnknownMedium(pub String);

impl FromStr for Medium {
    type Err = UnknownMedium;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "msisdn" => Ok(Self::Msisdn),
            other => Err(UnknownMedium(other.to_string())),
        }
    }
}

/// A binding of a third-party identifier to a user ID.
///
/// The serialized form is the object that gets signed and replicated:
/// `{medium, address, mxid, ts, not_before, not_after, ...extra}`. An absent
/// or empty `mxid` marks the record as an unbind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    /// Local sequence number; doubles as the origin ID during replication.
    #[serde(skip)]
    pub id: i64,
    pub medium: Medium,
    pub address: String,
    #[serde(default)]
    pub mxid: Option<String>,
    /// Creation time in milliseconds.
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub not_before: i64,
    #[serde(default)]
    pub not_after: i64,
    /// Additional signed fields, such as pending `invites`.
    #[serde(flatten)]
    pub extra_fields: Map<String, Value>,
}

impl Association {
    /// Builds a fresh binding valid from `now` for [`ASSOCIATION_LIFETIME_MS`].
    pub fn new_binding(medium: Medium, address: &str, mxid: &str, now: i64) -> Self {
        Self {
            id: 0,
            medium,
            address: address.to_string(),
            mxid: Some(mxid.to_string()),
            ts: now,
            not_before: now,
            not_after: now + ASSOCIATION_LIFETIME_MS,
            extra_fields: Map::new(),
        }
    }

    /// Returns `true` when this record removes a binding rather than adding one.
    pub fn is_removal(&self) -> bool {
        self.mxid.as_deref().map_or(true, str::is_empty)
    }

    /// Returns `true` when `now` falls inside the validity window.
    pub fn is_current(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Serializes the association into the JSON object that gets signed.
    pub fn to_json_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            // A struct with a flattened map always serializes to an object.
            _ => Map::new(),
        }
    }

    /// Decodes an association from a (possibly signed) JSON object.
    pub fn from_json_map(map: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(map.clone()))
    }
}

/// A proof-of-ownership session for a third-party identifier, joined with
/// its token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationSession {
    pub id: i64,
    pub medium: Medium,
    pub address: String,
    pub client_secret: String,
    pub validated: bool,
    /// Last time the session was touched, in milliseconds.
    pub mtime: i64,
    pub token: String,
    /// Highest send attempt already delivered; `-1` before the first send.
    pub send_attempt_number: i64,
}

/// An invite waiting for its recipient to bind the invited identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteToken {
    #[serde(skip)]
    pub id: i64,
    pub medium: Medium,
    pub address: String,
    pub room_id: String,
    pub sender: String,
    pub token: String,
    #[serde(skip)]
    pub received_at: i64,
    #[serde(skip)]
    pub sent_at: Option<i64>,
}

impl InviteToken {
    /// JSON object describing this invite, as attached to a binding.
    pub fn to_json_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// A one-time public key minted for an invite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralPublicKey {
    pub id: i64,
    pub public_key: String,
    pub verify_count: i64,
    pub persistence_ts: i64,
}

/// A remote identity server we replicate associations with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Peer {
    pub name: String,
    /// Replication port; [`DEFAULT_REPLICATION_PORT`] when unset.
    pub port: Option<u16>,
    /// Highest local origin ID the peer has acknowledged.
    pub last_sent_version: Option<i64>,
    pub last_poke_succeeded_at: Option<i64>,
    pub active: bool,
    /// Map of algorithm to unpadded-base64 public key.
    pub public_keys: BTreeMap<String, String>,
}

/// Error codes returned in `{errcode, error}` response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrCode {
    #[serde(rename = "M_UNRECOGNIZED")]
    Unrecognized,
    #[serde(rename = "M_UNAUTHORIZED")]
    Unauthorized,
    #[serde(rename = "M_FORBIDDEN")]
    Forbidden,
    #[serde(rename = "M_BAD_JSON")]
    BadJson,
    #[serde(rename = "M_NOT_JSON")]
    NotJson,
    #[serde(rename = "M_UNKNOWN")]
    Unknown,
    #[serde(rename = "M_NOT_FOUND")]
    NotFound,
    #[serde(rename = "M_MISSING_PARAM")]
    MissingParam,
    #[serde(rename = "M_INVALID_PARAM")]
    InvalidParam,
    #[serde(rename = "M_THREEPID_IN_USE")]
    ThreepidInUse,
    #[serde(rename = "M_NO_VALID_SESSION")]
    NoValidSession,
    #[serde(rename = "M_SESSION_EXPIRED")]
    SessionExpired,
    #[serde(rename = "M_SESSION_NOT_VALIDATED")]
    SessionNotValidated,
    #[serde(rename = "M_UNKNOWN_PEER")]
    UnknownPeer,
    #[serde(rename = "M_VERIFICATION_FAILED")]
    VerificationFailed,
    #[serde(rename = "M_INVALID_EMAIL")]
    InvalidEmail,
    #[serde(rename = "M_EMAIL_SEND_ERROR")]
    EmailSendError,
    #[serde(rename = "M_INCORRECT_CLIENT_SECRET")]
    IncorrectClientSecret,
}

impl ErrCode {
    /// Returns the `M_*` string for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unrecognized => "M_UNRECOGNIZED",
            Self::Unauthorized => "M_UNAUTHORIZED",
            Self::Forbidden => "M_FORBIDDEN",
            Self::BadJson => "M_BAD_JSON",
            Self::NotJson => "M_NOT_JSON",
            Self::Unknown => "M_UNKNOWN",
            Self::NotFound => "M_NOT_FOUND",
            Self::MissingParam => "M_MISSING_PARAM",
            Self::InvalidParam => "M_INVALID_PARAM",
            Self::ThreepidInUse => "M_THREEPID_IN_USE",
            Self::NoValidSession => "M_NO_VALID_SESSION",
            Self::SessionExpired => "M_SESSION_EXPIRED",
            Self::SessionNotValidated => "M_SESSION_NOT_VALIDATED",
            Self::UnknownPeer => "M_UNKNOWN_PEER",
            Self::VerificationFailed => "M_VERIFICATION_FAILED",
            Self::InvalidEmail => "M_INVALID_EMAIL",
            Self::EmailSendError => "M_EMAIL_SEND_ERROR",
            Self::IncorrectClientSecret => "M_INCORRECT_CLIENT_SECRET",
        }
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
