//! Validation session state machine: `Created -> Sent(n) -> Validated`.
//!
//! Mail delivery is async and lives with the caller, so `requestToken` is
//! split in two: [`begin_token_request`] decides whether a message must go
//! out, and [`record_send_attempt`] commits the attempt once it has.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tessera_types::{
    Medium, ValidationSession, SESSION_VALIDATION_LIFETIME_MS, SESSION_VALIDATION_TIMEOUT_MS,
};
use thiserror::Error;

use crate::{medium_column, StoreError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no session with that id")]
    NotFound,
    #[error("client secret does not match")]
    IncorrectClientSecret,
    #[error("session expired")]
    SessionExpired,
    #[error("incorrect token")]
    IncorrectToken,
    #[error("session not validated")]
    SessionNotValidated,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for SessionError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(StoreError::Database(e))
    }
}

/// Outcome of [`begin_token_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    pub session: ValidationSession,
    /// `false` when this attempt index was already delivered.
    pub should_send: bool,
}

const SESSION_COLUMNS: &str = "s.id, s.medium, s.address, s.client_secret, s.validated, s.mtime,
     t.token, t.send_attempt_number
     FROM threepid_validation_sessions s
     JOIN threepid_token_auths t ON t.validation_session = s.id";

fn session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ValidationSession> {
    Ok(ValidationSession {
        id: row.get(0)?,
        medium: medium_column(row, 1)?,
        address: row.get(2)?,
        client_secret: row.get(3)?,
        validated: row.get::<_, i64>(4)? != 0,
        mtime: row.get(5)?,
        token: row.get(6)?,
        send_attempt_number: row.get(7)?,
    })
}

/// Loads a session by id.
pub fn get_session(conn: &Connection, sid: i64) -> Result<Option<ValidationSession>, StoreError> {
    Ok(conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} WHERE s.id = ?1"),
            [sid],
            session_row,
        )
        .optional()?)
}

/// Returns the session for the triple, creating it (with a fresh token and
/// `send_attempt_number = -1`) if none exists.
///
/// The triple is unique in the schema; run this inside a write transaction
/// so the lookup and the insert see the same state.
fn get_or_create_session(
    conn: &Connection,
    medium: Medium,
    address: &str,
    client_secret: &str,
    now: i64,
) -> Result<ValidationSession, StoreError> {
    let existing = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS}
                 WHERE s.medium = ?1 AND s.address = ?2 AND s.client_secret = ?3"
            ),
            params![medium.as_str(), address, client_secret],
            session_row,
        )
        .optional()?;
    if let Some(session) = existing {
        return Ok(session);
    }

    conn.execute(
        "INSERT INTO threepid_validation_sessions (medium, address, client_secret, validated, mtime)
         VALUES (?1, ?2, ?3, 0, ?4)",
        params![medium.as_str(), address, client_secret, now],
    )?;
    let id = conn.last_insert_rowid();
    let token = medium.generate_token();
    conn.execute(
        "INSERT INTO threepid_token_auths (validation_session, token, send_attempt_number)
         VALUES (?1, ?2, -1)",
        params![id, token],
    )?;

    tracing::debug!(sid = id, medium = %medium, "created validation session");
    Ok(ValidationSession {
        id,
        medium,
        address: address.to_string(),
        client_secret: client_secret.to_string(),
        validated: false,
        mtime: now,
        token,
        send_attempt_number: -1,
    })
}

/// First half of `requestToken`: finds or creates the session, refreshes its
/// `mtime`, and reports whether `send_attempt` still needs delivering.
///
/// Runs in an immediate transaction, so concurrent requests for the same
/// `(medium, address, client_secret)` share one session. Email addresses
/// are normalized first.
pub fn begin_token_request(
    conn: &mut Connection,
    medium: Medium,
    address: &str,
    client_secret: &str,
    send_attempt: i64,
    now: i64,
) -> Result<TokenRequest, StoreError> {
    let address = medium.normalize_address(address);
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut session = get_or_create_session(&tx, medium, &address, client_secret, now)?;
    tx.execute(
        "UPDATE threepid_validation_sessions SET mtime = ?2 WHERE id = ?1",
        params![session.id, now],
    )?;
    tx.commit()?;

    session.mtime = now;
    let should_send = send_attempt > session.send_attempt_number;
    Ok(TokenRequest {
        session,
        should_send,
    })
}

/// Second half of `requestToken`: records a delivered attempt.
pub fn record_send_attempt(conn: &Connection, sid: i64, send_attempt: i64) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE threepid_token_auths SET send_attempt_number = ?2 WHERE validation_session = ?1",
        params![sid, send_attempt],
    )?;
    Ok(())
}

/// `submitToken`: validates the session when `token` matches.
///
/// Checks, in order: the session exists, the client secret matches, the
/// session was touched within [`SESSION_VALIDATION_TIMEOUT_MS`], and the
/// token matches.
pub fn submit_token(
    conn: &Connection,
    sid: i64,
    client_secret: &str,
    token: &str,
    now: i64,
) -> Result<ValidationSession, SessionError> {
    let mut session = get_session(conn, sid)?.ok_or(SessionError::NotFound)?;
    if session.client_secret != client_secret {
        return Err(SessionError::IncorrectClientSecret);
    }
    if session.mtime + SESSION_VALIDATION_TIMEOUT_MS < now {
        return Err(SessionError::SessionExpired);
    }
    if session.token != token {
        return Err(SessionError::IncorrectToken);
    }

    conn.execute(
        "UPDATE threepid_validation_sessions SET validated = 1, mtime = ?2 WHERE id = ?1",
        params![sid, now],
    )?;
    session.validated = true;
    session.mtime = now;
    Ok(session)
}

/// Returns the session only if it is validated and still within
/// [`SESSION_VALIDATION_LIFETIME_MS`].
pub fn get_validated_session(
    conn: &Connection,
    sid: i64,
    client_secret: &str,
    now: i64,
) -> Result<ValidationSession, SessionError> {
    let session = get_session(conn, sid)?.ok_or(SessionError::NotFound)?;
    if session.client_secret != client_secret {
        return Err(SessionError::IncorrectClientSecret);
    }
    if session.mtime + SESSION_VALIDATION_LIFETIME_MS < now {
        return Err(SessionError::SessionExpired);
    }
    if !session.validated {
        return Err(SessionError::SessionNotValidated);
    }
    Ok(session)
}
