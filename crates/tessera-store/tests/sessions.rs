use std::collections::BTreeMap;

use rusqlite::Connection;
use tessera_store::invites::{
    ephemeral_key_is_valid, mark_invites_sent, pending_invites, sender_for_token,
    store_ephemeral_key, store_invite,
};
use tessera_store::peers::{active_peers, get_peer_by_name, set_last_sent_version, upsert_peer};
use tessera_store::sessions::{
    begin_token_request, get_validated_session, record_send_attempt, submit_token,
};
use tessera_store::SessionError;
use tessera_types::{InviteToken, Medium, SESSION_VALIDATION_TIMEOUT_MS};

fn db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    tessera_db::run_migrations(&conn).unwrap();
    conn
}

#[test]
fn token_request_is_idempotent_per_send_attempt() {
    let mut conn = db();
    let first = begin_token_request(&mut conn, Medium::Email, "a@x.org", "secret", 1, 100).unwrap();
    assert!(first.should_send);
    assert_eq!(first.session.send_attempt_number, -1);
    assert_eq!(first.session.token.len(), 32);
    record_send_attempt(&conn, first.session.id, 1).unwrap();

    let repeat = begin_token_request(&mut conn, Medium::Email, "a@x.org", "secret", 1, 200).unwrap();
    assert!(!repeat.should_send);
    assert_eq!(repeat.session.id, first.session.id);
    assert_eq!(repeat.session.token, first.session.token);
    assert_eq!(repeat.session.mtime, 200);

    let next = begin_token_request(&mut conn, Medium::Email, "a@x.org", "secret", 2, 300).unwrap();
    assert!(next.should_send);

    let other = begin_token_request(&mut conn, Medium::Email, "a@x.org", "other", 1, 300).unwrap();
    assert_ne!(other.session.id, first.session.id);
}

#[test]
fn racing_token_requests_share_one_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sessions.db");
    let pool = tessera_db::create_pool(
        path.to_str().unwrap(),
        tessera_db::DbRuntimeSettings::default(),
    )
    .unwrap();
    tessera_db::run_migrations(&pool.get().unwrap()).unwrap();

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || {
                let mut conn = pool.get().unwrap();
                begin_token_request(&mut conn, Medium::Email, "A@x.org", "secret", 1, 100)
                    .unwrap()
                    .session
                    .id
            })
        })
        .collect();
    let sids: Vec<i64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(sids.iter().all(|sid| *sid == sids[0]), "{sids:?}");

    let sessions: i64 = pool
        .get()
        .unwrap()
        .query_row("SELECT COUNT(*) FROM threepid_validation_sessions", [], |r| r.get(0))
        .unwrap();
    assert_eq!(sessions, 1);
}

#[test]
fn msisdn_tokens_are_numeric() {
    let mut conn = db();
    let req = begin_token_request(&mut conn, Medium::Msisdn, "447700900000", "s", 1, 0).unwrap();
    assert_eq!(req.session.token.len(), 6);
    assert!(req.session.token.chars().all(|c| c.is_ascii_digit()));
}

#[test]
fn submit_token_checks_secret_expiry_and_token() {
    let mut conn = db();
    let session = begin_token_request(&mut conn, Medium::Email, "a@x.org", "secret", 1, 1_000)
        .unwrap()
        .session;

    assert!(matches!(
        submit_token(&conn, session.id + 100, "secret", &session.token, 1_000),
        Err(SessionError::NotFound)
    ));
    assert!(matches!(
        submit_token(&conn, session.id, "wrong", &session.token, 1_000),
        Err(SessionError::IncorrectClientSecret)
    ));
    assert!(matches!(
        submit_token(&conn, session.id, "secret", "nope", 1_000),
        Err(SessionError::IncorrectToken)
    ));
    assert!(matches!(
        get_validated_session(&conn, session.id, "secret", 1_000),
        Err(SessionError::SessionNotValidated)
    ));
    assert!(matches!(
        submit_token(
            &conn,
            session.id,
            "secret",
            &session.token,
            1_001 + SESSION_VALIDATION_TIMEOUT_MS
        ),
        Err(SessionError::SessionExpired)
    ));

    let validated = submit_token(&conn, session.id, "secret", &session.token, 2_000).unwrap();
    assert!(validated.validated);
    let fetched = get_validated_session(&conn, session.id, "secret", 3_000).unwrap();
    assert_eq!(fetched.address, "a@x.org");
    assert!(matches!(
        get_validated_session(&conn, session.id, "secret", 2_001 + SESSION_VALIDATION_TIMEOUT_MS),
        Err(SessionError::SessionExpired)
    ));
}

#[test]
fn invites_are_pending_until_marked_sent() {
    let conn = db();
    let invite = InviteToken {
        id: 0,
        medium: Medium::Email,
        address: "a@x.org".into(),
        room_id: "!room:hs".into(),
        sender: "@inviter:hs".into(),
        token: "tok".into(),
        received_at: 5,
        sent_at: None,
    };
    store_invite(&conn, &invite).unwrap();

    let pending = pending_invites(&conn, Medium::Email, "a@x.org").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].room_id, "!room:hs");
    assert_eq!(sender_for_token(&conn, "tok").unwrap().as_deref(), Some("@inviter:hs"));
    assert_eq!(sender_for_token(&conn, "missing").unwrap(), None);

    assert_eq!(mark_invites_sent(&conn, Medium::Email, "a@x.org", 9).unwrap(), 1);
    assert!(pending_invites(&conn, Medium::Email, "a@x.org").unwrap().is_empty());

    store_ephemeral_key(&conn, "ephemeral", 5).unwrap();
    assert!(ephemeral_key_is_valid(&conn, "ephemeral").unwrap());
    assert!(!ephemeral_key_is_valid(&conn, "unknown").unwrap());
}

#[test]
fn peers_keep_cursor_across_reregistration() {
    let mut conn = db();
    let keys = BTreeMap::from([("ed25519".to_string(), "AAAA".to_string())]);
    upsert_peer(&mut conn, "peer.example", Some(1001), &keys).unwrap();
    set_last_sent_version(&conn, "peer.example", 42, 7).unwrap();

    let rotated = BTreeMap::from([("ed25519".to_string(), "BBBB".to_string())]);
    upsert_peer(&mut conn, "peer.example", None, &rotated).unwrap();
    upsert_peer(&mut conn, "another.example", Some(9), &BTreeMap::new()).unwrap();

    let peer = get_peer_by_name(&conn, "peer.example").unwrap().unwrap();
    assert_eq!(peer.port, None);
    assert_eq!(peer.last_sent_version, Some(42));
    assert_eq!(peer.last_poke_succeeded_at, Some(7));
    assert_eq!(peer.public_keys.get("ed25519").map(String::as_str), Some("BBBB"));

    let names: Vec<String> = active_peers(&conn).unwrap().into_iter().map(|p| p.name).collect();
    assert_eq!(names, vec!["another.example", "peer.example"]);
    assert!(get_peer_by_name(&conn, "nobody.example").unwrap().is_none());
}
