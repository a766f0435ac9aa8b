mod common;

use std::collections::BTreeMap;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{Harness, SERVER_NAME};
use serde_json::json;
use tessera_replication::{sign_association, ReplicatedAssociation, ReplicationPayload};
use tessera_signing::ServerKey;
use tessera_store::peers;
use tessera_types::{Association, Medium};

const PUSH: &str = "/_matrix/identity/replicate/v1/push";
const PEER: &str = "peer.example";

fn harness_with_peer(peer_key: &ServerKey) -> Harness {
    let h = Harness::new();
    let keys = BTreeMap::from([("ed25519".to_string(), peer_key.public_key_base64())]);
    peers::upsert_peer(&mut h.conn(), PEER, Some(1443), &keys).unwrap();
    h
}

fn payload(key: &ServerKey, entries: &[(i64, &str, &str)]) -> ReplicationPayload {
    ReplicationPayload {
        sg_assocs: entries
            .iter()
            .map(|(origin_id, address, mxid)| {
                let assoc = Association::new_binding(Medium::Email, address, mxid, 1_000);
                ReplicatedAssociation {
                    origin_id: *origin_id,
                    signed_association: sign_association(key, PEER, &assoc).unwrap(),
                }
            })
            .collect(),
    }
}

fn push_request(peer: Option<&str>, content_type: &str, body: String) -> Request<Body> {
    let mut builder = Request::post(PUSH).header("content-type", content_type);
    if let Some(name) = peer {
        builder = builder.header("X-Client-Cert-CN", name);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn verified_batch_is_stored_and_resigned_on_lookup() {
    let peer_key = ServerKey::generate("1");
    let h = harness_with_peer(&peer_key);
    let batch = payload(
        &peer_key,
        &[(1, "carol@example.org", "@carol:hs"), (2, "dave@example.org", "@dave:hs")],
    );

    let (status, body) = h
        .send(push_request(
            Some(PEER),
            "application/json",
            serde_json::to_string(&batch).unwrap(),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body, json!({"success": true}));

    let (status, found) = h
        .get("/_matrix/identity/api/v1/lookup?medium=email&address=dave%40example.org")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found["mxid"], "@dave:hs");
    let signed = found.as_object().unwrap();
    peer_key.verify_key().verify(signed, PEER).unwrap();
    h.key.verify_key().verify(signed, SERVER_NAME).unwrap();

    // Re-delivery is harmless.
    let (status, _) = h
        .send(push_request(
            Some(PEER),
            "application/json",
            serde_json::to_string(&batch).unwrap(),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn one_forged_entry_rejects_the_batch() {
    let peer_key = ServerKey::generate("1");
    let h = harness_with_peer(&peer_key);
    let mut batch = payload(
        &peer_key,
        &[(1, "carol@example.org", "@carol:hs"), (2, "dave@example.org", "@dave:hs")],
    );
    batch.sg_assocs[1]
        .signed_association
        .insert("mxid".into(), json!("@mallory:hs"));

    let (status, body) = h
        .send(push_request(
            Some(PEER),
            "application/json",
            serde_json::to_string(&batch).unwrap(),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_VERIFICATION_FAILED");
    assert_eq!(body["failed_ids"], json!([2]));

    let (status, _) = h
        .get("/_matrix/identity/api/v1/lookup?medium=email&address=carol%40example.org")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn push_requires_a_known_peer_certificate() {
    let peer_key = ServerKey::generate("1");
    let h = harness_with_peer(&peer_key);
    let body = serde_json::to_string(&payload(&peer_key, &[(1, "c@example.org", "@c:hs")])).unwrap();

    let (status, response) = h
        .send(push_request(None, "application/json", body.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["errcode"], "M_UNKNOWN_PEER");

    let (status, response) = h
        .send(push_request(Some("stranger.example"), "application/json", body))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(response["errcode"], "M_UNKNOWN_PEER");
}

#[tokio::test]
async fn push_rejects_non_json() {
    let peer_key = ServerKey::generate("1");
    let h = harness_with_peer(&peer_key);

    let (status, body) = h
        .send(push_request(Some(PEER), "text/plain", "hello".into()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_NOT_JSON");

    let (status, body) = h
        .send(push_request(Some(PEER), "application/json", "{\"sgAssocs\": 3}".into()))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["errcode"], "M_BAD_JSON");
}
