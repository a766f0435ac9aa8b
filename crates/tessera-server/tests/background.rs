use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tessera_db::{create_pool, run_migrations, DbRuntimeSettings};
use tessera_federation::{
    Backoff, FederationResolver, FederationResponse, HttpTransport, PreparedRequest,
    ResolveError, RetryingTransport, SrvCandidate, SrvLookup, TransportError,
};
use tessera_replication::Pusher;
use tessera_server::background::start_push_task;
use tessera_signing::ServerKey;
use tessera_store::{associations, peers};
use tessera_types::{Association, Medium};
use tokio_util::sync::CancellationToken;

struct NoSrv;

#[async_trait]
impl SrvLookup for NoSrv {
    async fn lookup(&self, host: &str) -> Result<Vec<SrvCandidate>, ResolveError> {
        Err(ResolveError::NoCandidates(host.to_string()))
    }
}

#[derive(Default)]
struct Recorder {
    hosts: Mutex<Vec<String>>,
}

#[async_trait]
impl HttpTransport for Recorder {
    async fn send(&self, request: PreparedRequest) -> Result<FederationResponse, TransportError> {
        self.hosts.lock().unwrap().push(request.target_host);
        Ok(FederationResponse {
            status: 200,
            body: br#"{"success":true}"#.to_vec(),
        })
    }
}

fn pusher_for(pool: tessera_db::DbPool, recorder: Arc<Recorder>) -> Arc<Pusher> {
    let resolver = Arc::new(FederationResolver::new(Arc::new(NoSrv)));
    let transport = Arc::new(RetryingTransport::new(resolver, recorder, Backoff::default()));
    Arc::new(Pusher::new(
        pool,
        ServerKey::generate("0"),
        "id.example",
        transport,
    ))
}

#[tokio::test]
async fn push_task_delivers_to_peers_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bg.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    {
        let mut conn = pool.get().unwrap();
        run_migrations(&conn).unwrap();
        let assoc = Association::new_binding(Medium::Email, "a@example.org", "@a:hs", 10);
        associations::local_upsert(&conn, &assoc).unwrap();
        peers::upsert_peer(&mut conn, "peer.example", Some(1443), &BTreeMap::new()).unwrap();
    }

    let recorder = Arc::new(Recorder::default());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(start_push_task(
        pusher_for(pool.clone(), recorder.clone()),
        1,
        shutdown.clone(),
    ));

    let mut delivered = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let peer = peers::get_peer_by_name(&pool.get().unwrap(), "peer.example")
            .unwrap()
            .unwrap();
        if peer.last_sent_version == Some(1) {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "push task never advanced the peer cursor");
    assert_eq!(recorder.hosts.lock().unwrap()[0], "peer.example");

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("push task did not stop")
        .unwrap();
}

#[tokio::test]
async fn zero_interval_disables_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bg.db");
    let pool = create_pool(path.to_str().unwrap(), DbRuntimeSettings::default()).unwrap();
    let recorder = Arc::new(Recorder::default());

    // Returns at once even though nothing cancels it.
    tokio::time::timeout(
        Duration::from_secs(1),
        start_push_task(pusher_for(pool, recorder.clone()), 0, CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(recorder.hosts.lock().unwrap().is_empty());
}
