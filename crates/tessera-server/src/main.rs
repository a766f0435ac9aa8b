//! Tessera server binary.
//!
//! Starts the identity service HTTP API with structured logging, database
//! initialization, background replication, and graceful shutdown on
//! SIGTERM/SIGINT.

use std::collections::BTreeMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tessera_federation::{
    Backoff, FederationKeyFetcher, FederationResolver, HickorySrvLookup, KeyCache,
    ReqwestTransport, ReqwestWellKnown, RetryingTransport,
};
use tessera_mail::{Mailer, NoopMailer, SmtpMailer, Templates};
use tessera_replication::Pusher;
use tessera_server::config::{self, Config, EmailProvider};
use tessera_server::{app, background, AppState};
use tessera_signing::ServerKey;
use tessera_store::peers;
use tessera_types::SIGNING_ALGORITHM;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn Error + Send + Sync>;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_signing_key(config: &Config) -> Result<ServerKey, BoxError> {
    match &config.crypto.signing_key {
        Some(seed) => Ok(ServerKey::from_seed_base64(seed, config.crypto.version.clone())?),
        None => {
            let key = ServerKey::generate(config.crypto.version.clone());
            tracing::warn!(
                public_key = %key.public_key_base64(),
                "no crypto.signing_key configured; using a generated key that will not survive a restart"
            );
            Ok(key)
        }
    }
}

fn build_mailer(config: &Config) -> Result<Arc<dyn Mailer>, BoxError> {
    let email = &config.email;
    Ok(match email.provider {
        EmailProvider::Smtp => Arc::new(SmtpMailer::new(
            &email.smtp_host,
            email.smtp_port,
            email.smtp_username.clone(),
            email.smtp_password.clone(),
            email.smtp_tls,
        )?),
        EmailProvider::Noop => {
            tracing::warn!("email.provider is noop; validation emails will not be delivered");
            Arc::new(NoopMailer::new(config.server.name.clone()))
        }
    })
}

async fn run() -> Result<(), BoxError> {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)?;
    init_tracing(&config);

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    // Initialize database
    let pool = tessera_db::create_pool(
        &config.database.path,
        tessera_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )?;
    {
        let mut conn = pool.get()?;
        let applied = tessera_db::run_migrations(&conn)?;
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
        for peer in &config.peers {
            let keys = BTreeMap::from([(SIGNING_ALGORITHM.to_string(), peer.public_key.clone())]);
            peers::upsert_peer(&mut conn, &peer.name, peer.port, &keys)?;
        }
        if !config.peers.is_empty() {
            tracing::info!(count = config.peers.len(), "registered replication peers");
        }
    }

    let server_key = load_signing_key(&config)?;
    let shutdown = CancellationToken::new();

    // Federation
    let timeout = Duration::from_secs(config.federation.request_timeout_secs);
    let mut resolver = FederationResolver::new(Arc::new(HickorySrvLookup::from_system()));
    if config.server.allow_well_known {
        resolver = resolver.with_well_known(Arc::new(ReqwestWellKnown::new(timeout)?));
    }
    let http = ReqwestTransport::new(
        timeout,
        format!("tessera/{}", env!("CARGO_PKG_VERSION")),
    )?;
    let backoff = Backoff {
        initial_interval: Duration::from_millis(config.federation.backoff_initial_ms),
        multiplier: config.federation.backoff_multiplier,
        max_retries: config.federation.max_retries,
        max_interval: Duration::from_millis(config.federation.backoff_max_interval_ms),
    };
    let transport = Arc::new(
        RetryingTransport::new(Arc::new(resolver), Arc::new(http), backoff)
            .with_well_known(config.server.allow_well_known),
    );
    let key_cache = Arc::new(KeyCache::new(Arc::new(FederationKeyFetcher::new(
        Arc::clone(&transport),
        shutdown.clone(),
    ))));

    // Replication
    let mut pusher = Pusher::new(
        pool.clone(),
        server_key.clone(),
        config.server.name.clone(),
        Arc::clone(&transport),
    );
    for peer in &config.peers {
        if let Some(base) = &peer.base_replication_url {
            pusher = pusher.with_base_url(peer.name.clone(), base.clone());
        }
    }
    let push_task = tokio::spawn(background::start_push_task(
        Arc::new(pusher),
        config.replication.push_interval_secs,
        shutdown.clone(),
    ));

    // Build application
    let state = AppState {
        pool,
        server_key,
        server_name: config.server.name.clone(),
        client_http_base: config.server.client_http_base.clone(),
        peer_cert_header: config.server.peer_cert_header.clone(),
        email_from: config.email.from.clone(),
        mailer: build_mailer(&config)?,
        templates: Arc::new(Templates::load(
            config.email.templates_dir.as_deref().map(Path::new),
        )?),
        key_cache,
    };
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, server_name = %config.server.name, "starting tessera server");

    let listener = TcpListener::bind(addr).await?;

    // Serve with graceful shutdown
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Err(e) = push_task.await {
        tracing::warn!(error = %e, "replication push task did not stop cleanly");
    }
    tracing::info!("tessera server shut down");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("tessera-server: {e}");
        std::process::exit(1);
    }
}

/// Waits for SIGINT (Ctrl+C), SIGTERM, or `shutdown` being cancelled.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
        () = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
