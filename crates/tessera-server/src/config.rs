//! Server configuration loading from file and environment variables.

use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;
use tessera_signing::decode_base64;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub email: EmailConfig,
    /// Replication peers, upserted into the peer table at start-up.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Network identity of this server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Server name used in signatures and as the replication origin.
    #[serde(default = "default_server_name")]
    pub name: String,

    /// Public base URL clients reach us on; used in validation links and
    /// key validity URLs.
    #[serde(default = "default_client_http_base")]
    pub client_http_base: String,

    /// Header the TLS front end uses to forward the verified client
    /// certificate CN.
    #[serde(default = "default_peer_cert_header")]
    pub peer_cert_header: String,

    /// Whether federation routing may follow `.well-known` delegation.
    #[serde(default = "default_true")]
    pub allow_well_known: bool,
}

/// Long-term signing key.
#[derive(Debug, Clone, Deserialize)]
pub struct CryptoConfig {
    /// Unpadded base64 of the 32-byte ed25519 seed. Unset means a fresh key
    /// is generated on every start.
    #[serde(default)]
    pub signing_key: Option<String>,

    #[serde(default = "default_key_version")]
    pub version: String,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "tessera_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Outbound federation request policy.
#[derive(Debug, Clone, Deserialize)]
pub struct FederationConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Ceiling on a single backoff sleep.
    #[serde(default = "default_backoff_max_interval_ms")]
    pub backoff_max_interval_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-attempt HTTP timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Seconds between push rounds; 0 disables pushing to peers.
    #[serde(default = "default_push_interval_secs")]
    pub push_interval_secs: u64,
}

/// Which mail backend delivers verification and invite messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    Smtp,
    #[default]
    Noop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub provider: EmailProvider,

    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    #[serde(default)]
    pub smtp_username: Option<String>,

    #[serde(default)]
    pub smtp_password: Option<String>,

    #[serde(default)]
    pub smtp_tls: bool,

    /// Sender address for every outgoing message.
    #[serde(default = "default_email_from")]
    pub from: String,

    /// Directory whose `*.eml`/`*.html` files replace the built-in templates.
    #[serde(default)]
    pub templates_dir: Option<String>,
}

/// A statically configured replication peer.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub name: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Overrides where pushes are sent; host, port and path prefix are used.
    #[serde(default)]
    pub base_replication_url: Option<String>,
    /// Unpadded base64 ed25519 public key.
    pub public_key: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8090
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_client_http_base() -> String {
    "http://localhost:8090".to_string()
}

fn default_peer_cert_header() -> String {
    "X-Client-Cert-CN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_key_version() -> String {
    "0".to_string()
}

fn default_db_path() -> String {
    "tessera.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_backoff_max_interval_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    16
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_push_interval_secs() -> u64 {
    10
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_email_from() -> String {
    "Tessera Validation <noreply@localhost>".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_server_name(),
            client_http_base: default_client_http_base(),
            peer_cert_header: default_peer_cert_header(),
            allow_well_known: true,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            signing_key: None,
            version: default_key_version(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_interval_ms: default_backoff_max_interval_ms(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            push_interval_secs: default_push_interval_secs(),
        }
    }
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: EmailProvider::default(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_tls: false,
            from: default_email_from(),
            templates_dir: None,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnvVar { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `TESSERA_HOST` overrides `server.host`
/// - `TESSERA_PORT` overrides `server.port`
/// - `TESSERA_SERVER_NAME` overrides `server.name`
/// - `TESSERA_DB_PATH` overrides `database.path`
/// - `TESSERA_LOG_LEVEL` overrides `logging.level`
/// - `TESSERA_LOG_JSON` overrides `logging.json` ("true" or "1" to enable)
/// - `TESSERA_SIGNING_KEY` overrides `crypto.signing_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed,
/// if an override does not parse, or if the result fails [`Config::validate`].
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvVar { var, value })
}

/// Applies `TESSERA_*` overrides read through `lookup`.
fn apply_env_overrides(
    config: &mut Config,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(host) = lookup("TESSERA_HOST") {
        config.server.host = parse_env("TESSERA_HOST", host)?;
    }
    if let Some(port) = lookup("TESSERA_PORT") {
        config.server.port = parse_env("TESSERA_PORT", port)?;
    }
    if let Some(name) = lookup("TESSERA_SERVER_NAME") {
        config.server.name = name;
    }
    if let Some(db_path) = lookup("TESSERA_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = lookup("TESSERA_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("TESSERA_LOG_JSON") {
        config.logging.json = match json.as_str() {
            "true" | "1" => true,
            "false" | "0" | "" => false,
            _ => {
                return Err(ConfigError::InvalidEnvVar {
                    var: "TESSERA_LOG_JSON",
                    value: json,
                })
            }
        };
    }
    if let Some(key) = lookup("TESSERA_SIGNING_KEY") {
        config.crypto.signing_key = Some(key);
    }
    Ok(())
}

const MAX_BACKOFF_MULTIPLIER: f64 = 10.0;
const MAX_RETRIES: u32 = 100;

fn is_ed25519_key(encoded: &str) -> bool {
    decode_base64(encoded).is_ok_and(|bytes| bytes.len() == 32)
}

impl Config {
    /// Checks the invariants the server relies on at start-up.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.name.trim().is_empty() {
            return Err(ConfigError::Invalid("server.name must not be empty".into()));
        }
        url::Url::parse(&self.server.client_http_base).map_err(|e| {
            ConfigError::Invalid(format!(
                "server.client_http_base {:?}: {e}",
                self.server.client_http_base
            ))
        })?;
        if let Some(key) = &self.crypto.signing_key {
            if !is_ed25519_key(key) {
                return Err(ConfigError::Invalid(
                    "crypto.signing_key must be base64 of a 32-byte seed".into(),
                ));
            }
        }
        let federation = &self.federation;
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&federation.backoff_multiplier) {
            return Err(ConfigError::Invalid(format!(
                "federation.backoff_multiplier must be between 1 and {MAX_BACKOFF_MULTIPLIER}"
            )));
        }
        if federation.max_retries > MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "federation.max_retries must be at most {MAX_RETRIES}"
            )));
        }
        if federation.backoff_max_interval_ms < federation.backoff_initial_ms {
            return Err(ConfigError::Invalid(
                "federation.backoff_max_interval_ms must not be below backoff_initial_ms".into(),
            ));
        }
        for peer in &self.peers {
            if !is_ed25519_key(&peer.public_key) {
                return Err(ConfigError::Invalid(format!(
                    "public key of peer {} must be base64 of 32 bytes",
                    peer.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tessera_signing::ServerKey;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.peer_cert_header, "X-Client-Cert-CN");
        assert_eq!(config.federation.max_retries, 16);
        assert_eq!(config.replication.push_interval_secs, 10);
        assert_eq!(config.email.provider, EmailProvider::Noop);
    }

    #[test]
    fn parses_sections_and_peers() {
        let key = ServerKey::generate("0");
        let raw = format!(
            r#"
            [server]
            name = "id.example"
            port = 9000

            [email]
            provider = "smtp"
            smtp_host = "mail.example"
            smtp_tls = true

            [[peers]]
            name = "peer.example"
            port = 1443
            public_key = "{}"
            "#,
            key.public_key_base64()
        );
        let config: Config = toml::from_str(&raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.name, "id.example");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.email.provider, EmailProvider::Smtp);
        assert_eq!(config.email.smtp_port, 25);
        assert_eq!(config.peers[0].port, Some(1443));
        assert_eq!(config.database.path, "tessera.db");
    }

    #[test]
    fn env_overrides_apply_and_reject_garbage() {
        let mut config = Config::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("TESSERA_PORT", "9100"),
                ("TESSERA_SERVER_NAME", "id.example"),
                ("TESSERA_LOG_JSON", "1"),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.name, "id.example");
        assert!(config.logging.json);

        let err = apply_env_overrides(&mut config, env(&[("TESSERA_PORT", "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnvVar {
                var: "TESSERA_PORT",
                ..
            }
        ));
    }

    #[test]
    fn validation_rejects_bad_keys_and_names() {
        let mut config = Config::default();
        config.crypto.signing_key = Some("c2hvcnQ".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.server.name = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.server.client_http_base = "not a url".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn validation_bounds_the_retry_schedule() {
        for multiplier in [0.5, 11.0, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.federation.backoff_multiplier = multiplier;
            assert!(
                matches!(config.validate(), Err(ConfigError::Invalid(_))),
                "multiplier {multiplier} accepted"
            );
        }

        let mut config = Config::default();
        config.federation.max_retries = 1_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.federation.backoff_max_interval_ms = 10;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.federation.backoff_multiplier = 10.0;
        config.federation.max_retries = 100;
        config.validate().unwrap();
    }
}
