use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    engine::{Limits, SecretEngine, DEFAULT_MAX_CONTENT_CHARS, DEFAULT_MAX_TTL_MINUTES},
    handlers::{create_secret, get_secret, health, purge_secrets},
    reaper,
    store::{self, crypto, Cipher, EncryptionKey, StoreBackend},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Base used to build retrieval URLs ($BURNDROP_PUBLIC_URL).
    pub public_url: Option<String>,
    pub backend: StoreBackend,
    pub reap_interval: Duration,
    pub limits: Limits,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BURNDROP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BURNDROP_PORT").unwrap_or(8080),
            data_dir: std::env::var("BURNDROP_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("BURNDROP_PUBLIC_URL").ok(),
            backend: env_parse("BURNDROP_STORE").unwrap_or(StoreBackend::Redb),
            reap_interval: env_parse("BURNDROP_REAP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(reaper::DEFAULT_INTERVAL),
            limits: Limits {
                max_content_chars: env_parse("BURNDROP_MAX_CONTENT_CHARS")
                    .unwrap_or(DEFAULT_MAX_CONTENT_CHARS),
                max_ttl_minutes: env_parse("BURNDROP_MAX_TTL_MINUTES")
                    .unwrap_or(DEFAULT_MAX_TTL_MINUTES),
            },
            cors_origins: std::env::var("BURNDROP_CORS_ORIGINS").ok(),
        }
    }
}

impl ServerConfig {
    fn public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}", self.port))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparseable environment variable");
            None
        }
    }
}

/// Read a master key from a file, trimming surrounding whitespace.
/// Fails if the file cannot be read or is empty after trimming.
pub fn read_key_file(path: &Path) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read key file: {}", path.display()))?;
    let key = content.trim().to_string();
    if key.is_empty() {
        anyhow::bail!("key file is empty: {}", path.display());
    }
    Ok(key)
}

/// Resolve the master passphrase from `BURNDROP_MASTER_KEY_FILE` (preferred) or
/// `BURNDROP_MASTER_KEY`. `None` means neither is set and a raw key file is used.
pub fn resolve_master_key() -> Result<Option<String>> {
    if let Ok(path) = std::env::var("BURNDROP_MASTER_KEY_FILE") {
        let key = read_key_file(Path::new(&path))?;
        if std::env::var("BURNDROP_MASTER_KEY").is_ok() {
            warn!("both BURNDROP_MASTER_KEY and BURNDROP_MASTER_KEY_FILE are set; using file");
        }
        return Ok(Some(key));
    }
    match std::env::var("BURNDROP_MASTER_KEY") {
        Ok(key) if key.is_empty() => anyhow::bail!("BURNDROP_MASTER_KEY must not be empty"),
        Ok(key) => Ok(Some(key)),
        Err(_) => Ok(None),
    }
}

/// Resolve (and create) the data directory: the configured one, else the
/// platform app data dir (`~/.local/share/burndrop/`, etc.).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "burndrop")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir {}", dir.display()))?;
    Ok(dir)
}

/// Load the process-wide encryption key: derived from a master passphrase if
/// one is configured, otherwise the raw `burndrop.key` file.
pub fn load_encryption_key(data_dir: &Path) -> Result<EncryptionKey> {
    match resolve_master_key()? {
        Some(master_key) => {
            let salt = load_or_create_salt(data_dir)?;
            info!("deriving encryption key from master key");
            crypto::derive_key(&master_key, &salt)
        }
        None => load_or_create_key(data_dir),
    }
}

fn load_or_create_key(data_dir: &Path) -> Result<EncryptionKey> {
    let key_path = data_dir.join("burndrop.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read burndrop.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "burndrop.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        write_private(&key_path, key.as_bytes()).context("write burndrop.key")?;
        info!("generated new encryption key");
        Ok(key)
    }
}

fn load_or_create_salt(data_dir: &Path) -> Result<[u8; 32]> {
    let salt_path = data_dir.join("burndrop.salt");
    if salt_path.exists() {
        let bytes = std::fs::read(&salt_path).context("read burndrop.salt")?;
        bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "burndrop.salt is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let salt = crypto::generate_salt();
        write_private(&salt_path, &salt).context("write burndrop.salt")?;
        Ok(salt)
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Build the engine described by `cfg`: data dir, key, and store backend.
/// Shared by `serve` and the out-of-band purge command.
pub fn open_engine(cfg: &ServerConfig) -> Result<SecretEngine> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), backend = ?cfg.backend, "using data directory");

    let cipher = Cipher::new(load_encryption_key(&data_dir)?);
    let store = store::open(cfg.backend, &data_dir).context("open store")?;

    Ok(SecretEngine::new(store, cipher, cfg.public_url()).with_limits(cfg.limits))
}

/// The HTTP surface, without CORS or tracing layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/secrets", post(create_secret))
        .route("/v1/secrets/{id}", get(get_secret))
        .route("/v1/purge", post(purge_secrets))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let engine = open_engine(&cfg)?;
    let limits = engine.limits();
    info!(
        max_content_chars = limits.max_content_chars,
        max_ttl_minutes = limits.max_ttl_minutes,
        "secret limits"
    );

    reaper::spawn_reaper(engine.clone(), cfg.reap_interval);
    info!(interval_secs = cfg.reap_interval.as_secs(), "expiry reaper started");

    let cors = build_cors(cfg.cors_origins.as_deref());
    let app = router(AppState { engine })
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, public_url = %cfg.public_url(), "burndrop server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_file_is_created_once_and_reused() {
        let dir = tempdir().unwrap();
        let first = load_or_create_key(dir.path()).unwrap();
        let second = load_or_create_key(dir.path()).unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn corrupt_key_file_is_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("burndrop.key"), b"short").unwrap();
        let err = load_or_create_key(dir.path()).err().unwrap();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn salt_is_created_once_and_reused() {
        let dir = tempdir().unwrap();
        let first = load_or_create_salt(dir.path()).unwrap();
        let second = load_or_create_salt(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn read_key_file_trims_and_rejects_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("master");
        std::fs::write(&path, "  passphrase\n").unwrap();
        assert_eq!(read_key_file(&path).unwrap(), "passphrase");
        std::fs::write(&path, "\n").unwrap();
        assert!(read_key_file(&path).is_err());
    }

    #[test]
    fn configured_data_dir_is_created() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        assert_eq!(resolve_data_dir(Some(&nested)).unwrap(), nested);
        assert!(nested.is_dir());
    }

    #[test]
    fn public_url_defaults_to_localhost_port() {
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 9999,
            data_dir: None,
            public_url: None,
            backend: StoreBackend::Memory,
            reap_interval: reaper::DEFAULT_INTERVAL,
            limits: Limits::default(),
            cors_origins: None,
        };
        assert_eq!(cfg.public_url(), "http://localhost:9999");
    }

    #[test]
    fn encrypted_records_survive_restart() {
        let dir = tempdir().unwrap();
        let cfg = ServerConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            data_dir: Some(dir.path().to_owned()),
            public_url: Some("https://drop.example.com/".into()),
            backend: StoreBackend::Redb,
            reap_interval: reaper::DEFAULT_INTERVAL,
            limits: Limits::default(),
            cors_origins: None,
        };

        let handle = {
            let engine = open_engine(&cfg).unwrap();
            engine.store("persisted", None).unwrap()
        };
        assert!(handle.url.starts_with("https://drop.example.com/v1/secrets/"));

        let engine = open_engine(&cfg).unwrap();
        assert_eq!(
            engine.retrieve(&handle.id).unwrap().unwrap().content,
            "persisted"
        );
    }
}
