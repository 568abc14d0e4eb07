use std::io::Read;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "burndrop", about = "burndrop: one-time secret links", version)]
struct Cli {
    /// burndrop server URL (default: http://localhost:8080 or $BURNDROP_SERVER)
    #[arg(long, env = "BURNDROP_SERVER", default_value = "http://localhost:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the burndrop HTTP server
    Serve {
        /// Port to listen on (default: $BURNDROP_PORT or 8080)
        #[arg(long, env = "BURNDROP_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $BURNDROP_HOST or 0.0.0.0)
        #[arg(long, env = "BURNDROP_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Store a secret and print its one-time URL
    Push {
        /// Secret content, or `-` to read it from stdin
        content: String,
        /// TTL duration e.g. 30m, 1h, 7d (rounded up to whole minutes)
        #[arg(long)]
        ttl: Option<String>,
    },
    /// Reveal (and destroy) a secret by id or URL
    Get {
        /// Secret id or full retrieval URL
        id: String,
    },
    /// Print the retrieval URL for a secret id without contacting the server
    Share {
        /// Secret id
        id: String,
    },
    /// Delete expired secrets via the running server, or the local store if none answers
    Purge,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } | Commands::Purge => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("BURNDROP_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, host } => cmd_serve(host, port).await,
        Commands::Push { content, ttl } => cmd_push(&cli.server, &content, ttl.as_deref()).await,
        Commands::Get { id } => cmd_get(&cli.server, &id).await,
        Commands::Share { id } => {
            println!("{}", secret_url(&cli.server, &id));
            Ok(())
        }
        Commands::Purge => {
            cmd_purge(&cli.server, &burndrop_server::ServerConfig::default()).await;
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(host: String, port: u16) -> Result<()> {
    let cfg = burndrop_server::ServerConfig {
        host,
        port,
        ..Default::default()
    };
    burndrop_server::run(cfg).await
}

async fn cmd_push(server: &str, content: &str, ttl: Option<&str>) -> Result<()> {
    let ttl_minutes = ttl.map(parse_ttl_minutes).transpose()?;

    let content = if content == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("read secret from stdin")?;
        buf.trim_end_matches(['\r', '\n']).to_owned()
    } else {
        content.to_owned()
    };

    let body = serde_json::json!({
        "content": content,
        "ttl_minutes": ttl_minutes,
    });

    let resp = Client::new()
        .post(format!("{}/v1/secrets", server.trim_end_matches('/')))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;
    if !status.is_success() {
        let message = json["message"].as_str().unwrap_or("unknown error");
        anyhow::bail!("server returned {status}: {message}");
    }

    println!("{}", json["data"]["url"].as_str().unwrap_or_default());
    if let Some(expires_at) = json["data"]["expires_at"].as_str() {
        eprintln!("expires at {expires_at}");
    }
    Ok(())
}

async fn cmd_get(server: &str, id_or_url: &str) -> Result<()> {
    let url = if id_or_url.starts_with("http://") || id_or_url.starts_with("https://") {
        id_or_url.to_owned()
    } else {
        secret_url(server, id_or_url)
    };

    let resp = Client::new()
        .get(&url)
        .send()
        .await
        .context("HTTP request failed")?;

    let status = resp.status();
    let json: Value = resp.json().await.context("parse response")?;

    if status.is_success() {
        println!("{}", json["data"]["content"].as_str().unwrap_or_default());
        Ok(())
    } else {
        let message = json["message"].as_str().unwrap_or("unknown error");
        anyhow::bail!("{message}");
    }
}

/// Operational purge. Asks the server first, since it owns the store while
/// running; opens the local store only if nothing answers. Always exits 0.
async fn cmd_purge(server: &str, cfg: &burndrop_server::ServerConfig) -> usize {
    println!("Cleaning up expired secrets...");
    let removed = match purge_via_server(server).await {
        Ok(Some(n)) => n,
        Ok(None) => purge_local(cfg),
        Err(e) => {
            tracing::error!(error = %e, "purge request failed");
            0
        }
    };
    println!("Deleted {removed} expired secret(s).");
    removed
}

/// `Ok(None)` when no server is listening at `server`.
async fn purge_via_server(server: &str) -> Result<Option<usize>> {
    let resp = match Client::new()
        .post(format!("{}/v1/purge", server.trim_end_matches('/')))
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) if e.is_connect() => {
            tracing::info!(%server, "server unreachable, purging the local store");
            return Ok(None);
        }
        Err(e) => return Err(e).context("HTTP request failed"),
    };

    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("server returned {status}");
    }
    let json: Value = resp.json().await.context("parse response")?;
    Ok(Some(json["data"]["deleted"].as_u64().unwrap_or(0) as usize))
}

fn purge_local(cfg: &burndrop_server::ServerConfig) -> usize {
    match burndrop_server::open_engine(cfg) {
        Ok(engine) => burndrop_server::reaper::run_once(&engine),
        Err(e) => {
            tracing::error!(error = %e, "could not open secret store");
            0
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn secret_url(server: &str, id: &str) -> String {
    format!("{}/v1/secrets/{}", server.trim_end_matches('/'), id)
}

/// Parse human duration strings like "1h", "30m", "7d" into whole minutes, rounding up.
fn parse_ttl_minutes(s: &str) -> Result<i64> {
    let d: humantime::Duration = s
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;
    let secs = d.as_secs();
    if secs == 0 {
        anyhow::bail!("TTL must be at least one minute");
    }
    Ok(secs.div_ceil(60) as i64)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use burndrop_server::clock::ManualClock;
    use burndrop_server::engine::Limits;
    use burndrop_server::store::{
        Cipher, EncryptionKey, MemoryStore, RedbStore, SecretStore, StoreBackend,
    };
    use burndrop_server::{reaper, AppState, SecretEngine, ServerConfig};

    use super::*;

    #[test]
    fn ttl_rounds_up_to_minutes() {
        assert_eq!(parse_ttl_minutes("1h").unwrap(), 60);
        assert_eq!(parse_ttl_minutes("30m").unwrap(), 30);
        assert_eq!(parse_ttl_minutes("90s").unwrap(), 2);
        assert_eq!(parse_ttl_minutes("7d").unwrap(), 10_080);
    }

    #[test]
    fn ttl_rejects_garbage_and_zero() {
        assert!(parse_ttl_minutes("soon").is_err());
        assert!(parse_ttl_minutes("0s").is_err());
    }

    #[test]
    fn secret_url_trims_trailing_slash() {
        assert_eq!(
            secret_url("http://localhost:8080/", "abc"),
            "http://localhost:8080/v1/secrets/abc"
        );
    }

    fn local_config(dir: &Path) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            data_dir: Some(dir.to_owned()),
            public_url: None,
            backend: StoreBackend::Redb,
            reap_interval: reaper::DEFAULT_INTERVAL,
            limits: Limits::default(),
            cors_origins: None,
        }
    }

    #[tokio::test]
    async fn purge_goes_through_running_server() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let engine = SecretEngine::new(
            Arc::new(MemoryStore::new()),
            Cipher::new(EncryptionKey::from_bytes([3u8; 32])),
            "http://localhost",
        )
        .with_clock(clock.clone());
        engine.store("old", Some(1)).unwrap();
        engine.store("kept", None).unwrap();
        clock.advance(Duration::from_secs(120));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, burndrop_server::router(AppState { engine }))
                .await
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let removed = cmd_purge(&format!("http://{addr}"), &local_config(dir.path())).await;
        assert_eq!(removed, 1);
        // The local store was never opened.
        assert!(!dir.path().join("burndrop.db").exists());
    }

    #[tokio::test]
    async fn purge_falls_back_to_local_store_when_server_is_down() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = RedbStore::open(&dir.path().join("burndrop.db")).unwrap();
            store.create(b"stale".to_vec(), 0, Some(60)).unwrap();
            store.create(b"fresh".to_vec(), 0, None).unwrap();
        }

        // Bind then drop to get a port nothing listens on.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let server = format!("http://127.0.0.1:{port}");
        let removed = cmd_purge(&server, &local_config(dir.path())).await;
        assert_eq!(removed, 1);
    }

    #[test]
    fn cli_parses_push_with_ttl() {
        let cli = Cli::try_parse_from(["burndrop", "push", "hunter2", "--ttl", "1h"]).unwrap();
        match cli.command {
            Commands::Push { content, ttl } => {
                assert_eq!(content, "hunter2");
                assert_eq!(ttl.as_deref(), Some("1h"));
            }
            _ => panic!("expected push"),
        }
    }
}
