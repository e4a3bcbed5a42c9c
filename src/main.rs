//! sbp-server: Stigmergic Blackboard Protocol server
//!
//! Agents communicate indirectly through time-decaying pheromones on a
//! shared blackboard rather than exchanging messages directly. When a
//! source goes quiet, its pheromones decay and downstream scents fall
//! dormant on their own — no heartbeat or liveness check required.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use sbp::core::evaluator::Evaluator;
use sbp::core::{Blackboard, Config};
use sbp::transport::auth::AuthGate;
use sbp::transport::rate_limit::TokenBucketLimiter;
use sbp::transport::session::SessionStore;
use sbp::transport::sse::SseRegistry;
use sbp::transport::{routes, AppState};

#[derive(Parser, Debug)]
#[command(name = "sbp-server", version, about = "Stigmergic Blackboard Protocol server")]
struct Cli {
    /// Path to config.toml
    #[arg(long, env = "SBP_CONFIG")]
    config: Option<String>,

    /// Bind host, overrides config.toml
    #[arg(long, env = "SBP_HOST")]
    host: Option<String>,

    /// Bind port, overrides config.toml
    #[arg(long, env = "SBP_PORT")]
    port: Option<u16>,

    /// Comma-separated API keys; when set, requests must present one as a Bearer token
    #[arg(long, env = "SBP_API_KEYS", value_delimiter = ',')]
    api_key: Vec<String>,

    /// Requests per minute per agent, 0 disables rate limiting
    #[arg(long, env = "SBP_RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "SBP_LOG", default_value = "info")]
    log: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("stigmergic blackboard protocol server starting");

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!(error = %e, "no config.toml found, using defaults");
            Config::default()
        }),
    };

    if let Some(host) = cli.host {
        config.transport.host = host;
    }
    if let Some(port) = cli.port {
        config.transport.port = port;
    }
    if !cli.api_key.is_empty() {
        config.transport.api_keys = cli.api_key;
    }
    if let Some(rate_limit) = cli.rate_limit {
        config.transport.rate_limit_per_minute = rate_limit;
    }

    let config = Arc::new(config);
    let board = Arc::new(Blackboard::new(config.clone()));

    let evaluator = Arc::new(Evaluator::new(board.clone()));
    let evaluator_handle = evaluator.spawn();

    let sessions = Arc::new(SessionStore::new());
    let session_ttl_ms = config.transport.session_ttl_ms;
    let reaper_sessions = sessions.clone();
    let reaper_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let reaped = reaper_sessions.reap_expired(now, session_ttl_ms);
            if reaped > 0 {
                tracing::debug!(reaped, "reaped expired sessions");
            }
        }
    });

    let state = Arc::new(AppState {
        board,
        sessions,
        sse: Arc::new(SseRegistry::new(config.transport.sse_replay_buffer_size)),
        auth: Arc::new(AuthGate::new(config.transport.api_keys.clone())),
        rate_limiter: Arc::new(TokenBucketLimiter::new(config.transport.rate_limit_per_minute)),
        config: config.clone(),
        started_at: chrono::Utc::now().timestamp_millis(),
    });

    let addr: std::net::SocketAddr = format!("{}:{}", config.transport.host, config.transport.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address: {e}"))?;

    info!(%addr, "listening for JSON-RPC over HTTP + SSE on /sbp");
    let server = warp::serve(routes(state)).bind_with_graceful_shutdown(addr, async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    });

    server.1.await;

    evaluator_handle.abort();
    reaper_handle.abort();
    info!("stigmergic blackboard protocol server stopped");
    Ok(())
}
