//! tradegate - MCP gateway server binary.
//!
//! Wires the protocol gateway and rate limiter into an HTTP server. The
//! protocol server behind the gateway is constructed once at startup and
//! passed into the router factory; per-invocation state lives only in the
//! session transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tradegate::config::GatewayConfig;
use tradegate::gateway::{self, AppState, MessageHandler};
use tradegate::ratelimit::{MemoryStore, RateLimiter, RateLimitMiddleware};
use tradegate::transport::{JsonRpcMessage, ResponseSender};

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "TRADEGATE_PORT", default_value = "8080")]
    port: u16,

    /// Bind address
    #[arg(short, long, env = "TRADEGATE_BIND", default_value = "0.0.0.0")]
    bind: String,
}

/// Placeholder protocol server: answers `ping`, rejects everything else.
///
/// The real tool surface is generated from the trading platform's REST API
/// and plugged in through the same [`MessageHandler`] seam.
struct PingHandler;

impl MessageHandler for PingHandler {
    fn handle(&self, message: JsonRpcMessage, replies: ResponseSender) {
        if !message.is_request() {
            return;
        }
        let Some(id) = message.id() else {
            return;
        };
        match message.method() {
            Some("ping") => replies.send(JsonRpcMessage::response(id, serde_json::json!({}))),
            Some(method) => replies.send(JsonRpcMessage::error_response(
                id,
                -32601,
                &format!("Method not found: {}", method),
            )),
            None => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_env();

    let shutdown = CancellationToken::new();

    let store = Arc::new(MemoryStore::new());
    store.spawn_sweep_task(
        Duration::from_secs(config.store_sweep_secs),
        shutdown.clone(),
    );

    let limiter = Arc::new(RateLimiter::new(store));
    limiter.set_enabled(config.rate_limit_enabled);
    let rate_limit =
        Arc::new(RateLimitMiddleware::new(limiter).expose_headers(config.rate_limit_headers));

    let handler: Arc<dyn MessageHandler> = Arc::new(PingHandler);
    let state = AppState {
        handler,
        rate_limit,
    };

    let app = gateway::router(state).layer(DefaultBodyLimit::max(config.max_body_size));

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port).parse()?;
    info!(
        %addr,
        rate_limit_enabled = config.rate_limit_enabled,
        "tradegate listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    })
    .await?;

    Ok(())
}
