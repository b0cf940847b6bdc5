//! Certificate serial (CSL) issuance and verification service.
//!
//!
//!
//! # General Infrastructure
//! - Admin frontend calls `POST /certificates` once a student completes a course
//! - The returned `verify_url` goes into the QR code of the rendered PDF
//! - Anyone scanning the QR code lands on `GET /verify?csl=...`, no login involved
//! - Redis holds the counters, the certificate records and the per-year stats
//!
//!
//!
//! # Preventing Forgery
//!
//! **Goal**: nobody without the pepper can produce a CSL that verifies, and a leaked or edited
//! status alone can never make a forged CSL verify.
//!
//! - The last segment of a CSL is a SHA-256 based hash over the core, the owner and the pepper
//! - Verification looks the record up by core string, never by the full CSL, so a wrong hash
//!   reports `tampered` instead of `not_found`
//! - The hash is checked before the status is looked at
//! - Retired peppers keep verifying old certificates after a rotation, only the active one mints
//!
//!
//!
//! # Notes
//!
//! ## Sequence races
//! The earlier schema computed the next serial with a `MAX(sequence) + 1` query over the
//! certificates table. Two concurrent issuances could read the same max and mint the same number.
//! Sequences now come from a dedicated counter per (year, course code) incremented atomically.
//! A failed issuance burns its number, it is never handed out again.
//!
//! ## Ceiling
//! `NNNN` is four digits. The 10000th certificate of a course in a given year is refused
//! instead of widening the field or wrapping around.
//!
//!
//!
//! # Setup
//!
//! Secrets are read from `/run/secrets` (override with `SECRETS_DIR`).
//! ```sh
//! mkdir -p secrets && openssl rand -hex 32 > secrets/CSL_PEPPER
//! ```
//!
//! Run against a local Redis.
//! ```sh
//! docker run -d -p 6379:6379 redis:7
//! SECRETS_DIR=./secrets RUST_LOG=info cargo run -p certify
//! ```
//!
//! Run without Redis.
//! ```sh
//! SECRETS_DIR=./secrets CSL_STORE=memory cargo run -p certify
//! ```
//!
//! Register a course before issuing for it.
//! ```sh
//! cargo run -p process -- course 1 WD
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod allocator;
pub mod certificates;
pub mod config;
pub mod database;
pub mod error;
pub mod memory;
pub mod routes;
pub mod state;
pub mod store;

use config::Config;
use routes::{issue_handler, stats_handler, status_handler, validate_handler, verify_handler};
use state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/certificates", post(issue_handler))
        .route("/certificates/{csl}/status", post(status_handler))
        .route("/verify", get(verify_handler))
        .route("/validate", get(validate_handler))
        .route("/stats/{year}", get(stats_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> anyhow::Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    info!("Starting server...");
    let address = format!("0.0.0.0:{}", state.config.port);
    let app = router(state);

    info!("Binding to {address}");
    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        ctrl_c().await.expect("Failed to install Ctrl+C handler");

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        signal(SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
