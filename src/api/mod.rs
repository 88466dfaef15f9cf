//! HTTP API server
//!
//! Health probes, transcript lookup and the realtime relay socket.

pub mod auth;
pub mod health;
pub mod transcripts;

use std::sync::Arc;

use axum::Router;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::db::{DbPool, TranscriptRepo};
use crate::relay::{self, RelayConfig, RelayState};

/// Shared state for API handlers
pub struct ApiState {
    pub db: DbPool,
    pub transcripts: TranscriptRepo,
    /// Required bearer key for `/api/*`; `None` disables the check
    pub api_key: Option<SecretString>,
    pub relay: Arc<RelayState>,
}

impl ApiState {
    #[must_use]
    pub fn new(db: DbPool, api_key: Option<SecretString>, relay: RelayConfig) -> Self {
        let transcripts = TranscriptRepo::new(db.clone());
        let relay = Arc::new(RelayState {
            config: relay,
            transcripts: Some(transcripts.clone()),
        });
        Self {
            db,
            transcripts,
            api_key,
            relay,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<ApiState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        self.serve(listener).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let port = listener.local_addr().map_or(self.port, |addr| addr.port());
        tracing::info!(port, "API server listening");

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

/// All routes with CORS and request tracing
pub fn build_router(state: Arc<ApiState>) -> Router {
    let router = Router::new()
        .nest("/api/transcripts", transcripts::router(state.clone()))
        .merge(relay::router(state.relay.clone()))
        .merge(health::router())
        .merge(health::ready_router(state));

    // CORS layer for cross-origin requests from the browser client
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    router.layer(cors).layer(TraceLayer::new_for_http())
}
