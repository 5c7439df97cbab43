//! Application state, router assembly, and the HTTP server.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use pulse_core::PrivateKeyRing;
use pulse_store::PulseStore;

use crate::config::Config;
use crate::error::ApiError;
use crate::routes::{instances, system};

/// Shared application state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Persistence handle.
    pub store: PulseStore,
    /// Cloud signing key ring.
    pub keyring: Arc<PrivateKeyRing>,
    /// Server configuration.
    pub config: Arc<Config>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("store", &"<PulseStore>")
            .field("keyring", &self.keyring)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Builds application state, loading the key ring from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error when the private key ring cannot be parsed.
    pub fn new(store: PulseStore, config: Config) -> pulse_core::Result<Self> {
        let keyring = PrivateKeyRing::from_json(
            &config.private_keys_json,
            config.active_kid.as_deref(),
        )?;
        Ok(Self {
            store,
            keyring: Arc::new(keyring),
            config: Arc::new(config),
        })
    }
}

/// Last-resort guard: a panicking handler becomes a 500 envelope instead of
/// a dropped connection.
fn handle_panic(_: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("request handler panicked");
    ApiError::internal("unexpected server error").into_response()
}

/// Assembles the HTTP router.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(system::root))
        .route("/v1/health", get(system::health))
        .route("/.well-known/jwks.json", get(system::jwks))
        .route(instances::SYNC_PATH, post(instances::sync))
        .route(instances::DEREGISTER_PATH, post(instances::deregister))
        .route(instances::STATUS_PATH, post(instances::status))
        .fallback(system::not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The HTTP server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Creates a server over prepared application state.
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Binds the configured port and serves until the process exits.
    ///
    /// # Errors
    ///
    /// Returns an error when binding or serving fails.
    pub async fn serve(self) -> std::io::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr = %addr, "pulse api listening");
        axum::serve(listener, build_router(self.state)).await
    }
}
