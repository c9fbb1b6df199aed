//! Top-level gateway: wires the router, admission, proxy engine, and health
//! aggregator into one axum `Router` and runs it with graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::admission::{Admission, SqliteTokenStore, handler as admin_handler};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::health::{self, HealthAggregator};
use crate::proxy::ProxyEngine;
use crate::router::{RouteTable, is_reserved_path};
use crate::state::AppState;

/// Owns every long-lived component and the bound listener.
pub struct Gateway {
    state: AppState,
    listen_addr: SocketAddr,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Build every component from configuration. Opens the durable token
    /// store, which may fail if the schema on disk is from a newer build.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the token store cannot be opened,
    /// or [`Error::Config`] if `server.listen_addr` does not parse.
    pub async fn new(config: Config) -> Result<Self> {
        let listen_addr: SocketAddr = config
            .server
            .listen_addr
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen_addr: {e}")))?;

        let routes = Arc::new(RouteTable::from_config(&config));

        let store_path = std::path::Path::new(&config.admission.token_store_path);
        let store = Arc::new(SqliteTokenStore::open(store_path)?);
        let admission = Arc::new(Admission::new(store, &config.admission));

        let proxy = Arc::new(ProxyEngine::new(config.proxy.clone())?);

        let probe_client = reqwest::Client::builder()
            .timeout(config.health.probe_timeout)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        let health = Arc::new(HealthAggregator::spawn(routes.clone(), config.health.clone(), probe_client));

        let state = AppState {
            routes,
            admission,
            proxy,
            health,
        };

        Ok(Self {
            state,
            listen_addr,
            shutdown_timeout: config.server.shutdown_timeout,
        })
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health::liveness))
            .route("/status", get(health::status))
            .route("/admin/tokens", post(admin_handler::create_token).get(admin_handler::list_tokens))
            .route("/admin/tokens/{id}/revoke", post(admin_handler::revoke_token))
            .route("/admin/validate", post(admin_handler::validate_token))
            .fallback(proxy_fallback)
            .with_state(self.state.clone())
    }

    /// Bind the listen address and serve until a shutdown signal arrives,
    /// draining in-flight connections for up to `shutdown_timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the address cannot be bound.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(addr = %self.listen_addr, "gateway listening");

        let shutdown_timeout = self.shutdown_timeout;
        let health = self.state.health.clone();
        let app = self.router().into_make_service_with_connect_info::<SocketAddr>();

        let (force_tx, force_rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async move {
            shutdown_signal().await;
            tokio::spawn(async move {
                tokio::time::sleep(shutdown_timeout).await;
                let _ = force_tx.send(());
            });
        };

        let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown);

        let result = tokio::select! {
            r = serve => r.map_err(Error::Io),
            _ = force_rx => {
                warn!(?shutdown_timeout, "graceful drain exceeded timeout, forcing shutdown");
                Ok(())
            }
        };

        health.shutdown();
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    warn!("shutdown signal received, draining connections");
}

/// Every request that does not match `/health`, `/status`, or `/admin/...`
/// falls here: resolve the first path segment to a configured route and
/// hand off to the proxy engine.
async fn proxy_fallback(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let path = request.uri().path();
    if is_reserved_path(path) {
        return Error::RouteNotFound(path.to_string()).into_response();
    }

    let (route, tail) = match state.routes.resolve(path) {
        Ok(resolved) => resolved,
        Err(e) => return e.into_response(),
    };

    if route.protected {
        let headers = request.headers();
        let token = headers
            .get("x-admin-token")
            .and_then(|v| v.to_str().ok());
        let valid = match token {
            Some(t) => state.admission.validate(t).await.unwrap_or(false),
            None => false,
        };
        if !valid {
            return Error::Unauthorized.into_response();
        }
    }

    let query = request.uri().query().map(str::to_string);
    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = request.into_body();

    state
        .proxy
        .forward(route, tail, query.as_deref(), method, headers, body, client_addr)
        .await
}
