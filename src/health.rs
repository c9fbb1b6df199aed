//! Health Aggregator: liveness probe plus a background per-route reachability
//! sweep exposed via `GET /status`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::HealthConfig;
use crate::router::RouteTable;

/// Snapshot of a single backend's last probe outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RouteHealth {
    reachable: bool,
    latency_ms: u64,
    last_checked_at: DateTime<Utc>,
}

/// Runs a background probe loop against every configured route and serves
/// the latest snapshot without blocking on a fresh probe per request.
pub struct HealthAggregator {
    snapshots: Arc<RwLock<HashMap<String, RouteHealth>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl HealthAggregator {
    /// Spawn the background probe loop. The loop stops when the returned
    /// aggregator (and its shutdown sender) is dropped.
    #[must_use]
    pub fn spawn(routes: Arc<RouteTable>, config: HealthConfig, client: reqwest::Client) -> Self {
        let snapshots = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let loop_snapshots = snapshots.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.probe_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        probe_all(&routes, &client, config.probe_timeout, &loop_snapshots).await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("health probe loop shutting down");
                        break;
                    }
                }
            }
        });

        Self { snapshots, shutdown_tx }
    }

    /// Current snapshot for every configured route, keyed by service name.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, RouteHealth> {
        self.snapshots.read().clone()
    }

    /// Stop the background probe loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn probe_all(
    routes: &RouteTable,
    client: &reqwest::Client,
    timeout: Duration,
    snapshots: &RwLock<HashMap<String, RouteHealth>>,
) {
    for route in routes.iter() {
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, client.get(&route.base_url).send()).await;
        let reachable = matches!(result, Ok(Ok(resp)) if resp.status().is_success() || resp.status().is_redirection());
        if !reachable {
            warn!(service = %route.name, "probe reported backend unreachable");
        }
        let health = RouteHealth {
            reachable,
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            last_checked_at: Utc::now(),
        };
        snapshots.write().insert(route.name.clone(), health);
    }
}

/// `GET /health` — unconditional liveness check. Never reflects backend
/// reachability; a 200 here means only that the gateway process is running.
pub async fn liveness() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

/// `GET /status` — most recent reachability snapshot for every configured route.
pub async fn status(State(state): State<crate::state::AppState>) -> Response {
    Json(state.health.snapshot()).into_response()
}
