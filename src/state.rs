//! Shared application state threaded through every axum handler.

use std::sync::Arc;

use crate::admission::Admission;
use crate::health::HealthAggregator;
use crate::proxy::ProxyEngine;
use crate::router::RouteTable;

/// Cheaply `Clone`-able handle shared by every request, per axum's
/// `State<S>` extractor contract.
#[derive(Clone)]
pub struct AppState {
    /// Static route table resolved from configuration at startup.
    pub routes: Arc<RouteTable>,
    /// Admin token bootstrap/validate/revoke coordinator.
    pub admission: Arc<Admission>,
    /// Proxy engine forwarding requests to backends.
    pub proxy: Arc<ProxyEngine>,
    /// Background health/status aggregator.
    pub health: Arc<HealthAggregator>,
}
