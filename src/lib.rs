//! Kilo API Gateway
//!
//! A reverse proxy and admission controller fronting independent
//! microservices behind a single listen address.
//!
//! # Components
//!
//! - **Router**: resolves `/<service>/...` to a configured backend.
//! - **Admission**: mints, validates, and revokes admin bearer tokens.
//! - **Proxy Engine**: forwards requests, streaming bodies through untouched
//!   above a size/content-type threshold, retrying idempotent methods with
//!   backoff, and enforcing per-backend concurrency limits.
//! - **Health Aggregator**: background reachability probes exposed at `/status`.
//! - **Persistence**: a durable SQLite-backed admin token store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod proxy;
pub mod router;
pub mod server;
pub mod state;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
