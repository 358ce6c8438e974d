//! Offline survey data store for field devices.
//!
//! Provides:
//! - A versioned SQLite schema with an in-place migration chain
//! - Shared, reference-counted store handles
//! - Survey, instance, response and record repositories
//! - A file transmission ledger
//! - Incremental pull sync of data points

pub mod config;
pub mod db;
pub mod state;
pub mod sync;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use config::{ConfigError, StoreConfig};
pub use state::AppState;

/// Install the global tracing subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Calling it again is a no-op.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}

/// Load configuration, set up logging and open the store.
pub fn run() -> anyhow::Result<AppState> {
    let config = StoreConfig::from_env()?;
    init_tracing();
    AppState::open(&config)
}
