//! Application state.

use std::sync::Arc;

use anyhow::Context;
use reqwest::Client;

use crate::config::StoreConfig;
use crate::db::{ConnectionManager, SurveyStore};
use crate::sync::{HttpRemoteSource, RemoteSource, SyncConfig, SyncEngine};

/// Composition root: one connection manager shared by every subsystem,
/// each of which holds its own store handle.
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub store: SurveyStore,
    pub sync: SyncEngine,
}

impl AppState {
    /// Open the configured store file and wire sync over HTTP.
    pub fn open(config: &StoreConfig) -> anyhow::Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data directory {}", parent.display()))?;
        }
        let connections = ConnectionManager::new(&config.db_path);
        Self::with_remote(connections, config, Arc::new(HttpRemoteSource::new(Client::new())))
    }

    /// Wire the subsystems onto an existing manager and remote source.
    pub fn with_remote(
        connections: Arc<ConnectionManager>,
        config: &StoreConfig,
        remote: Arc<dyn RemoteSource>,
    ) -> anyhow::Result<Self> {
        let store = SurveyStore::new(connections.open().context("opening survey store")?);
        let sync_store = SurveyStore::new(connections.open().context("opening sync store")?);
        let sync = SyncEngine::new(
            sync_store,
            remote,
            SyncConfig {
                default_base_url: config.server_url.clone(),
                api_key: config.api_key.clone(),
            },
        );
        tracing::info!(path = %config.db_path.display(), "survey store ready");
        Ok(Self {
            connections,
            store,
            sync,
        })
    }
}
