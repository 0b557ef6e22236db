//! Test server wiring: real router over temp filesystem storage and a
//! SQLite metadata store.

use depot_core::config::AppConfig;
use depot_metadata::{MetadataStore, SqliteStore};
use depot_server::{AppState, create_router};
use std::sync::Arc;
use tempfile::TempDir;

/// A test server with all dependencies. Note: #[allow(dead_code)] because
/// each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub state: AppState,
    /// Concrete store handle for tests that need raw SQL access (e.g.
    /// forcing ref-count drift).
    pub sqlite: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a test server with default test configuration.
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Create a test server with config modifications applied on top of the
    /// testing defaults.
    pub async fn with_config<F>(modifier: F) -> Self
    where
        F: FnOnce(&mut AppConfig),
    {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        let mut config = AppConfig::for_testing(temp_dir.path());
        modifier(&mut config);

        let storage = depot_storage::from_config(&config.storage)
            .await
            .expect("failed to build storage orchestrator");

        let sqlite = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"))
                .await
                .expect("failed to create metadata store"),
        );
        let metadata: Arc<dyn MetadataStore> = sqlite.clone();

        let state = AppState::new(config, metadata, storage);
        let router = create_router(state.clone());

        Self {
            router,
            state,
            sqlite,
            _temp_dir: temp_dir,
        }
    }

    /// Clone of the router for oneshot requests.
    pub fn app(&self) -> axum::Router {
        self.router.clone()
    }
}
