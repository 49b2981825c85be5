//! Application state shared by the CLI commands.
//!
//! AppState pins the engine's storage and throttling seams to the concrete
//! infra implementations rooted at the resolved data directory.

use std::path::PathBuf;
use std::sync::Arc;

use pipeworks_core::throttle::Throttle;
use pipeworks_infra::config::load_global_config;
use pipeworks_infra::filesystem::{DataLayout, FsCheckpointStore};
use pipeworks_infra::manager::ExecutionManager;
use pipeworks_types::config::GlobalConfig;

#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub layout: DataLayout,
    pub config: GlobalConfig,
    pub store: Arc<FsCheckpointStore>,
    pub throttle: Arc<Throttle>,
    pub manager: ExecutionManager,
}

impl AppState {
    /// Create the data directory tree and load `config.toml`.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        let layout = DataLayout::new(&data_dir);
        layout.ensure().await?;

        let config = load_global_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), ?config, "loaded configuration");

        Ok(Self {
            store: Arc::new(FsCheckpointStore::new(layout.clone())),
            throttle: Throttle::shared(config.throttle.clone()),
            manager: ExecutionManager::new(layout.clone()),
            data_dir,
            layout,
            config,
        })
    }
}
