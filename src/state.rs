use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::error::Result;
use crate::services::{ChunkAssembler, UploadWindow};
use crate::storage::{ContentStore, MetadataStore};

/// Application state shared across all HTTP handlers.
///
/// The stores point at directories shared by every supervised worker; the
/// upload window is the only per-process piece.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub content: ContentStore,
    pub metadata: MetadataStore,
    pub assembler: ChunkAssembler,
    pub window: Arc<UploadWindow>,
    pub started_at: Instant,
}

impl AppState {
    /// Builds the state from configuration. Call [`AppState::init_storage`]
    /// before serving.
    pub fn new(config: Config) -> Self {
        let storage = &config.storage;
        let content = ContentStore::new(storage.files_dir(), storage.versions_dir());
        let metadata = MetadataStore::new(storage.metadata_dir(), storage.conflicts_dir());
        let assembler = ChunkAssembler::new(storage.chunks_dir());
        Self {
            config,
            content,
            metadata,
            assembler,
            window: Arc::new(UploadWindow::new()),
            started_at: Instant::now(),
        }
    }

    /// Creates the storage directories and runs the one-time metadata
    /// migration.
    pub async fn init_storage(&self) -> Result<()> {
        self.content.init().await?;
        self.metadata.init().await?;
        self.assembler.init().await?;
        Ok(())
    }
}
