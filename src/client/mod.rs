//! Client side: folder watcher, reconciling sync engine, HTTP transport.

pub mod engine;
pub mod transport;
pub mod watcher;

pub use engine::{FileSyncStatus, QueuedEvent, SyncEngine, SyncState, derive_client_id};
pub use transport::{ApiClient, UploadOutcome};
pub use watcher::{DEBOUNCE, FolderWatcher, WatchEvent, WatchKind, WatcherControl};
