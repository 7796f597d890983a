//! On-disk stores shared by every supervised worker.

pub mod content;
pub mod metadata;

pub use content::{ContentStore, SavedBlob, validate_file_name};
pub use metadata::{CONFLICT_THRESHOLD_MS, MetadataStore, NameLock};
