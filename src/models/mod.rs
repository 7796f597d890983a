pub mod conflicts;
pub mod files;
pub mod requests;

pub use conflicts::{ConflictLoser, ConflictRecord, ConflictResolution, ConflictStatus};
pub use files::{FileListing, FileRecord, parse_last_modified};
pub use requests::{
    ChunkResponse, ConflictNotice, ConflictParty, HealthResponse, MessageResponse, RenameRequest,
    ResolveConflictRequest, RestoreRequest, UploadResponse,
};
