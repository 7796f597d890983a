//! Utility modules for syncbox

pub mod checksum;
pub mod fs;
pub mod id;

pub use checksum::sha256_hex;
pub use fs::write_atomic;
pub use id::generate_id;
