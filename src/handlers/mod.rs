pub mod conflicts;
pub mod files;
pub mod health;

pub use conflicts::*;
pub use files::*;
pub use health::*;

use crate::error::Error;

pub(crate) fn log_handler_error(operation: &str, e: &Error) {
    match e {
        Error::BadRequest(_)
        | Error::NotFound(_)
        | Error::Conflict { .. }
        | Error::PayloadTooLarge(_) => {
            tracing::warn!(operation = operation, error = %e, "Handler operation failed");
        }
        _ => {
            tracing::error!(operation = operation, error = %e, "Handler operation failed");
        }
    }
}
