//! Result type alias for transfer operations

use crate::Error;

/// Result type alias for transfer operations
pub type Result<T> = std::result::Result<T, Error>;
