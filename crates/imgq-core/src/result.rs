//! Result type aliases for imgq.

use crate::ImgqError;

/// A specialized `Result` type for imgq operations.
pub type ImgqResult<T> = Result<T, ImgqError>;
