//! Cache file name validation.

use crate::error::CacheError;

/// Check that `name` names a plain file directly inside the cache directory.
pub fn validate(name: &str) -> Result<(), CacheError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name == "." || name == ".." {
        "name refers to a directory"
    } else if name.contains('/') || name.contains('\\') {
        "name contains a path separator"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else {
        return Ok(());
    };

    Err(CacheError::InvalidName {
        name: name.to_owned(),
        reason,
    })
}
