//! Mapping cache file names onto the underlying filesystem.

/// File identity and the name → entity registry.
pub mod identity;
/// Cache file name validation.
pub mod names;

pub use identity::EntityKey;
