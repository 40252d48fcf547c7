/// Per-file coordination of reads, writes and expiry.
pub(crate) mod entity;
/// Fair read-concurrency limits.
pub mod limiter;
/// State-transition events and the observer hook.
pub mod observer;
/// Rearm-on-access idle timers.
pub mod ttl;

pub(crate) use entity::CacheEntity;
pub use entity::WriteOutcome;
