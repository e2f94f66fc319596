//! Hybrid session/history store: a sharded in-memory hot tier with a rolling
//! per-session message window, backed by an optional durable tier.

pub mod durable;
pub mod history;
pub mod lifecycle;

pub use durable::{DurableStore, FileDurableStore, ToolCallRecord};
pub use history::{SessionMeta, SessionStatus, SessionStore, StoreStats};
pub use lifecycle::IdlePolicy;
