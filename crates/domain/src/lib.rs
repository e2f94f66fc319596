//! Shared domain types for VoxGate: error kinds, conversation messages,
//! LLM stream deltas, the versioned client event schema, model capabilities,
//! and configuration.

pub mod capability;
pub mod config;
pub mod error;
pub mod event;
pub mod message;
pub mod stream;

pub use error::{Error, Result};
