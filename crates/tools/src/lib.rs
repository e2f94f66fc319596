//! Tool layer: the pluggable tool registry with validated, timeout-bounded
//! dispatch, the built-in tools, and the TTL + single-flight result cache.

pub mod builtin;
pub mod cache;
pub mod registry;

pub use cache::{fingerprint, ToolCache};
pub use registry::{Tool, ToolContext, ToolDescriptor, ToolRegistry};
