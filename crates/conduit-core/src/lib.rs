//! # conduit-core
//!
//! Core types, traits, and completion-signaling primitives for the conduit
//! ingestion pipeline.
//!
//! This crate provides the data structures and trait definitions that the
//! other conduit crates depend on.

pub mod completion;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod traits;

// Re-export commonly used types at crate root
pub use completion::{CompletionToken, ScopeCounter};
pub use error::{Error, Result};
pub use events::{EventBus, EventContext, EventEnvelope, ServerEvent};
pub use models::*;
pub use pgvector::Vector;
pub use traits::*;
