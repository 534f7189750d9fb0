//! Core type definitions for the Quill library.
//!
//! Conversation messages, the outgoing request envelope, and the response
//! shapes shared by the direct and optimized paths.

pub mod content;
pub mod envelope;
pub mod messages;

// Re-export commonly used types
pub use content::*;
pub use envelope::*;
pub use messages::*;

/// Identifier of a clinical workflow ("tavi", "quick-letter", ...)
pub type TaskId = String;
