//! Common types and abstractions
//!
//! This module defines the core types used throughout the crate:
//! - Stream: unified async I/O abstraction
//! - Endpoint: remote host/port pair, never pre-resolved
//! - Error: unified error types

mod address;
mod stream;

pub use address::Endpoint;
pub use stream::{IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
