//! Notehost Core Library
//!
//! Shared foundations for the notehost extension host:
//! - Error taxonomy with stable codes
//! - TOML configuration with validation
//! - Host-domain collaborators (notes, users, attachments, preferences)

pub mod config;
pub mod domain;
pub mod error;

pub use error::{Error, Result};
