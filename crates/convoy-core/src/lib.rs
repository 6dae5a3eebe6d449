//! Shared foundation for the Convoy pipeline: configuration, error
//! taxonomy, request/result types, character-level sanitization, and
//! `@mention` override parsing.

pub mod config;
pub mod error;
pub mod logsafe;
pub mod overrides;
pub mod sanitize;
pub mod types;

pub use error::{ConvoyError, Result};
