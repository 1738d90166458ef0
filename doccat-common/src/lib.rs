//! # doccat Common Library
//!
//! Shared code for the doccat services including:
//! - Error and result types
//! - Event types (DoccatEvent enum) and the EventBus
//! - Bootstrap configuration loading and root folder resolution
//! - Database pool initialization helpers
//! - Timestamp helpers
//! - SSE streaming of bus events

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
