//! Shared types and infrastructure for CardVault modules
//!
//! Provides the common error type, the engine event bus, configuration
//! loading, and SQLite pool initialization used by the orchestration
//! engine.

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
