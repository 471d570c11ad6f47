//! Objsync Common - Shared types and utilities
//!
//! This crate provides the data model, error definitions and configuration
//! surface used across the objsync storage core.

pub mod config;
pub mod error;
pub mod time;
pub mod types;

pub use config::{Config, MongoConfig, PayloadBackend, StorageConfig};
pub use error::{Error, Result};
pub use types::*;
