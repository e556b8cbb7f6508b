//! tallystore common - shared types, settings and errors
//!
//! This crate provides the value types, store settings, content hashing and
//! the error type used by the storage engine and its tooling.

pub mod config;
pub mod error;
pub mod hash;
pub mod types;

pub use config::{PoolConfig, StoreSettings};
pub use error::{Error, Result};
pub use hash::ContentHasher;
pub use types::*;
