//! MirrorIO Common - Shared types and utilities
//!
//! This crate provides the sector/slot vocabulary, configuration structures
//! and error definitions used by the mirror engine and its tooling.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
