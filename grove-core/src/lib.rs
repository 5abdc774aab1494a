//! Grove Core Library
//!
//! Core functionality for Grove - a Nostr client engine.
//! This crate provides relay connection multiplexing, a local event cache
//! with per-relay provenance, and a passphrase-protected key vault.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

mod api;
pub mod cache;
pub mod config;
pub mod logging;
pub mod nostr;
pub mod relay;
pub mod vault;

pub use api::{CoreError, GroveCore, HOME_FEED_LIMIT};
pub use config::{ConfigError, CoreConfig};
