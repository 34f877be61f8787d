//! Shared library for the payments backend services
//!
//! This crate provides common functionality used across the backend services:
//! - Database connection pooling and migrations
//! - Error handling types
//! - Configuration management
//! - Logging infrastructure

pub mod config;
pub mod db;
pub mod error;

// Re-export commonly used types
pub use config::Config;
pub use db::DbPool;
pub use error::{Error, Result};

/// Initialize structured logging for a payments service
///
/// `RUST_LOG` overrides the default filter, which keeps the payments crates
/// at debug and everything else at info. Payment transitions are logged with
/// structured fields (payment id, from/to state, attempts), so the plain
/// formatter is enough; no JSON layer.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "info,shared=debug,payment_engine=debug,payment_worker=debug".into()
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
