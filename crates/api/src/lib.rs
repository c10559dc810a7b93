// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps sqlx::Error
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ThinkInk API Library
//!
//! HTTP surface for ThinkInk: accounts, bearer authentication with revocation, and the
//! billing endpoints backed by `thinkink-billing`.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError, LogFormat};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;

/// Embedded SQL migrations for the `users`, `revoked_tokens` and `password_resets` tables
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
