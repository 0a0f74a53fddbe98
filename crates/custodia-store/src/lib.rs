//! # custodia-store
//!
//! Durable metadata for the Custodia file server, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for the three record kinds the
//! server needs: users (the identity directory, with argon2id password
//! hashes), permission requests, and verification records.

pub mod database;
pub mod migrations;
pub mod models;
pub mod permission_requests;
pub mod users;
pub mod verifications;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
