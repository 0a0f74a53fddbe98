//! # custodia-server
//!
//! Protocol engine of the Custodia file server: a TLS listener, one session
//! per connection, a username/password handshake, a permission-gated command
//! dispatcher, length-prefixed upload/download, and an asynchronous
//! verification pipeline that hashes and scans every upload.

pub mod auth;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod framing;
pub mod listener;
pub mod ports;
pub mod session;
pub mod tls;
pub mod transfer;
pub mod verify;
pub mod workflow;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use error::{FramingError, ServerError, TransferError};
pub use listener::{start, BindError, ListenerHandle, ListenerOptions};
pub use ports::{IdentityDirectory, RecordStore, SqliteStore};
pub use session::{ServerContext, Session};
pub use verify::{InlineBackend, VerificationBackend, WorkerPoolBackend};
