//! # custodia-shared
//!
//! Domain types and wire helpers shared by the store and the server: user
//! identities and permission levels, permission-request and verification
//! enums, the command-line tokenizer, reply-line formatting and file-name
//! validation. Nothing in this crate performs I/O.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
pub mod verification;
