//! Domain model structs persisted in the server database.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use custodia_shared::types::{PermissionLevel, RequestId, RequestStatus, UserId};
use custodia_shared::verification::{Integrity, Outcome, ScanResult};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account. The password hash never leaves the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub level: PermissionLevel,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Permission request
// ---------------------------------------------------------------------------

/// A user's ask to move to another permission level.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PermissionRequest {
    pub id: RequestId,
    pub requester_id: UserId,
    /// Username of the requester, joined in for display.
    pub requester_name: String,
    pub requested_level: PermissionLevel,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<UserId>,
}

/// Which requests a listing should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestFilter {
    /// Every pending request, for administrators.
    Pending,
    /// All requests (any status) made by one user.
    ByRequester(UserId),
}

// ---------------------------------------------------------------------------
// Verification record
// ---------------------------------------------------------------------------

/// Stored outcome of the integrity and malware checks for one uploaded file
/// version. Records are appended, never updated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationRecord {
    pub file_name: String,
    pub outcome: Outcome,
    pub integrity: Integrity,
    pub scan_result: ScanResult,
    /// Hex SHA-256 of the stored content, when it could be computed.
    pub actual_hash: Option<String>,
    /// Hex SHA-256 the uploader (or a sidecar file) said to expect.
    pub expected_hash: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

// Fixed precision keeps lexicographic order equal to chronological order.
pub(crate) fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn decode_text<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = custodia_shared::error::ParseError>,
{
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}
