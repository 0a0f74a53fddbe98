//! v001 -- Initial schema creation.
//!
//! Creates the three tables: `users`, `permission_requests` and
//! `verifications`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (identity directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    username         TEXT NOT NULL UNIQUE,
    password_hash    TEXT NOT NULL,           -- argon2id PHC string
    permission_level TEXT NOT NULL,           -- 'user' | 'admin' (legacy values tolerated)
    created_at       TEXT NOT NULL            -- RFC-3339
);

-- ----------------------------------------------------------------
-- Permission requests
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS permission_requests (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    requester_id    INTEGER NOT NULL,         -- FK -> users(id)
    requested_level TEXT NOT NULL,
    status          TEXT NOT NULL,            -- 'pending' | 'approved' | 'rejected'
    created_at      TEXT NOT NULL,
    resolved_at     TEXT,
    resolved_by     INTEGER,                  -- admin user id

    FOREIGN KEY (requester_id) REFERENCES users(id) ON DELETE CASCADE
);

-- At most one pending request per (requester, level).
CREATE UNIQUE INDEX IF NOT EXISTS idx_permission_requests_one_pending
    ON permission_requests(requester_id, requested_level)
    WHERE status = 'pending';

-- ----------------------------------------------------------------
-- Verification records (append-only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS verifications (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    file_name     TEXT NOT NULL,
    outcome       TEXT NOT NULL,
    integrity     TEXT NOT NULL,
    scan_result   TEXT NOT NULL,
    actual_hash   TEXT,
    expected_hash TEXT,
    message       TEXT NOT NULL,
    timestamp     TEXT NOT NULL               -- RFC-3339, fixed microsecond precision
);

CREATE INDEX IF NOT EXISTS idx_verifications_file_ts
    ON verifications(file_name, timestamp DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
