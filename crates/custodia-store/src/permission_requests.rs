use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use custodia_shared::types::{Decision, PermissionLevel, RequestId, RequestStatus, UserId};

use crate::database::Database;
use crate::error::{is_constraint_violation, Result, StoreError};
use crate::models::{decode_text, decode_ts, encode_ts, PermissionRequest, RequestFilter};

const SELECT_REQUEST: &str = "SELECT r.id, r.requester_id, u.username, r.requested_level, r.status,
            r.created_at, r.resolved_at, r.resolved_by
     FROM permission_requests r
     JOIN users u ON u.id = r.requester_id";

impl Database {
    /// Record a new pending request. A second pending request for the same
    /// `(requester, level)` pair is refused with [`StoreError::AlreadyExists`].
    pub fn create_permission_request(
        &self,
        requester: UserId,
        level: PermissionLevel,
    ) -> Result<PermissionRequest> {
        let inserted = self.conn().execute(
            "INSERT INTO permission_requests (requester_id, requested_level, status, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                requester.0,
                level.as_str(),
                RequestStatus::Pending.as_str(),
                encode_ts(&Utc::now()),
            ],
        );

        match inserted {
            Ok(_) => {
                let id = RequestId(self.conn().last_insert_rowid());
                tracing::info!(request = %id, requester = %requester, level = %level, "permission request created");
                self.get_permission_request(id)
            }
            Err(e) if is_constraint_violation(&e) => Err(StoreError::AlreadyExists(format!(
                "pending request for level {level}"
            ))),
            Err(e) => Err(StoreError::Sqlite(e)),
        }
    }

    pub fn get_permission_request(&self, id: RequestId) -> Result<PermissionRequest> {
        self.conn()
            .query_row(
                &format!("{SELECT_REQUEST} WHERE r.id = ?1"),
                params![id.0],
                row_to_request,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn list_permission_requests(&self, filter: RequestFilter) -> Result<Vec<PermissionRequest>> {
        let (sql, arg) = match filter {
            RequestFilter::Pending => (
                format!("{SELECT_REQUEST} WHERE r.status = ?1 ORDER BY r.id ASC"),
                rusqlite::types::Value::Text(RequestStatus::Pending.as_str().to_string()),
            ),
            RequestFilter::ByRequester(user) => (
                format!("{SELECT_REQUEST} WHERE r.requester_id = ?1 ORDER BY r.id ASC"),
                rusqlite::types::Value::Integer(user.0),
            ),
        };

        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map(params![arg], row_to_request)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Move a pending request to its terminal status. On approval the
    /// requester's permission level is updated in the same transaction.
    ///
    /// Resolving an already-resolved request fails with
    /// [`StoreError::InvalidState`] and changes nothing.
    pub fn resolve_permission_request(
        &self,
        id: RequestId,
        decision: Decision,
        resolved_by: UserId,
    ) -> Result<PermissionRequest> {
        let tx = self.conn().unchecked_transaction()?;

        let current = tx
            .query_row(
                "SELECT requester_id, requested_level, status FROM permission_requests WHERE id = ?1",
                params![id.0],
                |row| {
                    let requester: i64 = row.get(0)?;
                    let level: String = row.get(1)?;
                    let status: String = row.get(2)?;
                    Ok((
                        UserId(requester),
                        decode_text::<PermissionLevel>(1, &level)?,
                        decode_text::<RequestStatus>(2, &status)?,
                    ))
                },
            )
            .optional()?;

        let Some((requester, level, status)) = current else {
            return Err(StoreError::NotFound);
        };
        if status.is_terminal() {
            return Err(StoreError::InvalidState(format!(
                "request {id} already {status}"
            )));
        }

        let new_status = decision.resulting_status();
        tx.execute(
            "UPDATE permission_requests
             SET status = ?1, resolved_at = ?2, resolved_by = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                new_status.as_str(),
                encode_ts(&Utc::now()),
                resolved_by.0,
                id.0,
                RequestStatus::Pending.as_str(),
            ],
        )?;

        if decision == Decision::Approve {
            tx.execute(
                "UPDATE users SET permission_level = ?1 WHERE id = ?2",
                params![level.as_str(), requester.0],
            )?;
        }

        tx.commit()?;

        tracing::info!(
            request = %id,
            requester = %requester,
            status = %new_status,
            resolved_by = %resolved_by,
            "permission request resolved"
        );

        self.get_permission_request(id)
    }
}

fn row_to_request(row: &rusqlite::Row<'_>) -> rusqlite::Result<PermissionRequest> {
    let id: i64 = row.get(0)?;
    let requester_id: i64 = row.get(1)?;
    let requester_name: String = row.get(2)?;
    let level_str: String = row.get(3)?;
    let status_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let resolved_str: Option<String> = row.get(6)?;
    let resolved_by: Option<i64> = row.get(7)?;

    Ok(PermissionRequest {
        id: RequestId(id),
        requester_id: UserId(requester_id),
        requester_name,
        requested_level: decode_text(3, &level_str)?,
        status: decode_text(4, &status_str)?,
        created_at: decode_ts(5, &created_str)?,
        resolved_at: resolved_str.map(|s| decode_ts(6, &s)).transpose()?,
        resolved_by: resolved_by.map(UserId),
    })
}
