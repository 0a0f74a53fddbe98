//! Permission requests: `pending -> approved | rejected`.
//!
//! The admin-only gate on resolution lives in the dispatcher; these functions
//! trust their caller's level and only enforce the workflow rules.

use tracing::info;

use custodia_shared::types::{Decision, Identity, PermissionLevel, RequestId, RequestStatus};
use custodia_store::{PermissionRequest, RequestFilter, StoreError};

use crate::error::ServerError;
use crate::ports::RecordStore;

/// File a request for `level`. Refused when the caller's *stored* level
/// already covers it or a request for it is already pending.
pub fn request_permission(
    records: &dyn RecordStore,
    caller: &Identity,
    level: PermissionLevel,
) -> Result<PermissionRequest, ServerError> {
    let current = records.get_user(caller.user_id)?;
    if current.level.satisfies(level) {
        return Err(ServerError::conflict(format!(
            "Ya tiene el nivel {}",
            current.level
        )));
    }

    match records.create_permission_request(caller.user_id, level) {
        Ok(request) => {
            info!(user = %caller.username, request = %request.id, level = %level, "Permission requested");
            Ok(request)
        }
        Err(StoreError::AlreadyExists(_)) => Err(ServerError::conflict(format!(
            "Ya existe una solicitud pendiente para el nivel {level}"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Approve or reject a pending request. Approval changes the requester's
/// stored level; live sessions keep the level they logged in with.
pub fn resolve_request(
    records: &dyn RecordStore,
    admin: &Identity,
    id: RequestId,
    decision: Decision,
) -> Result<PermissionRequest, ServerError> {
    match records.resolve_permission_request(id, decision, admin.user_id) {
        Ok(request) => {
            info!(
                admin = %admin.username,
                request = %id,
                requester = %request.requester_name,
                status = %request.status,
                "Permission request resolved"
            );
            Ok(request)
        }
        Err(StoreError::NotFound) => Err(ServerError::not_found(format!(
            "La solicitud {id} no existe"
        ))),
        Err(StoreError::InvalidState(_)) => Err(ServerError::conflict(format!(
            "La solicitud {id} ya fue resuelta"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// All pending requests for an admin; the caller's own requests, in any
/// status, for a user.
pub fn visible_requests(
    records: &dyn RecordStore,
    caller: &Identity,
) -> Result<Vec<PermissionRequest>, ServerError> {
    let filter = match caller.level {
        PermissionLevel::Admin => RequestFilter::Pending,
        PermissionLevel::User => RequestFilter::ByRequester(caller.user_id),
    };
    Ok(records.list_permission_requests(filter)?)
}

/// `#3 bob -> admin (pending, 2026-01-02 10:00)`
pub fn describe(request: &PermissionRequest) -> String {
    let mut text = format!(
        "{} {} -> {} ({}, {}",
        request.id,
        request.requester_name,
        request.requested_level,
        request.status,
        request.created_at.format("%Y-%m-%d %H:%M")
    );
    if request.status != RequestStatus::Pending {
        if let Some(at) = request.resolved_at {
            text.push_str(&format!(", resuelta {}", at.format("%Y-%m-%d %H:%M")));
        }
    }
    text.push(')');
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{IdentityDirectory, SqliteStore};
    use custodia_store::Database;

    fn setup() -> (SqliteStore, Identity, Identity) {
        let store = SqliteStore::new(Database::open_in_memory().unwrap());
        store.register("bob", "pw", PermissionLevel::User).unwrap();
        store.register("root", "pw", PermissionLevel::Admin).unwrap();
        let bob = store.authenticate("bob", "pw").unwrap().unwrap();
        let root = store.authenticate("root", "pw").unwrap().unwrap();
        (store, bob, root)
    }

    #[test]
    fn test_second_request_reports_already_pending() {
        let (store, bob, _) = setup();
        request_permission(&store, &bob, PermissionLevel::Admin).unwrap();
        let err = request_permission(&store, &bob, PermissionLevel::Admin).unwrap_err();
        assert!(err.client_message().contains("pendiente"));

        let mine = visible_requests(&store, &bob).unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].status, RequestStatus::Pending);
    }

    #[test]
    fn test_request_for_held_level_refused() {
        let (store, bob, root) = setup();
        assert!(matches!(
            request_permission(&store, &root, PermissionLevel::Admin),
            Err(ServerError::Conflict(_))
        ));
        assert!(matches!(
            request_permission(&store, &bob, PermissionLevel::User),
            Err(ServerError::Conflict(_))
        ));
    }

    #[test]
    fn test_held_level_uses_stored_state() {
        let (store, bob, root) = setup();
        let req = request_permission(&store, &bob, PermissionLevel::Admin).unwrap();
        resolve_request(&store, &root, req.id, Decision::Approve).unwrap();

        // `bob` still carries the stale login level here.
        assert_eq!(bob.level, PermissionLevel::User);
        assert!(matches!(
            request_permission(&store, &bob, PermissionLevel::Admin),
            Err(ServerError::Conflict(_))
        ));
    }

    #[test]
    fn test_resolution_errors() {
        let (store, bob, root) = setup();
        assert!(matches!(
            resolve_request(&store, &root, RequestId(99), Decision::Approve),
            Err(ServerError::NotFound(_))
        ));

        let req = request_permission(&store, &bob, PermissionLevel::Admin).unwrap();
        resolve_request(&store, &root, req.id, Decision::Reject).unwrap();
        assert!(matches!(
            resolve_request(&store, &root, req.id, Decision::Approve),
            Err(ServerError::Conflict(_))
        ));
        assert_eq!(
            store.authenticate("bob", "pw").unwrap().unwrap().level,
            PermissionLevel::User
        );
    }

    #[test]
    fn test_visibility_by_level() {
        let (store, bob, root) = setup();
        store.register("carol", "pw", PermissionLevel::User).unwrap();
        let carol = store.authenticate("carol", "pw").unwrap().unwrap();

        let a = request_permission(&store, &bob, PermissionLevel::Admin).unwrap();
        request_permission(&store, &carol, PermissionLevel::Admin).unwrap();
        resolve_request(&store, &root, a.id, Decision::Reject).unwrap();

        let admin_view = visible_requests(&store, &root).unwrap();
        assert_eq!(admin_view.len(), 1);
        assert_eq!(admin_view[0].requester_name, "carol");

        let bob_view = visible_requests(&store, &bob).unwrap();
        assert_eq!(bob_view.len(), 1);
        assert_eq!(bob_view[0].status, RequestStatus::Rejected);
        assert!(describe(&bob_view[0]).contains("rejected"));
    }
}
