//! Collaborator interfaces consumed by the protocol engine, and their
//! SQLite-backed implementation.
//!
//! Every call is a short synchronous round trip; the store provides its own
//! atomicity per call. Sessions run all of them on the blocking pool.
//! Password hashing happens outside the database lock, so a slow login never
//! holds up another session's queries.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use custodia_shared::types::{Decision, Identity, PermissionLevel, RequestId, UserId};
use custodia_store::users::{check_password, hash_password, validate_username};
use custodia_store::{
    Database, PermissionRequest, RequestFilter, StoreError, User, VerificationRecord,
};

type StoreResult<T> = Result<T, StoreError>;

/// Credential checks and self-registration.
pub trait IdentityDirectory: Send + Sync {
    /// `Some(identity)` with the *stored* level on success, `None` on any
    /// mismatch.
    fn authenticate(&self, username: &str, password: &str) -> StoreResult<Option<Identity>>;

    fn register(&self, username: &str, password: &str, level: PermissionLevel) -> StoreResult<UserId>;
}

/// Append-only verification log plus the permission workflow records.
pub trait RecordStore: Send + Sync {
    fn append_verification(&self, record: &VerificationRecord) -> StoreResult<()>;

    fn latest_verification(
        &self,
        file_name: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<Option<VerificationRecord>>;

    fn create_permission_request(
        &self,
        requester: UserId,
        level: PermissionLevel,
    ) -> StoreResult<PermissionRequest>;

    fn list_permission_requests(&self, filter: RequestFilter) -> StoreResult<Vec<PermissionRequest>>;

    fn resolve_permission_request(
        &self,
        id: RequestId,
        decision: Decision,
        resolved_by: UserId,
    ) -> StoreResult<PermissionRequest>;

    fn list_users(&self) -> StoreResult<Vec<User>>;

    fn get_user(&self, id: UserId) -> StoreResult<User>;
}

/// Shared handle to one SQLite database, usable from any session.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.db.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&guard)
    }

    /// Create `username` with admin level unless an account of that name
    /// already exists. Returns whether an account was created.
    pub fn ensure_admin(&self, username: &str, password: &str) -> StoreResult<bool> {
        if self.with_db(|db| db.find_user_by_name(username))?.is_some() {
            return Ok(false);
        }
        match self.register(username, password, PermissionLevel::Admin) {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl IdentityDirectory for SqliteStore {
    fn authenticate(&self, username: &str, password: &str) -> StoreResult<Option<Identity>> {
        let found = self.with_db(|db| db.credentials(username))?;
        let user = check_password(found, password)?;
        Ok(user.map(|u| Identity {
            user_id: u.id,
            username: u.username,
            level: u.level,
        }))
    }

    fn register(&self, username: &str, password: &str, level: PermissionLevel) -> StoreResult<UserId> {
        validate_username(username)?;
        let hash = hash_password(password)?;
        self.with_db(|db| db.insert_user(username, &hash, level))
    }
}

impl RecordStore for SqliteStore {
    fn append_verification(&self, record: &VerificationRecord) -> StoreResult<()> {
        self.with_db(|db| db.append_verification(record))
    }

    fn latest_verification(
        &self,
        file_name: &str,
        after: DateTime<Utc>,
    ) -> StoreResult<Option<VerificationRecord>> {
        self.with_db(|db| db.latest_verification(file_name, after))
    }

    fn create_permission_request(
        &self,
        requester: UserId,
        level: PermissionLevel,
    ) -> StoreResult<PermissionRequest> {
        self.with_db(|db| db.create_permission_request(requester, level))
    }

    fn list_permission_requests(&self, filter: RequestFilter) -> StoreResult<Vec<PermissionRequest>> {
        self.with_db(|db| db.list_permission_requests(filter))
    }

    fn resolve_permission_request(
        &self,
        id: RequestId,
        decision: Decision,
        resolved_by: UserId,
    ) -> StoreResult<PermissionRequest> {
        self.with_db(|db| db.resolve_permission_request(id, decision, resolved_by))
    }

    fn list_users(&self) -> StoreResult<Vec<User>> {
        self.with_db(|db| db.list_users())
    }

    fn get_user(&self, id: UserId) -> StoreResult<User> {
        self.with_db(|db| db.get_user(id))
    }
}
