//! The flat directory that holds stored files.
//!
//! Client-visible names map 1:1 to entries in the base directory. Names are
//! validated before any path is built, so a name can never point outside it.
//! Uploads are written to a hidden temporary file and published with a hard
//! link, which fails instead of overwriting when the target already exists.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use custodia_shared::constants::{SIDECAR_HASH_EXTENSION, TEMP_FILE_PREFIX};
use custodia_shared::protocol::{is_sha256_hex, validate_file_name};

use crate::error::ServerError;

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the base directory and remove temporaries
    /// left behind by an earlier crash.
    pub async fn open(base_path: PathBuf) -> std::io::Result<Self> {
        fs::create_dir_all(&base_path).await?;

        let mut swept = 0usize;
        let mut entries = fs::read_dir(&base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(TEMP_FILE_PREFIX));
            if is_temp && fs::remove_file(entry.path()).await.is_ok() {
                swept += 1;
            }
        }

        info!(path = %base_path.display(), swept, "File store initialized");
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Validated absolute path of a client-visible name.
    pub fn path_of(&self, name: &str) -> Result<PathBuf, ServerError> {
        validate_file_name(name)?;
        Ok(self.base_path.join(name))
    }

    /// Regular files in the base directory, sorted by name. Temporaries and
    /// names that are not valid UTF-8 are skipped.
    pub async fn list(&self) -> std::io::Result<Vec<FileEntry>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with(TEMP_FILE_PREFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            files.push(FileEntry {
                name,
                size: meta.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    /// Size and modification time of a stored file, `None` when absent.
    pub async fn stat(&self, name: &str) -> Result<Option<(u64, DateTime<Utc>)>, ServerError> {
        let path = self.path_of(name)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => {
                let modified: DateTime<Utc> = meta.modified()?.into();
                Ok(Some((meta.len(), modified)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool, ServerError> {
        Ok(self.stat(name).await?.is_some())
    }

    /// Start an upload into a fresh hidden temporary file.
    pub async fn begin_upload(&self) -> std::io::Result<PendingUpload> {
        let path = self
            .base_path
            .join(format!("{TEMP_FILE_PREFIX}{}", Uuid::new_v4()));
        let file = File::create(&path).await?;
        debug!(temp = %path.display(), "Upload started");
        Ok(PendingUpload {
            path,
            file,
            published: false,
        })
    }

    pub async fn delete(&self, name: &str) -> Result<(), ServerError> {
        let path = self.path_of(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(file = %name, "Deleted file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(name)),
            Err(e) => Err(e.into()),
        }
    }

    /// Rename without ever replacing an existing destination.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), ServerError> {
        let src = self.path_of(from)?;
        let dst = self.path_of(to)?;

        if !self.exists(from).await? {
            return Err(not_found(from));
        }
        if from == to {
            return Err(conflict(to));
        }

        match fs::hard_link(&src, &dst).await {
            Ok(()) => {
                if let Err(e) = fs::remove_file(&src).await {
                    // Both names now refer to the content; drop the new one.
                    let _ = fs::remove_file(&dst).await;
                    return Err(e.into());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(conflict(to)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(from)),
            Err(e) => {
                warn!(error = %e, "hard link unavailable, falling back to rename");
                if fs::try_exists(&dst).await? {
                    return Err(conflict(to));
                }
                fs::rename(&src, &dst).await?;
            }
        }

        debug!(from = %from, to = %to, "Renamed file");
        Ok(())
    }

    /// Open a stored file for streaming, returning it with its size.
    pub async fn open_for_download(&self, name: &str) -> Result<(File, u64), ServerError> {
        let path = self.path_of(name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found(name)),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(not_found(name));
        }
        Ok((file, meta.len()))
    }
}

/// Expected hash recorded in `<path>.sha256`, if that file exists and starts
/// with a well-formed hex digest. Accepts the `sha256sum` output format.
pub fn read_sidecar_hash(path: &Path) -> Option<String> {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".");
    sidecar.push(SIDECAR_HASH_EXTENSION);

    let content = std::fs::read_to_string(PathBuf::from(sidecar)).ok()?;
    let token = content.split_whitespace().next()?;
    is_sha256_hex(token).then(|| token.to_ascii_lowercase())
}

fn not_found(name: &str) -> ServerError {
    ServerError::not_found(format!("El archivo '{name}' no existe"))
}

fn conflict(name: &str) -> ServerError {
    ServerError::conflict(format!("El archivo '{name}' ya existe"))
}

/// An upload being written. Dropping it without [`PendingUpload::publish`]
/// removes the temporary file.
pub struct PendingUpload {
    path: PathBuf,
    file: File,
    published: bool,
}

impl PendingUpload {
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// Flush to disk and link the temporary under `target`. Fails with
    /// `AlreadyExists` instead of replacing an existing file.
    pub async fn publish(mut self, target: &Path) -> std::io::Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        match fs::hard_link(&self.path, target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Err(e),
            Err(e) => {
                warn!(error = %e, "hard link unavailable, falling back to rename");
                if fs::try_exists(target).await? {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "target exists",
                    ));
                }
                fs::rename(&self.path, target).await?;
                self.published = true;
                return Ok(());
            }
        }

        self.published = true;
        let _ = fs::remove_file(&self.path).await;
        Ok(())
    }
}

impl Drop for PendingUpload {
    fn drop(&mut self) {
        if !self.published {
            if std::fs::remove_file(&self.path).is_ok() {
                debug!(temp = %self.path.display(), "Discarded partial upload");
            }
        }
    }
}

/// Optional per-name serialization of file operations.
///
/// Disabled by default, in which case [`FileLocks::acquire`] returns
/// immediately and concurrent sessions may interleave on the same name.
#[derive(Clone, Default)]
pub struct FileLocks {
    table: Option<Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>>,
}

/// Held locks; released on drop.
pub struct FileLease {
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl FileLocks {
    pub fn new(enabled: bool) -> Self {
        Self {
            table: enabled.then(Default::default),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.table.is_some()
    }

    /// Lock every name in `names`. Names are locked in sorted order so two
    /// renames over the same pair cannot deadlock.
    pub async fn acquire(&self, names: &[&str]) -> FileLease {
        let Some(table) = &self.table else {
            return FileLease { _guards: Vec::new() };
        };

        let mut sorted: Vec<&str> = names.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let locks: Vec<_> = {
            let mut map = table.lock().unwrap_or_else(|p| p.into_inner());
            // Entries referenced only by the table are idle.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            sorted
                .iter()
                .map(|name| map.entry((*name).to_string()).or_default().clone())
                .collect()
        };

        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        FileLease { _guards: guards }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn test_store() -> (FileStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        (store, dir)
    }

    async fn put(store: &FileStore, name: &str, data: &[u8]) {
        let mut upload = store.begin_upload().await.unwrap();
        upload.file_mut().write_all(data).await.unwrap();
        upload.publish(&store.path_of(name).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_and_list() {
        let (store, _dir) = test_store().await;
        put(&store, "b.txt", b"bb").await;
        put(&store, "a b.txt", b"a").await;

        let files = store.list().await.unwrap();
        assert_eq!(
            files,
            vec![
                FileEntry { name: "a b.txt".into(), size: 1 },
                FileEntry { name: "b.txt".into(), size: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_never_overwrites() {
        let (store, _dir) = test_store().await;
        put(&store, "a.txt", b"original").await;

        let mut upload = store.begin_upload().await.unwrap();
        upload.file_mut().write_all(b"intruder").await.unwrap();
        let err = upload
            .publish(&store.path_of("a.txt").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);

        let content = std::fs::read(store.path_of("a.txt").unwrap()).unwrap();
        assert_eq!(content, b"original");
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_upload_leaves_nothing() {
        let (store, dir) = test_store().await;
        {
            let mut upload = store.begin_upload().await.unwrap();
            upload.file_mut().write_all(b"partial").await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_open_sweeps_stale_temporaries() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(format!("{TEMP_FILE_PREFIX}old")), b"x").unwrap();
        std::fs::write(dir.path().join("keep.txt"), b"y").unwrap();

        let store = FileStore::open(dir.path().to_path_buf()).await.unwrap();
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["keep.txt"]);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_rename_rules() {
        let (store, _dir) = test_store().await;
        put(&store, "a.txt", b"a").await;
        put(&store, "b.txt", b"b").await;

        assert!(matches!(
            store.rename("a.txt", "b.txt").await,
            Err(ServerError::Conflict(_))
        ));
        assert!(matches!(
            store.rename("missing.txt", "c.txt").await,
            Err(ServerError::NotFound(_))
        ));

        store.rename("a.txt", "c.txt").await.unwrap();
        assert!(!store.exists("a.txt").await.unwrap());
        assert!(store.exists("c.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_download_missing() {
        let (store, _dir) = test_store().await;
        put(&store, "a.txt", b"abc").await;

        let (_, size) = store.open_for_download("a.txt").await.unwrap();
        assert_eq!(size, 3);

        store.delete("a.txt").await.unwrap();
        assert!(matches!(
            store.delete("a.txt").await,
            Err(ServerError::NotFound(_))
        ));
        assert!(matches!(
            store.open_for_download("a.txt").await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (store, _dir) = test_store().await;
        for bad in ["../etc/passwd", "a/b", "x:y", "..", ""] {
            assert!(matches!(store.path_of(bad), Err(ServerError::Protocol(_))), "{bad}");
        }
        let temp_like = format!("{TEMP_FILE_PREFIX}1234");
        assert!(store.path_of(&temp_like).is_err());
    }

    #[tokio::test]
    async fn test_sidecar_hash() {
        let (store, _dir) = test_store().await;
        let digest = "AB".repeat(32);
        put(&store, "data.bin", b"x").await;
        put(&store, "data.bin.sha256", format!("{digest}  data.bin\n").as_bytes()).await;

        let path = store.path_of("data.bin").unwrap();
        assert_eq!(read_sidecar_hash(&path), Some(digest.to_ascii_lowercase()));

        put(&store, "other.bin.sha256", b"not-a-hash").await;
        assert_eq!(read_sidecar_hash(&store.path_of("other.bin").unwrap()), None);
    }

    #[tokio::test]
    async fn test_locks_serialize_same_name() {
        let locks = FileLocks::new(true);
        let lease = locks.acquire(&["a.txt"]).await;

        let contender = locks.clone();
        let waiter = tokio::spawn(async move {
            let _lease = contender.acquire(&["b.txt", "a.txt"]).await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        drop(lease);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_disabled_locks_never_wait() {
        let locks = FileLocks::new(false);
        assert!(!locks.is_enabled());
        let _a = locks.acquire(&["a.txt"]).await;
        let _b = locks.acquire(&["a.txt"]).await;
    }
}
