//! Post-upload verification: content hash, malware scan, persisted verdict.
//!
//! The session only ever calls [`VerificationBackend::submit`]. Whether the
//! job then runs on the worker pool or inline is decided once at startup.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use custodia_shared::constants::CHUNK_SIZE;
use custodia_shared::verification::{Integrity, Outcome, ScanResult};
use custodia_store::VerificationRecord;

use crate::files::read_sidecar_hash;
use crate::ports::RecordStore;

/// One stored file version to verify.
#[derive(Debug, Clone)]
pub struct VerificationJob {
    pub file_name: String,
    pub path: PathBuf,
    pub expected_hash: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl VerificationJob {
    pub fn new(file_name: impl Into<String>, path: PathBuf, expected_hash: Option<String>) -> Self {
        Self {
            file_name: file_name.into(),
            path,
            expected_hash: expected_hash.map(|h| h.to_ascii_lowercase()),
            submitted_at: now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Malware scanning
// ---------------------------------------------------------------------------

/// External malware scanner. Runs on a blocking thread.
pub trait MalwareScanner: Send + Sync {
    fn scan(&self, path: &Path) -> (ScanResult, String);
}

/// Used when no scanner is configured.
pub struct NoScanner;

impl MalwareScanner for NoScanner {
    fn scan(&self, _path: &Path) -> (ScanResult, String) {
        (ScanResult::Unscanned, "sin antivirus configurado".to_string())
    }
}

/// Runs `<program> [args..] <path>` and maps the exit status the way
/// `clamscan` reports it: 0 clean, 1 infected, anything else an error.
pub struct CommandScanner {
    program: String,
    args: Vec<String>,
}

impl CommandScanner {
    /// Parse a whitespace-separated command line. `None` when empty.
    pub fn from_command_line(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl MalwareScanner for CommandScanner {
    fn scan(&self, path: &Path) -> (ScanResult, String) {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(path)
            .stdin(Stdio::null())
            .output();

        match output {
            Ok(out) => match out.status.code() {
                Some(0) => (ScanResult::Clean, "antivirus: limpio".to_string()),
                Some(1) => {
                    let detail = String::from_utf8_lossy(&out.stdout);
                    let first = detail.lines().next().unwrap_or("").trim();
                    (ScanResult::Infected, format!("antivirus: infectado {first}"))
                }
                code => (
                    ScanResult::Error,
                    format!("antivirus: código de salida {code:?}"),
                ),
            },
            Err(e) => {
                warn!(program = %self.program, error = %e, "Failed to run scanner");
                (ScanResult::Error, "antivirus: no se pudo ejecutar".to_string())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

/// Runs the checks for one job and appends the record. Each step degrades
/// the outcome on failure instead of aborting.
pub struct Verifier {
    records: Arc<dyn RecordStore>,
    scanner: Arc<dyn MalwareScanner>,
}

impl Verifier {
    pub fn new(records: Arc<dyn RecordStore>, scanner: Arc<dyn MalwareScanner>) -> Self {
        Self { records, scanner }
    }

    /// Blocking; call from a blocking thread or the inline backend.
    pub fn run(&self, job: &VerificationJob) -> VerificationRecord {
        let record = self.evaluate(job);

        if let Err(e) = self.records.append_verification(&record) {
            error!(file = %job.file_name, error = %e, "Failed to store verification record");
        }

        info!(
            file = %record.file_name,
            outcome = %record.outcome,
            integrity = %record.integrity,
            scan = %record.scan_result,
            "Verification finished"
        );
        record
    }

    fn evaluate(&self, job: &VerificationJob) -> VerificationRecord {
        let expected = job
            .expected_hash
            .clone()
            .or_else(|| read_sidecar_hash(&job.path));

        let mut notes = Vec::new();
        let (integrity, actual) = match hash_file(&job.path) {
            Ok(actual) => {
                let integrity = match &expected {
                    Some(e) if e.eq_ignore_ascii_case(&actual) => Integrity::Valid,
                    Some(_) => {
                        notes.push("el hash no coincide".to_string());
                        Integrity::Invalid
                    }
                    None => Integrity::Unchecked,
                };
                (integrity, Some(actual))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return VerificationRecord {
                    file_name: job.file_name.clone(),
                    outcome: Outcome::Unknown,
                    integrity: Integrity::Error,
                    scan_result: ScanResult::Unscanned,
                    actual_hash: None,
                    expected_hash: expected,
                    message: "el archivo desapareció antes de verificarse".to_string(),
                    timestamp: now(),
                };
            }
            Err(e) => {
                warn!(file = %job.file_name, error = %e, "Failed to hash file");
                notes.push("no se pudo calcular el hash".to_string());
                (Integrity::Error, None)
            }
        };

        let (scan_result, scan_note) = self.scanner.scan(&job.path);
        notes.push(scan_note);

        let outcome = Outcome::combine(integrity, scan_result);
        debug!(file = %job.file_name, ?integrity, ?scan_result, ?outcome, "Verification evaluated");

        VerificationRecord {
            file_name: job.file_name.clone(),
            outcome,
            integrity,
            scan_result,
            actual_hash: actual,
            expected_hash: expected,
            message: notes.join("; "),
            timestamp: now(),
        }
    }
}

// Stored timestamps keep microseconds; match that so comparisons are exact.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lowercase hex SHA-256 of a file, read in chunks.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// Fire-and-forget sink for verification jobs. `submit` never waits for the
/// job to run.
pub trait VerificationBackend: Send + Sync {
    fn submit(&self, job: VerificationJob);
}

/// Runs each job on the submitting thread. Inside a multi-threaded runtime
/// the worker's other tasks are handed off first.
pub struct InlineBackend {
    verifier: Arc<Verifier>,
}

impl InlineBackend {
    pub fn new(verifier: Arc<Verifier>) -> Self {
        Self { verifier }
    }
}

impl VerificationBackend for InlineBackend {
    fn submit(&self, job: VerificationJob) {
        run_in_place(&self.verifier, &job);
    }
}

fn run_in_place(verifier: &Verifier, job: &VerificationJob) {
    match Handle::try_current().map(|h| h.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(|| verifier.run(job));
        }
        _ => {
            verifier.run(job);
        }
    }
}

/// Queue drained by a fixed number of workers, each running jobs on the
/// blocking pool. Jobs outlive the session that submitted them.
pub struct WorkerPoolBackend {
    tx: mpsc::UnboundedSender<VerificationJob>,
    verifier: Arc<Verifier>,
}

impl WorkerPoolBackend {
    /// Spawn `workers` workers on the current runtime.
    pub fn start(verifier: Arc<Verifier>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<VerificationJob>();
        let rx = Arc::new(Mutex::new(rx));

        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            let verifier = verifier.clone();
            tokio::spawn(async move {
                loop {
                    let job = { rx.lock().await.recv().await };
                    let Some(job) = job else {
                        break;
                    };
                    let v = verifier.clone();
                    let name = job.file_name.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || v.run(&job)).await {
                        error!(worker, file = %name, error = %e, "Verification job panicked");
                    }
                }
                debug!(worker, "Verification worker stopped");
            });
        }

        info!(workers, "Verification pool started");
        Self { tx, verifier }
    }
}

impl VerificationBackend for WorkerPoolBackend {
    fn submit(&self, job: VerificationJob) {
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job) {
            warn!(file = %job.file_name, "Verification pool closed, running inline");
            run_in_place(&self.verifier, &job);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SqliteStore;
    use custodia_store::Database;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    struct FixedScanner(ScanResult);

    impl MalwareScanner for FixedScanner {
        fn scan(&self, _path: &Path) -> (ScanResult, String) {
            (self.0, "fixed".into())
        }
    }

    fn setup(scan: ScanResult) -> (Arc<SqliteStore>, Verifier, TempDir) {
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let verifier = Verifier::new(store.clone(), Arc::new(FixedScanner(scan)));
        (store, verifier, TempDir::new().unwrap())
    }

    fn write(dir: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_hash_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "hello.txt", b"hello");
        assert_eq!(hash_file(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_matching_hash_is_ok() {
        let (store, verifier, dir) = setup(ScanResult::Clean);
        let path = write(&dir, "hello.txt", b"hello");
        let job = VerificationJob::new("hello.txt", path, Some(HELLO_SHA256.to_uppercase()));

        let record = verifier.run(&job);
        assert_eq!(record.outcome, Outcome::Ok);
        assert_eq!(record.integrity, Integrity::Valid);
        assert_eq!(record.actual_hash.as_deref(), Some(HELLO_SHA256));

        let stored = store
            .latest_verification("hello.txt", job.submitted_at)
            .unwrap()
            .unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_wrong_hash_is_corrupt() {
        let (_store, verifier, dir) = setup(ScanResult::Clean);
        let path = write(&dir, "hello.txt", b"hello");
        let record = verifier.run(&VerificationJob::new("hello.txt", path, Some("0".repeat(64))));
        assert_eq!(record.outcome, Outcome::Corrupt);
        assert_eq!(record.integrity, Integrity::Invalid);
    }

    #[test]
    fn test_infection_wins_over_integrity() {
        let (_store, verifier, dir) = setup(ScanResult::Infected);
        let path = write(&dir, "x.bin", b"hello");
        let record = verifier.run(&VerificationJob::new("x.bin", path, Some("0".repeat(64))));
        assert_eq!(record.outcome, Outcome::Infected);
    }

    #[test]
    fn test_scanner_error_is_partial() {
        let (_store, verifier, dir) = setup(ScanResult::Error);
        let path = write(&dir, "x.bin", b"hello");
        let record = verifier.run(&VerificationJob::new("x.bin", path, None));
        assert_eq!(record.integrity, Integrity::Unchecked);
        assert_eq!(record.outcome, Outcome::Partial);
    }

    #[test]
    fn test_sidecar_supplies_expected_hash() {
        let (_store, verifier, dir) = setup(ScanResult::Unscanned);
        let path = write(&dir, "hello.txt", b"hello");
        write(&dir, "hello.txt.sha256", format!("{HELLO_SHA256}  hello.txt\n").as_bytes());

        let record = verifier.run(&VerificationJob::new("hello.txt", path, None));
        assert_eq!(record.expected_hash.as_deref(), Some(HELLO_SHA256));
        assert_eq!(record.integrity, Integrity::Valid);
        assert_eq!(record.outcome, Outcome::Ok);
    }

    #[test]
    fn test_vanished_file_is_unknown() {
        let (store, verifier, dir) = setup(ScanResult::Clean);
        let job = VerificationJob::new("gone.txt", dir.path().join("gone.txt"), None);
        let record = verifier.run(&job);
        assert_eq!(record.outcome, Outcome::Unknown);
        assert!(store
            .latest_verification("gone.txt", job.submitted_at)
            .unwrap()
            .is_some());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_scanner_exit_codes() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "x.bin", b"x");

        let clean = CommandScanner::from_command_line("true").unwrap();
        assert_eq!(clean.scan(&path).0, ScanResult::Clean);

        let infected = CommandScanner::from_command_line("false").unwrap();
        assert_eq!(infected.scan(&path).0, ScanResult::Infected);

        let missing = CommandScanner::from_command_line("/nonexistent/scanner --flag").unwrap();
        assert_eq!(missing.scan(&path).0, ScanResult::Error);

        assert!(CommandScanner::from_command_line("   ").is_none());
    }

    #[tokio::test]
    async fn test_pool_runs_submitted_jobs() {
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let verifier = Arc::new(Verifier::new(store.clone(), Arc::new(NoScanner)));
        let pool = WorkerPoolBackend::start(verifier, 2);
        let dir = TempDir::new().unwrap();

        let mut jobs = Vec::new();
        for i in 0..4 {
            let name = format!("f{i}.txt");
            let path = write(&dir, &name, b"hello");
            let job = VerificationJob::new(name, path, Some(HELLO_SHA256.into()));
            jobs.push((job.file_name.clone(), job.submitted_at));
            pool.submit(job);
        }

        for (name, after) in jobs {
            let mut found = None;
            for _ in 0..200 {
                found = store.latest_verification(&name, after).unwrap();
                if found.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(found.expect("record").outcome, Outcome::Ok);
        }
    }

    #[test]
    fn test_inline_backend_runs_immediately() {
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let verifier = Arc::new(Verifier::new(store.clone(), Arc::new(NoScanner)));
        let backend = InlineBackend::new(verifier);
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "a.txt", b"hello");

        let job = VerificationJob::new("a.txt", path, None);
        let after = job.submitted_at;
        backend.submit(job);
        let record = store.latest_verification("a.txt", after).unwrap().unwrap();
        assert_eq!(record.scan_result, ScanResult::Unscanned);
        assert_eq!(record.outcome, Outcome::Ok);
    }

    /// Reports clean only if `ready` is set while the scan is running.
    struct WaitingScanner {
        ready: Arc<AtomicBool>,
    }

    impl MalwareScanner for WaitingScanner {
        fn scan(&self, _path: &Path) -> (ScanResult, String) {
            for _ in 0..200 {
                if self.ready.load(Ordering::SeqCst) {
                    return (ScanResult::Clean, "ok".into());
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            (ScanResult::Error, "runtime stalled".into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_inline_backend_keeps_runtime_responsive() {
        let ready = Arc::new(AtomicBool::new(false));
        let store = Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()));
        let scanner = Arc::new(WaitingScanner {
            ready: ready.clone(),
        });
        let backend = InlineBackend::new(Arc::new(Verifier::new(store.clone(), scanner)));
        let dir = TempDir::new().unwrap();
        let job = VerificationJob::new("a.txt", write(&dir, "a.txt", b"hello"), None);
        let after = job.submitted_at;

        // Submit from the only worker; the sibling task can run only if the
        // worker is handed off while the job blocks.
        tokio::spawn(async move {
            tokio::spawn(async move { ready.store(true, Ordering::SeqCst) });
            backend.submit(job);
        })
        .await
        .unwrap();

        let record = store.latest_verification("a.txt", after).unwrap().unwrap();
        assert_eq!(record.scan_result, ScanResult::Clean);
    }
}
