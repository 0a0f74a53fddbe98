//! Server configuration loaded from environment variables.
//!
//! All settings have defaults so the server can start with only a
//! certificate pair on disk.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use custodia_shared::constants::{DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_PORT};

/// How verification jobs are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationMode {
    /// Background worker pool; uploads return before verification finishes.
    Pool,
    /// Run on the submitting task, for environments without a worker pool.
    Inline,
}

impl FromStr for VerificationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pool" | "async" => Ok(Self::Pool),
            "inline" | "sync" => Ok(Self::Inline),
            other => Err(format!("unknown verification mode '{other}'")),
        }
    }
}

/// Credentials of an administrator created at startup if missing.
#[derive(Clone)]
pub struct BootstrapAdmin {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BootstrapAdmin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapAdmin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host or address to bind. `0.0.0.0`, `::` and empty bind every family;
    /// `localhost`, `127.0.0.1` and `::1` bind both loopbacks.
    /// Env: `CUSTODIA_HOST`
    pub bind_host: String,

    /// Env: `CUSTODIA_PORT`
    pub bind_port: u16,

    /// Flat directory holding the stored files.
    /// Env: `CUSTODIA_STORAGE_DIR`
    pub storage_dir: PathBuf,

    /// PEM certificate chain presented to clients.
    /// Env: `CUSTODIA_TLS_CERT`
    pub tls_cert_path: PathBuf,

    /// PEM private key matching `tls_cert_path`.
    /// Env: `CUSTODIA_TLS_KEY`
    pub tls_key_path: PathBuf,

    /// SQLite database file. `None` uses the platform data directory.
    /// Env: `CUSTODIA_DATABASE`
    pub database_path: Option<PathBuf>,

    /// Env: `CUSTODIA_IDLE_TIMEOUT_SECS`
    pub idle_timeout: Duration,

    /// Inactivity allowed between chunks of a transfer.
    /// Env: `CUSTODIA_TRANSFER_TIMEOUT_SECS`
    pub transfer_timeout: Duration,

    /// How long to wait for the client's final download acknowledgment.
    /// Env: `CUSTODIA_ACK_TIMEOUT_SECS`
    pub ack_timeout: Duration,

    /// Env: `CUSTODIA_HANDSHAKE_TIMEOUT_SECS`
    pub handshake_timeout: Duration,

    /// Env: `CUSTODIA_MAX_UPLOAD_BYTES`
    pub max_upload_bytes: u64,

    /// Concurrent sessions allowed (0 = unlimited).
    /// Env: `CUSTODIA_MAX_SESSIONS`
    pub max_sessions: usize,

    /// Consecutive failed logins before the session is closed (0 = unlimited).
    /// Env: `CUSTODIA_MAX_AUTH_ATTEMPTS`
    pub max_auth_attempts: u32,

    /// Env: `CUSTODIA_VERIFY_MODE` (`pool` | `inline`)
    pub verification_mode: VerificationMode,

    /// Env: `CUSTODIA_VERIFY_WORKERS`
    pub verification_workers: usize,

    /// External malware scanner, invoked as `<cmd> <path>`.
    /// Env: `CUSTODIA_SCANNER`
    pub scanner_command: Option<String>,

    /// Serialize operations on the same file name.
    /// Env: `CUSTODIA_FILE_LOCKING` (true/false)
    pub file_locking: bool,

    /// Env: `CUSTODIA_ADMIN_USER` + `CUSTODIA_ADMIN_PASSWORD`
    pub bootstrap_admin: Option<BootstrapAdmin>,

    /// IPs remembered by the connect-notice cache.
    pub seen_peers_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            bind_port: DEFAULT_PORT,
            storage_dir: PathBuf::from("./archivos"),
            tls_cert_path: PathBuf::from("./certs/server.crt"),
            tls_key_path: PathBuf::from("./certs/server.key"),
            database_path: None,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            transfer_timeout: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            max_upload_bytes: 1024 * 1024 * 1024, // 1 GiB
            max_sessions: 256,
            max_auth_attempts: 0,
            verification_mode: VerificationMode::Pool,
            verification_workers: 2,
            scanner_command: None,
            file_locking: false,
            bootstrap_admin: None,
            seen_peers_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. `from_env` passes
    /// the process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(host) = lookup("CUSTODIA_HOST") {
            config.bind_host = host.trim().to_string();
        }

        parse_into(&lookup, "CUSTODIA_PORT", &mut config.bind_port);

        if let Some(dir) = lookup("CUSTODIA_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("CUSTODIA_TLS_CERT") {
            config.tls_cert_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("CUSTODIA_TLS_KEY") {
            config.tls_key_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("CUSTODIA_DATABASE").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        parse_secs(&lookup, "CUSTODIA_IDLE_TIMEOUT_SECS", &mut config.idle_timeout);
        parse_secs(&lookup, "CUSTODIA_TRANSFER_TIMEOUT_SECS", &mut config.transfer_timeout);
        parse_secs(&lookup, "CUSTODIA_ACK_TIMEOUT_SECS", &mut config.ack_timeout);
        parse_secs(&lookup, "CUSTODIA_HANDSHAKE_TIMEOUT_SECS", &mut config.handshake_timeout);

        parse_into(&lookup, "CUSTODIA_MAX_UPLOAD_BYTES", &mut config.max_upload_bytes);
        parse_into(&lookup, "CUSTODIA_MAX_SESSIONS", &mut config.max_sessions);
        parse_into(&lookup, "CUSTODIA_MAX_AUTH_ATTEMPTS", &mut config.max_auth_attempts);
        parse_into(&lookup, "CUSTODIA_VERIFY_MODE", &mut config.verification_mode);
        parse_into(&lookup, "CUSTODIA_VERIFY_WORKERS", &mut config.verification_workers);
        config.verification_workers = config.verification_workers.max(1);

        if let Some(cmd) = lookup("CUSTODIA_SCANNER") {
            let cmd = cmd.trim().to_string();
            config.scanner_command = (!cmd.is_empty()).then_some(cmd);
        }

        if let Some(val) = lookup("CUSTODIA_FILE_LOCKING") {
            config.file_locking = val == "true" || val == "1";
        }

        match (lookup("CUSTODIA_ADMIN_USER"), lookup("CUSTODIA_ADMIN_PASSWORD")) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                config.bootstrap_admin = Some(BootstrapAdmin { username, password });
            }
            (Some(_), _) | (_, Some(_)) => {
                tracing::warn!(
                    "CUSTODIA_ADMIN_USER and CUSTODIA_ADMIN_PASSWORD must both be set; ignoring"
                );
            }
            _ => {}
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => tracing::warn!(key, value = %raw, error = %e, "invalid setting, using default"),
    }
}

fn parse_secs<F>(lookup: &F, key: &str, slot: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    let mut secs = slot.as_secs();
    parse_into(lookup, key, &mut secs);
    if secs == 0 {
        tracing::warn!(key, "zero timeout not allowed, using default");
        return;
    }
    *slot = Duration::from_secs(secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_port, DEFAULT_PORT);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.verification_mode, VerificationMode::Pool);
        assert!(!config.file_locking);
        assert!(config.bootstrap_admin.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CUSTODIA_HOST", "::"),
            ("CUSTODIA_PORT", "7000"),
            ("CUSTODIA_STORAGE_DIR", "/srv/files"),
            ("CUSTODIA_IDLE_TIMEOUT_SECS", "30"),
            ("CUSTODIA_VERIFY_MODE", "inline"),
            ("CUSTODIA_SCANNER", "clamscan"),
            ("CUSTODIA_FILE_LOCKING", "true"),
            ("CUSTODIA_ADMIN_USER", "root"),
            ("CUSTODIA_ADMIN_PASSWORD", "s3cret"),
        ]));
        assert_eq!(config.bind_host, "::");
        assert_eq!(config.bind_port, 7000);
        assert_eq!(config.storage_dir, PathBuf::from("/srv/files"));
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.verification_mode, VerificationMode::Inline);
        assert_eq!(config.scanner_command.as_deref(), Some("clamscan"));
        assert!(config.file_locking);
        assert_eq!(config.bootstrap_admin.unwrap().username, "root");
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup_from(&[
            ("CUSTODIA_PORT", "not-a-port"),
            ("CUSTODIA_IDLE_TIMEOUT_SECS", "0"),
            ("CUSTODIA_VERIFY_MODE", "carrier-pigeon"),
            ("CUSTODIA_VERIFY_WORKERS", "0"),
            ("CUSTODIA_ADMIN_USER", "root"),
        ]));
        assert_eq!(config.bind_port, DEFAULT_PORT);
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
        assert_eq!(config.verification_mode, VerificationMode::Pool);
        assert_eq!(config.verification_workers, 1);
        assert!(config.bootstrap_admin.is_none());
    }

    #[test]
    fn test_password_redacted_in_debug() {
        let admin = BootstrapAdmin {
            username: "root".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{admin:?}").contains("hunter2"));
    }
}
