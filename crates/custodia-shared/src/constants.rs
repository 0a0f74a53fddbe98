/// Application name shown in the welcome banner
pub const APP_NAME: &str = "Custodia";

/// Default TCP port for the TLS listener
pub const DEFAULT_PORT: u16 = 5443;

/// Chunk size for streaming file bodies in both directions (8 KiB)
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Longest command or prompt line accepted from a client (8 KiB)
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Longest file name accepted by the flat file store
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Idle read timeout for a session, in seconds
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// Hidden prefix used for in-flight uploads; never a valid client file name
pub const TEMP_FILE_PREFIX: &str = ".custodia-upload-";

/// Extension of the optional sidecar file carrying an expected SHA-256
pub const SIDECAR_HASH_EXTENSION: &str = "sha256";

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Prompts sent by the server
pub const PROMPT_USERNAME: &str = "Usuario: ";
pub const PROMPT_PASSWORD: &str = "Contraseña: ";
pub const PROMPT_COMMAND: &str = "Comando: ";

/// Client tokens used by the download sub-protocol
pub const CLIENT_READY: &str = "LISTO";
pub const CLIENT_CANCEL: &str = "CANCELAR";
