use std::time::Duration;

use thiserror::Error;

use custodia_shared::error::{NameError, TokenizeError};
use custodia_shared::types::PermissionLevel;
use custodia_store::StoreError;

/// Failures of the line/byte framing layer on one connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("no data received for {0:?}")]
    Timeout(Duration),

    #[error("peer closed the connection")]
    Closed,

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the session can keep using the connection after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::LineTooLong { .. } | Self::InvalidUtf8)
    }
}

/// Failures of an upload or download in progress.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Tiempo de espera agotado durante la transferencia ({0:?})")]
    Timeout(Duration),

    #[error("La conexión se cerró a mitad de la transferencia ({received} de {expected} bytes)")]
    PeerClosed { received: u64, expected: u64 },

    #[error("Tamaño no válido: {0}")]
    InvalidSize(String),

    #[error("Tamaño {size} supera el máximo permitido de {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Error de disco: {0}")]
    Disk(#[source] std::io::Error),

    /// The peer stopped moving body bytes after the size was agreed.
    #[error("La transferencia se detuvo ({received} de {expected} bytes)")]
    Stalled { received: u64, expected: u64 },

    #[error("El cliente informó un error: {0}")]
    ClientFailed(String),

    /// The stored file shrank while it was being streamed.
    #[error("El archivo cambió durante la descarga ({sent} de {expected} bytes)")]
    SourceTruncated { sent: u64, expected: u64 },

    #[error("Error de conexión: {0}")]
    Connection(#[source] FramingError),
}

impl TransferError {
    /// Whether the connection is unusable after this failure. Anything that
    /// leaves unread or missing body bytes on the stream is fatal, since line
    /// framing cannot resume. A disk error is not: the body is drained first.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Timeout(_)
            | Self::Stalled { .. }
            | Self::PeerClosed { .. }
            | Self::TooLarge { .. }
            | Self::SourceTruncated { .. } => true,
            Self::Connection(e) => !e.is_recoverable(),
            _ => false,
        }
    }
}

/// Everything a command can fail with. The variant decides how the failure is
/// reported: [`ServerError::client_message`] is the single line the client
/// sees, [`ServerError::is_fatal`] whether the session survives.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed command, wrong argument count or shape.
    #[error("{0}")]
    Protocol(String),

    /// Bad credentials. Deliberately says nothing about which part was wrong.
    #[error("Credenciales inválidas")]
    Auth,

    #[error("Permiso denegado: {verb} requiere nivel {required}")]
    Permission {
        verb: String,
        required: PermissionLevel,
    },

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Error de almacenamiento: {0}")]
    Store(#[from] StoreError),

    #[error("Error de disco: {0}")]
    Io(#[from] std::io::Error),

    /// The connection itself failed; nothing more can be sent.
    #[error("fatal transport error: {0}")]
    FatalTransport(#[source] FramingError),
}

impl ServerError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// The text sent to the client. Internal failures are summarized so that
    /// paths, SQL and OS messages stay in the server log.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) => "Error interno del servidor".to_string(),
            Self::Io(_) => "Error interno de disco".to_string(),
            Self::Transfer(TransferError::Disk(_)) => {
                "Error de disco durante la transferencia".to_string()
            }
            other => other.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            Self::FatalTransport(_) => true,
            Self::Transfer(e) => e.is_fatal(),
            _ => false,
        }
    }
}

impl From<FramingError> for ServerError {
    fn from(e: FramingError) -> Self {
        if e.is_recoverable() {
            Self::Protocol(e.to_string())
        } else {
            Self::FatalTransport(e)
        }
    }
}

impl From<TokenizeError> for ServerError {
    fn from(e: TokenizeError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<NameError> for ServerError {
    fn from(e: NameError) -> Self {
        Self::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_details_stay_private() {
        let err = ServerError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            "/srv/secret/path: permission denied",
        ));
        assert!(!err.client_message().contains("/srv/secret"));

        let err = ServerError::Store(StoreError::Migration("SELECT * FROM users".into()));
        assert!(!err.client_message().contains("SELECT"));
    }

    #[test]
    fn permission_message_names_level() {
        let err = ServerError::Permission {
            verb: "LISTAR_USUARIOS".into(),
            required: PermissionLevel::Admin,
        };
        assert_eq!(
            err.client_message(),
            "Permiso denegado: LISTAR_USUARIOS requiere nivel admin"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatality() {
        assert!(ServerError::from(FramingError::Closed).is_fatal());
        assert!(!ServerError::from(FramingError::LineTooLong { max: 8 }).is_fatal());
        assert!(ServerError::Transfer(TransferError::PeerClosed {
            received: 1,
            expected: 2
        })
        .is_fatal());
        assert!(ServerError::Transfer(TransferError::Timeout(Duration::from_secs(1))).is_fatal());
        assert!(ServerError::Transfer(TransferError::Stalled {
            received: 3,
            expected: 10
        })
        .is_fatal());
        assert!(ServerError::Transfer(TransferError::TooLarge { size: 10, max: 5 }).is_fatal());
        assert!(!ServerError::Transfer(TransferError::Disk(std::io::Error::other("full"))).is_fatal());
        assert!(!ServerError::Transfer(TransferError::InvalidSize("x".into())).is_fatal());
    }
}
