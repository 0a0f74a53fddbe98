use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Numeric identifier of a registered user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Numeric identifier of a permission request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub i64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for RequestId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix('#').unwrap_or(s);
        match digits.parse::<i64>() {
            Ok(n) if n > 0 => Ok(Self(n)),
            _ => Err(ParseError::new("id de solicitud", s)),
        }
    }
}

/// Permission tier of a user, ordered `User < Admin`.
///
/// The older three-tier model (`lectura`, `escritura`, `admin`) is accepted on
/// input and collapsed: both `lectura` and `escritura` become [`User`].
///
/// [`User`]: PermissionLevel::User
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    User,
    Admin,
}

impl PermissionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
        }
    }

    /// Whether this level satisfies a required minimum.
    pub fn satisfies(&self, required: PermissionLevel) -> bool {
        *self >= required
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "usuario" | "lectura" | "escritura" => Ok(Self::User),
            "admin" | "administrador" => Ok(Self::Admin),
            _ => Err(ParseError::new("nivel de permiso", s)),
        }
    }
}

/// Lifecycle of a permission request. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(ParseError::new("estado de solicitud", s)),
        }
    }
}

/// An administrator's ruling on a pending request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    /// Status a pending request moves to under this decision.
    pub fn resulting_status(&self) -> RequestStatus {
        match self {
            Self::Approve => RequestStatus::Approved,
            Self::Reject => RequestStatus::Rejected,
        }
    }
}

impl FromStr for Decision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aprobar" | "approve" | "si" | "sí" => Ok(Self::Approve),
            "rechazar" | "reject" | "no" => Ok(Self::Reject),
            _ => Err(ParseError::new("decisión", s)),
        }
    }
}

/// The authenticated principal bound to a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
    pub level: PermissionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(PermissionLevel::User < PermissionLevel::Admin);
        assert!(PermissionLevel::Admin.satisfies(PermissionLevel::User));
        assert!(!PermissionLevel::User.satisfies(PermissionLevel::Admin));
    }

    #[test]
    fn test_legacy_levels_collapse_to_user() {
        assert_eq!("lectura".parse::<PermissionLevel>().unwrap(), PermissionLevel::User);
        assert_eq!("Escritura".parse::<PermissionLevel>().unwrap(), PermissionLevel::User);
        assert_eq!("ADMIN".parse::<PermissionLevel>().unwrap(), PermissionLevel::Admin);
        assert!("root".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn test_request_id_parse() {
        assert_eq!("7".parse::<RequestId>().unwrap(), RequestId(7));
        assert_eq!("#12".parse::<RequestId>().unwrap(), RequestId(12));
        assert!("0".parse::<RequestId>().is_err());
        assert!("-3".parse::<RequestId>().is_err());
        assert!("abc".parse::<RequestId>().is_err());
    }

    #[test]
    fn test_decision_parse() {
        assert_eq!("aprobar".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("Reject".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("quizas".parse::<Decision>().is_err());
        assert_eq!(Decision::Reject.resulting_status(), RequestStatus::Rejected);
    }
}
