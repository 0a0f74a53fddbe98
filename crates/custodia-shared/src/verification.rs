//! Result vocabulary of the post-upload verification pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Overall verdict for one uploaded file version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Ok,
    Corrupt,
    Infected,
    Partial,
    Unknown,
}

/// Result of comparing the stored content hash with the expected one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
    Valid,
    Invalid,
    Error,
    /// No expected hash was available.
    Unchecked,
}

/// Result of the malware scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ScanResult {
    Clean,
    Infected,
    Error,
    /// No scanner is configured.
    Unscanned,
}

impl Outcome {
    /// Combine the two independent checks into a verdict.
    ///
    /// An infection always wins, then a hash mismatch. Otherwise the file is
    /// `Ok` unless one of the checks errored, which makes it `Partial`.
    pub fn combine(integrity: Integrity, scan: ScanResult) -> Self {
        match (integrity, scan) {
            (_, ScanResult::Infected) => Self::Infected,
            (Integrity::Invalid, _) => Self::Corrupt,
            (Integrity::Error, _) | (_, ScanResult::Error) => Self::Partial,
            _ => Self::Ok,
        }
    }
}

macro_rules! text_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    _ => Err(ParseError::new($kind, s)),
                }
            }
        }
    };
}

text_enum!(Outcome, "resultado", {
    Ok => "ok",
    Corrupt => "corrupt",
    Infected => "infected",
    Partial => "partial",
    Unknown => "unknown",
});

text_enum!(Integrity, "integridad", {
    Valid => "valid",
    Invalid => "invalid",
    Error => "error",
    Unchecked => "unchecked",
});

text_enum!(ScanResult, "análisis", {
    Clean => "clean",
    Infected => "infected",
    Error => "error",
    Unscanned => "unscanned",
});
