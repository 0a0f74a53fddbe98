//! Line-level pieces of the text protocol.
//!
//! Every message on the wire is a single UTF-8 line. Server replies carry a
//! marker (`OK:`, `ERROR:` or `LISTO:`) so a client can tell the outcome
//! without understanding the human-readable text that follows it.

use std::fmt;

use crate::constants::{MAX_FILE_NAME_LEN, SHA256_HEX_LEN, TEMP_FILE_PREFIX};
use crate::error::{NameError, TokenizeError};

const MARK_OK: &str = "OK";
const MARK_ERROR: &str = "ERROR";
const MARK_READY: &str = "LISTO";

/// Characters that may never appear in a stored file name.
pub const FORBIDDEN_NAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Kind of a server reply line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Ok,
    Error,
    /// Ready acknowledgment of the upload/download sub-protocols.
    Ready,
}

/// A single server reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub text: String,
}

impl Reply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Ok,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            text: text.into(),
        }
    }

    pub fn ready(text: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Ready,
            text: text.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.kind == ReplyKind::Ok
    }

    /// Render as a wire line, without the trailing newline. Embedded line
    /// breaks are flattened so the reply can never span two lines.
    pub fn to_line(&self) -> String {
        let marker = match self.kind {
            ReplyKind::Ok => MARK_OK,
            ReplyKind::Error => MARK_ERROR,
            ReplyKind::Ready => MARK_READY,
        };
        let text: String = self
            .text
            .chars()
            .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
            .collect();
        format!("{marker}: {text}")
    }

    /// Parse a reply line. Returns `None` for lines without a known marker
    /// (banners and prompts).
    pub fn parse(line: &str) -> Option<Self> {
        let (marker, rest) = line.split_once(':')?;
        let kind = match marker {
            MARK_OK => ReplyKind::Ok,
            MARK_ERROR => ReplyKind::Error,
            MARK_READY => ReplyKind::Ready,
            _ => return None,
        };
        Some(Self {
            kind,
            text: rest.strip_prefix(' ').unwrap_or(rest).to_string(),
        })
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}

/// Split a command line on whitespace, keeping double-quoted runs together so
/// that file names may contain spaces. Quotes are removed from the result; an
/// explicitly quoted empty string yields an empty argument.
pub fn tokenize(line: &str) -> Result<Vec<String>, TokenizeError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote_start: Option<usize> = None;

    for (pos, c) in line.char_indices() {
        match (c, quote_start) {
            ('"', None) => {
                quote_start = Some(pos);
                in_token = true;
            }
            ('"', Some(_)) => quote_start = None,
            (c, None) if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            (c, _) => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if let Some(pos) = quote_start {
        return Err(TokenizeError::UnterminatedQuote(pos));
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(TokenizeError::Empty);
    }
    Ok(tokens)
}

/// Check that `name` is usable as a file name in the flat storage directory.
pub fn validate_file_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_FILE_NAME_LEN {
        return Err(NameError::TooLong {
            len: name.len(),
            max: MAX_FILE_NAME_LEN,
        });
    }
    if let Some(c) = name
        .chars()
        .find(|c| FORBIDDEN_NAME_CHARS.contains(c) || c.is_control())
    {
        return Err(NameError::ForbiddenChar(c));
    }
    if name == "." || name == ".." || name.starts_with(TEMP_FILE_PREFIX) {
        return Err(NameError::Reserved(name.to_string()));
    }
    Ok(())
}

/// Whether `s` looks like a hex-encoded SHA-256 digest (either case).
pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == SHA256_HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Quote an argument for a command line if it contains whitespace.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(char::is_whitespace) {
        format!("\"{arg}\"")
    } else {
        arg.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_plain() {
        assert_eq!(
            tokenize("RENOMBRAR a.txt b.txt").unwrap(),
            vec!["RENOMBRAR", "a.txt", "b.txt"]
        );
        assert_eq!(tokenize("  LISTAR   ").unwrap(), vec!["LISTAR"]);
    }

    #[test]
    fn test_tokenize_quoted_spaces() {
        assert_eq!(
            tokenize(r#"SUBIR "informe final.pdf" abc"#).unwrap(),
            vec!["SUBIR", "informe final.pdf", "abc"]
        );
        assert_eq!(
            tokenize(r#"RENOMBRAR "a b" "c  d""#).unwrap(),
            vec!["RENOMBRAR", "a b", "c  d"]
        );
    }

    #[test]
    fn test_tokenize_empty_quoted_arg() {
        assert_eq!(tokenize(r#"ELIMINAR """#).unwrap(), vec!["ELIMINAR", ""]);
    }

    #[test]
    fn test_tokenize_errors() {
        assert_eq!(tokenize("   "), Err(TokenizeError::Empty));
        assert_eq!(
            tokenize(r#"SUBIR "sin cierre"#),
            Err(TokenizeError::UnterminatedQuote(6))
        );
    }

    #[test]
    fn test_validate_file_name() {
        assert!(validate_file_name("report.txt").is_ok());
        assert!(validate_file_name("informe final.pdf").is_ok());
        assert_eq!(validate_file_name(""), Err(NameError::Empty));
        for bad in ["a/b", "a\\b", "c:x", "x*", "q?", "\"q\"", "<a", "b>", "p|q"] {
            assert!(
                matches!(validate_file_name(bad), Err(NameError::ForbiddenChar(_))),
                "{bad} should be rejected"
            );
        }
        assert!(matches!(validate_file_name(".."), Err(NameError::Reserved(_))));
        assert!(matches!(
            validate_file_name(".custodia-upload-1234"),
            Err(NameError::Reserved(_))
        ));
        let long = "x".repeat(MAX_FILE_NAME_LEN + 1);
        assert!(matches!(validate_file_name(&long), Err(NameError::TooLong { .. })));
    }

    #[test]
    fn test_reply_line_and_parse() {
        let line = Reply::ok("Archivo recibido (10 bytes)").to_line();
        assert_eq!(line, "OK: Archivo recibido (10 bytes)");
        let parsed = Reply::parse(&line).unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.text, "Archivo recibido (10 bytes)");

        assert_eq!(Reply::ready("1024").to_line(), "LISTO: 1024");
        assert_eq!(Reply::parse("ERROR: x").unwrap().kind, ReplyKind::Error);
        assert!(Reply::parse("Usuario: ").is_none());
    }

    #[test]
    fn test_reply_never_spans_lines() {
        let line = Reply::error("uno\ndos\r\ntres").to_line();
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
    }

    #[test]
    fn test_sha256_hex() {
        assert!(is_sha256_hex(&"a".repeat(64)));
        assert!(is_sha256_hex(&"AbC0".repeat(16)));
        assert!(!is_sha256_hex(&"g".repeat(64)));
        assert!(!is_sha256_hex("abcd"));
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("a.txt"), "a.txt");
        assert_eq!(quote_arg("a b.txt"), "\"a b.txt\"");
        assert_eq!(tokenize(&format!("X {}", quote_arg("a b"))).unwrap()[1], "a b");
    }
}
