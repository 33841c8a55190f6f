//! Classification of input lines into protocol requests.

use thiserror::Error;

/// A line equal to this token ends the request loop.
pub const TERMINATOR: &str = "EOF";

/// Separates the leading token from the payload.
pub const FIELD_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// `METHOD:<name>`
    Method,
    /// `OPTIONS:<key>=<value>,...`
    Options,
}

impl DirectiveKind {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "METHOD" => Some(DirectiveKind::Method),
            "OPTIONS" => Some(DirectiveKind::Options),
            _ => None,
        }
    }
}

/// One decoded input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    Configure {
        kind: DirectiveKind,
        payload: &'a str,
    },
    Evaluate {
        identifier: &'a str,
        payload: &'a str,
    },
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed request `{0}` (missing `:` separator)")]
    MissingSeparator(String),
    #[error("request `{0}` is not valid UTF-8")]
    InvalidUtf8(String),
}

/// Classifies a single line (without its trailing newline).
pub fn parse_request(line: &str) -> Result<Request<'_>, ProtocolError> {
    let line = line.trim();
    if line == TERMINATOR {
        return Ok(Request::Terminate);
    }

    let (head, payload) = line
        .split_once(FIELD_SEPARATOR)
        .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;

    Ok(match DirectiveKind::from_keyword(head.trim()) {
        Some(kind) => Request::Configure { kind, payload },
        None => Request::Evaluate {
            identifier: head,
            payload,
        },
    })
}
