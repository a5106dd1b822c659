//! SMTP reply parsing and capability discovery.
//!
//! Implements the RFC 5321 reply grammar needed for recipient probing:
//! multi-line replies (`NNN-` continuation, `NNN ` terminator), enhanced
//! status codes (RFC 2034), and the EHLO capability listing.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::EnhancedStatusCode;

/// Reply codes the verifier cares about.
pub mod codes {
    /// Service ready (greeting, STARTTLS go-ahead).
    pub const SERVICE_READY: u16 = 220;
    /// Service closing (QUIT).
    pub const SERVICE_CLOSING: u16 = 221;
    /// Requested action completed.
    pub const OK: u16 = 250;
    /// User not local; the server will forward.
    pub const WILL_FORWARD: u16 = 251;
    /// Mailbox unavailable.
    pub const MAILBOX_UNAVAILABLE: u16 = 550;
}

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpReply {
    /// Status code from the first line (0 when nothing parseable arrived).
    pub code: u16,
    /// Enhanced status code from the first line, if present.
    pub code_ex: Option<EnhancedStatusCode>,
    /// Per-line reply text with the `NNN[- ]` prefix (and enhanced code,
    /// where present) stripped.
    pub details: Vec<String>,
    /// The reply exactly as received.
    pub raw: String,
}

impl SmtpReply {
    /// Parses a raw, possibly multi-line reply.
    ///
    /// When the first line does not match the reply grammar the parse
    /// falls back to: code = lenient read of the first three characters,
    /// detail = everything from index 4.
    pub fn parse(raw: &str) -> Self {
        let lines: Vec<&str> = raw
            .split(['\r', '\n'])
            .filter(|line| !line.is_empty())
            .collect();

        let Some(first) = lines.first() else {
            return Self {
                code: 0,
                code_ex: None,
                details: Vec::new(),
                raw: raw.to_string(),
            };
        };

        if let Some((code, rest)) = split_status_prefix(first) {
            let (code_ex, first_detail) = strip_enhanced_code(rest);
            let mut details = vec![first_detail.to_string()];
            for line in &lines[1..] {
                let rest = split_status_prefix(line).map_or(*line, |(_, rest)| rest);
                let (_, detail) = strip_enhanced_code(rest);
                details.push(detail.to_string());
            }
            Self {
                code,
                code_ex,
                details,
                raw: raw.to_string(),
            }
        } else {
            // Fallback: take what we can from the malformed first line.
            let code = first
                .get(..3)
                .and_then(|prefix| prefix.trim().parse().ok())
                .unwrap_or(0);
            let detail = first.get(4..).unwrap_or_default().to_string();
            Self {
                code,
                code_ex: None,
                details: vec![detail],
                raw: raw.to_string(),
            }
        }
    }

    /// Joined reply text, one line per reply line.
    pub fn detail(&self) -> String {
        self.details.join("\n")
    }

    /// True for a 2xx reply.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// True for a 4xx reply.
    pub fn is_transient_failure(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// True for a 5xx reply.
    pub fn is_permanent_failure(&self) -> bool {
        (500..600).contains(&self.code)
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.detail())
    }
}

/// Splits `NNN[- ]` from a reply line; `None` when the line is malformed.
fn split_status_prefix(line: &str) -> Option<(u16, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !bytes[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code: u16 = line[..3].parse().ok()?;
    match bytes.get(3) {
        Some(b' ') | Some(b'-') => Some((code, &line[4..])),
        None => Some((code, "")),
        Some(_) => None,
    }
}

/// Strips a leading `X.Y.Z` enhanced status token when present.
fn strip_enhanced_code(rest: &str) -> (Option<EnhancedStatusCode>, &str) {
    let mut split = rest.splitn(2, ' ');
    let token = split.next().unwrap_or_default();
    if let Some(code) = EnhancedStatusCode::parse(token) {
        (Some(code), split.next().unwrap_or_default())
    } else {
        (None, rest)
    }
}

/// Which hello command established the session capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HelloKind {
    /// Extended hello; capability lines follow the greeting.
    Ehlo,
    /// Basic hello; no extension information is available.
    Helo,
}

impl HelloKind {
    /// The wire command name.
    pub fn command(self) -> &'static str {
        match self {
            HelloKind::Ehlo => "EHLO",
            HelloKind::Helo => "HELO",
        }
    }
}

/// Value of one discovered capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityValue {
    /// Plain extension flag.
    Flag(bool),
    /// `SIZE` limit (0 when the server did not announce one).
    Size(u64),
    /// `AUTH` mechanism list (possibly empty).
    Auth(Vec<String>),
    /// Server identifier from the greeting line.
    Ident(String),
}

/// Capability map discovered from a HELO/EHLO reply.
#[derive(Debug, Clone)]
pub struct Capabilities {
    kind: HelloKind,
    entries: HashMap<String, CapabilityValue>,
}

impl Capabilities {
    /// Parses the reply to the hello command that was actually sent.
    pub fn from_reply(kind: HelloKind, reply: &SmtpReply) -> Self {
        let mut entries = HashMap::new();
        let mut lines = reply.details.iter();

        if let Some(greeting) = lines.next() {
            let ident = greeting.split_whitespace().next().unwrap_or_default();
            entries.insert(
                kind.command().to_string(),
                CapabilityValue::Ident(ident.to_string()),
            );
        }

        for line in lines {
            let mut tokens = line.split_whitespace();
            let Some(name) = tokens.next() else {
                continue;
            };
            let name = name.to_uppercase();
            let value = match name.as_str() {
                "SIZE" => CapabilityValue::Size(
                    tokens.next().and_then(|t| t.parse().ok()).unwrap_or(0),
                ),
                "AUTH" => CapabilityValue::Auth(tokens.map(str::to_string).collect()),
                _ => CapabilityValue::Flag(true),
            };
            entries.insert(name, value);
        }

        Self { kind, entries }
    }

    /// Which hello command produced this map.
    pub fn kind(&self) -> HelloKind {
        self.kind
    }

    /// Raw access to a stored capability.
    pub fn get(&self, name: &str) -> Option<&CapabilityValue> {
        self.entries.get(name)
    }

    /// The server identifier from the greeting line.
    pub fn server_ident(&self) -> Option<&str> {
        match self.entries.get(self.kind.command()) {
            Some(CapabilityValue::Ident(ident)) => Some(ident),
            _ => None,
        }
    }
}
