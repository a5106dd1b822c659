//! Error types for the verifier.
//!
//! Only true preconditions (empty input, out-of-range level, invalid
//! configuration) surface as [`VerifyError`]. SMTP protocol misbehavior is
//! never an error from the public API: it is observable as a validation
//! level below `Ok` together with the session's [`LastError`] slot.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for verifier operations.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// Kinds of caller-facing failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerifyErrorKind {
    /// An argument violated a precondition (empty email, bad level, bad key).
    InvalidArgument,
    /// Configuration is invalid.
    ConfigurationInvalid,
}

impl fmt::Display for VerifyErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyErrorKind::InvalidArgument => write!(f, "Invalid argument"),
            VerifyErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
        }
    }
}

/// Caller-facing error with a kind and message.
#[derive(Error, Debug)]
pub struct VerifyError {
    kind: VerifyErrorKind,
    message: String,
}

impl VerifyError {
    /// Creates a new error.
    pub fn new(kind: VerifyErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an invalid-argument error.
    pub fn argument(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::InvalidArgument, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(VerifyErrorKind::ConfigurationInvalid, message)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> VerifyErrorKind {
        self.kind
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Enhanced SMTP status code (RFC 2034), e.g. `5.1.1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnhancedStatusCode {
    /// Class (2 = success, 4 = temporary, 5 = permanent).
    pub class: u8,
    /// Subject (1 = addressing, 2 = mailbox, ...).
    pub subject: u16,
    /// Detail code.
    pub detail: u16,
}

impl EnhancedStatusCode {
    /// Creates a new enhanced status code.
    pub fn new(class: u8, subject: u16, detail: u16) -> Self {
        Self {
            class,
            subject,
            detail,
        }
    }

    /// Parses an enhanced status code from a string such as `"5.1.1"`.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return None;
        }
        Some(Self {
            class: parts[0].parse().ok()?,
            subject: parts[1].parse().ok()?,
            detail: parts[2].parse().ok()?,
        })
    }

    /// Returns true for a permanent failure (class 5).
    pub fn is_permanent(&self) -> bool {
        self.class == 5
    }

    /// Returns true for a temporary failure (class 4).
    pub fn is_temporary(&self) -> bool {
        self.class == 4
    }
}

impl fmt::Display for EnhancedStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.class, self.subject, self.detail)
    }
}

/// Diagnostics for the most recent failed SMTP exchange.
///
/// Cleared on connect and on each successful command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    /// Short description, e.g. `"RCPT TO command failed"`.
    pub error: String,
    /// Server response detail with status prefixes stripped.
    pub detail: String,
    /// SMTP status code of the failing reply (0 when unparseable).
    pub smtp_code: u16,
    /// Enhanced status code if the server sent one.
    pub smtp_code_ex: Option<EnhancedStatusCode>,
}

/// Session-level failures driving engine control flow.
///
/// These never escape `verify`/`verify_bulk`; the engine maps them onto
/// validation levels and the [`LastError`] surface. They are the error
/// type of the lower-level [`SmtpSession`](crate::session::SmtpSession)
/// API.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("session is closed")]
    Closed,
    #[error("{command} contains CR or LF")]
    CrlfInjection { command: String },
    #[error("{command} command failed with code {code}")]
    UnexpectedReply { command: String, code: u16 },
    #[error("stream error: {0}")]
    Stream(String),
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    #[error("No HELO/EHLO was sent")]
    NoHello,
    #[error("HELO handshake was used; no extension info")]
    HeloNoExtensions,
}
