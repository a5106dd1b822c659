//! # mailprobe
//!
//! Staged email deliverability verification:
//! - Lexical (RFC 5321/5322 subset) address validation
//! - DNS MX availability of the domain, with caching
//! - TCP reachability of a mail exchanger on port 25
//! - Server-side recipient acceptance via MAIL FROM / RCPT TO, without
//!   ever transmitting message data
//!
//! Callers pick a maximum depth; the verifier reports either
//! [`ValidationLevel::Ok`] or the deepest level that failed. Bulk mode
//! groups addresses by canonical domain and amortizes one SMTP session
//! across many recipients, chunked by a per-connection cap.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use mailprobe::{EmailVerifier, ValidationLevel, VerifierConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = VerifierConfig::builder()
//!         .validation_level(ValidationLevel::SendAttempt)
//!         .hello_domain("probe.example.com")
//!         .build()?;
//!
//!     let mut verifier = EmailVerifier::new(config)?;
//!     let level = verifier.verify("someone@example.com").await?;
//!     if level == ValidationLevel::Ok {
//!         println!("deliverable");
//!     } else {
//!         println!("failed at {level}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core value types
pub mod address;
pub mod errors;
pub mod level;

// Collaborators
pub mod blacklist;
pub mod cache;
pub mod dns;
pub mod syntax;

// Protocol layer
pub mod protocol;
pub mod session;

// Engine
pub mod config;
pub mod verifier;

// Test doubles
pub mod mocks;

// Re-exports for convenience
pub use address::{canonical_domain, canonical_email, AddressCollection, EmailAddress};
pub use blacklist::Blacklist;
pub use cache::{Cache, MemoryCache, NullCache};
pub use config::{VerifierConfig, VerifierConfigBuilder};
pub use dns::{canonize_fqdn, DnsFacade, DnsLookup, MxRecord, RblServer, RblStatus, SystemResolver};
pub use errors::{EnhancedStatusCode, LastError, SessionError, VerifyError, VerifyErrorKind, VerifyResult};
pub use level::ValidationLevel;
pub use protocol::{Capabilities, CapabilityValue, HelloKind, SmtpReply};
pub use session::{SessionState, SmtpSession, TransferLogEntry};
pub use syntax::check_email;
pub use verifier::EmailVerifier;
