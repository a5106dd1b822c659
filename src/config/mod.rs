//! Verifier configuration.
//!
//! A builder over the options enumerated for the engine: requested depth,
//! hello/sender identities, timeouts, and the bulk recipients-per-connection
//! cap. Durations serialize in human-readable form (`"30s"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{VerifyError, VerifyResult};
use crate::level::ValidationLevel;

/// Default SMTP port for mail-exchanger probing.
pub const DEFAULT_PORT: u16 = 25;

/// Default TCP-connect and per-read idle timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default overall limit for a single read phase.
pub const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(300);

/// Default number of RCPT TO commands issued over one connection.
pub const DEFAULT_MAX_RECIPIENTS: usize = 50;

/// Configuration for [`EmailVerifier`](crate::verifier::EmailVerifier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Requested verification depth.
    #[serde(default = "default_level")]
    pub validation_level: ValidationLevel,
    /// Identity announced in EHLO/HELO; empty means the recipient's domain.
    #[serde(default)]
    pub hello_domain: String,
    /// Envelope sender for MAIL FROM; empty means `user@<hello domain>`.
    #[serde(default)]
    pub mail_from: String,
    /// TCP-connect and per-read idle timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Overall limit for one read phase.
    #[serde(default = "default_time_limit", with = "humantime_serde")]
    pub time_limit: Duration,
    /// Cap on RCPT TO commands per connection in bulk mode.
    #[serde(default = "default_max_recipients")]
    pub max_recipients_per_connection: usize,
    /// SMTP port probed on each mail exchanger.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_level() -> ValidationLevel {
    ValidationLevel::SendAttempt
}
fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}
fn default_time_limit() -> Duration {
    DEFAULT_TIME_LIMIT
}
fn default_max_recipients() -> usize {
    DEFAULT_MAX_RECIPIENTS
}
fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            validation_level: default_level(),
            hello_domain: String::new(),
            mail_from: String::new(),
            timeout: default_timeout(),
            time_limit: default_time_limit(),
            max_recipients_per_connection: default_max_recipients(),
            port: default_port(),
        }
    }
}

impl VerifierConfig {
    /// Creates a configuration builder.
    pub fn builder() -> VerifierConfigBuilder {
        VerifierConfigBuilder::default()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> VerifyResult<()> {
        self.validation_level.bounds_check()?;
        if self.max_recipients_per_connection == 0 {
            return Err(VerifyError::configuration(
                "max_recipients_per_connection must be at least 1",
            ));
        }
        if self.port == 0 {
            return Err(VerifyError::configuration("port must be non-zero"));
        }
        if self.timeout.is_zero() {
            return Err(VerifyError::configuration("timeout must be non-zero"));
        }
        Ok(())
    }

    /// The hello identity for a recipient in `domain`.
    pub fn hello_domain_for(&self, domain: &str) -> String {
        if self.hello_domain.is_empty() {
            domain.to_string()
        } else {
            self.hello_domain.clone()
        }
    }

    /// The envelope sender given the effective hello identity.
    pub fn mail_from_for(&self, hello_domain: &str) -> String {
        if self.mail_from.is_empty() {
            format!("user@{hello_domain}")
        } else {
            self.mail_from.clone()
        }
    }
}

/// Builder for [`VerifierConfig`].
#[derive(Debug, Default)]
pub struct VerifierConfigBuilder {
    config: VerifierConfig,
}

impl VerifierConfigBuilder {
    /// Sets the requested verification depth.
    pub fn validation_level(mut self, level: ValidationLevel) -> Self {
        self.config.validation_level = level;
        self
    }

    /// Sets the EHLO/HELO identity.
    pub fn hello_domain(mut self, domain: impl Into<String>) -> Self {
        self.config.hello_domain = domain.into();
        self
    }

    /// Sets the MAIL FROM envelope sender.
    pub fn mail_from(mut self, sender: impl Into<String>) -> Self {
        self.config.mail_from = sender.into();
        self
    }

    /// Sets the connect/read timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Sets the overall read-phase limit.
    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.config.time_limit = limit;
        self
    }

    /// Sets the bulk recipients-per-connection cap.
    pub fn max_recipients_per_connection(mut self, cap: usize) -> Self {
        self.config.max_recipients_per_connection = cap;
        self
    }

    /// Sets the SMTP port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> VerifyResult<VerifierConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
