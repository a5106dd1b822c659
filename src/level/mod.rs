//! Verification depth levels.
//!
//! The verifier escalates through these stages in order; `Ok` is a
//! sentinel meaning the requested depth was reached successfully.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{VerifyError, VerifyResult};

/// A point in the verification escalation ordering.
///
/// Levels are totally ordered: `SyntaxCheck < DnsQuery < SmtpConnection <
/// SendAttempt < Ok`. A result below `Ok` names the deepest stage that
/// failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ValidationLevel {
    /// Lexical validation of the address.
    SyntaxCheck = 1,
    /// MX availability of the domain.
    DnsQuery = 2,
    /// TCP reachability of a mail exchanger.
    SmtpConnection = 3,
    /// Server-side acceptance of the recipient.
    SendAttempt = 4,
    /// Sentinel: the requested depth was reached.
    Ok = 5,
}

impl ValidationLevel {
    /// Returns the next deeper level, saturating at [`ValidationLevel::Ok`].
    pub fn next(self) -> ValidationLevel {
        match self {
            ValidationLevel::SyntaxCheck => ValidationLevel::DnsQuery,
            ValidationLevel::DnsQuery => ValidationLevel::SmtpConnection,
            ValidationLevel::SmtpConnection => ValidationLevel::SendAttempt,
            ValidationLevel::SendAttempt | ValidationLevel::Ok => ValidationLevel::Ok,
        }
    }

    /// Rejects levels that are not a valid requested depth.
    ///
    /// `Ok` is a result sentinel, never a depth a caller may request.
    pub fn bounds_check(self) -> VerifyResult<()> {
        if self >= ValidationLevel::Ok {
            return Err(VerifyError::argument(format!(
                "validation level {self} is out of range"
            )));
        }
        Ok(())
    }

    /// Returns the numeric rank of the level.
    pub fn rank(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ValidationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationLevel::SyntaxCheck => "syntax_check",
            ValidationLevel::DnsQuery => "dns_query",
            ValidationLevel::SmtpConnection => "smtp_connection",
            ValidationLevel::SendAttempt => "send_attempt",
            ValidationLevel::Ok => "ok",
        };
        write!(f, "{name}")
    }
}

impl TryFrom<u8> for ValidationLevel {
    type Error = VerifyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ValidationLevel::SyntaxCheck),
            2 => Ok(ValidationLevel::DnsQuery),
            3 => Ok(ValidationLevel::SmtpConnection),
            4 => Ok(ValidationLevel::SendAttempt),
            5 => Ok(ValidationLevel::Ok),
            other => Err(VerifyError::argument(format!(
                "{other} is not a validation level"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn levels_are_totally_ordered() {
        assert!(ValidationLevel::SyntaxCheck < ValidationLevel::DnsQuery);
        assert!(ValidationLevel::DnsQuery < ValidationLevel::SmtpConnection);
        assert!(ValidationLevel::SmtpConnection < ValidationLevel::SendAttempt);
        assert!(ValidationLevel::SendAttempt < ValidationLevel::Ok);
    }

    #[rstest]
    #[case(ValidationLevel::SyntaxCheck, ValidationLevel::DnsQuery)]
    #[case(ValidationLevel::DnsQuery, ValidationLevel::SmtpConnection)]
    #[case(ValidationLevel::SmtpConnection, ValidationLevel::SendAttempt)]
    #[case(ValidationLevel::SendAttempt, ValidationLevel::Ok)]
    #[case(ValidationLevel::Ok, ValidationLevel::Ok)]
    fn next_saturates_at_ok(#[case] level: ValidationLevel, #[case] expected: ValidationLevel) {
        assert_eq!(level.next(), expected);
    }

    #[test]
    fn bounds_check_rejects_ok() {
        assert!(ValidationLevel::SyntaxCheck.bounds_check().is_ok());
        assert!(ValidationLevel::SendAttempt.bounds_check().is_ok());
        assert!(ValidationLevel::Ok.bounds_check().is_err());
    }

    #[test]
    fn try_from_round_trips() {
        for rank in 1u8..=5 {
            let level = ValidationLevel::try_from(rank).unwrap();
            assert_eq!(level.rank(), rank);
        }
        assert!(ValidationLevel::try_from(0).is_err());
        assert!(ValidationLevel::try_from(6).is_err());
    }
}
