//! Address value types and the bulk-verification collection.
//!
//! This module provides:
//! - [`EmailAddress`], an immutable local-part/domain pair
//! - canonicalization free functions shared with the blacklist
//! - [`AddressCollection`], an insertion-ordered set that groups
//!   addresses by canonical domain for bulk probing

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{VerifyError, VerifyResult};
use crate::syntax;

/// Lowercases a full address string for set-membership comparisons.
pub fn canonical_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Canonicalizes a domain: trims surrounding whitespace and dots, converts
/// IDN labels to their ASCII (Punycode) form, and lowercases.
///
/// Idempotent: applying it twice yields the same string.
pub fn canonical_domain(domain: &str) -> String {
    let trimmed = domain.trim().trim_matches('.');
    match idna::domain_to_ascii(trimmed) {
        Ok(ascii) => ascii,
        Err(_) => trimmed.to_lowercase(),
    }
}

/// An immutable, lexically valid email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmailAddress {
    raw: String,
    local: String,
    domain: String,
    display_name: Option<String>,
}

impl EmailAddress {
    /// Parses a trimmed input string into an address.
    ///
    /// The input must pass lexical validation; the rightmost `@` splits
    /// the local part from the domain. CR and LF are rejected with the
    /// rest of the control characters.
    pub fn parse(input: &str) -> VerifyResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VerifyError::argument("email must not be empty"));
        }
        if !syntax::check_email(trimmed) {
            return Err(VerifyError::argument(format!(
                "{trimmed:?} is not a valid email address"
            )));
        }

        // check_email guarantees an `@` is present.
        let Some(at) = trimmed.rfind('@') else {
            return Err(VerifyError::argument(format!(
                "{trimmed:?} is missing the @ delimiter"
            )));
        };
        Ok(Self {
            raw: trimmed.to_string(),
            local: trimmed[..at].to_string(),
            domain: trimmed[at + 1..].to_string(),
            display_name: None,
        })
    }

    /// Attaches a display name, e.g. for collections built from a
    /// directory export.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Returns the address exactly as parsed (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the local part (left of the rightmost `@`).
    pub fn local_part(&self) -> &str {
        &self.local
    }

    /// Returns the domain as written.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Returns the ASCII (Punycode) lowercase form of the domain.
    pub fn canonical_domain(&self) -> String {
        canonical_domain(&self.domain)
    }

    /// Returns the display name if one was attached.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} <{}>", name, self.raw),
            None => write!(f, "{}", self.raw),
        }
    }
}

impl TryFrom<&str> for EmailAddress {
    type Error = VerifyError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        EmailAddress::parse(s)
    }
}

impl TryFrom<String> for EmailAddress {
    type Error = VerifyError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        EmailAddress::parse(&s)
    }
}

/// An insertion-ordered set of addresses keyed by the lowercase of the
/// full address string.
///
/// Adding an address whose key is already present is a no-op, so two
/// spellings differing only in letter case count once.
#[derive(Debug, Clone, Default)]
pub struct AddressCollection {
    order: Vec<String>,
    entries: HashMap<String, EmailAddress>,
}

impl AddressCollection {
    /// Creates an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an address; returns false if its key was already present.
    pub fn add(&mut self, address: EmailAddress) -> bool {
        let key = canonical_email(address.as_str());
        if self.entries.contains_key(&key) {
            return false;
        }
        self.order.push(key.clone());
        self.entries.insert(key, address);
        true
    }

    /// Parses and inserts one address string.
    pub fn add_str(&mut self, email: &str) -> VerifyResult<bool> {
        Ok(self.add(EmailAddress::parse(email)?))
    }

    /// Parses and inserts many address strings; returns how many were new.
    pub fn add_many<I, S>(&mut self, emails: I) -> VerifyResult<usize>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for email in emails {
            if self.add_str(email.as_ref())? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Inserts address/display-name pairs; returns how many were new.
    pub fn add_many_named<I, S, N>(&mut self, pairs: I) -> VerifyResult<usize>
    where
        I: IntoIterator<Item = (S, N)>,
        S: AsRef<str>,
        N: Into<String>,
    {
        let mut added = 0;
        for (email, name) in pairs {
            let address = EmailAddress::parse(email.as_ref())?.with_display_name(name);
            if self.add(address) {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Returns true if the address is present (case-insensitive).
    pub fn has(&self, email: &str) -> bool {
        self.entries.contains_key(&canonical_email(email))
    }

    /// Looks up an address by string (case-insensitive).
    pub fn get(&self, email: &str) -> Option<&EmailAddress> {
        self.entries.get(&canonical_email(email))
    }

    /// Removes an address; returns true if it was present.
    pub fn remove(&mut self, email: &str) -> bool {
        let key = canonical_email(email);
        if self.entries.remove(&key).is_some() {
            self.order.retain(|k| k != &key);
            true
        } else {
            false
        }
    }

    /// Adds every address of `other` not already present.
    pub fn merge(&mut self, other: &AddressCollection) {
        for address in other.iter() {
            self.add(address.clone());
        }
    }

    /// Number of distinct addresses.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates addresses in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &EmailAddress> {
        self.order.iter().map(|key| &self.entries[key])
    }

    /// Returns the distinct canonical domains in first-encounter order.
    pub fn domains(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for address in self.iter() {
            let domain = address.canonical_domain();
            if !seen.contains(&domain) {
                seen.push(domain);
            }
        }
        seen
    }

    /// Returns the lowercase address strings whose canonical domain
    /// matches `domain` (trimmed of surrounding whitespace and dots).
    pub fn emails_in_domain(&self, domain: &str) -> Vec<String> {
        let wanted = canonical_domain(domain);
        self.iter()
            .filter(|address| address.canonical_domain() == wanted)
            .map(|address| canonical_email(address.as_str()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a AddressCollection {
    type Item = &'a EmailAddress;
    type IntoIter = Box<dyn Iterator<Item = &'a EmailAddress> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_at_rightmost_at() {
        let address = EmailAddress::parse("\"left@inside\"@example.com").unwrap();
        assert_eq!(address.local_part(), "\"left@inside\"");
        assert_eq!(address.domain(), "example.com");
    }

    #[test]
    fn parse_rejects_crlf() {
        assert!(EmailAddress::parse("user\r\n@example.com").is_err());
        assert!(EmailAddress::parse("").is_err());
    }

    #[test]
    fn canonical_domain_handles_idn() {
        assert_eq!(canonical_domain("BÜCHER.example"), "xn--bcher-kva.example");
        // Already-punycode domains only get lowercased.
        let address = EmailAddress::parse("user@XN--BCHER-KVA.Example").unwrap();
        assert_eq!(address.canonical_domain(), "xn--bcher-kva.example");
    }

    #[test]
    fn canonical_domain_is_idempotent() {
        for input in ["Example.COM.", " mail.example.org ", "bücher.example"] {
            let once = canonical_domain(input);
            assert_eq!(canonical_domain(&once), once);
        }
    }

    #[test]
    fn collection_dedups_case_insensitively() {
        let mut set = AddressCollection::new();
        assert!(set.add_str("User@Example.com").unwrap());
        assert!(!set.add_str("user@example.COM").unwrap());
        assert_eq!(set.len(), 1);
        assert!(set.has("USER@EXAMPLE.COM"));
    }

    #[test]
    fn collection_keeps_insertion_order() {
        let mut set = AddressCollection::new();
        set.add_many(["c@z.example", "a@y.example", "b@z.example"])
            .unwrap();
        let order: Vec<&str> = set.iter().map(EmailAddress::as_str).collect();
        assert_eq!(order, ["c@z.example", "a@y.example", "b@z.example"]);
        assert_eq!(set.domains(), ["z.example", "y.example"]);
    }

    #[test]
    fn emails_in_domain_normalizes_the_query() {
        let mut set = AddressCollection::new();
        set.add_many(["one@example.com", "Two@EXAMPLE.com", "other@else.example"])
            .unwrap();
        let hits = set.emails_in_domain(" example.com. ");
        assert_eq!(hits, ["one@example.com", "two@example.com"]);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut left = AddressCollection::new();
        left.add_str("a@example.com").unwrap();
        let mut right = AddressCollection::new();
        right.add_str("a@example.com").unwrap();
        right.add_str("b@example.com").unwrap();

        left.merge(&right);
        left.merge(&right);
        assert_eq!(left.len(), 2);
    }

    #[test]
    fn remove_preserves_remaining_order() {
        let mut set = AddressCollection::new();
        set.add_many(["a@x.example", "b@x.example", "c@x.example"])
            .unwrap();
        assert!(set.remove("B@X.EXAMPLE"));
        assert!(!set.remove("b@x.example"));
        let order: Vec<&str> = set.iter().map(EmailAddress::as_str).collect();
        assert_eq!(order, ["a@x.example", "c@x.example"]);
    }

    #[test]
    fn named_pairs_keep_display_names() {
        let mut set = AddressCollection::new();
        set.add_many_named([("lead@example.com", "Team Lead")]).unwrap();
        let address = set.get("lead@example.com").unwrap();
        assert_eq!(address.display_name(), Some("Team Lead"));
        assert_eq!(address.to_string(), "Team Lead <lead@example.com>");
    }
}
