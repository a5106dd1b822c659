//! Lexical email validation.
//!
//! A pure predicate over RFC 5321/5322 address syntax with the hostname,
//! IP-literal, and local-part extensions the verifier accepts. Performs no
//! I/O; deliverability of the domain is the job of the DNS stage.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Maximum total length of an address, per RFC 5321 path limits.
const MAX_ADDRESS_LEN: usize = 254;

/// Maximum length of a single domain label.
const MAX_LABEL_LEN: usize = 63;

/// Returns true if `email` is lexically a valid address.
///
/// The input is trimmed first. The rightmost `@` splits the local part
/// from the domain; the local part must be a dot-atom or a quoted string,
/// the domain either a bracketed IPv4/IPv6 literal or a dotted sequence of
/// at least two LDH labels.
pub fn check_email(email: &str) -> bool {
    let email = email.trim();
    if email.is_empty() || email.len() > MAX_ADDRESS_LEN {
        return false;
    }
    if email.chars().any(char::is_control) {
        return false;
    }

    let Some(at) = email.rfind('@') else {
        return false;
    };
    let (local, domain) = (&email[..at], &email[at + 1..]);

    check_local_part(local) && check_domain(domain)
}

fn check_local_part(local: &str) -> bool {
    if local.is_empty() {
        return false;
    }
    if local.starts_with('"') {
        check_quoted_string(local)
    } else {
        check_dot_atom(local)
    }
}

/// Characters permitted in an unquoted atom, per RFC 5322 `atext`.
fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn check_dot_atom(local: &str) -> bool {
    local
        .split('.')
        .all(|atom| !atom.is_empty() && atom.chars().all(is_atext))
}

fn check_quoted_string(local: &str) -> bool {
    let mut chars = local.chars();
    if chars.next() != Some('"') || local.len() < 2 || !local.ends_with('"') {
        return false;
    }

    // Interior of the quotes: printable text with backslash escape pairs.
    let inner = &local[1..local.len() - 1];
    let mut escaped = false;
    for c in inner.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => return false,
            _ => {}
        }
    }
    !escaped
}

fn check_domain(domain: &str) -> bool {
    if domain.is_empty() {
        return false;
    }
    if domain.starts_with('[') {
        return check_address_literal(domain);
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    if !labels.iter().all(|label| check_label(label)) {
        return false;
    }

    // The TLD must be alphabetic unless it is a punycode label.
    let last = labels[labels.len() - 1];
    last.starts_with("xn--") || last.chars().all(|c| c.is_ascii_alphabetic())
}

/// Validates one LDH label, with an optional `xn--` punycode prefix.
fn check_label(label: &str) -> bool {
    let body = label.strip_prefix("xn--").unwrap_or(label);
    if body.is_empty() || body.len() > MAX_LABEL_LEN {
        return false;
    }
    let bytes = body.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

fn check_address_literal(domain: &str) -> bool {
    let Some(inner) = domain.strip_prefix('[').and_then(|d| d.strip_suffix(']')) else {
        return false;
    };
    if let Some(v6) = inner.strip_prefix("IPv6:") {
        return v6.parse::<Ipv6Addr>().is_ok();
    }
    inner.parse::<Ipv4Addr>().is_ok()
}
