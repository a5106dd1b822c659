//! DNS facade for MX retrieval and RBL checks.
//!
//! Lookups go through the [`DnsLookup`] seam so tests can inject stub
//! resolvers; the production implementation wraps the system-configured
//! trust-dns resolver. Results are memoized in a pluggable [`Cache`]:
//! `"domain:<fqdn>"` holds the ordered MX host list (possibly empty),
//! `"rbl:<reversed-octets>"` holds `false` or a `[server, url]` pair.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::address::canonical_domain;
use crate::cache::{Cache, MemoryCache};
use crate::errors::{VerifyError, VerifyResult};

/// A mail exchanger host with its preference.
///
/// Ordering is by ascending preference, ties broken by host ascending, so
/// sorting a record list yields the probing order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct MxRecord {
    /// Preference value; lower is preferred.
    pub preference: u16,
    /// Exchanger hostname as returned by the resolver.
    pub host: String,
}

impl MxRecord {
    /// Creates a new record.
    pub fn new(host: impl Into<String>, preference: u16) -> Self {
        Self {
            preference,
            host: host.into(),
        }
    }
}

impl fmt::Display for MxRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.preference, self.host)
    }
}

/// Failures below the facade.
#[derive(Debug, Error)]
pub enum DnsLookupError {
    /// Authoritative answer that no records exist.
    #[error("no records found")]
    NoRecords,
    /// Transport or server failure; the answer is unknown.
    #[error("lookup failed: {0}")]
    Failed(String),
}

/// Resolver seam used by the facade.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Looks up the MX records of `fqdn`.
    async fn mx(&self, fqdn: &str) -> Result<Vec<MxRecord>, DnsLookupError>;

    /// Looks up the IPv4 addresses of `fqdn`.
    async fn a(&self, fqdn: &str) -> Result<Vec<Ipv4Addr>, DnsLookupError>;
}

/// System-configured recursive resolver.
pub struct SystemResolver {
    inner: TokioAsyncResolver,
}

impl SystemResolver {
    /// Builds a resolver from the system configuration.
    ///
    /// Returns `None` when no usable configuration exists; the facade then
    /// short-circuits every MX query to the empty list.
    pub fn from_system_conf() -> Option<Self> {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(inner) => Some(Self { inner }),
            Err(error) => {
                tracing::warn!(%error, "system resolver unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl DnsLookup for SystemResolver {
    async fn mx(&self, fqdn: &str) -> Result<Vec<MxRecord>, DnsLookupError> {
        match self.inner.mx_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| MxRecord::new(mx.exchange().to_ascii(), mx.preference()))
                .collect()),
            Err(error) => match error.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsLookupError::NoRecords),
                _ => Err(DnsLookupError::Failed(error.to_string())),
            },
        }
    }

    async fn a(&self, fqdn: &str) -> Result<Vec<Ipv4Addr>, DnsLookupError> {
        match self.inner.ipv4_lookup(fqdn).await {
            Ok(lookup) => Ok(lookup.iter().map(|a| a.0).collect()),
            Err(error) => match error.kind() {
                ResolveErrorKind::NoRecordsFound { .. } => Err(DnsLookupError::NoRecords),
                _ => Err(DnsLookupError::Failed(error.to_string())),
            },
        }
    }
}

/// A realtime-blacklist server and its public lookup page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RblServer {
    /// Zone queried via reversed-octet A lookups.
    pub host: String,
    /// Base URL for a human-readable listing check.
    pub lookup_url: String,
}

impl RblServer {
    /// Creates a new server entry.
    pub fn new(host: impl Into<String>, lookup_url: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            lookup_url: lookup_url.into(),
        }
    }
}

/// Outcome of an RBL consensus check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RblStatus {
    /// Not listed by every configured server (or IPv6 input).
    Clear,
    /// Listed by all servers; identifies the last confirming one.
    Listed {
        /// The confirming server's zone.
        server: String,
        /// Lookup URL with the original address appended.
        lookup_url: String,
    },
}

/// Canonicalizes a domain to FQDN form: trailing dots trimmed, exactly one
/// appended, lowercased. Idempotent.
pub fn canonize_fqdn(domain: &str) -> String {
    let trimmed = domain.trim().trim_end_matches('.');
    format!("{}.", trimmed.to_lowercase())
}

fn default_rbl_servers() -> Vec<RblServer> {
    vec![
        RblServer::new("zen.spamhaus.org", "https://check.spamhaus.org/listed/"),
        RblServer::new("bl.spamcop.net", "https://www.spamcop.net/bl.shtml"),
    ]
}

/// MX retrieval and RBL checks with cache memoization.
pub struct DnsFacade {
    lookup: Option<Arc<dyn DnsLookup>>,
    cache: Arc<dyn Cache>,
    rbl_servers: Vec<RblServer>,
}

impl DnsFacade {
    /// Builds a facade over the system resolver and a process-local cache.
    ///
    /// Resolver availability is probed once, here; an environment without
    /// DNS yields a facade whose MX queries all return the empty list.
    pub fn new() -> Self {
        let lookup = SystemResolver::from_system_conf()
            .map(|resolver| Arc::new(resolver) as Arc<dyn DnsLookup>);
        Self::with_parts(lookup, Arc::new(MemoryCache::new()))
    }

    /// Builds a facade from explicit collaborators.
    pub fn with_parts(lookup: Option<Arc<dyn DnsLookup>>, cache: Arc<dyn Cache>) -> Self {
        Self {
            lookup,
            cache,
            rbl_servers: default_rbl_servers(),
        }
    }

    /// Replaces the RBL server set.
    pub fn set_rbl_servers(&mut self, servers: Vec<RblServer>) {
        self.rbl_servers = servers;
    }

    /// Returns the MX hosts of `domain`, most preferred first.
    ///
    /// Cached under `"domain:<fqdn>"`; a no-records answer is cached as the
    /// empty list. Transient resolver failures return the empty list
    /// without caching.
    pub async fn mx_hosts_for_domain(&self, domain: &str) -> VerifyResult<Vec<String>> {
        if domain.trim().is_empty() {
            return Err(VerifyError::argument("domain must not be empty"));
        }

        let fqdn = canonize_fqdn(domain);
        let key = format!("domain:{fqdn}");
        if let Some(cached) = self.cache.get(&key) {
            if let Some(hosts) = value_to_hosts(&cached) {
                tracing::trace!(%fqdn, "MX cache hit");
                return Ok(hosts);
            }
        }

        let Some(lookup) = &self.lookup else {
            tracing::debug!(%fqdn, "no resolver available, returning empty MX list");
            return Ok(Vec::new());
        };

        match lookup.mx(&fqdn).await {
            Ok(mut records) => {
                records.sort();
                let hosts: Vec<String> = records.into_iter().map(|r| r.host).collect();
                self.cache.set(&key, json!(hosts), None);
                Ok(hosts)
            }
            Err(DnsLookupError::NoRecords) => {
                self.cache.set(&key, json!([]), None);
                Ok(Vec::new())
            }
            Err(DnsLookupError::Failed(reason)) => {
                tracing::warn!(%fqdn, %reason, "MX lookup failed");
                Ok(Vec::new())
            }
        }
    }

    /// Returns the MX hosts for an address's domain.
    ///
    /// The domain is taken after the rightmost `@` and converted from IDN
    /// to its ASCII form before delegation.
    pub async fn mx_hosts_for_email(&self, email: &str) -> VerifyResult<Vec<String>> {
        let email = email.trim();
        if email.is_empty() {
            return Err(VerifyError::argument("email must not be empty"));
        }
        let domain = match email.rfind('@') {
            Some(at) => &email[at + 1..],
            None => email,
        };
        self.mx_hosts_for_domain(&canonical_domain(domain)).await
    }

    /// Checks an IPv4 address against every configured RBL server.
    ///
    /// The address counts as listed only when all servers return a record;
    /// the reported pair names the last confirming server. IPv6 input is
    /// unsupported and cached as not listed. Octet parsing is deliberately
    /// lenient (leading digits, else zero).
    pub async fn check_rbl(&self, ip: &str) -> VerifyResult<RblStatus> {
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(VerifyError::argument("ip must not be empty"));
        }

        let reversed = reverse_octets(ip);
        let key = format!("rbl:{reversed}");

        if ip.contains(':') {
            self.cache.set(&key, json!(false), None);
            return Ok(RblStatus::Clear);
        }

        if let Some(cached) = self.cache.get(&key) {
            if let Some(status) = value_to_rbl_status(&cached) {
                tracing::trace!(%ip, "RBL cache hit");
                return Ok(status);
            }
        }

        let Some(lookup) = &self.lookup else {
            tracing::debug!(%ip, "no resolver available, skipping RBL check");
            return Ok(RblStatus::Clear);
        };

        let mut confirmed: Option<&RblServer> = None;
        for server in &self.rbl_servers {
            let name = format!("{reversed}.{}.", server.host);
            match lookup.a(&name).await {
                Ok(addresses) if !addresses.is_empty() => confirmed = Some(server),
                _ => {
                    confirmed = None;
                    break;
                }
            }
        }

        let status = match confirmed {
            Some(server) => RblStatus::Listed {
                server: server.host.clone(),
                lookup_url: format!("{}?ip={ip}", server.lookup_url),
            },
            None => RblStatus::Clear,
        };
        self.cache.set(&key, rbl_status_to_value(&status), None);
        Ok(status)
    }
}

impl Default for DnsFacade {
    fn default() -> Self {
        Self::new()
    }
}

/// Reverses dot-separated octets, casting each leniently to an integer.
fn reverse_octets(ip: &str) -> String {
    let mut octets: Vec<String> = ip.split('.').map(|part| lenient_octet(part).to_string()).collect();
    octets.reverse();
    octets.join(".")
}

fn lenient_octet(part: &str) -> u64 {
    let digits: String = part
        .trim()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().unwrap_or(0)
}

fn value_to_hosts(value: &Value) -> Option<Vec<String>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect()
}

fn value_to_rbl_status(value: &Value) -> Option<RblStatus> {
    if value == &Value::Bool(false) {
        return Some(RblStatus::Clear);
    }
    let pair = value.as_array()?;
    if pair.len() != 2 {
        return None;
    }
    Some(RblStatus::Listed {
        server: pair[0].as_str()?.to_string(),
        lookup_url: pair[1].as_str()?.to_string(),
    })
}

fn rbl_status_to_value(status: &RblStatus) -> Value {
    match status {
        RblStatus::Clear => json!(false),
        RblStatus::Listed { server, lookup_url } => json!([server, lookup_url]),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mocks::StubDns;

    fn facade(stub: StubDns) -> (DnsFacade, Arc<MemoryCache>) {
        let cache = Arc::new(MemoryCache::new());
        let facade = DnsFacade::with_parts(Some(Arc::new(stub)), cache.clone());
        (facade, cache)
    }

    #[test]
    fn canonize_fqdn_is_idempotent() {
        for input in ["Example.COM", "example.com.", "example.com..", " mx.example "] {
            let once = canonize_fqdn(input);
            assert_eq!(canonize_fqdn(&once), once);
            assert!(once.ends_with('.'));
            assert!(!once.ends_with(".."));
        }
    }

    #[tokio::test]
    async fn mx_hosts_sorted_by_preference_then_host() {
        let stub = StubDns::new().with_mx(
            "test.",
            vec![
                MxRecord::new("b.mx.", 20),
                MxRecord::new("a.mx.", 10),
                MxRecord::new("c.mx.", 10),
            ],
        );
        let (facade, _) = facade(stub);
        let hosts = facade.mx_hosts_for_domain("test").await.unwrap();
        assert_eq!(hosts, ["a.mx.", "c.mx.", "b.mx."]);
    }

    #[tokio::test]
    async fn mx_sort_is_stable_under_permutation() {
        let records = vec![
            MxRecord::new("beta.mx.", 5),
            MxRecord::new("alpha.mx.", 5),
        ];
        let mut reversed = records.clone();
        reversed.reverse();

        let (forward, _) = facade(StubDns::new().with_mx("tie.", records));
        let (backward, _) = facade(StubDns::new().with_mx("tie.", reversed));
        let a = forward.mx_hosts_for_domain("tie").await.unwrap();
        let b = backward.mx_hosts_for_domain("tie").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a, ["alpha.mx.", "beta.mx."]);
    }

    #[tokio::test]
    async fn empty_mx_answer_is_cached() {
        let (facade, cache) = facade(StubDns::new());
        let hosts = facade.mx_hosts_for_domain("no-mx.test").await.unwrap();
        assert!(hosts.is_empty());
        assert_eq!(cache.get("domain:no-mx.test."), Some(json!([])));
    }

    #[tokio::test]
    async fn cached_mx_list_short_circuits_lookup() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("domain:cached.test.", json!(["mx.cached.test."]), None);
        let facade = DnsFacade::with_parts(Some(Arc::new(StubDns::new())), cache);
        let hosts = facade.mx_hosts_for_domain("cached.test").await.unwrap();
        assert_eq!(hosts, ["mx.cached.test."]);
    }

    #[tokio::test]
    async fn missing_resolver_short_circuits_to_empty() {
        let facade = DnsFacade::with_parts(None, Arc::new(MemoryCache::new()));
        let hosts = facade.mx_hosts_for_domain("example.com").await.unwrap();
        assert!(hosts.is_empty());
    }

    #[tokio::test]
    async fn mx_for_email_converts_idn() {
        let stub = StubDns::new().with_mx(
            "xn--bcher-kva.example.",
            vec![MxRecord::new("mx.example.", 10)],
        );
        let (facade, _) = facade(stub);
        let hosts = facade.mx_hosts_for_email("user@BÜCHER.example").await.unwrap();
        assert_eq!(hosts, ["mx.example."]);
    }

    #[tokio::test]
    async fn empty_inputs_are_argument_errors() {
        let (facade, _) = facade(StubDns::new());
        assert!(facade.mx_hosts_for_domain("  ").await.is_err());
        assert!(facade.mx_hosts_for_email("").await.is_err());
        assert!(facade.check_rbl(" ").await.is_err());
    }

    #[tokio::test]
    async fn rbl_requires_consensus_of_all_servers() {
        // Listed only on the first of the two default servers.
        let stub = StubDns::new().with_a("2.0.0.127.zen.spamhaus.org.", vec![Ipv4Addr::new(127, 0, 0, 2)]);
        let (facade, cache) = facade(stub);
        let status = facade.check_rbl("127.0.0.2").await.unwrap();
        assert_eq!(status, RblStatus::Clear);
        assert_eq!(cache.get("rbl:2.0.0.127"), Some(json!(false)));
    }

    #[tokio::test]
    async fn rbl_listing_reports_last_server() {
        let stub = StubDns::new()
            .with_a("2.0.0.127.zen.spamhaus.org.", vec![Ipv4Addr::new(127, 0, 0, 2)])
            .with_a("2.0.0.127.bl.spamcop.net.", vec![Ipv4Addr::new(127, 0, 0, 2)]);
        let (facade, cache) = facade(stub);
        let status = facade.check_rbl("127.0.0.2").await.unwrap();
        assert_eq!(
            status,
            RblStatus::Listed {
                server: "bl.spamcop.net".to_string(),
                lookup_url: "https://www.spamcop.net/bl.shtml?ip=127.0.0.2".to_string(),
            }
        );
        assert_eq!(
            cache.get("rbl:2.0.0.127"),
            Some(json!(["bl.spamcop.net", "https://www.spamcop.net/bl.shtml?ip=127.0.0.2"]))
        );

        // Second call is served from the cache.
        let again = facade.check_rbl("127.0.0.2").await.unwrap();
        assert_eq!(again, status);
    }

    #[tokio::test]
    async fn rbl_ipv6_is_cached_as_clear() {
        let (facade, cache) = facade(StubDns::new());
        let status = facade.check_rbl("2001:db8::1").await.unwrap();
        assert_eq!(status, RblStatus::Clear);
        let key = format!("rbl:{}", reverse_octets("2001:db8::1"));
        assert_eq!(cache.get(&key), Some(json!(false)));
    }

    #[test]
    fn octet_reversal_is_lenient() {
        assert_eq!(reverse_octets("127.0.0.1"), "1.0.0.127");
        assert_eq!(reverse_octets("10.junk.3x.4"), "4.3.0.10");
    }

    #[tokio::test]
    async fn cache_ttl_is_honored() {
        let cache = Arc::new(MemoryCache::new());
        cache.set("domain:ttl.test.", json!(["stale.mx."]), Some(Duration::ZERO));
        let stub = StubDns::new().with_mx("ttl.test.", vec![MxRecord::new("fresh.mx.", 1)]);
        let facade = DnsFacade::with_parts(Some(Arc::new(stub)), cache);
        let hosts = facade.mx_hosts_for_domain("ttl.test").await.unwrap();
        assert_eq!(hosts, ["fresh.mx."]);
    }
}
