//! The staged verification engine.
//!
//! Escalates through syntax, DNS MX, TCP connect, and RCPT acceptance up
//! to the configured depth, reporting either `Ok` or the deepest level
//! that failed. Bulk mode amortizes one SMTP session across many
//! recipients of a shared domain, chunked by a per-connection cap.

use std::collections::HashMap;

use crate::address::{canonical_domain, canonical_email, AddressCollection, EmailAddress};
use crate::config::VerifierConfig;
use crate::dns::DnsFacade;
use crate::errors::{LastError, SessionError, VerifyError, VerifyResult};
use crate::level::ValidationLevel;
use crate::session::{SmtpSession, TransferLogEntry};
use crate::syntax;

/// Outcome of probing one mail exchanger.
enum ProbeOutcome {
    /// The TCP connection could not be established.
    ConnectFailed,
    /// Connected, but the SMTP transaction was refused.
    CommandFailed,
    /// The requested depth was reached on this host.
    Accepted,
}

/// Staged email deliverability verifier.
///
/// One verifier drives one verification at a time; independent
/// verifications may run in parallel on separate instances.
pub struct EmailVerifier {
    config: VerifierConfig,
    dns: DnsFacade,
    transfer_logs: HashMap<String, Vec<TransferLogEntry>>,
    last_error: Option<LastError>,
}

impl EmailVerifier {
    /// Creates a verifier over the system resolver.
    pub fn new(config: VerifierConfig) -> VerifyResult<Self> {
        Self::with_dns(config, DnsFacade::new())
    }

    /// Creates a verifier with an explicit DNS facade.
    pub fn with_dns(config: VerifierConfig, dns: DnsFacade) -> VerifyResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            dns,
            transfer_logs: HashMap::new(),
            last_error: None,
        })
    }

    /// The active configuration.
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Sets the requested verification depth.
    pub fn set_validation_level(&mut self, level: ValidationLevel) -> VerifyResult<()> {
        level.bounds_check()?;
        self.config.validation_level = level;
        Ok(())
    }

    /// Sets the EHLO/HELO identity; empty restores the recipient-domain
    /// default.
    pub fn set_hello_domain(&mut self, domain: impl Into<String>) {
        self.config.hello_domain = domain.into();
    }

    /// Sets the MAIL FROM sender; empty restores the `user@<hello>` default.
    pub fn set_mail_from(&mut self, sender: impl Into<String>) {
        self.config.mail_from = sender.into();
    }

    /// Sets the connect/read timeout.
    pub fn set_timeout(&mut self, timeout: std::time::Duration) -> VerifyResult<()> {
        if timeout.is_zero() {
            return Err(VerifyError::configuration("timeout must be non-zero"));
        }
        self.config.timeout = timeout;
        Ok(())
    }

    /// Sets the bulk recipients-per-connection cap.
    pub fn set_max_recipients_per_connection(&mut self, cap: usize) -> VerifyResult<()> {
        if cap == 0 {
            return Err(VerifyError::configuration(
                "max_recipients_per_connection must be at least 1",
            ));
        }
        self.config.max_recipients_per_connection = cap;
        Ok(())
    }

    /// Per-MX-host transfer logs captured by the most recent verification.
    pub fn transfer_logs(&self) -> &HashMap<String, Vec<TransferLogEntry>> {
        &self.transfer_logs
    }

    /// Diagnostics from the most recent failed SMTP exchange, if any.
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Verifies a single address up to the configured depth.
    ///
    /// Returns `Ok(ValidationLevel::Ok)` when the requested depth
    /// succeeded, otherwise the deepest level that failed. Only an empty
    /// input is an error.
    pub async fn verify(&mut self, email: &str) -> VerifyResult<ValidationLevel> {
        let email = email.trim();
        if email.is_empty() {
            return Err(VerifyError::argument("email must not be empty"));
        }
        self.transfer_logs.clear();
        self.last_error = None;

        let requested = self.config.validation_level;
        let mut current = ValidationLevel::SyntaxCheck;

        if !syntax::check_email(email) {
            tracing::debug!(email, "syntax check failed");
            return Ok(current);
        }
        if requested == ValidationLevel::SyntaxCheck {
            return Ok(ValidationLevel::Ok);
        }
        current = current.next();

        let hosts = self.dns.mx_hosts_for_email(email).await?;
        if hosts.is_empty() {
            tracing::debug!(email, "domain has no mail exchangers");
            return Ok(current);
        }
        if requested == ValidationLevel::DnsQuery {
            return Ok(ValidationLevel::Ok);
        }
        current = current.next();

        let domain = domain_of(email);
        for host in &hosts {
            match self.probe_mx(host, &domain, email).await {
                ProbeOutcome::Accepted => return Ok(ValidationLevel::Ok),
                ProbeOutcome::CommandFailed => current = ValidationLevel::SendAttempt,
                ProbeOutcome::ConnectFailed => {}
            }
        }
        Ok(current)
    }

    /// Verifies many addresses, batching SMTP work per canonical domain.
    ///
    /// Every input address appears exactly once in the result, keyed by
    /// its lowercase form; addresses failing syntax are reported at
    /// `SyntaxCheck` and never probed.
    pub async fn verify_bulk<I, S>(
        &mut self,
        emails: I,
    ) -> VerifyResult<HashMap<String, ValidationLevel>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.transfer_logs.clear();
        self.last_error = None;

        let requested = self.config.validation_level;
        let mut results = HashMap::new();
        let mut valid = AddressCollection::new();

        for email in emails {
            let email = email.as_ref().trim();
            if email.is_empty() {
                return Err(VerifyError::argument("email must not be empty"));
            }
            match EmailAddress::parse(email) {
                Ok(address) => {
                    valid.add(address);
                }
                Err(_) => {
                    results.insert(canonical_email(email), ValidationLevel::SyntaxCheck);
                }
            }
        }

        for domain in valid.domains() {
            let members = valid.emails_in_domain(&domain);
            tracing::debug!(%domain, recipients = members.len(), "verifying domain group");

            if requested == ValidationLevel::SyntaxCheck {
                mark(&mut results, &members, ValidationLevel::Ok);
                continue;
            }
            let hosts = self.dns.mx_hosts_for_domain(&domain).await?;
            if hosts.is_empty() {
                mark(&mut results, &members, ValidationLevel::DnsQuery);
                continue;
            }
            if requested == ValidationLevel::DnsQuery {
                mark(&mut results, &members, ValidationLevel::Ok);
                continue;
            }
            if requested == ValidationLevel::SmtpConnection {
                self.bulk_connect_only(&hosts, &members, &mut results).await;
                continue;
            }
            self.bulk_send_attempt(&domain, &hosts, &members, &mut results)
                .await;
        }

        Ok(results)
    }

    /// Probes one exchanger for a single recipient.
    ///
    /// The session is closed on every exit path; its transfer log is
    /// captured under the host name either way.
    async fn probe_mx(&mut self, host: &str, domain: &str, email: &str) -> ProbeOutcome {
        let helo_host = self.config.hello_domain_for(domain);
        let sender = self.config.mail_from_for(&helo_host);

        let mut session = match self.open_session(host).await {
            Ok(session) => session,
            Err(()) => return ProbeOutcome::ConnectFailed,
        };

        if self.config.validation_level == ValidationLevel::SmtpConnection {
            self.capture_log(host, &session);
            session.close();
            return ProbeOutcome::Accepted;
        }

        let accepted = run_transaction(&mut session, &helo_host, &sender, email).await;
        self.last_error = session.last_error().cloned();
        let _ = session.quit().await;
        self.capture_log(host, &session);

        if accepted {
            ProbeOutcome::Accepted
        } else {
            ProbeOutcome::CommandFailed
        }
    }

    /// Connection-depth bulk probing: the first reachable exchanger
    /// settles the whole domain.
    async fn bulk_connect_only(
        &mut self,
        hosts: &[String],
        members: &[String],
        results: &mut HashMap<String, ValidationLevel>,
    ) {
        for host in hosts {
            match self.open_session(host).await {
                Ok(mut session) => {
                    self.capture_log(host, &session);
                    session.close();
                    mark(results, members, ValidationLevel::Ok);
                    return;
                }
                Err(()) => {}
            }
        }
        mark(results, members, ValidationLevel::SmtpConnection);
    }

    /// Full-depth bulk probing with per-connection recipient chunking.
    ///
    /// The first exchanger that accepts EHLO + MAIL FROM claims the
    /// domain; later chunks open fresh sessions to it only.
    async fn bulk_send_attempt(
        &mut self,
        domain: &str,
        hosts: &[String],
        members: &[String],
        results: &mut HashMap<String, ValidationLevel>,
    ) {
        let helo_host = self.config.hello_domain_for(domain);
        let sender = self.config.mail_from_for(&helo_host);
        let mut current = ValidationLevel::SmtpConnection;
        let mut claimed: Option<String> = None;

        for chunk in members.chunks(self.config.max_recipients_per_connection) {
            let candidates: Vec<String> = match &claimed {
                Some(host) => vec![host.clone()],
                None => hosts.to_vec(),
            };

            for host in &candidates {
                let mut session = match self.open_session(host).await {
                    Ok(session) => session,
                    Err(()) => {
                        mark(results, chunk, current);
                        continue;
                    }
                };
                current = ValidationLevel::SendAttempt;

                let ready = session.hello(&helo_host).await.is_ok()
                    && session.mail_from(&sender).await.is_ok();
                if !ready {
                    self.last_error = session.last_error().cloned();
                    mark(results, chunk, current);
                    let _ = session.quit().await;
                    self.capture_log(host, &session);
                    continue;
                }

                claimed = Some(host.clone());
                for email in chunk {
                    let accepted = session.rcpt_to(email).await.is_ok();
                    results.insert(
                        email.clone(),
                        if accepted { ValidationLevel::Ok } else { current },
                    );
                }
                self.last_error = session.last_error().cloned();
                let _ = session.quit().await;
                self.capture_log(host, &session);
                break;
            }
        }
    }

    /// Opens a session, recording a connect failure in the last-error
    /// slot.
    async fn open_session(&mut self, host: &str) -> Result<SmtpSession, ()> {
        match SmtpSession::connect(
            host,
            self.config.port,
            self.config.timeout,
            self.config.time_limit,
        )
        .await
        {
            Ok(session) => {
                self.last_error = None;
                Ok(session)
            }
            Err(error) => {
                tracing::debug!(%host, %error, "MX connect failed");
                self.last_error = Some(connect_failure(&error));
                Err(())
            }
        }
    }

    fn capture_log(&mut self, host: &str, session: &SmtpSession) {
        self.transfer_logs
            .entry(host.to_string())
            .or_default()
            .extend_from_slice(session.transfer_log());
    }
}

impl Default for EmailVerifier {
    fn default() -> Self {
        Self::with_dns(VerifierConfig::default(), DnsFacade::new())
            .expect("default configuration is valid")
    }
}

/// EHLO/HELO + MAIL FROM + RCPT TO; true only when all three succeed.
async fn run_transaction(
    session: &mut SmtpSession,
    helo_host: &str,
    sender: &str,
    email: &str,
) -> bool {
    if session.hello(helo_host).await.is_err() {
        return false;
    }
    if session.mail_from(sender).await.is_err() {
        return false;
    }
    session.rcpt_to(email).await.is_ok()
}

fn connect_failure(error: &SessionError) -> LastError {
    LastError {
        error: "connect failed".to_string(),
        detail: error.to_string(),
        smtp_code: 0,
        smtp_code_ex: None,
    }
}

fn mark(results: &mut HashMap<String, ValidationLevel>, emails: &[String], level: ValidationLevel) {
    for email in emails {
        results.insert(email.clone(), level);
    }
}

fn domain_of(email: &str) -> String {
    let domain = email.rfind('@').map_or(email, |at| &email[at + 1..]);
    canonical_domain(domain)
}
