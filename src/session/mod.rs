//! A single TCP session to an SMTP server.
//!
//! Executes the command subset recipient verification needs (EHLO/HELO,
//! MAIL FROM, RCPT TO, NOOP, RSET, VRFY, STARTTLS, QUIT), parses all
//! replies including multi-line ones, and keeps an append-only transfer
//! log plus a last-error slot for diagnostics.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::errors::LastError;
use crate::protocol::{codes, Capabilities, CapabilityValue, HelloKind, SmtpReply};

pub use crate::errors::SessionError;

/// One command/response pair from a session, in wire order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLogEntry {
    /// The command as written (or `"<CONNECT>"` for the greeting).
    pub command: String,
    /// The raw server response.
    pub response: String,
    /// Parsed status code of the response.
    pub smtp_code: u16,
    /// Whether the exchange counted as successful.
    pub success: bool,
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket open, greeting consumed, no hello sent yet.
    Connected,
    /// Hello exchange completed with the recorded command.
    Greeted(HelloKind),
    /// Socket released; every further command fails.
    Closed,
}

enum SessionStream {
    Plain(BufReader<TcpStream>),
    Tls(BufReader<TlsStream<TcpStream>>),
    Closed,
}

/// A live SMTP client session.
///
/// A value of this type only exists once the socket is up; dropping it (or
/// calling [`close`](Self::close), which is idempotent) releases the
/// connection. The transfer log is reset only by a fresh connect.
pub struct SmtpSession {
    host: String,
    stream: SessionStream,
    state: SessionState,
    read_timeout: Duration,
    time_limit: Duration,
    transfer_log: Vec<TransferLogEntry>,
    last_error: Option<LastError>,
    capabilities: Option<Capabilities>,
}

impl SmtpSession {
    /// Opens a TCP connection and consumes the server's greeting.
    ///
    /// The greeting is recorded as a `"<CONNECT>"` transfer-log entry with
    /// `success = (code == 220)`; a non-220 greeting does not fail the
    /// connect, the next command just fails naturally. `timeout` bounds
    /// both the connect and each subsequent read; `time_limit` bounds a
    /// whole read phase.
    pub async fn connect(
        host: &str,
        port: u16,
        timeout_per_op: Duration,
        time_limit: Duration,
    ) -> Result<Self, SessionError> {
        let address = format!("{host}:{port}");
        tracing::debug!(%address, "opening SMTP session");

        let stream = timeout(timeout_per_op, TcpStream::connect(&address))
            .await
            .map_err(|_| SessionError::Connect(format!("connect to {address} timed out")))?
            .map_err(|e| SessionError::Connect(format!("connect to {address} failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let mut session = Self {
            host: host.to_string(),
            stream: SessionStream::Plain(BufReader::new(stream)),
            state: SessionState::Connected,
            read_timeout: timeout_per_op,
            time_limit,
            transfer_log: Vec::new(),
            last_error: None,
            capabilities: None,
        };

        let greeting = session.read_reply().await;
        let success = greeting.code == codes::SERVICE_READY;
        session.transfer_log.push(TransferLogEntry {
            command: "<CONNECT>".to_string(),
            response: greeting.raw.clone(),
            smtp_code: greeting.code,
            success,
        });
        tracing::debug!(code = greeting.code, "greeting received");

        Ok(session)
    }

    /// The host this session was opened against.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true until the session is closed.
    pub fn is_connected(&self) -> bool {
        self.state != SessionState::Closed
    }

    /// The session's transfer log, oldest entry first.
    pub fn transfer_log(&self) -> &[TransferLogEntry] {
        &self.transfer_log
    }

    /// Diagnostics for the most recent failed command, if any.
    pub fn last_error(&self) -> Option<&LastError> {
        self.last_error.as_ref()
    }

    /// Capability map discovered by [`hello`](Self::hello), if any.
    pub fn capabilities(&self) -> Option<&Capabilities> {
        self.capabilities.as_ref()
    }

    /// Sends one command line and checks the reply code against `expect`.
    ///
    /// `raw` must not contain CR or LF; a violation fails immediately with
    /// the last-error slot set and nothing written. A transfer-log entry
    /// is appended for every command that reaches the wire, successful or
    /// not.
    pub async fn send_command(
        &mut self,
        name: &str,
        raw: &str,
        expect: &[u16],
    ) -> Result<SmtpReply, SessionError> {
        if !self.is_connected() || matches!(self.stream, SessionStream::Closed) {
            self.last_error = Some(LastError {
                error: format!("{name} command failed"),
                detail: "session is closed".to_string(),
                smtp_code: 0,
                smtp_code_ex: None,
            });
            return Err(SessionError::Closed);
        }
        if raw.contains(['\r', '\n']) {
            self.last_error = Some(LastError {
                error: format!("{name} command failed"),
                detail: "command contains CR or LF".to_string(),
                smtp_code: 0,
                smtp_code_ex: None,
            });
            return Err(SessionError::CrlfInjection {
                command: name.to_string(),
            });
        }

        tracing::trace!(command = raw, "sending");
        if let Err(error) = self.write_line(raw).await {
            self.transfer_log.push(TransferLogEntry {
                command: raw.to_string(),
                response: String::new(),
                smtp_code: 0,
                success: false,
            });
            self.last_error = Some(LastError {
                error: format!("{name} command failed"),
                detail: error.clone(),
                smtp_code: 0,
                smtp_code_ex: None,
            });
            return Err(SessionError::Stream(error));
        }

        let reply = self.read_reply().await;
        let success = expect.contains(&reply.code);
        self.transfer_log.push(TransferLogEntry {
            command: raw.to_string(),
            response: reply.raw.clone(),
            smtp_code: reply.code,
            success,
        });
        tracing::trace!(code = reply.code, success, "reply received");

        if success {
            self.last_error = None;
            Ok(reply)
        } else {
            self.last_error = Some(LastError {
                error: format!("{name} command failed"),
                detail: reply.detail(),
                smtp_code: reply.code,
                smtp_code_ex: reply.code_ex.clone(),
            });
            Err(SessionError::UnexpectedReply {
                command: name.to_string(),
                code: reply.code,
            })
        }
    }

    /// Performs the hello exchange: EHLO first, HELO on any non-250.
    ///
    /// On success the reply is parsed into the capability map.
    pub async fn hello(&mut self, helo_host: &str) -> Result<(), SessionError> {
        match self
            .send_command("EHLO", &format!("EHLO {helo_host}"), &[codes::OK])
            .await
        {
            Ok(reply) => {
                self.capabilities = Some(Capabilities::from_reply(HelloKind::Ehlo, &reply));
                self.state = SessionState::Greeted(HelloKind::Ehlo);
                Ok(())
            }
            Err(_) => {
                let reply = self
                    .send_command("HELO", &format!("HELO {helo_host}"), &[codes::OK])
                    .await?;
                self.capabilities = Some(Capabilities::from_reply(HelloKind::Helo, &reply));
                self.state = SessionState::Greeted(HelloKind::Helo);
                Ok(())
            }
        }
    }

    /// Resolves a capability recorded by the hello exchange.
    ///
    /// Before any hello this is an error; after a HELO handshake only the
    /// greeting identifier is known, so asking for an extension is an
    /// error too. Asking for `"HELO"` after an EHLO yields the server
    /// identifier; `"EHLO"` when the extended hello was not used yields
    /// `Flag(false)`. An unknown extension after EHLO resolves to `None`.
    pub fn server_capability(
        &mut self,
        name: &str,
    ) -> Result<Option<CapabilityValue>, SessionError> {
        let Some(caps) = &self.capabilities else {
            self.last_error = Some(LastError {
                error: "No HELO/EHLO was sent".to_string(),
                detail: String::new(),
                smtp_code: 0,
                smtp_code_ex: None,
            });
            return Err(SessionError::NoHello);
        };

        if let Some(value) = caps.get(name) {
            return Ok(Some(value.clone()));
        }
        match (name, caps.kind()) {
            ("HELO", HelloKind::Ehlo) => Ok(caps.get("EHLO").cloned()),
            ("EHLO", _) => Ok(Some(CapabilityValue::Flag(false))),
            (_, HelloKind::Helo) => {
                self.last_error = Some(LastError {
                    error: "HELO handshake was used; no extension info".to_string(),
                    detail: String::new(),
                    smtp_code: 0,
                    smtp_code_ex: None,
                });
                Err(SessionError::HeloNoExtensions)
            }
            _ => Ok(None),
        }
    }

    /// Sends `MAIL FROM:<sender>`.
    pub async fn mail_from(&mut self, sender: &str) -> Result<(), SessionError> {
        self.send_command("MAIL FROM", &format!("MAIL FROM:<{sender}>"), &[codes::OK])
            .await
            .map(drop)
    }

    /// Sends `RCPT TO:<recipient>`; 250 and 251 both count as accepted.
    pub async fn rcpt_to(&mut self, recipient: &str) -> Result<(), SessionError> {
        self.send_command(
            "RCPT TO",
            &format!("RCPT TO:<{recipient}>"),
            &[codes::OK, codes::WILL_FORWARD],
        )
        .await
        .map(drop)
    }

    /// Sends `NOOP`.
    pub async fn noop(&mut self) -> Result<(), SessionError> {
        self.send_command("NOOP", "NOOP", &[codes::OK]).await.map(drop)
    }

    /// Sends `RSET`, aborting the current mail transaction.
    pub async fn rset(&mut self) -> Result<(), SessionError> {
        self.send_command("RSET", "RSET", &[codes::OK]).await.map(drop)
    }

    /// Sends `VRFY <name>`.
    pub async fn vrfy(&mut self, name: &str) -> Result<(), SessionError> {
        self.send_command(
            "VRFY",
            &format!("VRFY {name}"),
            &[codes::OK, codes::WILL_FORWARD],
        )
        .await
        .map(drop)
    }

    /// Sends `STARTTLS` and upgrades the transport to TLS.
    ///
    /// Succeeds only when the server answered 220 and the handshake
    /// completed. Capabilities are cleared; the caller must re-issue
    /// [`hello`](Self::hello) to re-discover them over the secure channel.
    pub async fn starttls(&mut self) -> Result<(), SessionError> {
        self.send_command("STARTTLS", "STARTTLS", &[codes::SERVICE_READY])
            .await?;

        let tcp = match std::mem::replace(&mut self.stream, SessionStream::Closed) {
            SessionStream::Plain(reader) => reader.into_inner(),
            other => {
                self.stream = other;
                return Err(SessionError::Tls("transport is already encrypted".to_string()));
            }
        };

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));

        let server_name = ServerName::try_from(self.host.trim_end_matches('.').to_string())
            .map_err(|_| SessionError::Tls(format!("invalid server name: {}", self.host)))?;

        let tls = timeout(self.read_timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| SessionError::Tls("handshake timed out".to_string()))?
            .map_err(|e| SessionError::Tls(e.to_string()))?;

        self.stream = SessionStream::Tls(BufReader::new(tls));
        self.capabilities = None;
        tracing::debug!(host = %self.host, "transport upgraded to TLS");
        Ok(())
    }

    /// Sends `QUIT` and closes the socket regardless of the reply.
    pub async fn quit(&mut self) -> Result<(), SessionError> {
        let result = self
            .send_command("QUIT", "QUIT", &[codes::SERVICE_CLOSING])
            .await
            .map(drop);
        self.close();
        result
    }

    /// Releases the connection. Idempotent.
    pub fn close(&mut self) {
        self.stream = SessionStream::Closed;
        self.state = SessionState::Closed;
    }

    async fn write_line(&mut self, raw: &str) -> Result<(), String> {
        let line = format!("{raw}\r\n");
        match &mut self.stream {
            SessionStream::Plain(reader) => {
                let stream = reader.get_mut();
                stream
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                stream.flush().await.map_err(|e| e.to_string())
            }
            SessionStream::Tls(reader) => {
                let stream = reader.get_mut();
                stream
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| e.to_string())?;
                stream.flush().await.map_err(|e| e.to_string())
            }
            SessionStream::Closed => Err("session is closed".to_string()),
        }
    }

    /// Reads one reply, honoring the per-read idle timeout and the overall
    /// time limit. On expiry, whatever has accumulated is parsed and
    /// returned.
    async fn read_reply(&mut self) -> SmtpReply {
        let mut raw = String::new();
        let deadline = Instant::now() + self.time_limit;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let budget = self.read_timeout.min(remaining);
            if budget.is_zero() {
                tracing::warn!(host = %self.host, "read time limit reached");
                break;
            }

            let mut line = String::new();
            let read = match &mut self.stream {
                SessionStream::Plain(reader) => timeout(budget, reader.read_line(&mut line)).await,
                SessionStream::Tls(reader) => timeout(budget, reader.read_line(&mut line)).await,
                SessionStream::Closed => break,
            };

            match read {
                Err(_) => {
                    tracing::warn!(host = %self.host, "read timed out, returning partial reply");
                    break;
                }
                Ok(Err(error)) => {
                    tracing::warn!(host = %self.host, %error, "read failed");
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => {
                    raw.push_str(&line);
                    let trimmed = line.trim_end_matches(['\r', '\n']);
                    // RFC 5321 §4.2: a space after the code terminates the
                    // reply; very short lines are treated as terminal too.
                    let terminal =
                        trimmed.len() <= 3 || trimmed.as_bytes().get(3) == Some(&b' ');
                    if terminal {
                        break;
                    }
                }
            }
        }

        SmtpReply::parse(&raw)
    }
}

impl std::fmt::Debug for SmtpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpSession")
            .field("host", &self.host)
            .field("state", &self.state)
            .field("log_entries", &self.transfer_log.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockSmtpServer, SmtpBehavior};

    const TIMEOUT: Duration = Duration::from_secs(5);
    const LIMIT: Duration = Duration::from_secs(10);

    async fn connect(server: &MockSmtpServer) -> SmtpSession {
        SmtpSession::connect("127.0.0.1", server.port(), TIMEOUT, LIMIT)
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn connect_logs_greeting() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let session = connect(&server).await;

        assert_eq!(session.state(), SessionState::Connected);
        let log = session.transfer_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].command, "<CONNECT>");
        assert_eq!(log[0].smtp_code, 220);
        assert!(log[0].success);
    }

    #[tokio::test]
    async fn non_220_greeting_connects_but_flags_entry() {
        let behavior = SmtpBehavior::accept_all().with_greeting("554 go away\r\n");
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let session = connect(&server).await;

        assert!(session.is_connected());
        let log = session.transfer_log();
        assert_eq!(log[0].smtp_code, 554);
        assert!(!log[0].success);
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let result = SmtpSession::connect("127.0.0.1", port, TIMEOUT, LIMIT).await;
        assert!(matches!(result, Err(SessionError::Connect(_))));
    }

    #[tokio::test]
    async fn silent_server_yields_empty_greeting() {
        let behavior = SmtpBehavior::accept_all().with_greeting("");
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let session = SmtpSession::connect(
            "127.0.0.1",
            server.port(),
            Duration::from_millis(200),
            Duration::from_millis(400),
        )
        .await
        .unwrap();

        let log = session.transfer_log();
        assert_eq!(log[0].smtp_code, 0);
        assert!(!log[0].success);
    }

    #[tokio::test]
    async fn ehlo_discovers_capabilities() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let mut session = connect(&server).await;

        session.hello("client.example").await.unwrap();
        assert_eq!(session.state(), SessionState::Greeted(HelloKind::Ehlo));
        assert_eq!(
            session.server_capability("SIZE").unwrap(),
            Some(CapabilityValue::Size(10485760))
        );
        assert_eq!(
            session.server_capability("HELO").unwrap(),
            Some(CapabilityValue::Ident("mx.test".to_string()))
        );
        assert_eq!(session.server_capability("DSN").unwrap(), None);
    }

    #[tokio::test]
    async fn ehlo_failure_falls_back_to_helo() {
        let behavior =
            SmtpBehavior::accept_all().with_rule("EHLO", "502 5.5.2 not implemented\r\n");
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let mut session = connect(&server).await;

        session.hello("client.example").await.unwrap();
        assert_eq!(session.state(), SessionState::Greeted(HelloKind::Helo));

        // Extension queries after HELO are an error by contract.
        assert!(matches!(
            session.server_capability("SIZE"),
            Err(SessionError::HeloNoExtensions)
        ));
        assert_eq!(
            session.last_error().unwrap().error,
            "HELO handshake was used; no extension info"
        );
        // But the EHLO pseudo-capability resolves to false.
        assert_eq!(
            session.server_capability("EHLO").unwrap(),
            Some(CapabilityValue::Flag(false))
        );

        let commands: Vec<String> = server.sessions()[0].commands.clone();
        assert_eq!(commands, ["EHLO client.example", "HELO client.example"]);
    }

    #[tokio::test]
    async fn capability_before_hello_is_an_error() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let mut session = connect(&server).await;

        assert!(matches!(
            session.server_capability("SIZE"),
            Err(SessionError::NoHello)
        ));
        assert_eq!(session.last_error().unwrap().error, "No HELO/EHLO was sent");
    }

    #[tokio::test]
    async fn crlf_in_command_is_rejected_before_write() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let mut session = connect(&server).await;

        let result = session
            .send_command("NOOP", "NOOP\r\nRCPT TO:<x@y>", &[250])
            .await;
        assert!(matches!(result, Err(SessionError::CrlfInjection { .. })));
        assert_eq!(session.last_error().unwrap().error, "NOOP command failed");

        // Nothing reached the wire and no entry was logged for it.
        assert_eq!(session.transfer_log().len(), 1);
        session.noop().await.unwrap();
        assert!(server.sessions()[0]
            .commands
            .iter()
            .all(|c| !c.contains("RCPT")));
    }

    #[tokio::test]
    async fn failed_command_sets_last_error_with_code() {
        let behavior =
            SmtpBehavior::accept_all().with_rule("RCPT TO", "550 5.1.1 User unknown\r\n");
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let mut session = connect(&server).await;

        session.hello("client.example").await.unwrap();
        session.mail_from("probe@client.example").await.unwrap();
        let result = session.rcpt_to("nobody@remote.example").await;

        assert!(result.is_err());
        let error = session.last_error().unwrap();
        assert_eq!(error.error, "RCPT TO command failed");
        assert_eq!(error.smtp_code, 550);
        assert_eq!(
            error.smtp_code_ex,
            Some(crate::errors::EnhancedStatusCode::new(5, 1, 1))
        );
        assert_eq!(error.detail, "User unknown");

        // A later success clears the slot.
        session.rset().await.unwrap();
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn transfer_log_is_append_only_until_close() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let mut session = connect(&server).await;

        let mut lengths = vec![session.transfer_log().len()];
        session.hello("client.example").await.unwrap();
        lengths.push(session.transfer_log().len());
        session.noop().await.unwrap();
        lengths.push(session.transfer_log().len());
        let _ = session.vrfy("postmaster").await;
        lengths.push(session.transfer_log().len());
        session.quit().await.unwrap();
        lengths.push(session.transfer_log().len());

        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*lengths.last().unwrap(), 5);
    }

    #[tokio::test]
    async fn quit_closes_and_close_is_idempotent() {
        let server = MockSmtpServer::start(SmtpBehavior::accept_all()).await.unwrap();
        let mut session = connect(&server).await;

        session.quit().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_connected());

        session.close();
        session.close();
        assert_eq!(session.state(), SessionState::Closed);

        let result = session.noop().await;
        assert!(matches!(result, Err(SessionError::Closed)));
        assert_eq!(session.last_error().unwrap().detail, "session is closed");
    }

    #[tokio::test]
    async fn starttls_refusal_is_a_command_failure() {
        let behavior = SmtpBehavior::accept_all()
            .with_rule("STARTTLS", "454 4.7.0 TLS not available\r\n");
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let mut session = connect(&server).await;

        session.hello("client.example").await.unwrap();
        let result = session.starttls().await;
        assert!(matches!(result, Err(SessionError::UnexpectedReply { .. })));
        assert_eq!(session.last_error().unwrap().smtp_code, 454);

        // The plaintext transport is still usable after the refusal.
        session.noop().await.unwrap();
    }

    #[tokio::test]
    async fn multiline_reply_is_read_to_terminal_line() {
        let behavior = SmtpBehavior::accept_all().with_rule(
            "EHLO",
            "250-mx.test greets you\r\n250-SIZE 1000\r\n250-8BITMIME\r\n250 OK\r\n",
        );
        let server = MockSmtpServer::start(behavior).await.unwrap();
        let mut session = connect(&server).await;

        session.hello("client.example").await.unwrap();
        let entry = &session.transfer_log()[1];
        assert_eq!(entry.smtp_code, 250);
        assert!(entry.response.contains("8BITMIME"));
        assert_eq!(
            session.server_capability("8BITMIME").unwrap(),
            Some(CapabilityValue::Flag(true))
        );
    }
}
