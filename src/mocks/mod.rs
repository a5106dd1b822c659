//! Test doubles: stub DNS lookups and an in-process SMTP server.
//!
//! Public so downstream crates can exercise their own verification flows
//! without touching the network.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::dns::{DnsLookup, DnsLookupError, MxRecord};

/// Stub resolver answering from fixed tables.
///
/// Unknown names answer "no records"; lookups are counted so tests can
/// assert that a stage performed no DNS activity.
#[derive(Debug, Clone, Default)]
pub struct StubDns {
    mx: HashMap<String, Vec<MxRecord>>,
    a: HashMap<String, Vec<Ipv4Addr>>,
    mx_calls: Arc<AtomicUsize>,
    a_calls: Arc<AtomicUsize>,
}

impl StubDns {
    /// Creates an empty stub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers MX records for an FQDN (trailing dot included).
    pub fn with_mx(mut self, fqdn: impl Into<String>, records: Vec<MxRecord>) -> Self {
        self.mx.insert(fqdn.into(), records);
        self
    }

    /// Registers A records for an FQDN (trailing dot included).
    pub fn with_a(mut self, fqdn: impl Into<String>, addresses: Vec<Ipv4Addr>) -> Self {
        self.a.insert(fqdn.into(), addresses);
        self
    }

    /// Number of MX lookups performed.
    pub fn mx_calls(&self) -> usize {
        self.mx_calls.load(Ordering::SeqCst)
    }

    /// Number of A lookups performed.
    pub fn a_calls(&self) -> usize {
        self.a_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsLookup for StubDns {
    async fn mx(&self, fqdn: &str) -> Result<Vec<MxRecord>, DnsLookupError> {
        self.mx_calls.fetch_add(1, Ordering::SeqCst);
        self.mx
            .get(fqdn)
            .cloned()
            .ok_or(DnsLookupError::NoRecords)
    }

    async fn a(&self, fqdn: &str) -> Result<Vec<Ipv4Addr>, DnsLookupError> {
        self.a_calls.fetch_add(1, Ordering::SeqCst);
        self.a.get(fqdn).cloned().ok_or(DnsLookupError::NoRecords)
    }
}

/// Reply rules for the mock server, matched by command prefix in order.
#[derive(Debug, Clone)]
pub struct SmtpBehavior {
    /// Greeting written right after accept (may be multi-line).
    pub greeting: String,
    /// `(command prefix, response)` pairs; first match wins.
    pub rules: Vec<(String, String)>,
}

impl SmtpBehavior {
    /// Accepts everything: EHLO/HELO, MAIL, RCPT, NOOP, RSET all succeed.
    pub fn accept_all() -> Self {
        Self {
            greeting: "220 mx.test ESMTP ready\r\n".to_string(),
            rules: Vec::new(),
        }
    }

    /// Overrides the greeting.
    pub fn with_greeting(mut self, greeting: impl Into<String>) -> Self {
        self.greeting = greeting.into();
        self
    }

    /// Prepends a reply rule; earlier rules shadow the defaults.
    pub fn with_rule(mut self, prefix: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push((prefix.into(), response.into()));
        self
    }

    fn reply_for(&self, command: &str) -> String {
        for (prefix, response) in &self.rules {
            if command.starts_with(prefix.as_str()) {
                return response.clone();
            }
        }
        default_reply(command)
    }
}

fn default_reply(command: &str) -> String {
    if command.starts_with("EHLO") {
        "250-mx.test greets you\r\n250-SIZE 10485760\r\n250-PIPELINING\r\n250 HELP\r\n".to_string()
    } else if command.starts_with("HELO") {
        "250 mx.test\r\n".to_string()
    } else if command.starts_with("MAIL FROM")
        || command.starts_with("RCPT TO")
        || command.starts_with("NOOP")
        || command.starts_with("RSET")
    {
        "250 2.0.0 Ok\r\n".to_string()
    } else if command.starts_with("VRFY") {
        "252 2.0.0 Cannot VRFY user\r\n".to_string()
    } else if command.starts_with("QUIT") {
        "221 2.0.0 Bye\r\n".to_string()
    } else {
        "502 5.5.2 Command not recognized\r\n".to_string()
    }
}

/// Commands one accepted connection received, in order.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    /// Command lines with the trailing CRLF stripped.
    pub commands: Vec<String>,
}

/// In-process SMTP server driven by [`SmtpBehavior`].
///
/// Accepts any number of connections until dropped and records each
/// session's command sequence for assertions.
pub struct MockSmtpServer {
    port: u16,
    sessions: Arc<Mutex<Vec<SessionRecord>>>,
    accept_task: JoinHandle<()>,
}

impl MockSmtpServer {
    /// Binds to an ephemeral local port and starts serving.
    pub async fn start(behavior: SmtpBehavior) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let sessions: Arc<Mutex<Vec<SessionRecord>>> = Arc::new(Mutex::new(Vec::new()));

        let behavior = Arc::new(behavior);
        let recorded = sessions.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let index = {
                    let mut sessions = recorded.lock().expect("session registry poisoned");
                    sessions.push(SessionRecord::default());
                    sessions.len() - 1
                };
                let behavior = behavior.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = serve_session(stream, &behavior, &recorded, index).await;
                });
            }
        });

        Ok(Self {
            port,
            sessions,
            accept_task,
        })
    }

    /// The port the server listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Snapshot of all sessions seen so far.
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .clone()
    }

    /// Number of accepted connections.
    pub fn connection_count(&self) -> usize {
        self.sessions
            .lock()
            .expect("session registry poisoned")
            .len()
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_session(
    stream: TcpStream,
    behavior: &SmtpBehavior,
    recorded: &Arc<Mutex<Vec<SessionRecord>>>,
    index: usize,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half.write_all(behavior.greeting.as_bytes()).await?;
    write_half.flush().await?;

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let command = line.trim_end_matches(['\r', '\n']).to_string();
        {
            let mut sessions = recorded.lock().expect("session registry poisoned");
            sessions[index].commands.push(command.clone());
        }
        let reply = behavior.reply_for(&command);
        write_half.write_all(reply.as_bytes()).await?;
        write_half.flush().await?;
        if command.starts_with("QUIT") {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_dns_counts_calls() {
        let stub = StubDns::new().with_mx("test.", vec![MxRecord::new("mx.test.", 10)]);
        assert_eq!(stub.mx_calls(), 0);
        assert!(stub.mx("test.").await.is_ok());
        assert!(stub.mx("missing.").await.is_err());
        assert_eq!(stub.mx_calls(), 2);
    }

    #[tokio::test]
    async fn mock_server_scripts_a_session() {
        let server = MockSmtpServer::start(
            SmtpBehavior::accept_all().with_rule("RCPT TO", "550 5.1.1 User unknown\r\n"),
        )
        .await
        .unwrap();

        let stream = TcpStream::connect(("127.0.0.1", server.port())).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("220"));

        write_half.write_all(b"RCPT TO:<u@test>\r\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("550"));

        write_half.write_all(b"QUIT\r\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("221"));

        assert_eq!(server.connection_count(), 1);
        let sessions = server.sessions();
        assert_eq!(sessions[0].commands, ["RCPT TO:<u@test>", "QUIT"]);
    }
}
