//! IMAP over TLS.
//!
//! The protocol runs on a blocking rustls stream. Every command is executed
//! inside `spawn_blocking`: the connection is moved onto the blocking pool and
//! handed back to the session once the tagged response has been read.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, info, warn};

use super::{FetchPart, MailSession, MailboxConnector, MessageId, SearchCriteria};
use crate::config::{AppConfig, CLIENT_ID, Credentials};
use crate::error::MailboxError;

const IO_TIMEOUT: Duration = Duration::from_secs(60);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Connector ───────────────────────────────────────────────────────

/// Opens IMAPS sessions against one server.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    client_id: String,
}

impl ImapConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: CLIENT_ID.to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.imap_host, config.imap_port)
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn MailSession>, MailboxError> {
        let host = self.host.clone();
        let port = self.port;
        let credentials = credentials.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&host, port)?;
            conn.login(&credentials)?;
            Ok::<_, MailboxError>(conn)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))??;

        info!(host = %self.host, port = self.port, "IMAP login succeeded");
        Ok(Box::new(ImapSession::new(conn, self.client_id.clone())))
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// An authenticated session. `S` is the byte stream (TLS in production).
pub struct ImapSession<S> {
    conn: Option<Connection<S>>,
    client_id: String,
}

impl<S> ImapSession<S>
where
    S: Read + Write + Send + 'static,
{
    fn new(conn: Connection<S>, client_id: String) -> Self {
        Self {
            conn: Some(conn),
            client_id,
        }
    }

    /// Run one blocking exchange on the connection.
    async fn run<T, F>(&mut self, f: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection<S>) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailboxError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task panicked: {e}")))?;
        self.conn = Some(conn);
        result
    }
}

#[async_trait]
impl<S> MailSession for ImapSession<S>
where
    S: Read + Write + Send + 'static,
{
    async fn identify(&mut self) {
        let command = format!("ID {}", self.client_id);
        match self.run(move |conn| conn.command(&command)).await {
            Ok(resp) if resp.status == Status::Ok => debug!("IMAP ID accepted"),
            Ok(resp) => warn!(reply = %resp.text, "IMAP ID rejected, continuing"),
            Err(e) => warn!("IMAP ID failed, continuing: {e}"),
        }
    }

    async fn select(&mut self, folder: &str, readonly: bool) -> Result<(), MailboxError> {
        let folder = folder.to_string();
        self.run(move |conn| conn.select(&folder, readonly)).await
    }

    async fn search(&mut self, criteria: &SearchCriteria) -> Result<Vec<MessageId>, MailboxError> {
        let keys = criteria.to_imap();
        self.run(move |conn| conn.search(&keys)).await
    }

    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, MailboxError> {
        self.run(move |conn| conn.fetch(id, part)).await
    }

    async fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || conn.shutdown()).await {
            warn!("IMAP teardown task panicked: {e}");
        }
    }
}

// ── Protocol ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One untagged line with any literals it carried.
#[derive(Debug)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: Status,
    text: String,
}

struct Connection<S> {
    stream: BufReader<S>,
    next_tag: u32,
    selected: bool,
}

impl Connection<TlsStream> {
    fn open(host: &str, port: u16) -> Result<Self, MailboxError> {
        let connection_error = |e: std::io::Error| MailboxError::Connection {
            host: host.to_string(),
            reason: e.to_string(),
        };

        let tcp = TcpStream::connect((host, port)).map_err(connection_error)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .map_err(|e| MailboxError::Tls(e.to_string()))?
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| MailboxError::Tls(format!("invalid server name {host}: {e}")))?;
        let tls = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Tls(e.to_string()))?;

        // The handshake runs on first read, so greeting failures are TLS failures.
        Connection::greet(rustls::StreamOwned::new(tls, tcp)).map_err(|e| match e {
            MailboxError::Io(io) => MailboxError::Tls(io.to_string()),
            other => other,
        })
    }
}

impl<S: Read + Write> Connection<S> {
    /// Wrap a fresh stream and consume the server greeting.
    fn greet(stream: S) -> Result<Self, MailboxError> {
        let mut conn = Self {
            stream: BufReader::new(stream),
            next_tag: 1,
            selected: false,
        };
        let greeting = String::from_utf8_lossy(&read_line(&mut conn.stream)?).trim_end().to_string();
        if greeting.starts_with("* OK") || greeting.starts_with("* PREAUTH") {
            Ok(conn)
        } else {
            Err(MailboxError::Protocol(format!("unexpected greeting: {greeting}")))
        }
    }

    fn command(&mut self, command: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let verb = command.split(' ').next().unwrap_or(command);
        debug!(tag = %tag, verb, "IMAP command");

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        writer.flush()?;

        read_response(&mut self.stream, &tag)
    }

    fn login(&mut self, credentials: &Credentials) -> Result<(), MailboxError> {
        let resp = self.command(&format!(
            "LOGIN {} {}",
            quote(&credentials.username),
            quote(credentials.password.expose_secret())
        ))?;
        match resp.status {
            Status::Ok => Ok(()),
            _ => Err(MailboxError::Auth(resp.text)),
        }
    }

    fn select(&mut self, folder: &str, readonly: bool) -> Result<(), MailboxError> {
        let verb = if readonly { "EXAMINE" } else { "SELECT" };
        let resp = self.command(&format!("{verb} {}", quote(folder)))?;
        self.selected = resp.status == Status::Ok;
        if self.selected {
            Ok(())
        } else {
            Err(MailboxError::Folder {
                folder: folder.to_string(),
                reason: resp.text,
            })
        }
    }

    fn search(&mut self, keys: &str) -> Result<Vec<MessageId>, MailboxError> {
        let resp = expect_ok(self.command(&format!("SEARCH {keys}"))?, "SEARCH")?;
        Ok(parse_search(&resp))
    }

    fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, MailboxError> {
        let resp = expect_ok(self.command(&format!("FETCH {id} {}", part.as_imap()))?, "FETCH")?;
        resp.untagged
            .into_iter()
            .find_map(|line| line.literals.into_iter().next())
            .ok_or_else(|| MailboxError::Protocol(format!("FETCH {id} returned no message data")))
    }

    /// CLOSE (if a folder is selected) then LOGOUT; failures are logged.
    fn shutdown(&mut self) {
        if self.selected {
            self.selected = false;
            match self.command("CLOSE") {
                Ok(resp) if resp.status != Status::Ok => warn!(reply = %resp.text, "IMAP CLOSE rejected"),
                Err(e) => warn!("IMAP CLOSE failed: {e}"),
                Ok(_) => {}
            }
        }
        match self.command("LOGOUT") {
            Ok(_) => debug!("IMAP logged out"),
            Err(e) => warn!("IMAP LOGOUT failed: {e}"),
        }
    }
}

fn expect_ok(resp: Response, verb: &str) -> Result<Response, MailboxError> {
    match resp.status {
        Status::Ok => Ok(resp),
        _ => Err(MailboxError::Protocol(format!("{verb} failed: {}", resp.text))),
    }
}

/// IMAP quoted string.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn read_line<R: BufRead>(reader: &mut R) -> Result<Vec<u8>, MailboxError> {
    let mut buf = Vec::new();
    if reader.read_until(b'\n', &mut buf)? == 0 {
        return Err(MailboxError::Protocol("connection closed by server".into()));
    }
    Ok(buf)
}

/// Byte count of a `{n}` literal announced at the end of `line`.
fn literal_len(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\n")?;
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let body = line.strip_suffix(b"}")?;
    let open = body.iter().rposition(|&b| b == b'{')?;
    std::str::from_utf8(&body[open + 1..]).ok()?.parse().ok()
}

/// Read untagged lines until the line tagged `tag`.
fn read_response<R: BufRead>(reader: &mut R, tag: &str) -> Result<Response, MailboxError> {
    let mut untagged = Vec::new();
    loop {
        let mut line = read_line(reader)?;
        let mut literals = Vec::new();

        while let Some(len) = literal_len(&line) {
            let mut literal = vec![0u8; len];
            reader.read_exact(&mut literal)?;
            literals.push(literal);
            line.extend_from_slice(&read_line(reader)?);
        }

        let text = String::from_utf8_lossy(&line).trim_end().to_string();
        if let Some(rest) = text.strip_prefix(tag).and_then(|r| r.strip_prefix(' ')) {
            let (status, message) = rest.split_once(' ').unwrap_or((rest, ""));
            let status = match status.to_ascii_uppercase().as_str() {
                "OK" => Status::Ok,
                "NO" => Status::No,
                _ => Status::Bad,
            };
            return Ok(Response {
                untagged,
                status,
                text: message.to_string(),
            });
        }
        untagged.push(ResponseLine { text, literals });
    }
}

fn parse_search(resp: &Response) -> Vec<MessageId> {
    resp.untagged
        .iter()
        .filter_map(|line| {
            let upper = line.text.get(..8)?.to_ascii_uppercase();
            (upper == "* SEARCH").then(|| &line.text[8..])
        })
        .flat_map(|ids| ids.split_whitespace().filter_map(|n| n.parse().ok().map(MessageId)))
        .collect()
}
