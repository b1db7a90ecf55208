//! SMTP session backend.
//!
//! A small SMTP client over `tokio::net::TcpStream`: greeting, `EHLO`,
//! `STARTTLS` when the server offers it, optional `AUTH PLAIN`, then
//! `MAIL`/`RCPT`/`DATA` per message and `QUIT` on close. Every network step is
//! bounded by [`SmtpConfig::io_timeout`].
//!
//! Credentials are never sent over an unencrypted connection unless
//! [`SmtpConfig::allow_plaintext_auth`] is set.
//!
//! Replies are classified as follows:
//!
//! | Situation                                   | Outcome                      |
//! |---------------------------------------------|------------------------------|
//! | invalid sender or recipient address         | [`SendError::rejected`]      |
//! | 4xx/5xx reply to `MAIL`, `RCPT`, `DATA`     | [`SendError::rejected`]      |
//! | `421`, I/O error, timeout, EOF, bad reply   | [`SendError::session_lost`]  |
//! | any failure in greeting, `EHLO`, `STARTTLS` or `AUTH` | connect error      |

use std::{io, sync::Arc, time::Duration};

use base64::Engine as _;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{self, ClientConfig, RootCertStore, pki_types::ServerName},
};
use tracing_error::SpanTrace;

use crate::{
    Credentials, Message,
    transport::{Connector, SendError, Session},
};

/// Connection settings of the SMTP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Name announced in `EHLO`.
    pub helo_name: String,
    /// Upper bound on every connect, read and write.
    pub io_timeout: Duration,
    pub starttls: StartTls,
    /// Send `AUTH` over a connection that is not encrypted.
    pub allow_plaintext_auth: bool,
}

/// When to upgrade the connection with `STARTTLS`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartTls {
    /// Upgrade when the server advertises `STARTTLS`.
    #[default]
    Opportunistic,
    /// Fail the connect when the server does not advertise `STARTTLS`.
    Required,
    Disabled,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 25,
            helo_name: "localhost".to_string(),
            io_timeout: Duration::from_secs(30),
            starttls: StartTls::default(),
            allow_plaintext_auth: false,
        }
    }
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_helo_name(mut self, name: impl Into<String>) -> Self {
        self.helo_name = name.into();
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_starttls(mut self, starttls: StartTls) -> Self {
        self.starttls = starttls;
        self
    }

    pub fn with_plaintext_auth(mut self, allow: bool) -> Self {
        self.allow_plaintext_auth = allow;
        self
    }
}

/// Creates [`Smtp`] sessions for one endpoint.
#[derive(Debug, Clone)]
pub struct SmtpConnector {
    config: Arc<SmtpConfig>,
}

impl SmtpConnector {
    pub fn new(config: SmtpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Connector for SmtpConnector {
    type Session = Smtp;

    fn session(&self) -> Smtp {
        Smtp {
            config: Arc::clone(&self.config),
            stream: None,
            encrypted: false,
        }
    }
}

/// Byte stream of a session, plain TCP or TLS.
trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> Io for T {}

type Stream = BufStream<Box<dyn Io>>;

/// One SMTP session.
pub struct Smtp {
    config: Arc<SmtpConfig>,
    stream: Option<Stream>,
    encrypted: bool,
}

/// A parsed SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }

    /// Whether an `EHLO` reply lists `extension`.
    fn advertises(&self, extension: &str) -> bool {
        self.text.lines().any(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|word| word.eq_ignore_ascii_case(extension))
        })
    }
}

impl Smtp {
    async fn with_timeout<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = io::Result<T>>,
    {
        match tokio::time::timeout(self.config.io_timeout, fut).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::timeout()),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, Error> {
        let timeout = self.config.io_timeout;
        let stream = self.stream.as_mut().ok_or_else(Error::not_connected)?;
        tokio::time::timeout(timeout, read_reply(stream))
            .await
            .map_err(|_| Error::timeout())?
    }

    async fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let timeout = self.config.io_timeout;
        let stream = self.stream.as_mut().ok_or_else(Error::not_connected)?;
        let write = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::timeout()),
        }
    }

    async fn command(&mut self, line: &str) -> Result<Reply, Error> {
        self.write_all(format!("{line}\r\n").as_bytes()).await?;
        self.read_reply().await
    }

    async fn expect(&mut self, line: &str, code: u16) -> Result<Reply, Error> {
        let reply = self.command(line).await?;
        if reply.code == code {
            Ok(reply)
        } else {
            Err(Error::reply(reply))
        }
    }

    async fn handshake(&mut self, credentials: &Credentials) -> Result<(), Error> {
        let greeting = self.read_reply().await?;
        if greeting.code != 220 {
            return Err(Error::reply(greeting));
        }
        let ehlo = format!("EHLO {}", self.config.helo_name);
        let capabilities = self.expect(&ehlo, 250).await?;

        if self.config.starttls != StartTls::Disabled {
            if capabilities.advertises("STARTTLS") {
                self.expect("STARTTLS", 220).await?;
                self.upgrade().await?;
                // Capabilities announced before the upgrade no longer hold.
                self.expect(&ehlo, 250).await?;
            } else if self.config.starttls == StartTls::Required {
                return Err(Error::new(SmtpErrorKind::TlsUnavailable));
            }
        }

        if !credentials.username.is_empty() {
            if !self.encrypted && !self.config.allow_plaintext_auth {
                return Err(Error::new(SmtpErrorKind::PlaintextAuth));
            }
            let token = base64::engine::general_purpose::STANDARD.encode(format!(
                "\0{}\0{}",
                credentials.username, credentials.password
            ));
            self.expect(&format!("AUTH PLAIN {token}"), 235).await?;
        }
        Ok(())
    }

    /// Wrap the connection in TLS after a successful `STARTTLS`.
    async fn upgrade(&mut self) -> Result<(), Error> {
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|e| Error::tls(e.to_string()))?;
        let connector = TlsConnector::from(tls_config()?);
        let stream = self.stream.take().ok_or_else(Error::not_connected)?;
        // The server sends nothing between its 220 and the TLS handshake, so
        // no buffered input is lost here.
        let tls = self
            .with_timeout(connector.connect(server_name, stream.into_inner()))
            .await?;
        self.stream = Some(BufStream::new(Box::new(tls)));
        self.encrypted = true;
        tracing::debug!("Connection upgraded to TLS");
        Ok(())
    }

    async fn transaction(&mut self, message: &Message) -> Result<(), SendError> {
        let steps: [(String, &[u16]); 3] = [
            (format!("MAIL FROM:<{}>", message.sender()), &[250]),
            (format!("RCPT TO:<{}>", message.recipient()), &[250, 251]),
            ("DATA".to_string(), &[354]),
        ];
        for (line, accepted) in steps {
            let reply = self.command(&line).await.map_err(|e| self.lost(e))?;
            if !accepted.contains(&reply.code) {
                return Err(self.refused(reply).await);
            }
        }

        let content = format_message(message);
        self.write_all(content.as_bytes())
            .await
            .map_err(|e| self.lost(e))?;
        let reply = self.read_reply().await.map_err(|e| self.lost(e))?;
        if reply.code != 250 {
            return Err(self.refused(reply).await);
        }
        Ok(())
    }

    /// Mark the session unusable and wrap `err` as a session-level failure.
    fn lost(&mut self, err: Error) -> SendError {
        self.stream = None;
        SendError::session_lost(Box::new(err))
    }

    /// Classify a negative reply, resetting the transaction on rejection.
    async fn refused(&mut self, reply: Reply) -> SendError {
        if reply.code == 421 || !(400..600).contains(&reply.code) {
            return self.lost(Error::reply(reply));
        }
        let rejected = SendError::rejected(Box::new(Error::reply(reply)));
        match self.command("RSET").await {
            Ok(reset) if reset.is_positive() => {}
            Ok(reset) => {
                tracing::warn!(code = reset.code, "RSET refused, dropping session");
                self.stream = None;
            }
            Err(error) => {
                tracing::warn!(%error, "RSET failed, dropping session");
                self.stream = None;
            }
        }
        rejected
    }
}

#[async_trait::async_trait]
impl Session for Smtp {
    type Error = Error;

    #[tracing::instrument(skip_all, fields(host = %self.config.host, port = self.config.port))]
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), Self::Error> {
        if self.stream.is_some() {
            return Ok(());
        }
        let address = (self.config.host.as_str(), self.config.port);
        let stream = self.with_timeout(TcpStream::connect(address)).await?;
        self.stream = Some(BufStream::new(Box::new(stream)));
        self.encrypted = false;

        if let Err(err) = self.handshake(credentials).await {
            self.stream = None;
            return Err(err);
        }
        tracing::debug!("SMTP session established");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    #[tracing::instrument(skip_all, fields(id = message.id()))]
    async fn send(&mut self, message: &Message) -> Result<(), SendError> {
        for address in [message.sender(), message.recipient()] {
            if !is_valid_address(address) {
                return Err(SendError::rejected(Box::new(Error::invalid_address(
                    address,
                ))));
            }
        }
        if self.stream.is_none() {
            return Err(SendError::session_lost(Box::new(Error::not_connected())));
        }
        self.transaction(message).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.stream.is_none() {
            return Ok(());
        }
        let quit = self.command("QUIT").await;
        let shutdown = match self.stream.take() {
            Some(mut stream) => self.with_timeout(stream.shutdown()).await,
            None => Ok(()),
        };
        quit?;
        shutdown
    }
}

fn tls_config() -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config =
        ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
    Ok(Arc::new(config))
}

async fn read_reply(stream: &mut Stream) -> Result<Reply, Error> {
    let mut text = Vec::new();
    loop {
        let mut line = String::new();
        if stream.read_line(&mut line).await? == 0 {
            return Err(Error::protocol("connection closed by server"));
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.len() < 3 || !line.is_char_boundary(3) {
            return Err(Error::protocol(format!("malformed reply {line:?}")));
        }
        let code: u16 = line[..3]
            .parse()
            .map_err(|_| Error::protocol(format!("malformed reply {line:?}")))?;
        let rest = &line[3..];
        text.push(rest.get(1..).unwrap_or_default().to_string());
        if !rest.starts_with('-') {
            return Ok(Reply {
                code,
                text: text.join("\n"),
            });
        }
    }
}

fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.rsplit_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && !address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '<' | '>'))
}

/// Render the `DATA` payload, terminator included.
fn format_message(message: &Message) -> String {
    let subject: String = message
        .subject()
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    let mut out = format!(
        "From: <{}>\r\nTo: <{}>\r\nSubject: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/html; charset=utf-8\r\n\r\n",
        message.sender(),
        message.recipient(),
        subject
    );
    for line in message.body().lines() {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str(".\r\n");
    out
}

/// SMTP session errors.
#[derive(Debug)]
pub struct Error {
    context: SpanTrace,
    kind: SmtpErrorKind,
}

/// Kinds of SMTP session errors.
#[derive(Debug)]
pub enum SmtpErrorKind {
    Io(io::Error),
    Timeout,
    NotConnected,
    Reply { code: u16, text: String },
    Protocol(String),
    InvalidAddress(String),
    /// `STARTTLS` is required but the server does not offer it.
    TlsUnavailable,
    /// Credentials would have been sent over an unencrypted connection.
    PlaintextAuth,
    Tls(String),
}

impl Error {
    fn new(kind: SmtpErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    fn timeout() -> Self {
        Self::new(SmtpErrorKind::Timeout)
    }

    fn not_connected() -> Self {
        Self::new(SmtpErrorKind::NotConnected)
    }

    fn reply(reply: Reply) -> Self {
        Self::new(SmtpErrorKind::Reply {
            code: reply.code,
            text: reply.text,
        })
    }

    fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Protocol(msg.into()))
    }

    fn tls(msg: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::Tls(msg.into()))
    }

    fn invalid_address(address: &str) -> Self {
        Self::new(SmtpErrorKind::InvalidAddress(address.to_string()))
    }

    pub fn kind(&self) -> &SmtpErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SmtpErrorKind::Io(err) => writeln!(f, "I/O error: {err}"),
            SmtpErrorKind::Timeout => writeln!(f, "Timed out"),
            SmtpErrorKind::NotConnected => writeln!(f, "Not connected"),
            SmtpErrorKind::Reply { code, text } => writeln!(f, "Server replied {code} {text}"),
            SmtpErrorKind::Protocol(msg) => writeln!(f, "Protocol error: {msg}"),
            SmtpErrorKind::InvalidAddress(address) => {
                writeln!(f, "Invalid address: {address:?}")
            }
            SmtpErrorKind::TlsUnavailable => writeln!(f, "Server does not offer STARTTLS"),
            SmtpErrorKind::PlaintextAuth => {
                writeln!(f, "Refusing to authenticate over an unencrypted connection")
            }
            SmtpErrorKind::Tls(msg) => writeln!(f, "TLS error: {msg}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SmtpErrorKind::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::new(SmtpErrorKind::Io(err))
    }
}
