//! Transport sessions and sender backends.
//!
//! A transport delivers [`Message`]s over a stateful, authenticated session
//! (an SMTP connection, for instance). Sessions are scoped to one batch: a
//! worker opens one through a [`Connector`], sends the batch in order and
//! closes it again, whatever happened in between.
//!
//! ## Key components
//!
//! - [`Transport`]: Wrapper driving one session through a batch
//! - [`Session`]: Trait implemented by concrete session backends
//! - [`Connector`]: Factory for fresh sessions
//! - [`SendError`]: Per-message failure, either message-level or session-level
//! - [`TransportError`]: Connect and close failures
//!
//! Message-level failures ([`SendErrorKind::Rejected`]) only affect the
//! message being sent. Session-level failures
//! ([`SendErrorKind::SessionLost`]) abort the rest of the batch.

mod inmemory;

#[cfg(feature = "smtp")]
pub mod smtp;

use tracing_error::SpanTrace;

use crate::{Credentials, Message, MessageId};

pub use inmemory::{InMemory, InMemoryConnector};

/// Trait implemented by concrete session backends.
#[async_trait::async_trait]
pub trait Session: Send {
    /// Backend-specific error type for connect and close.
    type Error: Into<tower::BoxError> + Send;

    /// Open and authenticate the connection.
    ///
    /// Calling `connect` on a connected session must succeed without
    /// reconnecting.
    async fn connect(&mut self, credentials: &Credentials) -> Result<(), Self::Error>;

    fn is_connected(&self) -> bool;

    /// Send one message over the open connection.
    async fn send(&mut self, message: &Message) -> Result<(), SendError>;

    /// Release the connection. Closing a disconnected session is a no-op.
    async fn close(&mut self) -> Result<(), Self::Error>;
}

/// Factory for transport sessions.
///
/// Each worker cycle asks the connector for a fresh, unconnected session.
pub trait Connector: Send + Sync {
    type Session: Session;

    fn session(&self) -> Self::Session;
}

/// Outcome of sending one batch.
///
/// `delivered`, `failed` and `unprocessed` are disjoint and together hold
/// every identifier of the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Handed off to the endpoint.
    pub delivered: Vec<MessageId>,
    /// Rejected by the endpoint.
    pub failed: Vec<MessageId>,
    /// Not attempted, or interrupted, because the session was lost.
    pub unprocessed: Vec<MessageId>,
}

impl SendReport {
    /// Number of messages accounted for.
    pub fn len(&self) -> usize {
        self.delivered.len() + self.failed.len() + self.unprocessed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the session was lost before the end of the batch.
    pub fn session_lost(&self) -> bool {
        !self.unprocessed.is_empty()
    }
}

/// Session wrapper driving a batch through a [`Session`].
///
/// `Transport` normalizes backend errors into [`TransportError`] and makes
/// sure the session is closed at the end of every batch.
pub struct Transport<S> {
    session: S,
}

impl<S> Transport<S>
where
    S: Session,
{
    pub fn new(session: S) -> Self {
        Self { session }
    }

    /// Open a session from a connector.
    pub fn from_connector<C>(connector: &C) -> Self
    where
        C: Connector<Session = S>,
    {
        Self::new(connector.session())
    }

    /// Connect and authenticate, unless already connected.
    #[tracing::instrument(skip_all)]
    pub async fn connect(&mut self, credentials: &Credentials) -> Result<(), TransportError> {
        if self.session.is_connected() {
            return Ok(());
        }
        self.session
            .connect(credentials)
            .await
            .map_err(|e| TransportError::connect(e.into()))
    }

    /// Send `messages` in order, then close the session.
    ///
    /// A rejected message is recorded as failed and sending continues. A lost
    /// session marks the current message and everything after it as
    /// unprocessed, and no further send is attempted.
    #[tracing::instrument(skip_all, fields(count = messages.len()))]
    pub async fn send_batch(&mut self, messages: &[Message]) -> SendReport {
        let mut report = SendReport::default();

        for (index, message) in messages.iter().enumerate() {
            let result = if self.session.is_connected() {
                self.session.send(message).await
            } else {
                Err(SendError::session_lost("session is not connected".into()))
            };

            match result {
                Ok(()) => {
                    tracing::debug!(id = message.id(), "Message handed off");
                    report.delivered.push(message.id());
                }
                Err(error) if error.is_session_lost() => {
                    tracing::warn!(id = message.id(), %error, "Session lost, aborting batch");
                    report
                        .unprocessed
                        .extend(messages[index..].iter().map(Message::id));
                    break;
                }
                Err(error) => {
                    tracing::warn!(id = message.id(), %error, "Message rejected");
                    report.failed.push(message.id());
                }
            }
        }

        self.close().await;
        report
    }

    /// Close the session, logging close failures.
    pub async fn close(&mut self) {
        if let Err(e) = self.session.close().await {
            let error = TransportError::close(e.into());
            tracing::warn!(%error, "Could not close session");
        }
    }

    pub fn session(&self) -> &S {
        &self.session
    }
}

/// Error returned when sending a single message.
#[derive(Debug)]
pub struct SendError {
    context: SpanTrace,
    kind: SendErrorKind,
}

/// Classification of send failures.
#[derive(Debug)]
pub enum SendErrorKind {
    /// The endpoint refused this message. The session is still usable.
    Rejected(tower::BoxError),
    /// The session can no longer be used.
    SessionLost(tower::BoxError),
}

impl SendError {
    /// Create a message-level send error.
    pub fn rejected(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::Rejected(err),
        }
    }

    /// Create a session-level send error.
    pub fn session_lost(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: SendErrorKind::SessionLost(err),
        }
    }

    pub fn kind(&self) -> &SendErrorKind {
        &self.kind
    }

    pub fn is_session_lost(&self) -> bool {
        matches!(self.kind, SendErrorKind::SessionLost(_))
    }

    /// Whether sending the message again on a fresh session may succeed.
    ///
    /// Rejections are permanent; a lost session says nothing about the
    /// message itself.
    pub fn is_retryable(&self) -> bool {
        self.is_session_lost()
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            SendErrorKind::Rejected(err) => writeln!(f, "Message rejected: {err}"),
            SendErrorKind::SessionLost(err) => writeln!(f, "Session lost: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            SendErrorKind::Rejected(err) => Some(err.as_ref()),
            SendErrorKind::SessionLost(err) => Some(err.as_ref()),
        }
    }
}

/// Error returned by session management.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// The session could not be opened or authenticated.
    Connect(tower::BoxError),
    /// The session could not be closed cleanly.
    Close(tower::BoxError),
}

impl TransportError {
    pub fn connect(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Connect(err),
        }
    }

    pub fn close(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Close(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Connect(err) => writeln!(f, "Connect error: {err}"),
            TransportErrorKind::Close(err) => writeln!(f, "Close error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Connect(err) => Some(err.as_ref()),
            TransportErrorKind::Close(err) => Some(err.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    fn messages(count: i64) -> Vec<Message> {
        (1..=count)
            .map(|id| {
                Message::new(
                    id,
                    "sender@example.com",
                    format!("recipient{id}@example.com"),
                    format!("Subject {id}"),
                    "Body",
                )
            })
            .collect()
    }

    fn assert_partition(report: &SendReport, batch: &[Message]) {
        let mut seen = HashSet::new();
        for id in report
            .delivered
            .iter()
            .chain(&report.failed)
            .chain(&report.unprocessed)
        {
            assert!(seen.insert(*id), "message {id} reported twice");
        }
        let expected: HashSet<_> = batch.iter().map(Message::id).collect();
        assert_eq!(seen, expected);
        assert_eq!(report.len(), batch.len());
    }

    #[tokio::test]
    async fn rejections_only_fail_their_message() {
        let connector = InMemoryConnector::new().reject_ids([2, 4]);
        let batch = messages(5);
        let mut transport = Transport::from_connector(&connector);

        transport.connect(&Credentials::default()).await.unwrap();
        let report = transport.send_batch(&batch).await;

        assert_eq!(report.delivered, vec![1, 3, 5]);
        assert_eq!(report.failed, vec![2, 4]);
        assert!(report.unprocessed.is_empty());
        assert_partition(&report, &batch);
        assert!(!transport.session().is_connected());
    }

    #[tokio::test]
    async fn lost_session_marks_the_rest_unprocessed() {
        let connector = InMemoryConnector::new().drop_session_at(7).reject_ids([3]);
        let batch = messages(10);
        let mut transport = Transport::from_connector(&connector);

        transport.connect(&Credentials::default()).await.unwrap();
        let report = transport.send_batch(&batch).await;

        assert_eq!(report.delivered, vec![1, 2, 4, 5, 6]);
        assert_eq!(report.failed, vec![3]);
        assert_eq!(report.unprocessed, vec![7, 8, 9, 10]);
        assert!(report.session_lost());
        assert_partition(&report, &batch);
        assert_eq!(connector.delivered_ids().await, vec![1, 2, 4, 5, 6]);
        assert!(!transport.session().is_connected());
    }

    #[tokio::test]
    async fn unconnected_session_processes_nothing() {
        let connector = InMemoryConnector::new();
        let batch = messages(3);
        let mut transport = Transport::from_connector(&connector);

        let report = transport.send_batch(&batch).await;

        assert_eq!(report.unprocessed, vec![1, 2, 3]);
        assert_partition(&report, &batch);
        assert!(connector.delivered_ids().await.is_empty());
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let connector = InMemoryConnector::new().refuse_connections();
        let mut transport = Transport::from_connector(&connector);

        let error = transport.connect(&Credentials::default()).await.unwrap_err();

        assert!(matches!(error.kind(), TransportErrorKind::Connect(_)));
        assert!(!transport.session().is_connected());
    }

    #[tokio::test]
    async fn connect_is_idempotent() {
        let connector = InMemoryConnector::new();
        let mut transport = Transport::from_connector(&connector);

        transport.connect(&Credentials::default()).await.unwrap();
        transport.connect(&Credentials::default()).await.unwrap();

        assert_eq!(connector.connections().await, 1);
    }

    #[test]
    fn only_session_loss_is_retryable() {
        assert!(SendError::session_lost("gone".into()).is_retryable());
        assert!(!SendError::rejected("bad address".into()).is_retryable());
    }
}
