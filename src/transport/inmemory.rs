use std::{collections::HashSet, io, sync::Arc};

use tokio::sync::Mutex;

use crate::{
    Credentials, Message, MessageId,
    transport::{Connector, SendError, Session},
};

/// In-memory endpoint shared by every session of an [`InMemoryConnector`].
#[derive(Default)]
struct Endpoint {
    delivered: Vec<Message>,
    connections: usize,
    refused_connections: Option<usize>,
    rejected_ids: HashSet<MessageId>,
    rejected_recipients: HashSet<String>,
    drop_at: Option<MessageId>,
    always_drop_at: HashSet<MessageId>,
    drop_after: Option<usize>,
}

/// In-memory transport for testing or local pipelines.
///
/// Every session created by the connector delivers into the same shared
/// endpoint, which records delivered messages. The endpoint can be scripted
/// to refuse connections, reject messages, or drop a session mid-batch. It is
/// useful for:
/// - Unit and integration testing
/// - Simulating delivery without a real server
/// - Debugging dispatch flows
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    endpoint: Arc<Mutex<Endpoint>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse every connection attempt.
    pub fn refuse_connections(self) -> Self {
        self.refuse_first_connections(usize::MAX)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_first_connections(self, count: usize) -> Self {
        self.configure(|e| e.refused_connections = Some(count))
    }

    /// Reject the given message identifiers.
    pub fn reject_ids(self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.configure(|e| e.rejected_ids.extend(ids))
    }

    /// Reject every message addressed to `recipient`.
    pub fn reject_recipient(self, recipient: impl Into<String>) -> Self {
        let recipient = recipient.into();
        self.configure(|e| {
            e.rejected_recipients.insert(recipient);
        })
    }

    /// Drop the session when message `id` is sent. Triggers once.
    pub fn drop_session_at(self, id: MessageId) -> Self {
        self.configure(|e| e.drop_at = Some(id))
    }

    /// Drop the session every time message `id` is sent.
    pub fn always_drop_session_at(self, id: MessageId) -> Self {
        self.configure(|e| {
            e.always_drop_at.insert(id);
        })
    }

    /// Drop the session after `count` further deliveries. Triggers once.
    pub fn drop_session_after(self, count: usize) -> Self {
        self.configure(|e| e.drop_after = Some(count))
    }

    /// Apply a scripted behaviour to the endpoint.
    ///
    /// # Panics
    ///
    /// Panics if a session holds the endpoint at the same time. Scripting is
    /// meant to happen before dispatch starts.
    fn configure(self, f: impl FnOnce(&mut Endpoint)) -> Self {
        match self.endpoint.try_lock() {
            Ok(mut endpoint) => f(&mut endpoint),
            Err(_) => panic!("in-memory endpoint configured while a session is using it"),
        }
        self
    }

    /// Identifiers of every delivered message, in delivery order.
    pub async fn delivered_ids(&self) -> Vec<MessageId> {
        self.endpoint
            .lock()
            .await
            .delivered
            .iter()
            .map(Message::id)
            .collect()
    }

    /// Return all delivered messages and clear the endpoint.
    pub async fn take_delivered(&self) -> Vec<Message> {
        std::mem::take(&mut self.endpoint.lock().await.delivered)
    }

    /// Number of successful connections so far.
    pub async fn connections(&self) -> usize {
        self.endpoint.lock().await.connections
    }
}

impl Connector for InMemoryConnector {
    type Session = InMemory;

    fn session(&self) -> InMemory {
        InMemory {
            endpoint: Arc::clone(&self.endpoint),
            connected: false,
        }
    }
}

/// A session on an [`InMemoryConnector`] endpoint.
pub struct InMemory {
    endpoint: Arc<Mutex<Endpoint>>,
    connected: bool,
}

#[async_trait::async_trait]
impl Session for InMemory {
    type Error = io::Error;

    async fn connect(&mut self, _credentials: &Credentials) -> Result<(), Self::Error> {
        if self.connected {
            return Ok(());
        }
        let mut endpoint = self.endpoint.lock().await;
        if let Some(remaining) = endpoint.refused_connections.as_mut() {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "in-memory endpoint refused the connection",
                ));
            }
        }
        endpoint.connections += 1;
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// "Send" a message by appending it to the endpoint.
    #[tracing::instrument(skip_all, fields(id = message.id()))]
    async fn send(&mut self, message: &Message) -> Result<(), SendError> {
        let mut endpoint = self.endpoint.lock().await;

        let drop_now = endpoint.drop_at == Some(message.id())
            || endpoint.drop_after == Some(0)
            || endpoint.always_drop_at.contains(&message.id());
        if drop_now {
            endpoint.drop_at = endpoint.drop_at.filter(|id| *id != message.id());
            endpoint.drop_after = endpoint.drop_after.filter(|n| *n != 0);
            self.connected = false;
            return Err(SendError::session_lost(Box::new(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "in-memory endpoint dropped the session",
            ))));
        }

        if endpoint.rejected_ids.contains(&message.id())
            || endpoint.rejected_recipients.contains(message.recipient())
        {
            return Err(SendError::rejected(Box::new(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("recipient {} rejected", message.recipient()),
            ))));
        }

        if let Some(remaining) = endpoint.drop_after.as_mut() {
            *remaining -= 1;
        }
        endpoint.delivered.push(message.clone());
        tracing::debug!(recipient = message.recipient(), "Message sent to in-memory endpoint");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }
}
