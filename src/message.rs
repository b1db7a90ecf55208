//! Message values and delivery state.
//!
//! A [`Message`] never changes once the store has assigned its identifier.
//! Its [`DeliveryState`] lives in the store, next to the message, and is the
//! only thing the dispatch loop ever updates.

use std::fmt;

/// Store-assigned message identifier.
///
/// Identifiers are unique and increase monotonically with insertion order.
pub type MessageId = i64;

/// A message stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub(crate) id: MessageId,
    pub(crate) sender: String,
    pub(crate) recipient: String,
    pub(crate) subject: String,
    pub(crate) body: String,
}

impl Message {
    /// Build a message with a known identifier.
    ///
    /// Store backends use this when materializing rows; applications insert
    /// [`NewMessage`]s and let the store assign identifiers.
    pub fn new(
        id: MessageId,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

/// A message waiting to be inserted into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

impl NewMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub(crate) fn with_id(self, id: MessageId) -> Message {
        Message {
            id,
            sender: self.sender,
            recipient: self.recipient,
            subject: self.subject,
            body: self.body,
        }
    }
}

/// Delivery state of a stored message.
///
/// The discriminants are the values persisted by SQL backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(i16)]
pub enum DeliveryState {
    /// Not attempted yet, or handed back after the session was lost.
    Pending = 0,
    /// Claimed by a worker or handed off to the endpoint.
    Dispatched = 1,
    /// Rejected by the endpoint.
    Failed = 2,
}

impl DeliveryState {
    pub fn as_i16(self) -> i16 {
        self as i16
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Dispatched),
            2 => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Dispatched => f.write_str("dispatched"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Messages claimed together by one worker cycle.
///
/// Messages are kept in ascending identifier order, as returned by
/// [`MessageStore::claim_batch`](crate::store::MessageStore::claim_batch).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    messages: Vec<Message>,
}

impl Batch {
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by_key(|m| m.id);
        Self { messages }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.messages.iter().map(|m| m.id).collect()
    }

    /// Inclusive identifier range covered by the batch.
    pub fn range(&self) -> Option<(MessageId, MessageId)> {
        match (self.messages.first(), self.messages.last()) {
            (Some(first), Some(last)) => Some((first.id, last.id)),
            _ => None,
        }
    }

    /// Whether the batch holds every identifier of its range.
    ///
    /// A range update is only safe on contiguous batches. Anything else in
    /// the range may belong to another worker or be dispatched already.
    pub fn is_contiguous(&self) -> bool {
        match self.range() {
            Some((low, high)) => (high - low) as usize + 1 == self.messages.len(),
            None => false,
        }
    }
}

impl IntoIterator for Batch {
    type Item = Message;
    type IntoIter = std::vec::IntoIter<Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

/// Formats a batch range for log fields.
pub(crate) struct RangeDisplay(pub(crate) Option<(MessageId, MessageId)>);

impl fmt::Display for RangeDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some((low, high)) => write!(f, "[{low}, {high}]"),
            None => f.write_str("[]"),
        }
    }
}
