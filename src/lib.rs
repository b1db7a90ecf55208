#![doc = include_str!("../README.md")]

pub mod config;
pub mod coordinator;
mod hook;
mod message;
pub mod store;
pub mod transport;
mod worker;

#[doc(inline)]
pub use config::{Credentials, DispatchConfig, StoreErrorPolicy};

#[doc(inline)]
pub use coordinator::{BatchPlan, Coordinator, DispatchError, DispatchErrorKind, RunReport};

#[doc(inline)]
pub use hook::{DefaultDispatchHook, DispatchHook};

#[doc(inline)]
pub use message::{Batch, DeliveryState, Message, MessageId, NewMessage};

#[doc(inline)]
pub use store::{InMemoryStore, InsertMessages, MessageStore, Store, StoreError};

#[doc(inline)]
pub use transport::{
    Connector, InMemoryConnector, SendError, SendErrorKind, SendReport, Session, Transport,
    TransportError, TransportErrorKind,
};

#[doc(inline)]
pub use worker::{Worker, WorkerError, WorkerStats};
