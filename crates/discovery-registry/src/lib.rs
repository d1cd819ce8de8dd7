//! Abstract interface for the key-value registry used as a discovery
//! rendezvous point.
//!
//! The discovery protocol only needs a narrow slice of a registry client:
//! single-key and prefix reads that report the store revision, plain puts,
//! prefix watches starting from a revision, and an explicit close.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;
mod options;

pub use error::{RegistryError, RegistryErrorKind};
pub use options::{ClientOptions, Credentials};

use std::fmt::Debug;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// A single key-value pair as stored in the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// Full registry key.
    pub key: String,

    /// Raw value bytes.
    pub value: Bytes,

    /// Revision at which the key was created. Kept across overwrites.
    pub create_revision: i64,

    /// Revision of the last modification of the key.
    pub mod_revision: i64,
}

/// Result of a single-key or prefix read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    /// Matching entries, ordered by key.
    pub kvs: Vec<KeyValue>,

    /// Store revision at the time the read was served.
    pub revision: i64,
}

/// Kind of change reported by a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// The key was created or overwritten.
    Put,

    /// The key was deleted.
    Delete,
}

/// A single change observed by a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    /// What happened to the key.
    pub kind: EventKind,

    /// The key-value pair after the change. For deletes the value is empty.
    pub kv: KeyValue,
}

/// A batch of events delivered together, in increasing revision order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchResponse {
    /// Events in this batch.
    pub events: Vec<WatchEvent>,
}

/// Stream of watch batches. Ends when the watch or its connection is closed.
pub type WatchStream<E> = Pin<Box<dyn Stream<Item = Result<WatchResponse, E>> + Send>>;

/// A connected registry client.
///
/// Every method except [`Registry::watch_prefix`] is a bounded request/reply;
/// callers are expected to apply their own request timeouts.
///
/// Dropping a client must release its connection the same way
/// [`Registry::close`] does.
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// The error type for registry operations.
    type Error: RegistryError;

    /// Reads a single key. An absent key yields an empty `kvs`.
    async fn get(&self, key: &str) -> Result<RangeResponse, Self::Error>;

    /// Reads every key starting with `prefix` in one consistent snapshot.
    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, Self::Error>;

    /// Writes `value` under `key`, returning the revision of the write.
    async fn put(&self, key: &str, value: Bytes) -> Result<i64, Self::Error>;

    /// Opens a watch over every key starting with `prefix`, delivering every
    /// change with a revision greater than or equal to `start_revision`.
    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream<Self::Error>, Self::Error>;

    /// Closes the connection. Outstanding reads and watches fail or end
    /// promptly afterwards. Closing twice is a no-op.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Opens registry connections.
#[async_trait]
pub trait RegistryConnector: Send + Sync + 'static {
    /// The connected client type.
    type Registry: Registry;

    /// Opens a new connection described by `options`.
    async fn connect(
        &self,
        options: &ClientOptions,
    ) -> Result<Self::Registry, <Self::Registry as Registry>::Error>;
}
