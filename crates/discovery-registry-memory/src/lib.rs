//! In-memory (single process) implementation of the discovery registry for
//! tests and local development.
//!
//! Revisions follow the usual MVCC conventions: the store starts at revision
//! 1, every write bumps the revision by one, `create_revision` survives
//! overwrites, and watches can replay history from any revision not yet
//! compacted.
//!
//! Every put and delete is kept in the event history until
//! [`MemoryRegistry::compact`] drops it, so long-lived registries should be
//! compacted periodically.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_discovery_registry::{
    ClientOptions, EventKind, KeyValue, RangeResponse, Registry, RegistryConnector, WatchEvent,
    WatchResponse, WatchStream,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug)]
struct State {
    kvs: BTreeMap<String, KeyValue>,
    history: Vec<WatchEvent>,
    revision: i64,
    compacted: i64,
    failing_requests: usize,
    refuse_connections: bool,
    connections: CancellationToken,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory registry shared by every client connected through it.
#[derive(Clone, Debug)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    /// Creates an empty registry at revision 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CHANNEL_CAPACITY)
    }

    /// Creates an empty registry whose watchers may fall at most `capacity`
    /// events behind before their watch fails with [`Error::Lagged`].
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    kvs: BTreeMap::new(),
                    history: Vec::new(),
                    revision: 1,
                    compacted: 0,
                    failing_requests: 0,
                    refuse_connections: false,
                    connections: CancellationToken::new(),
                }),
                events,
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    /// Writes a key directly, bypassing fault injection. Returns the revision.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Bytes>) -> i64 {
        self.apply_put(key.into(), value.into())
    }

    /// Deletes a key directly. Returns the revision of the delete, or `None`
    /// if the key did not exist.
    pub fn delete(&self, key: &str) -> Option<i64> {
        let mut state = self.shared.state.lock();
        state.kvs.remove(key)?;

        state.revision += 1;
        let event = WatchEvent {
            kind: EventKind::Delete,
            kv: KeyValue {
                key: key.to_string(),
                value: Bytes::new(),
                create_revision: 0,
                mod_revision: state.revision,
            },
        };
        state.history.push(event.clone());
        let _ = self.shared.events.send(event);

        Some(state.revision)
    }

    /// Current store revision.
    #[must_use]
    pub fn revision(&self) -> i64 {
        self.shared.state.lock().revision
    }

    /// Current value of `key`, if any.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.shared
            .state
            .lock()
            .kvs
            .get(key)
            .map(|kv| kv.value.clone())
    }

    /// Makes the next `count` client reads and writes fail with
    /// [`Error::Unavailable`].
    pub fn fail_next_requests(&self, count: usize) {
        self.shared.state.lock().failing_requests = count;
    }

    /// Number of injected failures not yet consumed.
    #[must_use]
    pub fn pending_failures(&self) -> usize {
        self.shared.state.lock().failing_requests
    }

    /// Makes [`RegistryConnector::connect`] fail while `refuse` is set.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().refuse_connections = refuse;
    }

    /// Drops connections of every client opened so far, as if the server
    /// went away. Their watches end and their requests fail with
    /// [`Error::Closed`]. Later connections are unaffected.
    pub fn disconnect_clients(&self) {
        let mut state = self.shared.state.lock();
        state.connections.cancel();
        state.connections = CancellationToken::new();
        debug!("Disconnected all in-memory registry clients");
    }

    /// Discards history older than `revision`. Watches can no longer start
    /// before it.
    pub fn compact(&self, revision: i64) {
        let mut state = self.shared.state.lock();
        if revision <= state.compacted {
            return;
        }

        state.history.retain(|event| event.kv.mod_revision >= revision);
        state.compacted = revision;
        debug!("Compacted in-memory registry history to revision {}", revision);
    }

    /// Number of events kept for watch replay.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.shared.state.lock().history.len()
    }

    /// Number of watches currently open.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.shared.events.receiver_count()
    }

    /// Number of connections opened so far.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed so far.
    #[must_use]
    pub fn closed_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    fn apply_put(&self, key: String, value: Bytes) -> i64 {
        let mut state = self.shared.state.lock();
        state.revision += 1;
        let revision = state.revision;

        let create_revision = state
            .kvs
            .get(&key)
            .map_or(revision, |existing| existing.create_revision);

        let kv = KeyValue {
            key: key.clone(),
            value,
            create_revision,
            mod_revision: revision,
        };
        state.kvs.insert(key, kv.clone());

        let event = WatchEvent {
            kind: EventKind::Put,
            kv,
        };
        state.history.push(event.clone());

        // Sent under the lock so watchers subscribing concurrently never miss
        // or duplicate an event.
        let _ = self.shared.events.send(event);

        revision
    }
}

#[async_trait]
impl RegistryConnector for MemoryRegistry {
    type Registry = MemoryClient;

    async fn connect(&self, options: &ClientOptions) -> Result<MemoryClient, Error> {
        let closed = {
            let state = self.shared.state.lock();
            if state.refuse_connections {
                debug!("Refusing connection to {}", options.endpoint);
                return Err(Error::Unavailable);
            }
            state.connections.child_token()
        };

        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Opened in-memory registry connection to {} (secure: {})",
            options.endpoint,
            options.is_secure()
        );

        Ok(MemoryClient {
            registry: self.clone(),
            closed,
            released: AtomicBool::new(false),
        })
    }
}

/// A connection to a [`MemoryRegistry`].
///
/// Dropping the client closes it.
#[derive(Debug)]
pub struct MemoryClient {
    registry: MemoryRegistry,
    closed: CancellationToken,
    released: AtomicBool,
}

impl MemoryClient {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.closed.cancel();
            self.registry.shared.closes.fetch_add(1, Ordering::SeqCst);
            debug!("Closed in-memory registry connection");
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn take_failure(&self) -> Result<(), Error> {
        let mut state = self.registry.shared.state.lock();
        if state.failing_requests > 0 {
            state.failing_requests -= 1;
            return Err(Error::Unavailable);
        }
        Ok(())
    }

    fn range<F>(&self, matches: F) -> RangeResponse
    where
        F: Fn(&str) -> bool,
    {
        let state = self.registry.shared.state.lock();
        RangeResponse {
            kvs: state
                .kvs
                .values()
                .filter(|kv| matches(&kv.key))
                .cloned()
                .collect(),
            revision: state.revision,
        }
    }
}

#[async_trait]
impl Registry for MemoryClient {
    type Error = Error;

    async fn get(&self, key: &str) -> Result<RangeResponse, Error> {
        self.ensure_open()?;
        self.take_failure()?;
        Ok(self.range(|candidate| candidate == key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<RangeResponse, Error> {
        self.ensure_open()?;
        self.take_failure()?;
        Ok(self.range(|candidate| candidate.starts_with(prefix)))
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<i64, Error> {
        self.ensure_open()?;
        self.take_failure()?;
        Ok(self.registry.apply_put(key.to_string(), value))
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream<Error>, Error> {
        self.ensure_open()?;

        let prefix = prefix.to_string();
        let (backlog, mut receiver) = {
            let state = self.registry.shared.state.lock();
            if start_revision < state.compacted {
                return Err(Error::Compacted(state.compacted));
            }

            let backlog: Vec<WatchEvent> = state
                .history
                .iter()
                .filter(|event| {
                    event.kv.mod_revision >= start_revision && event.kv.key.starts_with(&prefix)
                })
                .cloned()
                .collect();
            (backlog, self.registry.shared.events.subscribe())
        };

        debug!(
            "Watching prefix {} from revision {} ({} replayed events)",
            prefix,
            start_revision,
            backlog.len()
        );

        let closed = self.closed.clone();
        let stream = async_stream::stream! {
            if !backlog.is_empty() {
                yield Ok(WatchResponse { events: backlog });
            }

            loop {
                let received = tokio::select! {
                    biased;
                    () = closed.cancelled() => break,
                    received = receiver.recv() => received,
                };

                match received {
                    Ok(event) => {
                        if event.kv.key.starts_with(&prefix) {
                            yield Ok(WatchResponse { events: vec![event] });
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        yield Err(Error::Lagged(missed));
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), Error> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryClient {
    fn drop(&mut self) {
        self.release();
    }
}
