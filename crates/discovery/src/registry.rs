//! Discovery view of a registry connection: cluster-scoped reads, writes and
//! watches, each bounded by the request timeout and the shutdown token.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use proven_discovery_registry::{KeyValue, Registry, RegistryError, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;
use crate::keys::{cluster_size_key, member_prefix};
use crate::ledger::ClusterLedger;

/// Registry connection scoped to one cluster token.
#[derive(Debug)]
pub struct ClusterRegistry<R: Registry> {
    client: R,
    token: String,
    size_key: String,
    member_prefix: String,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl<R: Registry> ClusterRegistry<R> {
    /// Wraps a connected client for the cluster `token`.
    pub fn new(
        client: R,
        token: impl Into<String>,
        request_timeout: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        let token = token.into();

        Self {
            client,
            size_key: cluster_size_key(&token),
            member_prefix: member_prefix(&token),
            token,
            request_timeout,
            shutdown,
        }
    }

    /// Cluster token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Prefix under which members register.
    pub fn member_prefix(&self) -> &str {
        &self.member_prefix
    }

    /// Reads the configured cluster size.
    ///
    /// # Errors
    ///
    /// [`Error::SizeNotFound`] if the key is absent, [`Error::BadSizeKey`] if
    /// it is not a positive integer, or the request error.
    pub async fn read_cluster_size(&self) -> Result<usize, Error> {
        let response = self
            .request("read cluster size", self.client.get(&self.size_key))
            .await
            .inspect_err(|e| {
                warn!(
                    "Failed to get cluster size {} from discovery service: {}",
                    self.size_key, e
                );
            })?;

        let Some(kv) = response.kvs.first() else {
            return Err(Error::SizeNotFound {
                key: self.size_key.clone(),
            });
        };

        std::str::from_utf8(&kv.value)
            .ok()
            .and_then(|value| value.parse::<i64>().ok())
            .filter(|size| *size > 0)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| Error::BadSizeKey {
                key: self.size_key.clone(),
            })
    }

    /// Reads every registered member in one snapshot.
    ///
    /// Returns the ledger together with the store revision the snapshot was
    /// taken at. Malformed entries are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns the request error.
    pub async fn read_members(&self) -> Result<(ClusterLedger, i64), Error> {
        let response = self
            .request("read cluster members", self.client.get_prefix(&self.member_prefix))
            .await
            .inspect_err(|e| {
                warn!(
                    "Failed to get cluster members under {} from discovery service: {}",
                    self.member_prefix, e
                );
            })?;

        let mut ledger = ClusterLedger::new(&self.token);
        for kv in &response.kvs {
            record(&mut ledger, kv);
        }

        Ok((ledger, response.revision))
    }

    /// Writes this member's registration.
    ///
    /// # Errors
    ///
    /// Returns the request error.
    pub async fn register_self(&self, member_key: &str, contents: &str) -> Result<(), Error> {
        self.request(
            "register member",
            self.client
                .put(member_key, Bytes::copy_from_slice(contents.as_bytes())),
        )
        .await
        .inspect_err(|e| {
            warn!(
                "Failed to register member {} with the discovery service: {}",
                member_key, e
            );
        })?;

        info!("Registered member {} as {}", member_key, contents);

        Ok(())
    }

    /// Opens a watch over the member prefix starting at `start_revision`.
    ///
    /// # Errors
    ///
    /// Returns the request error if the watch cannot be opened.
    pub async fn watch_members(&self, start_revision: i64) -> Result<WatchStream<R::Error>, Error> {
        self.request(
            "watch cluster members",
            self.client.watch_prefix(&self.member_prefix, start_revision),
        )
        .await
    }

    /// Closes the underlying connection. Failures are logged.
    pub async fn close(&self) {
        if let Err(e) = self.client.close().await {
            warn!("Failed to close discovery service connection: {}", e);
        }
    }

    async fn request<T, F>(&self, operation: &'static str, request: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, R::Error>> + Send,
    {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(self.request_timeout, request) => match result {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::Registry {
                    operation,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
                Err(_) => Err(Error::Timeout { operation }),
            },
        }
    }
}

/// Feeds one registry entry into `ledger`, logging the outcome.
///
/// Returns whether the entry was recorded.
pub(crate) fn record(ledger: &mut ClusterLedger, kv: &KeyValue) -> bool {
    let key = kv.key.trim();
    let value = String::from_utf8_lossy(&kv.value);
    let value = value.trim();

    match ledger.add(key, value, kv.create_revision) {
        Ok(()) => {
            info!("Found peer {} ({}) from discovery service", key, value);
            true
        }
        Err(e) => {
            warn!("Skipping entry {} ({}): {}", key, value, e);
            false
        }
    }
}
