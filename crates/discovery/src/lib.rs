//! Cluster bootstrap discovery through a shared key-value registry.
//!
//! Nodes that are about to form a new cluster agree on a token and a
//! registry. Each one registers its `name=url` peer info under the token,
//! then waits until the configured number of members have registered. The
//! registry's create revisions give every node the same ordering, so all of
//! them produce the same initial cluster string.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod backoff;
mod clock;
mod config;
mod engine;
mod error;
mod keys;
mod ledger;
mod member_id;
mod registry;
mod tls;
mod urls_map;

pub use backoff::{Backoff, MAX_EXPONENTIAL_RETRIES, backoff_for};
pub use clock::{Clock, TokioClock};
pub use config::{
    DEFAULT_DIAL_TIMEOUT, DEFAULT_KEEPALIVE_TIME, DEFAULT_KEEPALIVE_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT, DiscoveryConfig, DiscoveryUrl,
};
pub use engine::{ClusterCheck, Session};
pub use error::{Error, LedgerError, UrlsMapError};
pub use keys::{REGISTRY_ROOT, cluster_prefix, cluster_size_key, member_key, member_prefix};
pub use ledger::ClusterLedger;
pub use member_id::MemberId;
pub use registry::ClusterRegistry;
pub use tls::{TlsFiles, client_config};
pub use urls_map::UrlsMap;

use std::sync::Arc;

use proven_discovery_registry::RegistryConnector;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};

/// Runs discovery attempts against one registry.
#[derive(Debug)]
pub struct ClusterDiscovery<C: RegistryConnector> {
    connector: C,
    config: DiscoveryConfig,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl<C: RegistryConnector> ClusterDiscovery<C> {
    /// Creates a discovery client sleeping on the tokio timer.
    pub fn new(connector: C, config: DiscoveryConfig) -> Self {
        Self {
            connector,
            config,
            clock: Arc::new(TokioClock),
            shutdown: CancellationToken::new(),
        }
    }

    /// Replaces the clock used for retry backoff.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Aborts in-flight attempts with [`Error::Cancelled`] once `shutdown` is
    /// cancelled. The connection is still closed.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Returns the initial cluster without registering this node.
    ///
    /// # Errors
    ///
    /// See [`Error`]. Transient registry failures are retried with
    /// exponential backoff until `max_retries` is reached.
    pub async fn get_cluster(&self) -> Result<String, Error> {
        let result = async {
            let mut session = self.open(None).await?;
            let result = session.get_cluster().await;
            session.close().await;
            result
        }
        .instrument(info_span!("discovery", url = %self.config.url))
        .await;

        match &result {
            Ok(cluster) => info!(
                "Discovered cluster {} from {}",
                cluster, self.config.url
            ),
            Err(e) => error!("Failed to get cluster from {}: {}", self.config.url, e),
        }

        result
    }

    /// Registers this node as `member_info` (`name=url[,name=url...]`) and
    /// returns the initial cluster once every member has registered.
    ///
    /// # Errors
    ///
    /// [`Error::FullCluster`] if enough other members registered first, and
    /// everything [`ClusterDiscovery::get_cluster`] can return.
    pub async fn join_cluster(&self, member_id: MemberId, member_info: &str) -> Result<String, Error> {
        let result = async {
            let mut session = self.open(Some(member_id)).await?;
            let result = session.join_cluster(member_info.trim()).await;
            session.close().await;
            result
        }
        .instrument(info_span!("discovery", url = %self.config.url, member = %member_id))
        .await;

        match &result {
            Ok(cluster) => info!(
                "Joined cluster {} through {} as member {}",
                cluster, self.config.url, member_id
            ),
            Err(e) => error!(
                "Failed to join cluster through {} as member {}: {}",
                self.config.url, member_id, e
            ),
        }

        result
    }

    async fn open(&self, member_id: Option<MemberId>) -> Result<Session<C::Registry>, Error> {
        let url = self.config.validate()?;
        let options = self.config.client_options(url.endpoint())?;

        let connected = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(Error::Cancelled),
            result = self.connector.connect(&options) => result,
        };

        let client = connected.map_err(|e| Error::Connect {
            endpoint: url.endpoint().to_string(),
            message: e.to_string(),
        })?;

        let registry = ClusterRegistry::new(
            client,
            url.token(),
            self.config.request_timeout,
            self.shutdown.clone(),
        );

        Ok(Session::new(
            registry,
            member_id,
            self.config.max_retries,
            self.clock.clone(),
            self.shutdown.clone(),
        ))
    }
}

/// Returns the initial cluster for `config` without registering.
///
/// # Errors
///
/// See [`ClusterDiscovery::get_cluster`].
pub async fn get_cluster<C: RegistryConnector>(
    connector: C,
    config: &DiscoveryConfig,
) -> Result<String, Error> {
    ClusterDiscovery::new(connector, config.clone())
        .get_cluster()
        .await
}

/// Registers `member_info` under `member_id` and returns the initial cluster.
///
/// # Errors
///
/// See [`ClusterDiscovery::join_cluster`].
pub async fn join_cluster<C: RegistryConnector>(
    connector: C,
    config: &DiscoveryConfig,
    member_id: MemberId,
    member_info: &str,
) -> Result<String, Error> {
    ClusterDiscovery::new(connector, config.clone())
        .join_cluster(member_id, member_info)
        .await
}
