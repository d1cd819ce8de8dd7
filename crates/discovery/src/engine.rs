//! Discovery protocol run over one registry connection.

use std::sync::Arc;

use futures::StreamExt;
use proven_discovery_registry::{EventKind, Registry};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;
use crate::backoff::Backoff;
use crate::clock::Clock;
use crate::keys::member_key;
use crate::ledger::ClusterLedger;
use crate::member_id::MemberId;
use crate::registry::{ClusterRegistry, record};

/// Snapshot taken by a cluster status check.
#[derive(Debug)]
pub struct ClusterCheck {
    /// Members registered at `revision`
    pub ledger: ClusterLedger,
    /// Configured cluster size
    pub cluster_size: usize,
    /// Store revision of the member snapshot
    pub revision: i64,
    /// Whether the cluster is full without this session's member
    pub full: bool,
}

/// State of a single discovery attempt.
///
/// A session owns its connection and its retry counter; nothing is shared
/// between attempts.
#[derive(Debug)]
pub struct Session<R: Registry> {
    registry: ClusterRegistry<R>,
    member_key: Option<String>,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
    shutdown: CancellationToken,
}

impl<R: Registry> Session<R> {
    /// Creates a session. Observers pass no `member_id`.
    pub fn new(
        registry: ClusterRegistry<R>,
        member_id: Option<MemberId>,
        max_retries: u32,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let member_key = member_id.map(|id| member_key(registry.token(), &id.to_string()));

        Self {
            registry,
            member_key,
            backoff: Backoff::new(max_retries),
            clock,
            shutdown,
        }
    }

    /// Returns the initial cluster without registering.
    ///
    /// A full cluster is rendered immediately; otherwise waits until enough
    /// members have registered.
    ///
    /// # Errors
    ///
    /// Size key errors, retry exhaustion, watch failures, cancellation, or an
    /// invalid rendered cluster.
    pub async fn get_cluster(&mut self) -> Result<String, Error> {
        let ClusterCheck {
            mut ledger,
            cluster_size,
            revision,
            full,
        } = self.check_cluster().await?;

        if !full && ledger.len() < cluster_size {
            self.wait_peers(&mut ledger, cluster_size, revision).await?;
        }

        ledger.render_initial_cluster(cluster_size)
    }

    /// Registers `contents` under this session's member key and returns the
    /// initial cluster once enough members have registered.
    ///
    /// # Errors
    ///
    /// [`Error::FullCluster`] if the cluster fills up before this member, as
    /// well as every error [`Session::get_cluster`] can return.
    pub async fn join_cluster(&mut self, contents: &str) -> Result<String, Error> {
        let Some(member_key) = self.member_key.clone() else {
            return Err(Error::Config(
                "joining a cluster requires a member id".to_string(),
            ));
        };

        self.check_room().await?;
        self.register_self(&member_key, contents).await?;

        let ClusterCheck {
            mut ledger,
            cluster_size,
            revision,
            ..
        } = self.check_room().await?;

        if ledger.len() < cluster_size {
            self.wait_peers(&mut ledger, cluster_size, revision).await?;
        }

        ledger.render_initial_cluster(cluster_size)
    }

    /// Closes the session's connection.
    pub async fn close(self) {
        self.registry.close().await;
    }

    async fn check_room(&mut self) -> Result<ClusterCheck, Error> {
        let check = self.check_cluster().await?;
        if check.full {
            return Err(Error::FullCluster {
                cluster: self.registry.token().to_string(),
            });
        }
        Ok(check)
    }

    pub(crate) async fn check_cluster(&mut self) -> Result<ClusterCheck, Error> {
        loop {
            match self.try_check_cluster().await {
                Ok(check) => {
                    self.backoff.reset();
                    return Ok(check);
                }
                Err(
                    e @ (Error::SizeNotFound { .. } | Error::BadSizeKey { .. } | Error::Cancelled),
                ) => return Err(e),
                Err(e) => self.backoff_for_retry("check cluster status", e).await?,
            }
        }
    }

    async fn try_check_cluster(&self) -> Result<ClusterCheck, Error> {
        let cluster_size = self.registry.read_cluster_size().await?;
        let (ledger, revision) = self.registry.read_members().await?;
        let full = ledger.is_full_without(self.member_key.as_deref(), cluster_size);

        Ok(ClusterCheck {
            ledger,
            cluster_size,
            revision,
            full,
        })
    }

    pub(crate) async fn register_self(
        &mut self,
        member_key: &str,
        contents: &str,
    ) -> Result<(), Error> {
        if !contents.contains('=') {
            return Err(Error::Config(format!(
                "member info {contents:?} is not of the form name=url"
            )));
        }

        loop {
            match self.registry.register_self(member_key, contents).await {
                Ok(()) => {
                    self.backoff.reset();
                    return Ok(());
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => self.backoff_for_retry("register member", e).await?,
            }
        }
    }

    async fn wait_peers(
        &self,
        ledger: &mut ClusterLedger,
        cluster_size: usize,
        revision: i64,
    ) -> Result<(), Error> {
        let prefix = self.registry.member_prefix().to_string();
        let mut watch = self.registry.watch_members(revision + 1).await?;

        info!(
            "Waiting for peers from discovery service ({} of {} found)",
            ledger.len(),
            cluster_size
        );

        while ledger.len() < cluster_size {
            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(Error::Cancelled),
                next = watch.next() => next,
            };

            match next {
                Some(Ok(response)) => {
                    for event in &response.events {
                        match event.kind {
                            EventKind::Put => {
                                record(ledger, &event.kv);
                            }
                            EventKind::Delete => {
                                warn!(
                                    "Ignoring removal of {} from discovery service",
                                    event.kv.key.trim()
                                );
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    return Err(Error::Watch {
                        prefix,
                        message: e.to_string(),
                    });
                }
                None => return Err(Error::WatchClosed { prefix }),
            }
        }

        info!(
            "Found all needed peers from discovery service ({} of {})",
            ledger.len(),
            cluster_size
        );

        Ok(())
    }

    async fn backoff_for_retry(&mut self, step: &'static str, cause: Error) -> Result<(), Error> {
        let Some(delay) = self.backoff.next_delay() else {
            return Err(Error::TooManyRetries {
                cluster: self.registry.token().to_string(),
                step,
                source: Box::new(cause),
            });
        };

        warn!(
            "Failed to {} (retry {}), retrying in {:?}: {}",
            step,
            self.backoff.retries(),
            delay,
            cause
        );

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(Error::Cancelled),
            () = self.clock.sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;
    use proven_discovery_registry::{ClientOptions, RangeResponse, RegistryConnector, WatchStream};
    use proven_discovery_registry_memory::{self as memory, MemoryClient, MemoryRegistry};
    use url::Url;

    use crate::clock::RecordingClock;
    use crate::keys::cluster_size_key;

    const TOKEN: &str = "engine-test";

    fn secs(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_secs).collect()
    }

    async fn session(
        registry: &MemoryRegistry,
        member_id: Option<u64>,
        max_retries: u32,
        clock: &RecordingClock,
        shutdown: &CancellationToken,
    ) -> Session<MemoryClient> {
        let options = ClientOptions::new(Url::parse("http://127.0.0.1:2379").unwrap());
        let client = registry.connect(&options).await.unwrap();
        let cluster = ClusterRegistry::new(client, TOKEN, Duration::from_secs(5), shutdown.clone());

        Session::new(
            cluster,
            member_id.map(MemberId::new),
            max_retries,
            Arc::new(clock.clone()),
            shutdown.clone(),
        )
    }

    fn seed(registry: &MemoryRegistry, size: &str, members: &[(u64, &str)]) {
        registry.put(cluster_size_key(TOKEN), size.to_string());
        for (id, info) in members {
            registry.put(member_key(TOKEN, &MemberId::new(*id).to_string()), info.to_string());
        }
    }

    async fn wait_for_watch(registry: &MemoryRegistry) {
        while registry.watcher_count() == 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Accepts requests and never answers them.
    #[derive(Debug)]
    struct StalledRegistry;

    #[async_trait]
    impl Registry for StalledRegistry {
        type Error = memory::Error;

        async fn get(&self, _key: &str) -> Result<RangeResponse, memory::Error> {
            futures::future::pending().await
        }

        async fn get_prefix(&self, _prefix: &str) -> Result<RangeResponse, memory::Error> {
            futures::future::pending().await
        }

        async fn put(&self, _key: &str, _value: Bytes) -> Result<i64, memory::Error> {
            futures::future::pending().await
        }

        async fn watch_prefix(
            &self,
            _prefix: &str,
            _start_revision: i64,
        ) -> Result<WatchStream<memory::Error>, memory::Error> {
            futures::future::pending().await
        }

        async fn close(&self) -> Result<(), memory::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_cluster_rejects_join() {
        let registry = MemoryRegistry::new();
        seed(&registry, "2", &[(1, "a=http://h:1"), (2, "b=http://h:2")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, Some(3), u32::MAX, &clock, &CancellationToken::new()).await;

        assert_matches!(
            session.join_cluster("c=http://h:3").await,
            Err(Error::FullCluster { cluster }) if cluster == TOKEN
        );
        assert!(registry.value(&member_key(TOKEN, "3")).is_none());
    }

    #[tokio::test]
    async fn test_full_cluster_renders_for_observer() {
        let registry = MemoryRegistry::new();
        seed(
            &registry,
            "2",
            &[(1, "a=http://h:1"), (2, "b=http://h:2"), (3, "c=http://h:3")],
        );
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        assert_eq!(
            session.get_cluster().await.unwrap(),
            "a=http://h:1,b=http://h:2"
        );
    }

    #[tokio::test]
    async fn test_registered_member_rejoins() {
        let registry = MemoryRegistry::new();
        seed(&registry, "2", &[(1, "a=http://h:1"), (2, "b=http://h:2")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, Some(2), u32::MAX, &clock, &CancellationToken::new()).await;

        assert_eq!(
            session.join_cluster("b=http://h:2").await.unwrap(),
            "a=http://h:1,b=http://h:2"
        );
    }

    #[tokio::test]
    async fn test_size_errors_are_not_retried() {
        let registry = MemoryRegistry::new();
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        assert_matches!(session.get_cluster().await, Err(Error::SizeNotFound { .. }));

        registry.put(cluster_size_key(TOKEN), "zero");
        assert_matches!(session.get_cluster().await, Err(Error::BadSizeKey { .. }));

        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_backoff_grows_and_caps() {
        let registry = MemoryRegistry::new();
        seed(&registry, "1", &[(1, "a=http://h:1")]);
        registry.fail_next_requests(12);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        assert_eq!(session.get_cluster().await.unwrap(), "a=http://h:1");
        assert_eq!(
            clock.sleeps(),
            secs(&[1, 2, 4, 8, 16, 32, 64, 128, 256, 256, 256, 256])
        );
    }

    #[tokio::test]
    async fn test_backoff_resets_after_success() {
        let registry = MemoryRegistry::new();
        seed(&registry, "1", &[(1, "a=http://h:1")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        registry.fail_next_requests(3);
        session.check_cluster().await.unwrap();
        registry.fail_next_requests(2);
        session.check_cluster().await.unwrap();

        assert_eq!(clock.sleeps(), secs(&[1, 2, 4, 1, 2]));
    }

    #[tokio::test]
    async fn test_too_many_retries() {
        let registry = MemoryRegistry::new();
        seed(&registry, "1", &[(1, "a=http://h:1")]);
        registry.fail_next_requests(10);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, 3, &clock, &CancellationToken::new()).await;

        assert_matches!(
            session.get_cluster().await,
            Err(Error::TooManyRetries { cluster, step: "check cluster status", source })
                if cluster == TOKEN && matches!(*source, Error::Registry { .. })
        );
        assert_eq!(clock.sleeps(), secs(&[1, 2, 4]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_requests_time_out_and_retry() {
        let shutdown = CancellationToken::new();
        let cluster = ClusterRegistry::new(
            StalledRegistry,
            TOKEN,
            Duration::from_millis(50),
            shutdown.clone(),
        );
        let clock = RecordingClock::new();
        let mut session = Session::new(cluster, None, 1, Arc::new(clock.clone()), shutdown);

        assert_matches!(
            session.get_cluster().await,
            Err(Error::TooManyRetries { step: "check cluster status", source, .. })
                if matches!(*source, Error::Timeout { operation: "read cluster size" })
        );
        assert_eq!(clock.sleeps(), secs(&[1]));
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_register_retries() {
        let registry = MemoryRegistry::new();
        let clock = RecordingClock::new();
        let mut session = session(&registry, Some(7), u32::MAX, &clock, &CancellationToken::new()).await;
        let key = member_key(TOKEN, "7");

        registry.fail_next_requests(2);
        session.register_self(&key, "g=http://h:7").await.unwrap();

        assert_eq!(clock.sleeps(), secs(&[1, 2]));
        assert!(registry.value(&key).is_some());
        assert!(logs_contain("Failed to register member"));
    }

    #[tokio::test]
    async fn test_register_rejects_payload_without_name() {
        let registry = MemoryRegistry::new();
        let clock = RecordingClock::new();
        let mut session = session(&registry, Some(7), u32::MAX, &clock, &CancellationToken::new()).await;

        assert_matches!(
            session.register_self(&member_key(TOKEN, "7"), "http://h:7").await,
            Err(Error::Config(_))
        );
    }

    #[tokio::test]
    async fn test_observer_cannot_join() {
        let registry = MemoryRegistry::new();
        seed(&registry, "1", &[]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        assert_matches!(session.join_cluster("a=http://h:1").await, Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_wait_skips_deletes_and_malformed_entries() {
        let registry = MemoryRegistry::new();
        seed(&registry, "3", &[(1, "a=http://h:1")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        let waiter = tokio::spawn(async move { session.get_cluster().await });
        wait_for_watch(&registry).await;

        registry.put(member_key(TOKEN, "bad"), "not-a-peer");
        registry.delete(&member_key(TOKEN, "1"));
        registry.put(member_key(TOKEN, "2"), "b=http://h:2");
        registry.put(member_key(TOKEN, "3"), "c=http://h:3");

        assert_eq!(
            waiter.await.unwrap().unwrap(),
            "a=http://h:1,b=http://h:2,c=http://h:3"
        );
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let registry = MemoryRegistry::new();
        seed(&registry, "2", &[(1, "a=http://h:1")]);
        let clock = RecordingClock::new();
        let shutdown = CancellationToken::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &shutdown).await;

        let waiter = tokio::spawn(async move { session.get_cluster().await });
        wait_for_watch(&registry).await;
        shutdown.cancel();

        assert_matches!(waiter.await.unwrap(), Err(Error::Cancelled));
    }

    #[tokio::test]
    async fn test_watch_closed_by_registry() {
        let registry = MemoryRegistry::new();
        seed(&registry, "2", &[(1, "a=http://h:1")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        let waiter = tokio::spawn(async move { session.get_cluster().await });
        wait_for_watch(&registry).await;
        registry.disconnect_clients();

        assert_matches!(
            waiter.await.unwrap(),
            Err(Error::WatchClosed { prefix }) if prefix == crate::keys::member_prefix(TOKEN)
        );
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_lagging_watch_fails() {
        let registry = MemoryRegistry::with_event_capacity(2);
        seed(&registry, "2", &[(1, "a=http://h:1")]);
        let clock = RecordingClock::new();
        let mut session = session(&registry, None, u32::MAX, &clock, &CancellationToken::new()).await;

        let waiter = tokio::spawn(async move { session.get_cluster().await });
        wait_for_watch(&registry).await;
        for i in 0..5 {
            registry.put(format!("/unrelated/{i}"), "x");
        }

        assert_matches!(
            waiter.await.unwrap(),
            Err(Error::Watch { prefix, .. }) if prefix == crate::keys::member_prefix(TOKEN)
        );
    }
}
