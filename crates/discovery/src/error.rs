//! Error types for cluster discovery

use proven_discovery_registry::RegistryErrorKind;
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The rendered initial cluster is not a valid name to URLs mapping.
    /// The rendered string is kept for diagnostics.
    #[error("discovery: invalid peer URL in initial cluster {cluster:?}: {source}")]
    InvalidUrl {
        /// The rendered initial cluster string
        cluster: String,
        /// Why validation failed
        source: UrlsMapError,
    },

    /// The cluster size key holds something other than a positive integer
    #[error("discovery: size key {key} is bad")]
    BadSizeKey {
        /// The size key that was read
        key: String,
    },

    /// The cluster size key does not exist
    #[error("discovery: size key {key} not found")]
    SizeNotFound {
        /// The size key that was read
        key: String,
    },

    /// The cluster already holds the configured number of other members
    #[error("discovery: cluster {cluster} is full")]
    FullCluster {
        /// Cluster token
        cluster: String,
    },

    /// Transient failures persisted past the retry ceiling
    #[error("discovery: too many retries to {step} for cluster {cluster}")]
    TooManyRetries {
        /// Cluster token
        cluster: String,
        /// The operation being retried
        step: &'static str,
        /// The last transient failure
        source: Box<Self>,
    },

    /// Invalid discovery configuration
    #[error("discovery: invalid configuration: {0}")]
    Config(String),

    /// TLS material could not be loaded
    #[error("discovery: TLS error: {0}")]
    Tls(String),

    /// The registry connection could not be opened
    #[error("discovery: failed to connect to {endpoint}: {message}")]
    Connect {
        /// Registry endpoint
        endpoint: String,
        /// Connector error
        message: String,
    },

    /// A registry request failed
    #[error("discovery: registry request to {operation} failed ({kind}): {message}")]
    Registry {
        /// The request that failed
        operation: &'static str,
        /// Kind reported by the registry client
        kind: RegistryErrorKind,
        /// Registry client error
        message: String,
    },

    /// A registry request did not complete within the request timeout
    #[error("discovery: registry request to {operation} timed out")]
    Timeout {
        /// The request that timed out
        operation: &'static str,
    },

    /// The member watch reported an error
    #[error("discovery: watch on {prefix} failed: {message}")]
    Watch {
        /// Watched prefix
        prefix: String,
        /// Watch error
        message: String,
    },

    /// The member watch ended before enough peers registered
    #[error("discovery: watch on {prefix} closed before all peers registered")]
    WatchClosed {
        /// Watched prefix
        prefix: String,
    },

    /// Discovery was cancelled by the caller
    #[error("discovery: cancelled")]
    Cancelled,
}

/// Reasons a registry entry is refused by the membership ledger.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LedgerError {
    /// Key lies outside this cluster's member prefix
    #[error("invalid peer registry key")]
    InvalidRegistryKey,

    /// Value is not of the form `name=url`
    #[error("invalid peer info returned from discovery service")]
    InvalidPeerInfo,

    /// Key was already recorded
    #[error("found duplicate peer from discovery service")]
    DuplicatePeer,
}

/// Reasons an initial cluster string fails validation.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum UrlsMapError {
    /// URL could not be parsed at all
    #[error("invalid URL {url:?}: {reason}")]
    Parse {
        /// Offending URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// `http`/`https` URL without an explicit port
    #[error("URL address does not have the form \"host:port\": {0}")]
    MissingPort(String),

    /// Scheme other than `http`, `https`, `unix` or `unixs`
    #[error("URL scheme must be http, https, unix, or unixs: {0}")]
    UnsupportedScheme(String),

    /// URL carries a path
    #[error("URL must not contain a path: {0}")]
    UnexpectedPath(String),
}
