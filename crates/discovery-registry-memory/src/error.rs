use proven_discovery_registry::{RegistryError, RegistryErrorKind};
use thiserror::Error;

/// Errors that can occur in this crate.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The client has been closed
    #[error("registry connection closed")]
    Closed,

    /// The requested start revision has been compacted away
    #[error("revision compacted; earliest watchable revision is {0}")]
    Compacted(i64),

    /// A watcher fell too far behind the event feed
    #[error("watch lagged behind by {0} events")]
    Lagged(u64),

    /// The registry is (artificially) unreachable
    #[error("registry unavailable")]
    Unavailable,
}

impl RegistryError for Error {
    fn kind(&self) -> RegistryErrorKind {
        match self {
            Self::Closed => RegistryErrorKind::Closed,
            Self::Compacted(_) | Self::Lagged(_) => RegistryErrorKind::Other,
            Self::Unavailable => RegistryErrorKind::Unavailable,
        }
    }
}
