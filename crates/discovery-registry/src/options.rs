use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

/// Username/password pair used to authenticate against the registry.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// User name
    pub user: String,

    /// Password
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything a connector needs to open a registry connection.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Registry endpoint (scheme, host and port only).
    pub endpoint: Url,

    /// Maximum time to establish the connection.
    pub dial_timeout: Duration,

    /// Interval between keepalive pings.
    pub keepalive_time: Duration,

    /// Time to wait for a keepalive response before closing the connection.
    pub keepalive_timeout: Duration,

    /// Optional authentication.
    pub credentials: Option<Credentials>,

    /// TLS configuration. `None` means plaintext transport.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClientOptions {
    /// Creates plaintext, unauthenticated options for `endpoint` with zero
    /// timeouts (meaning "connector default").
    #[must_use]
    pub const fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            dial_timeout: Duration::ZERO,
            keepalive_time: Duration::ZERO,
            keepalive_timeout: Duration::ZERO,
            credentials: None,
            tls: None,
        }
    }

    /// Whether the connection will be made over TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }
}
