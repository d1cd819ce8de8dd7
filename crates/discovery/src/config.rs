//! Discovery configuration

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use percent_encoding::percent_decode_str;
use proven_discovery_registry::{ClientOptions, Credentials};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Error;
use crate::tls::{TlsFiles, client_config};

/// Default time to establish the registry connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on each registry request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default keepalive ping interval
pub const DEFAULT_KEEPALIVE_TIME: Duration = Duration::from_secs(2);

/// Default keepalive response timeout
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(6);

/// Configuration for one discovery attempt.
#[derive(Clone, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Discovery URL: registry endpoint plus the cluster token as its path,
    /// e.g. `https://registry.example.com:2379/my-cluster`.
    #[serde(rename = "discovery")]
    pub url: String,

    /// Time allowed to establish the registry connection
    #[serde(rename = "discovery-dial-timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,

    /// Bound on every non-streaming registry request
    #[serde(rename = "discovery-request-timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Keepalive ping interval
    #[serde(rename = "discovery-keepalive-time", with = "humantime_serde")]
    pub keepalive_time: Duration,

    /// Keepalive response timeout
    #[serde(rename = "discovery-keepalive-timeout", with = "humantime_serde")]
    pub keepalive_timeout: Duration,

    /// Use plaintext when no TLS material is given
    #[serde(rename = "discovery-insecure-transport")]
    pub insecure_transport: bool,

    /// Skip server certificate verification
    #[serde(rename = "discovery-insecure-skip-tls-verify")]
    pub insecure_skip_verify: bool,

    /// Client certificate (PEM)
    #[serde(rename = "discovery-cert")]
    pub cert_file: Option<PathBuf>,

    /// Client private key (PEM)
    #[serde(rename = "discovery-key")]
    pub key_file: Option<PathBuf>,

    /// Trusted CA bundle (PEM)
    #[serde(rename = "discovery-cacert")]
    pub trusted_ca_file: Option<PathBuf>,

    /// Registry user
    #[serde(rename = "discovery-user")]
    pub user: Option<String>,

    /// Registry password
    #[serde(rename = "discovery-password")]
    pub password: Option<String>,

    /// Transient failures tolerated before giving up
    #[serde(rename = "discovery-max-retries")]
    pub max_retries: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            keepalive_time: DEFAULT_KEEPALIVE_TIME,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            insecure_transport: false,
            insecure_skip_verify: false,
            cert_file: None,
            key_file: None,
            trusted_ca_file: None,
            user: None,
            password: None,
            max_retries: u32::MAX,
        }
    }
}

impl fmt::Debug for DiscoveryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryConfig")
            .field("url", &self.url)
            .field("dial_timeout", &self.dial_timeout)
            .field("request_timeout", &self.request_timeout)
            .field("keepalive_time", &self.keepalive_time)
            .field("keepalive_timeout", &self.keepalive_timeout)
            .field("insecure_transport", &self.insecure_transport)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("cert_file", &self.cert_file)
            .field("key_file", &self.key_file)
            .field("trusted_ca_file", &self.trusted_ca_file)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl DiscoveryConfig {
    /// Creates a configuration with default timeouts for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sets the registry request timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the keepalive interval and timeout.
    #[must_use]
    pub const fn with_keepalive(mut self, time: Duration, timeout: Duration) -> Self {
        self.keepalive_time = time;
        self.keepalive_timeout = timeout;
        self
    }

    /// Allows plaintext transport when no TLS material is configured.
    #[must_use]
    pub const fn with_insecure_transport(mut self, insecure: bool) -> Self {
        self.insecure_transport = insecure;
        self
    }

    /// Disables server certificate verification.
    #[must_use]
    pub const fn with_insecure_skip_verify(mut self, skip: bool) -> Self {
        self.insecure_skip_verify = skip;
        self
    }

    /// Sets client certificate and key files.
    #[must_use]
    pub fn with_client_cert(mut self, cert_file: impl Into<PathBuf>, key_file: impl Into<PathBuf>) -> Self {
        self.cert_file = Some(cert_file.into());
        self.key_file = Some(key_file.into());
        self
    }

    /// Sets the trusted CA bundle.
    #[must_use]
    pub fn with_trusted_ca(mut self, ca_file: impl Into<PathBuf>) -> Self {
        self.trusted_ca_file = Some(ca_file.into());
        self
    }

    /// Sets registry credentials.
    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Checks the configuration and splits the discovery URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unparsable URL, a missing cluster
    /// token, a zero request timeout, or a password without a user.
    pub fn validate(&self) -> Result<DiscoveryUrl, Error> {
        if self.request_timeout.is_zero() {
            return Err(Error::Config("request timeout must be non-zero".to_string()));
        }

        if self.password.is_some() && self.user.is_none() {
            return Err(Error::Config("password given without a user".to_string()));
        }

        DiscoveryUrl::parse(&self.url)
    }

    /// Builds connector options for `endpoint`, loading any TLS material.
    ///
    /// TLS is used when certificate, key or CA files are configured, or when
    /// none are and plaintext transport was not requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if TLS material cannot be loaded.
    pub fn client_options(&self, endpoint: &Url) -> Result<ClientOptions, Error> {
        let has_tls_files =
            self.cert_file.is_some() || self.key_file.is_some() || self.trusted_ca_file.is_some();

        let tls = if has_tls_files || !self.insecure_transport {
            Some(client_config(&TlsFiles {
                cert_file: self.cert_file.as_deref(),
                key_file: self.key_file.as_deref(),
                trusted_ca_file: self.trusted_ca_file.as_deref(),
                insecure_skip_verify: self.insecure_skip_verify,
            })?)
        } else {
            None
        };

        let credentials = self.user.as_ref().map(|user| Credentials {
            user: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        });

        Ok(ClientOptions {
            endpoint: endpoint.clone(),
            dial_timeout: self.dial_timeout,
            keepalive_time: self.keepalive_time,
            keepalive_timeout: self.keepalive_timeout,
            credentials,
            tls,
        })
    }
}

/// A discovery URL split into the registry endpoint and the cluster token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveryUrl {
    endpoint: Url,
    token: String,
}

impl DiscoveryUrl {
    /// Parses `scheme://host:port/<token>`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the URL does not parse, cannot carry a
    /// path, or has an empty token.
    pub fn parse(url: &str) -> Result<Self, Error> {
        let parsed =
            Url::parse(url).map_err(|e| Error::Config(format!("invalid discovery URL {url:?}: {e}")))?;

        if parsed.cannot_be_a_base() {
            return Err(Error::Config(format!("invalid discovery URL {url:?}")));
        }

        let token = percent_decode_str(parsed.path())
            .decode_utf8()
            .map_err(|e| Error::Config(format!("invalid cluster token in {url:?}: {e}")))?
            .trim_matches('/')
            .to_string();

        if token.is_empty() {
            return Err(Error::Config(format!(
                "discovery URL {url:?} has no cluster token"
            )));
        }

        let mut endpoint = parsed;
        endpoint.set_path("");
        endpoint.set_query(None);
        endpoint.set_fragment(None);

        Ok(Self { endpoint, token })
    }

    /// Registry endpoint without path, query or fragment.
    #[must_use]
    pub const fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Cluster token taken from the URL path.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }
}
