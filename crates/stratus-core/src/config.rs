//! Connection configuration.
//!
//! A [`StorageConfig`] is immutable for the life of a connection. It carries
//! the account credentials, the endpoint shape (host, port, Walrus service
//! path, HTTP vs HTTPS), the TLS trust source, an optional proxy, and the two
//! transfer timeouts.

use std::path::PathBuf;

/// Where the TLS engine gets its trust anchors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CaCerts {
    /// Use the compiled-in list of well-known AWS root certificates.
    #[default]
    Default,
    /// Load PEM certificates from the given file.
    File(PathBuf),
    /// Skip peer verification entirely.
    Insecure,
}

/// Configuration for one storage connection.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// AWS access key id.
    pub access_key: String,
    /// AWS secret key.
    pub secret_key: String,
    /// Endpoint host. Empty means the default S3 endpoint.
    pub host: String,
    /// Endpoint port. `None` means the scheme default (Walrus defaults to 8773).
    pub port: Option<u16>,
    /// Whether the endpoint is a Eucalyptus Walrus service.
    pub is_walrus: bool,
    /// Whether to connect over HTTPS.
    pub is_https: bool,
    /// TLS trust anchors.
    pub ca_certs: CaCerts,
    /// Optional HTTP proxy, as `host:port`.
    pub proxy: Option<String>,
    /// Total per-operation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

// Without default timeouts a connection could stall forever if the cable is
// unplugged mid-transfer.
const DEFAULT_TIMEOUT_MS: u64 = 120 * 1000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30 * 1000;

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            host: String::new(),
            port: None,
            is_walrus: false,
            is_https: true,
            ca_certs: CaCerts::Default,
            proxy: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl StorageConfig {
    /// The endpoint used when no host is configured.
    pub const DEFAULT_HOST: &'static str = "s3.amazonaws.com";
    /// The port Walrus deployments listen on by default.
    pub const DEFAULT_WALRUS_PORT: u16 = 8773;

    /// Create a configuration for the given account credentials.
    #[must_use]
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            ..Self::default()
        }
    }

    /// Load a configuration from environment variables.
    ///
    /// Reads `AWS_ACCESS_KEY`, `AWS_SECRET_KEY`, `AWS_HOST`, and `AWS_PROXY`;
    /// absent variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("AWS_ACCESS_KEY") {
            config.access_key = v;
        }
        if let Ok(v) = std::env::var("AWS_SECRET_KEY") {
            config.secret_key = v;
        }
        if let Ok(v) = std::env::var("AWS_HOST") {
            config.host = v;
        }
        if let Ok(v) = std::env::var("AWS_PROXY") {
            config.proxy = Some(v);
        }

        config
    }

    /// Set the endpoint host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the endpoint port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Target a Walrus endpoint.
    #[must_use]
    pub fn with_walrus(mut self, is_walrus: bool) -> Self {
        self.is_walrus = is_walrus;
        self
    }

    /// Enable or disable HTTPS.
    #[must_use]
    pub fn with_https(mut self, is_https: bool) -> Self {
        self.is_https = is_https;
        self
    }

    /// Set the TLS trust source.
    #[must_use]
    pub fn with_ca_certs(mut self, ca_certs: CaCerts) -> Self {
        self.ca_certs = ca_certs;
        self
    }

    /// Set the HTTP proxy.
    #[must_use]
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Set the total per-operation timeout in milliseconds.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the connect timeout in milliseconds.
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, connect_timeout_ms: u64) -> Self {
        self.connect_timeout_ms = connect_timeout_ms;
        self
    }

    /// The host to connect to, falling back to the default S3 endpoint.
    #[must_use]
    pub fn effective_host(&self) -> &str {
        if self.host.is_empty() {
            Self::DEFAULT_HOST
        } else {
            &self.host
        }
    }

    /// The port to connect to: the configured port, the Walrus default for
    /// Walrus endpoints, otherwise the scheme default.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        if let Some(port) = self.port {
            return port;
        }
        if self.is_walrus {
            return Self::DEFAULT_WALRUS_PORT;
        }
        if self.is_https {
            443
        } else {
            80
        }
    }

    /// Whether the port must appear in URLs (a non-default port, or any
    /// explicit Walrus port).
    #[must_use]
    pub fn url_port(&self) -> Option<u16> {
        let port = self.effective_port();
        let scheme_default = if self.is_https { 443 } else { 80 };
        if self.is_walrus || port != scheme_default {
            Some(port)
        } else {
            None
        }
    }
}
