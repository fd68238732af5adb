//! Resolved connections to the openHAB server
//!
//! A [`Connection`] binds one endpoint (base URL, credentials, type tag) to a
//! pair of ready-to-use HTTP clients. Connections are immutable; the
//! [`factory::ConnectionFactory`] builds them and swaps them out when the
//! network or the settings change.

pub mod factory;
pub mod http;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::config::Settings;
use self::http::{AsyncHttpClient, BasicAuth, HttpClient, HttpOptions};

/// Connect timeout for reachability checks
const REACHABILITY_TIMEOUT: Duration = Duration::from_secs(1);

/// Classification of a server endpoint, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Local,
    Remote,
    Cloud,
}

impl ConnectionType {
    /// Most preferred first
    pub const PRIORITY: [ConnectionType; 3] = [
        ConnectionType::Local,
        ConnectionType::Remote,
        ConnectionType::Cloud,
    ];

    /// Configured URL for this type, if any
    pub fn configured_url(self, settings: &Settings) -> Option<&str> {
        let url = match self {
            ConnectionType::Local => &settings.local_url,
            ConnectionType::Remote => &settings.remote_url,
            ConnectionType::Cloud => &settings.cloud_url,
        };
        let url = url.trim();
        (!url.is_empty()).then_some(url)
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Local => write!(f, "local"),
            ConnectionType::Remote => write!(f, "remote"),
            ConnectionType::Cloud => write!(f, "cloud"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// No active network interface; retry after the next network change
    #[error("{0}")]
    NetworkNotAvailable(String),

    /// Network present but no configured or reachable server endpoint
    #[error("{0}")]
    NoUsableConnection(String),

    #[error("invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

impl ConnectionError {
    pub fn is_network_unavailable(&self) -> bool {
        matches!(self, ConnectionError::NetworkNotAvailable(_))
    }
}

/// Where a connection points and how it authenticates.
///
/// Two endpoints are equal iff type, base URL, username and password match.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    connection_type: ConnectionType,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    /// Validate `base_url` (http/https with a host) and normalise it.
    ///
    /// Trailing slashes are dropped and empty credentials count as absent.
    pub fn new(
        connection_type: ConnectionType,
        base_url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self, ConnectionError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        let invalid = |reason: &str| ConnectionError::InvalidUrl {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };

        let parsed = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if parsed.host().is_none() {
            return Err(invalid("missing host"));
        }

        let non_empty = |s: Option<&str>| s.filter(|s| !s.is_empty()).map(str::to_string);

        Ok(Self {
            connection_type,
            base_url: trimmed.to_string(),
            username: non_empty(username),
            password: non_empty(password),
        })
    }

    /// Endpoint of `connection_type` built from the settings, if configured
    pub fn from_settings(
        connection_type: ConnectionType,
        settings: &Settings,
    ) -> Option<Result<Self, ConnectionError>> {
        let url = connection_type.configured_url(settings)?;
        Some(Self::new(
            connection_type,
            url,
            settings.username.as_deref(),
            settings.password.as_deref(),
        ))
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.connection_type
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Same URL and credentials, ignoring the type tag
    pub fn same_target(&self, other: &Endpoint) -> bool {
        self.base_url == other.base_url
            && self.username == other.username
            && self.password == other.password
    }

    fn basic_auth(&self) -> Option<BasicAuth> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(BasicAuth {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connection_type", &self.connection_type)
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Client pair shared between a connection and the connections derived from it
struct Clients {
    sync: HttpClient,
    asynchronous: AsyncHttpClient,
}

/// A resolved, ready-to-use binding to one server endpoint
#[derive(Clone)]
pub struct Connection {
    endpoint: Endpoint,
    options: HttpOptions,
    clients: Arc<Clients>,
}

impl Connection {
    pub fn new(endpoint: Endpoint, options: &HttpOptions) -> Result<Self, ConnectionError> {
        let sync = HttpClient::new(&endpoint.base_url, endpoint.basic_auth(), options)?;
        let asynchronous = AsyncHttpClient::new(sync.clone());

        debug!(
            connection_type = %endpoint.connection_type,
            url = %endpoint.base_url,
            basic_auth = sync.has_basic_auth(),
            "Connection built"
        );

        Ok(Self {
            endpoint,
            options: options.clone(),
            clients: Arc::new(Clients { sync, asynchronous }),
        })
    }

    /// Relabel `base` as `connection_type`, sharing its HTTP clients
    pub fn derived(base: &Connection, connection_type: ConnectionType) -> Self {
        Self {
            endpoint: Endpoint {
                connection_type,
                ..base.endpoint.clone()
            },
            options: base.options.clone(),
            clients: Arc::clone(&base.clients),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.endpoint.connection_type
    }

    /// Base URL this connection targets; never empty
    pub fn openhab_url(&self) -> &str {
        &self.endpoint.base_url
    }

    pub fn username(&self) -> Option<&str> {
        self.endpoint.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.endpoint.password.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.options.timeout
    }

    /// Transport options the clients were built with
    pub fn options(&self) -> &HttpOptions {
        &self.options
    }

    pub fn sync_client(&self) -> &HttpClient {
        &self.clients.sync
    }

    pub fn async_client(&self) -> &AsyncHttpClient {
        &self.clients.asynchronous
    }

    /// Whether `other` shares this connection's HTTP client instances
    pub fn shares_clients_with(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.clients, &other.clients)
    }

    /// TCP connect to the server's host and port within one second.
    ///
    /// Any error or timeout counts as unreachable.
    pub async fn check_reachability(&self) -> bool {
        debug!("Checking reachability of {}", self.openhab_url());

        let result = tokio::time::timeout(REACHABILITY_TIMEOUT, self.connect()).await;
        match result {
            Ok(Ok(())) => {
                debug!("Socket connected");
                true
            }
            Ok(Err(e)) => {
                warn!("{} is not reachable: {}", self.openhab_url(), e);
                false
            }
            Err(_) => {
                warn!("{} is not reachable: connect timed out", self.openhab_url());
                false
            }
        }
    }

    /// Run [`Self::check_reachability`] on its own task
    pub fn check_reachability_in_background(&self) -> JoinHandle<bool> {
        let connection = self.clone();
        tokio::spawn(async move { connection.check_reachability().await })
    }

    async fn connect(&self) -> std::io::Result<()> {
        let url = Url::parse(self.openhab_url())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
        let port = url.port_or_known_default().unwrap_or(80);

        let stream = match url.host() {
            Some(Host::Domain(domain)) => TcpStream::connect((domain, port)).await?,
            Some(Host::Ipv4(ip)) => TcpStream::connect(SocketAddr::from((ip, port))).await?,
            Some(Host::Ipv6(ip)) => TcpStream::connect(SocketAddr::from((ip, port))).await?,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "URL has no host",
                ))
            }
        };
        drop(stream);
        Ok(())
    }
}

/// HTTP transport options carried by the settings
pub fn http_options(settings: &Settings) -> HttpOptions {
    HttpOptions {
        timeout: settings.timeout(),
        accept_invalid_certs: settings.accept_invalid_certs,
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Connection {}

impl Hash for Connection {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.options.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> HttpOptions {
        HttpOptions {
            timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }

    fn connection(
        connection_type: ConnectionType,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Connection {
        let endpoint = Endpoint::new(connection_type, url, username, password).unwrap();
        Connection::new(endpoint, &options()).unwrap()
    }

    #[test]
    fn equality_covers_every_field() {
        let base = connection(
            ConnectionType::Local,
            "http://192.168.1.10:8080",
            Some("user"),
            Some("secret"),
        );
        let same = connection(
            ConnectionType::Local,
            "http://192.168.1.10:8080/",
            Some("user"),
            Some("secret"),
        );
        assert_eq!(base, same);

        let variants = [
            connection(
                ConnectionType::Remote,
                "http://192.168.1.10:8080",
                Some("user"),
                Some("secret"),
            ),
            connection(
                ConnectionType::Local,
                "http://192.168.1.11:8080",
                Some("user"),
                Some("secret"),
            ),
            connection(
                ConnectionType::Local,
                "http://192.168.1.10:8080",
                Some("other"),
                Some("secret"),
            ),
            connection(
                ConnectionType::Local,
                "http://192.168.1.10:8080",
                Some("user"),
                Some("changed"),
            ),
        ];
        for variant in &variants {
            assert_ne!(&base, variant);
        }
    }

    #[test]
    fn basic_auth_needs_both_credentials() {
        let user_only = connection(
            ConnectionType::Local,
            "http://192.168.1.10:8080",
            Some("user"),
            Some(""),
        );
        assert!(!user_only.sync_client().has_basic_auth());
        assert!(!user_only.async_client().has_basic_auth());
        assert_eq!(user_only.password(), None);

        let both = connection(
            ConnectionType::Local,
            "http://192.168.1.10:8080",
            Some("user"),
            Some("secret"),
        );
        assert!(both.sync_client().has_basic_auth());
    }

    #[test]
    fn invalid_urls_are_rejected() {
        for url in ["not a url", "ftp://192.168.1.10", "http://"] {
            let result = Endpoint::new(ConnectionType::Local, url, None, None);
            assert!(
                matches!(result, Err(ConnectionError::InvalidUrl { .. })),
                "expected {url:?} to be rejected"
            );
        }
    }

    #[test]
    fn derived_connection_shares_clients() {
        let remote = connection(
            ConnectionType::Remote,
            "https://home.example.org",
            Some("user"),
            Some("secret"),
        );
        let cloud = Connection::derived(&remote, ConnectionType::Cloud);

        assert_eq!(cloud.connection_type(), ConnectionType::Cloud);
        assert_eq!(cloud.openhab_url(), remote.openhab_url());
        assert!(cloud.shares_clients_with(&remote));
        assert_ne!(cloud, remote);
    }

    #[test]
    fn debug_output_redacts_password() {
        let conn = connection(
            ConnectionType::Local,
            "http://192.168.1.10:8080",
            Some("user"),
            Some("hunter2"),
        );
        let debug = format!("{:?}", conn);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn configured_url_ignores_blank_values() {
        let settings = Settings {
            local_url: "   ".to_string(),
            remote_url: "https://home.example.org".to_string(),
            ..Settings::default()
        };
        assert_eq!(ConnectionType::Local.configured_url(&settings), None);
        assert_eq!(
            ConnectionType::Remote.configured_url(&settings),
            Some("https://home.example.org")
        );
    }

    #[tokio::test]
    async fn reachability_of_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let conn = connection(
            ConnectionType::Local,
            &format!("http://127.0.0.1:{port}"),
            None,
            None,
        );

        assert!(conn.check_reachability_in_background().await.unwrap());
    }

    #[tokio::test]
    async fn reachability_of_closed_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let conn = connection(
            ConnectionType::Local,
            &format!("http://127.0.0.1:{port}"),
            None,
            None,
        );

        assert!(!conn.check_reachability().await);
    }
}
