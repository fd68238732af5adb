//! ConnectionFactory - decides which path to the server is used
//!
//! The factory keeps one [`Resolution`] snapshot: the last known network state
//! and the connections built for it, keyed by type. A resolution pass builds a
//! complete replacement and swaps it in, so readers see either the old or the
//! new snapshot and never a mix of both.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{Settings, SettingsProvider};
use crate::connection::http::HttpOptions;
use crate::connection::{http_options, Connection, ConnectionError, ConnectionType, Endpoint};
use crate::network::NetworkState;

/// Availability derived from a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    NoNetwork,
    NetworkPresentNoServer,
    LocalAvailable,
    RemoteAvailable,
    BothAvailable,
}

/// Builds a connection for an endpoint that is not cached yet
pub type Connector =
    Arc<dyn Fn(Endpoint, &HttpOptions) -> Result<Connection, ConnectionError> + Send + Sync>;

/// Outcome of one resolution pass
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    network: NetworkState,
    connections: HashMap<ConnectionType, Connection>,
    generation: u64,
}

impl Resolution {
    pub fn network(&self) -> NetworkState {
        self.network
    }

    pub fn get(&self, connection_type: ConnectionType) -> Option<&Connection> {
        self.connections.get(&connection_type)
    }

    /// Passes applied so far; 0 before the first
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn connection_types(&self) -> Vec<ConnectionType> {
        let mut types: Vec<_> = self.connections.keys().copied().collect();
        types.sort();
        types
    }

    pub fn state(&self) -> ConnectivityState {
        if !self.network.is_connected() {
            return ConnectivityState::NoNetwork;
        }
        let local = self.connections.contains_key(&ConnectionType::Local);
        let remote = self.connections.contains_key(&ConnectionType::Remote)
            || self.connections.contains_key(&ConnectionType::Cloud);
        match (local, remote) {
            (true, true) => ConnectivityState::BothAvailable,
            (true, false) => ConnectivityState::LocalAvailable,
            (false, true) => ConnectivityState::RemoteAvailable,
            (false, false) => ConnectivityState::NetworkPresentNoServer,
        }
    }
}

pub struct ConnectionFactory {
    settings: Arc<dyn SettingsProvider>,
    connector: Connector,
    snapshot: watch::Sender<Arc<Resolution>>,
    /// Serialises resolution passes; readers never take it
    pass_lock: Mutex<()>,
}

impl ConnectionFactory {
    pub fn new(settings: Arc<dyn SettingsProvider>) -> Self {
        Self::with_connector(settings, Arc::new(Connection::new))
    }

    /// Factory that builds new connections through `connector`
    pub fn with_connector(settings: Arc<dyn SettingsProvider>, connector: Connector) -> Self {
        let (snapshot, _) = watch::channel(Arc::new(Resolution::default()));
        Self {
            settings,
            connector,
            snapshot,
            pass_lock: Mutex::new(()),
        }
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Resolution> {
        self.snapshot.borrow().clone()
    }

    /// Watch snapshot replacements
    pub fn subscribe(&self) -> watch::Receiver<Arc<Resolution>> {
        self.snapshot.subscribe()
    }

    pub fn network(&self) -> NetworkState {
        self.snapshot().network
    }

    pub fn state(&self) -> ConnectivityState {
        self.snapshot().state()
    }

    /// Highest-priority connection whose type is both cached and still configured
    pub fn available_connection(&self) -> Result<Connection, ConnectionError> {
        let snapshot = self.snapshot();
        let settings = self.settings.settings();

        if !snapshot.network.is_connected() {
            return Err(ConnectionError::NetworkNotAvailable(
                settings.messages.network_not_available.clone(),
            ));
        }

        ConnectionType::PRIORITY
            .iter()
            .filter(|t| t.configured_url(&settings).is_some())
            .find_map(|t| snapshot.connections.get(t))
            .cloned()
            .ok_or_else(|| {
                ConnectionError::NoUsableConnection(settings.messages.no_usable_connection.clone())
            })
    }

    /// Like [`Self::available_connection`], but `None` instead of an error
    pub fn usable_connection(&self) -> Option<Connection> {
        match self.available_connection() {
            Ok(connection) => Some(connection),
            Err(e) => {
                debug!("No usable connection: {}", e);
                None
            }
        }
    }

    /// Direct lookup, bypassing priority selection
    pub fn connection(&self, connection_type: ConnectionType) -> Option<Connection> {
        self.snapshot().connections.get(&connection_type).cloned()
    }

    /// Rebuild the connection cache for `network` and swap it in.
    ///
    /// On error the previous snapshot stays in place untouched.
    pub async fn resolve(
        &self,
        network: NetworkState,
    ) -> Result<ConnectivityState, ConnectionError> {
        let _pass = self.pass_lock.lock().await;
        self.run_pass(network).await
    }

    /// One resolution pass; the caller holds `pass_lock`
    async fn run_pass(&self, network: NetworkState) -> Result<ConnectivityState, ConnectionError> {
        let previous = self.snapshot();
        let settings = self.settings.settings();

        let connections = if network.is_connected() {
            let mut connections = build_connections(&settings, network, &previous, &self.connector)?;
            if settings.check_local_reachability {
                if let Some(local) = connections.get(&ConnectionType::Local).cloned() {
                    if !local.check_reachability().await {
                        info!("Local server {} unreachable, skipping", local.openhab_url());
                        connections.remove(&ConnectionType::Local);
                    }
                }
            }
            connections
        } else {
            HashMap::new()
        };

        let resolution = Resolution {
            network,
            connections,
            generation: previous.generation + 1,
        };
        let state = resolution.state();

        info!(
            ?network,
            ?state,
            types = ?resolution.connection_types(),
            generation = resolution.generation,
            "Connection cache rebuilt"
        );

        self.snapshot.send_replace(Arc::new(resolution));
        Ok(state)
    }

    /// Re-run a pass with the last known network state after a settings change.
    ///
    /// The state is read once the pass lock is held, so a network report
    /// queued ahead of the reload is never replayed over.
    pub async fn reload_settings(&self) {
        let _pass = self.pass_lock.lock().await;
        let network = self.network();
        if let Err(e) = self.run_pass(network).await {
            warn!("Resolution after settings change failed: {}", e);
        }
    }

    /// Drop every cached connection and forget the network state.
    ///
    /// Waits for a pass in flight so it cannot overwrite the reset.
    pub async fn reset(&self) {
        let _pass = self.pass_lock.lock().await;
        debug!("Connection factory reset");
        self.snapshot.send_replace(Arc::new(Resolution::default()));
    }
}

/// Build the connection map for one pass.
///
/// Unchanged endpoints reuse the cached connection. Invalid URLs are skipped;
/// a client build failure fails the whole pass.
fn build_connections(
    settings: &Settings,
    network: NetworkState,
    previous: &Resolution,
    connector: &Connector,
) -> Result<HashMap<ConnectionType, Connection>, ConnectionError> {
    let options = http_options(settings);
    let mut connections: HashMap<ConnectionType, Connection> = HashMap::new();

    for connection_type in ConnectionType::PRIORITY {
        let endpoint = match Endpoint::from_settings(connection_type, settings) {
            None => continue,
            Some(Ok(endpoint)) => endpoint,
            Some(Err(e)) => {
                warn!(%connection_type, "Skipping candidate: {}", e);
                continue;
            }
        };

        if connection_type == ConnectionType::Local {
            let allowed = network
                .network_type()
                .is_some_and(|t| settings.local_policy.allows(t));
            if !allowed {
                debug!(?network, policy = ?settings.local_policy, "Local connection not allowed on this network");
                continue;
            }
        }

        let cached = previous
            .connections
            .get(&connection_type)
            .filter(|c| c.endpoint() == &endpoint && c.options() == &options);

        let connection = if let Some(cached) = cached {
            cached.clone()
        } else if let Some(remote) = connections
            .get(&ConnectionType::Remote)
            .filter(|r| connection_type == ConnectionType::Cloud && r.endpoint().same_target(&endpoint))
        {
            Connection::derived(remote, ConnectionType::Cloud)
        } else {
            connector(endpoint, &options)?
        };

        connections.insert(connection_type, connection);
    }

    Ok(connections)
}
