//! Network-state tracking
//!
//! The platform layer reports connectivity through a [`NetworkMonitor`]; the
//! [`NetworkListener`] turns every report into a resolution pass on the
//! [`ConnectionFactory`] followed by a `NetworkChanged` broadcast.
//!
//! ```text
//! OS callback / poller ──report()──▶ NetworkMonitor ──watch──▶ NetworkListener
//!                                                                  │
//!                                     factory.resolve(state) ◀─────┤
//!                                     bus: NetworkChanged    ◀─────┘
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::connection::factory::ConnectionFactory;

/// Kind of the active network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Wifi,
    Ethernet,
    Cellular,
    Vpn,
    Other,
}

/// Connectivity as last reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum NetworkState {
    #[default]
    Disconnected,
    Connected(NetworkType),
}

impl NetworkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkState::Connected(_))
    }

    pub fn network_type(&self) -> Option<NetworkType> {
        match self {
            NetworkState::Connected(network_type) => Some(*network_type),
            NetworkState::Disconnected => None,
        }
    }
}

// =============================================================================
// Monitor - platform-facing publisher
// =============================================================================

/// Publisher the platform layer feeds with connectivity changes.
///
/// `report` never blocks and may be called from any thread. Reporting the
/// same state twice still wakes listeners.
#[derive(Clone)]
pub struct NetworkMonitor {
    sender: Arc<watch::Sender<NetworkState>>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn report(&self, state: NetworkState) {
        debug!(?state, "Network state reported");
        self.sender.send_replace(state);
    }

    pub fn current(&self) -> NetworkState {
        *self.sender.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.sender.subscribe()
    }
}

// =============================================================================
// Listener - drives resolution passes
// =============================================================================

pub struct NetworkListener;

impl NetworkListener {
    /// Spawn the listener task.
    ///
    /// The state present at registration is handled immediately, then every
    /// report triggers one pass and one `NetworkChanged` broadcast, whether or
    /// not the resolved set changed.
    pub fn spawn(
        factory: Arc<ConnectionFactory>,
        bus: SharedBus,
        mut receiver: watch::Receiver<NetworkState>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Network listener started");

            let initial = *receiver.borrow_and_update();
            Self::handle_change(&factory, &bus, initial).await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Network listener shutting down");
                        break;
                    }
                    changed = receiver.changed() => {
                        if changed.is_err() {
                            debug!("Network monitor dropped, listener exiting");
                            break;
                        }
                        let state = *receiver.borrow_and_update();
                        Self::handle_change(&factory, &bus, state).await;
                    }
                }
            }

            info!("Network listener stopped");
        })
    }

    async fn handle_change(factory: &ConnectionFactory, bus: &SharedBus, state: NetworkState) {
        match factory.resolve(state).await {
            Ok(connectivity) => debug!(?state, ?connectivity, "Connections resolved"),
            Err(e) => warn!(?state, "Resolution pass failed, keeping previous connections: {}", e),
        }
        bus.publish(BusEvent::NetworkChanged);
    }
}

// =============================================================================
// Probing - desktop stand-in for OS callbacks
// =============================================================================

/// Source of the current network state
#[async_trait]
pub trait NetworkProbe: Send + Sync {
    async fn probe(&self) -> NetworkState;
}

/// Considers the device connected when a UDP socket can be routed to
/// `target`. Routing a UDP socket sends no packets.
pub struct RouteProbe {
    target: SocketAddr,
    interface: NetworkType,
}

impl RouteProbe {
    pub fn new(target: SocketAddr, interface: NetworkType) -> Self {
        Self { target, interface }
    }
}

#[async_trait]
impl NetworkProbe for RouteProbe {
    async fn probe(&self) -> NetworkState {
        let bind_addr: SocketAddr = if self.target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Route probe bind failed: {}", e);
                return NetworkState::Disconnected;
            }
        };

        match socket.connect(self.target).await {
            Ok(()) => NetworkState::Connected(self.interface),
            Err(e) => {
                debug!("No route to {}: {}", self.target, e);
                NetworkState::Disconnected
            }
        }
    }
}

/// Poll `probe` every `interval` and report to `monitor` when the state changes.
pub fn spawn_poller(
    probe: Arc<dyn NetworkProbe>,
    monitor: NetworkMonitor,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let state = probe.probe().await;
                    if last != Some(state) {
                        info!(?state, "Network state changed");
                        monitor.report(state);
                        last = Some(state);
                    }
                }
            }
        }
    })
}
