//! AppContext - wires the connection subsystem together
//!
//! Replaces a process-wide singleton: whoever needs connection resolution gets
//! the context (or the `Arc`s inside it) passed in. `start` brings up the
//! network listener, `shutdown` stops every task it spawned.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bus::{create_bus, BusEvent, SharedBus};
use crate::config::{Settings, SettingsProvider, SettingsStore};
use crate::connection::factory::ConnectionFactory;
use crate::network::{NetworkListener, NetworkMonitor, NetworkState};
use crate::voice::VoiceCommandRelay;

pub struct AppContext {
    pub bus: SharedBus,
    pub settings: Arc<SettingsStore>,
    pub factory: Arc<ConnectionFactory>,
    pub monitor: NetworkMonitor,
    pub voice: VoiceCommandRelay,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Build the context and start listening to `initial` and later network reports
    pub fn start(settings: Settings, initial: NetworkState) -> Self {
        let bus = create_bus();
        let settings = Arc::new(SettingsStore::new(settings));
        let provider: Arc<dyn SettingsProvider> = settings.clone();
        let factory = Arc::new(ConnectionFactory::new(provider.clone()));
        let monitor = NetworkMonitor::new(initial);
        let shutdown = CancellationToken::new();

        let listener = NetworkListener::spawn(
            factory.clone(),
            bus.clone(),
            monitor.subscribe(),
            shutdown.child_token(),
        );

        let voice = VoiceCommandRelay::new(
            factory.clone(),
            provider,
            bus.clone(),
            shutdown.child_token(),
        );

        info!(?initial, "Connection subsystem started");

        Self {
            bus,
            settings,
            factory,
            monitor,
            voice,
            shutdown,
            tasks: vec![listener],
        }
    }

    /// Token cancelled on shutdown, for tasks spawned by the embedding app
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Keep track of an extra task so `shutdown` waits for it
    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Replace the settings and rebuild connections for the current network
    pub async fn apply_settings(&self, settings: Settings) {
        self.settings.replace(settings);
        self.factory.reload_settings().await;
    }

    pub async fn shutdown(self) {
        info!("Shutting down connection subsystem");
        self.bus.publish(BusEvent::ShuttingDown);
        self.shutdown.cancel();

        for task in self.tasks {
            if let Err(e) = task.await {
                debug!("Task ended abnormally: {}", e);
            }
        }
        self.voice.join().await;
        self.factory.reset().await;
        info!("Shutdown complete");
    }
}
