//! Voice command relay
//!
//! Forwards the first recognized transcript to the server's `VoiceCommand`
//! item. Without a usable connection the command is queued and the relay
//! subscribes to the bus; on the first `NetworkChanged` that yields a
//! connection the whole queue is sent and the subscription dropped.

use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEvent, SharedBus};
use crate::config::SettingsProvider;
use crate::connection::factory::ConnectionFactory;
use crate::connection::{Connection, ConnectionError};

/// Item receiving voice commands on the server
pub const VOICE_COMMAND_ITEM: &str = "VoiceCommand";

const COMMAND_CONTENT_TYPE: &str = "text/plain;charset=UTF-8";

/// What `submit` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceDispatch {
    /// Nothing recognized; the request is finished
    Ignored,
    /// Handed to the HTTP client
    Sent,
    /// Waiting for a connection
    Queued,
}

/// First transcript of a recognition result, or empty
pub fn extract_voice_command(results: &[String]) -> String {
    results.first().cloned().unwrap_or_default()
}

#[derive(Debug, Clone)]
struct PendingCommand {
    command: String,
    request_id: u32,
}

#[derive(Default)]
struct RelayState {
    pending: Vec<PendingCommand>,
    listening: bool,
    listener: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct VoiceCommandRelay {
    factory: Arc<ConnectionFactory>,
    settings: Arc<dyn SettingsProvider>,
    bus: SharedBus,
    state: Arc<Mutex<RelayState>>,
    shutdown: CancellationToken,
}

impl VoiceCommandRelay {
    pub fn new(
        factory: Arc<ConnectionFactory>,
        settings: Arc<dyn SettingsProvider>,
        bus: SharedBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            factory,
            settings,
            bus,
            state: Arc::new(Mutex::new(RelayState::default())),
            shutdown,
        }
    }

    /// Handle one recognition result identified by `request_id`
    pub async fn submit(&self, request_id: u32, results: &[String]) -> VoiceDispatch {
        let command = extract_voice_command(results);
        info!("Recognized text: {}", command);
        self.notify(self.settings.settings().messages.recognized_text(&command));

        if command.is_empty() {
            self.bus.publish(BusEvent::VoiceRequestFinished {
                request_id,
                success: false,
            });
            return VoiceDispatch::Ignored;
        }

        // Subscribe before the check so a NetworkChanged landing in between is kept
        let rx = self.bus.subscribe();
        if let Some(conn) = self.factory.usable_connection() {
            self.send_item_command(&conn, command, request_id);
            return VoiceDispatch::Sent;
        }

        let mut state = self.state.lock().await;
        state.pending.push(PendingCommand {
            command,
            request_id,
        });
        debug!(queued = state.pending.len(), "No usable connection, command queued");
        if !state.listening {
            state.listening = true;
            state.listener = Some(self.spawn_listener(rx));
        }
        VoiceDispatch::Queued
    }

    /// Commands waiting for a connection
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Whether the relay currently listens for network changes
    pub async fn is_listening(&self) -> bool {
        self.state.lock().await.listening
    }

    /// Wait for the network-change listener to finish, if one was started
    pub async fn join(&self) {
        let listener = self.state.lock().await.listener.take();
        if let Some(handle) = listener {
            if let Err(e) = handle.await {
                debug!("Voice relay listener ended abnormally: {}", e);
            }
        }
    }

    fn spawn_listener(&self, mut rx: broadcast::Receiver<BusEvent>) -> JoinHandle<()> {
        let relay = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = relay.shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(BusEvent::NetworkChanged) | Err(RecvError::Lagged(_)) => {
                            if relay.try_flush().await {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            debug!("Voice relay stopped listening for network changes");
        })
    }

    /// Send every queued command if a connection is available.
    ///
    /// Returns true once the queue was flushed and the subscription released.
    async fn try_flush(&self) -> bool {
        let conn = match self.factory.available_connection() {
            Ok(conn) => conn,
            Err(ConnectionError::NetworkNotAvailable(_)) => {
                debug!("Still no network, keeping voice commands queued");
                return false;
            }
            Err(e) => {
                warn!("Couldn't determine openHAB URL: {}", e);
                self.notify(self.settings.settings().messages.no_usable_connection.clone());
                return false;
            }
        };

        let pending = {
            let mut state = self.state.lock().await;
            state.listening = false;
            std::mem::take(&mut state.pending)
        };

        info!(count = pending.len(), url = conn.openhab_url(), "Sending queued voice commands");
        for entry in pending {
            self.send_item_command(&conn, entry.command, entry.request_id);
        }
        true
    }

    fn send_item_command(&self, conn: &Connection, command: String, request_id: u32) {
        debug!(
            item = VOICE_COMMAND_ITEM,
            command = %command,
            "sendItemCommand"
        );
        let path = format!("/rest/items/{}", urlencoding::encode(VOICE_COMMAND_ITEM));
        let bus = self.bus.clone();

        conn.async_client()
            .post(&path, command, COMMAND_CONTENT_TYPE, move |result| {
                let success = match result {
                    Ok(_) => {
                        debug!("Command was sent successfully");
                        true
                    }
                    Err(e) => {
                        error!(status = ?e.status(), "Got command error: {}", e);
                        false
                    }
                };
                bus.publish(BusEvent::VoiceRequestFinished {
                    request_id,
                    success,
                });
            });
    }

    /// Marshal a user-facing message to the UI layer
    fn notify(&self, message: String) {
        self.bus.publish(BusEvent::UserNotice { message });
    }
}
