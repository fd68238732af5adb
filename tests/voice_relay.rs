//! Voice relay integration tests
//!
//! Run the relay against a mock openHAB server and verify what reaches the
//! wire: item path, content type, basic auth, and the queue-until-connected
//! behaviour driven by network reports.

mod mock_servers;

use axum::http::StatusCode;
use base64::Engine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

use hab_connect::bus::{create_bus, BusEvent};
use hab_connect::config::{Settings, SettingsProvider, SettingsStore};
use hab_connect::connection::factory::ConnectionFactory;
use hab_connect::context::AppContext;
use hab_connect::model::LinkedPage;
use hab_connect::network::{NetworkState, NetworkType};
use hab_connect::voice::{VoiceCommandRelay, VoiceDispatch};
use tokio_util::sync::CancellationToken;

use mock_servers::MockOpenHabServer;

const WIFI: NetworkState = NetworkState::Connected(NetworkType::Wifi);

// =============================================================================
// Test utilities
// =============================================================================

/// Wait for a specific event with timeout
async fn expect_event<F>(rx: &mut broadcast::Receiver<BusEvent>, predicate: F) -> Option<BusEvent>
where
    F: Fn(&BusEvent) -> bool,
{
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    })
    .await
    .unwrap_or(None)
}

async fn expect_finished(rx: &mut broadcast::Receiver<BusEvent>, id: u32) -> bool {
    match expect_event(rx, |e| {
        matches!(e, BusEvent::VoiceRequestFinished { request_id, .. } if *request_id == id)
    })
    .await
    {
        Some(BusEvent::VoiceRequestFinished { success, .. }) => success,
        other => panic!("no completion for request {id}: {other:?}"),
    }
}

/// Start a context and wait until the initial network state is resolved
async fn started(settings: Settings, network: NetworkState) -> AppContext {
    let ctx = AppContext::start(settings, network);
    let mut rx = ctx.bus.subscribe();
    ctx.monitor.report(network);
    expect_event(&mut rx, |e| *e == BusEvent::NetworkChanged)
        .await
        .expect("initial resolution");
    ctx
}

fn local(server: &MockOpenHabServer) -> Settings {
    Settings {
        local_url: server.url(),
        ..Settings::default()
    }
}

/// Settings whose next read stalls once armed, to widen a race window
struct StallingSettings {
    settings: Arc<Settings>,
    armed: AtomicBool,
}

impl SettingsProvider for StallingSettings {
    fn settings(&self) -> Arc<Settings> {
        if self.armed.swap(false, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(300));
        }
        self.settings.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn command_is_posted_as_plain_text() {
    let server = MockOpenHabServer::start().await;
    let ctx = started(local(&server), WIFI).await;
    let mut rx = ctx.bus.subscribe();

    let dispatch = ctx
        .voice
        .submit(1, &["turn on the kitchen light".to_string(), "turn on the kitchen lie".to_string()])
        .await;
    assert_eq!(dispatch, VoiceDispatch::Sent);
    assert!(expect_finished(&mut rx, 1).await);

    let requests = server.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/rest/items/VoiceCommand");
    assert_eq!(requests[0].body, "turn on the kitchen light");
    assert_eq!(
        requests[0].content_type.as_deref(),
        Some("text/plain;charset=UTF-8")
    );
    assert_eq!(requests[0].authorization, None);

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn basic_auth_applied_with_both_credentials() {
    let server = MockOpenHabServer::start().await;
    let settings = Settings {
        username: Some("user".to_string()),
        password: Some("secret".to_string()),
        ..local(&server)
    };
    let ctx = started(settings, WIFI).await;
    let mut rx = ctx.bus.subscribe();

    ctx.voice.submit(2, &["lights off".to_string()]).await;
    assert!(expect_finished(&mut rx, 2).await);

    let expected = format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode("user:secret")
    );
    let requests = server.requests().await;
    assert_eq!(requests[0].authorization.as_deref(), Some(expected.as_str()));

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn empty_password_sends_no_auth() {
    let server = MockOpenHabServer::start().await;
    let settings = Settings {
        username: Some("user".to_string()),
        password: Some(String::new()),
        ..local(&server)
    };
    let ctx = started(settings, WIFI).await;
    let mut rx = ctx.bus.subscribe();

    ctx.voice.submit(3, &["lights off".to_string()]).await;
    assert!(expect_finished(&mut rx, 3).await);

    assert_eq!(server.requests().await[0].authorization, None);

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn server_error_finishes_unsuccessfully() {
    let server = MockOpenHabServer::start().await;
    server.set_command_status(StatusCode::NOT_FOUND).await;
    let ctx = started(local(&server), WIFI).await;
    let mut rx = ctx.bus.subscribe();

    ctx.voice.submit(4, &["open the garage".to_string()]).await;
    assert!(!expect_finished(&mut rx, 4).await);

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn queued_commands_flush_when_network_returns() {
    let server = MockOpenHabServer::start().await;
    let ctx = started(local(&server), NetworkState::Disconnected).await;
    let mut rx = ctx.bus.subscribe();

    assert_eq!(
        ctx.voice.submit(5, &["first".to_string()]).await,
        VoiceDispatch::Queued
    );
    assert_eq!(
        ctx.voice.submit(6, &["second".to_string()]).await,
        VoiceDispatch::Queued
    );
    assert!(ctx.voice.is_listening().await);

    ctx.monitor.report(WIFI);

    assert!(expect_finished(&mut rx, 5).await);
    assert!(expect_finished(&mut rx, 6).await);
    assert_eq!(ctx.voice.pending_count().await, 0);
    assert!(!ctx.voice.is_listening().await);

    let mut bodies: Vec<_> = server
        .requests()
        .await
        .into_iter()
        .map(|r| r.body)
        .collect();
    bodies.sort();
    assert_eq!(bodies, vec!["first", "second"]);

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test]
async fn missing_url_notifies_and_keeps_waiting() {
    let ctx = started(Settings::default(), WIFI).await;
    let mut rx = ctx.bus.subscribe();

    assert_eq!(
        ctx.voice.submit(7, &["hello".to_string()]).await,
        VoiceDispatch::Queued
    );

    ctx.monitor.report(WIFI);

    let notice = expect_event(&mut rx, |e| {
        matches!(e, BusEvent::UserNotice { message } if message.contains("openHAB URL"))
    })
    .await;
    assert_eq!(
        notice,
        Some(BusEvent::UserNotice {
            message: "Couldn't determine openHAB URL".to_string()
        })
    );
    assert_eq!(ctx.voice.pending_count().await, 1);
    assert!(ctx.voice.is_listening().await);

    ctx.shutdown().await;
}

#[tokio::test]
async fn linked_page_fetched_through_resolved_connection() {
    let server = MockOpenHabServer::start().await;
    let ctx = started(local(&server), WIFI).await;

    let conn = ctx.factory.available_connection().unwrap();
    let response = conn
        .sync_client()
        .get("/rest/sitemaps/demo/0001")
        .await
        .unwrap();
    let page = LinkedPage::from_json_str(&response.text()).unwrap();

    assert_eq!(page.id, "0001");
    assert_eq!(page.icon, "groundfloor");
    assert_eq!(page.display_title(), "Ground Floor ");

    ctx.shutdown().await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn network_change_during_submit_flushes_queue() {
    let server = MockOpenHabServer::start().await;
    let stalling = Arc::new(StallingSettings {
        settings: Arc::new(local(&server)),
        armed: AtomicBool::new(false),
    });
    let factory = Arc::new(ConnectionFactory::new(stalling.clone()));
    let bus = create_bus();
    let relay = VoiceCommandRelay::new(
        factory.clone(),
        Arc::new(SettingsStore::new(local(&server))),
        bus.clone(),
        CancellationToken::new(),
    );
    let mut rx = bus.subscribe();

    // The availability check reads the disconnected snapshot, then stalls
    // while the network comes up and the change is broadcast
    stalling.armed.store(true, Ordering::SeqCst);
    let network_up = tokio::spawn({
        let factory = factory.clone();
        let bus = bus.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            factory.resolve(WIFI).await.unwrap();
            bus.publish(BusEvent::NetworkChanged);
        }
    });

    let dispatch = relay.submit(8, &["close the blinds".to_string()]).await;
    network_up.await.unwrap();

    assert_eq!(dispatch, VoiceDispatch::Queued);
    assert!(expect_finished(&mut rx, 8).await);
    assert_eq!(relay.pending_count().await, 0);

    let requests = server.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, "close the blinds");

    server.stop().await;
}
