//! Reconnection policy tests with a scripted transport
//!
//! Time is paused so the linear backoff runs instantly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use waav_duplex::core::realtime::{
    ConnectionConfig, Connector, ProtocolEvent, ProtocolState, RealtimeError, RealtimeResult,
    ReconnectionConfig, SessionProtocolClient, TransportEvent, TransportLink,
};

/// Opens the first `successes` connections, then refuses.
struct ScriptedConnector {
    successes: u32,
    attempts: AtomicU32,
    ends: Mutex<Vec<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<TransportEvent>)>>,
}

impl ScriptedConnector {
    fn new(successes: u32) -> Arc<Self> {
        Arc::new(Self {
            successes,
            attempts: AtomicU32::new(0),
            ends: Mutex::new(Vec::new()),
        })
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Simulate the server dropping connection `index`.
    fn drop_link(&self, index: usize) {
        let tx = self.ends.lock()[index].1.clone();
        let _ = tx.send(TransportEvent::Closed {
            reason: "connection reset".to_string(),
        });
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _config: &ConnectionConfig) -> RealtimeResult<TransportLink> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.successes {
            return Err(RealtimeError::ConnectionFailed("connection refused".to_string()));
        }
        let (link, out_rx, in_tx) = TransportLink::pair();
        self.ends.lock().push((out_rx, in_tx));
        Ok(link)
    }
}

fn config(max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://127.0.0.1:9/v1/realtime".to_string(),
        heartbeat_interval_ms: 0,
        reconnection: ReconnectionConfig {
            enabled: true,
            max_attempts,
            base_delay_ms: 1000,
        },
        ..Default::default()
    }
}

struct Observed {
    events: mpsc::UnboundedReceiver<ProtocolEvent>,
    errors: mpsc::UnboundedReceiver<RealtimeError>,
}

fn observe(client: &SessionProtocolClient) -> Observed {
    let (event_tx, events) = mpsc::unbounded_channel();
    client.on_event(Arc::new(move |event| {
        let _ = event_tx.send(event);
    }));
    let (error_tx, errors) = mpsc::unbounded_channel();
    client.on_error(Arc::new(move |error| {
        let _ = error_tx.send(error);
    }));
    Observed { events, errors }
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded_and_reported_once() {
    let connector = ScriptedConnector::new(1);
    let client = SessionProtocolClient::with_connector(config(3), connector.clone());
    let mut observed = observe(&client);

    client.connect().await.unwrap();
    connector.drop_link(0);

    // The drop and each failed attempt are reported before giving up
    let mut transient = 0;
    loop {
        match observed.errors.recv().await {
            Some(RealtimeError::Transport(_)) => transient += 1,
            Some(RealtimeError::MaxRetriesExceeded { attempts }) => {
                assert_eq!(attempts, 3);
                break;
            }
            other => panic!("Expected MaxRetriesExceeded, got {other:?}"),
        }
    }
    assert_eq!(transient, 4);

    let mut delays = Vec::new();
    while let Ok(event) = observed.events.try_recv() {
        if let ProtocolEvent::Reconnecting { attempt, delay } = event {
            delays.push((attempt, delay));
        }
    }
    assert_eq!(
        delays,
        vec![
            (1, Duration::from_secs(1)),
            (2, Duration::from_secs(2)),
            (3, Duration::from_secs(3)),
        ]
    );

    // Initial connect plus three retries
    assert_eq!(connector.attempts(), 4);
    assert_eq!(client.state(), ProtocolState::Disconnected);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(observed.errors.try_recv().is_err(), "error raised more than once");
    assert_eq!(connector.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_successful_reconnect_resets_attempts() {
    let connector = ScriptedConnector::new(2);
    let client = SessionProtocolClient::with_connector(config(5), connector.clone());
    let mut observed = observe(&client);

    client.connect().await.unwrap();
    connector.drop_link(0);

    loop {
        match observed.events.recv().await {
            Some(ProtocolEvent::Connected { reconnected: true }) => break,
            Some(_) => continue,
            None => panic!("Expected a reconnect"),
        }
    }
    assert_eq!(connector.attempts(), 2);
    assert_eq!(client.get_status().reconnect_attempts, 0);
    assert!(client.is_ready());
    match observed.errors.try_recv() {
        Ok(RealtimeError::Transport(reason)) => assert!(reason.contains("connection reset")),
        other => panic!("Expected one Transport error, got {other:?}"),
    }
    assert!(observed.errors.try_recv().is_err());

    client.disconnect();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_cancels_pending_reconnect() {
    let connector = ScriptedConnector::new(5);
    let client = SessionProtocolClient::with_connector(config(5), connector.clone());
    let mut observed = observe(&client);

    client.connect().await.unwrap();
    connector.drop_link(0);

    loop {
        match observed.events.recv().await {
            Some(ProtocolEvent::Reconnecting { attempt: 1, .. }) => break,
            Some(_) => continue,
            None => panic!("Expected Reconnecting"),
        }
    }
    client.disconnect();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(client.state(), ProtocolState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_reconnection_reports_lost_connection() {
    let connector = ScriptedConnector::new(1);
    let client = SessionProtocolClient::with_connector(
        ConnectionConfig {
            reconnection: ReconnectionConfig::disabled(),
            ..config(3)
        },
        connector.clone(),
    );
    let mut observed = observe(&client);

    client.connect().await.unwrap();
    connector.drop_link(0);

    match observed.errors.recv().await {
        Some(RealtimeError::Transport(message)) => assert!(message.contains("connection reset")),
        other => panic!("Expected Transport error, got {other:?}"),
    }
    match observed.errors.recv().await {
        Some(RealtimeError::ConnectionLost(message)) => {
            assert!(message.contains("connection reset"))
        }
        other => panic!("Expected ConnectionLost, got {other:?}"),
    }
    assert_eq!(connector.attempts(), 1);
}
