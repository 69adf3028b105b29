//! End-to-end tests of the session coordinator against a mock realtime server
//!
//! These tests verify:
//! - Session configuration is pushed on connect and on reconnect
//! - Response audio is decoded and scheduled gaplessly
//! - Server and local barge-in cancel the response on the wire and flush playback
//! - Late audio for a cancelled or superseded response is never played
//! - Graceful finish and heartbeats

mod fixtures;
mod mock_server;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use fixtures::*;
use mock_server::MockRealtimeServer;
use waav_duplex::core::capture::AudioFrame;
use waav_duplex::core::playback::{OfflineSink, PlaybackScheduler};
use waav_duplex::core::realtime::{
    ConnectionConfig, InterruptSource, ProtocolState, ReconnectionConfig, SessionConfig,
    SessionProtocolClient, TranscriptRole,
};
use waav_duplex::core::session::{SessionAction, SessionCoordinator, TranscriptUpdate};
use waav_duplex::{EngineConfig, EngineContext};

fn connection(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        url: url.to_string(),
        api_key: "test-api-key".to_string(),
        connect_timeout_ms: 2000,
        heartbeat_interval_ms: 0,
        reconnection: ReconnectionConfig::disabled(),
        ..Default::default()
    }
}

struct Harness {
    coordinator: Arc<SessionCoordinator>,
    sink: Arc<OfflineSink>,
    actions: mpsc::UnboundedReceiver<SessionAction>,
    transcripts: mpsc::UnboundedReceiver<TranscriptUpdate>,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        let context = EngineContext::new(config);
        let sink = Arc::new(OfflineSink::new(OUTPUT_RATE));
        let scheduler = Arc::new(PlaybackScheduler::new(sink.clone(), 0.05));
        let client = SessionProtocolClient::new(context.config.connection.clone());
        let coordinator = SessionCoordinator::new(context, client, scheduler)
            .expect("coordinator should build");

        let (action_tx, actions) = mpsc::unbounded_channel();
        coordinator.on_action(Arc::new(move |action| {
            let _ = action_tx.send(action);
        }));
        let (transcript_tx, transcripts) = mpsc::unbounded_channel();
        coordinator.on_transcript(Arc::new(move |update| {
            let _ = transcript_tx.send(update);
        }));

        Self {
            coordinator,
            sink,
            actions,
            transcripts,
        }
    }

    fn with_url(url: &str) -> Self {
        let mut config = EngineConfig::default();
        config.connection = connection(url);
        Self::new(config)
    }

    async fn next_action(&mut self, matches: impl Fn(&SessionAction) -> bool) -> SessionAction {
        loop {
            let action = tokio::time::timeout(mock_server::WAIT, self.actions.recv())
                .await
                .ok()
                .flatten()
                .expect("Expected a session action");
            if matches(&action) {
                return action;
            }
        }
    }

    fn is_playing(&self) -> bool {
        self.coordinator.scheduler().get_status().is_playing
    }
}

/// Connect, answer the session update and start `resp_1` with three chunks.
async fn start_response(
    server: &mut MockRealtimeServer,
    harness: &Harness,
) -> mock_server::MockConnection {
    harness.coordinator.start().await.expect("connect");
    let mut conn = server.accept().await;
    conn.expect("session.update").await;
    conn.send(session_created("sess_1"));
    conn.send(response_created("resp_1"));
    for _ in 0..3 {
        conn.send(audio_delta("resp_1", MS_20 * 5));
    }
    assert!(wait_until(|| harness.sink.scheduled().len() == 3).await);
    conn
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test]
async fn test_connect_pushes_stored_session_config() {
    let mut server = MockRealtimeServer::start().await;
    let client = SessionProtocolClient::new(connection(&server.url));
    client
        .update_session(SessionConfig {
            instructions: Some("Answer briefly.".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(client.state(), ProtocolState::Disconnected);

    client.connect().await.unwrap();
    let mut conn = server.accept().await;
    let update = conn.expect("session.update").await;
    assert_eq!(update["session"]["instructions"], "Answer briefly.");
    assert_eq!(update["session"]["voice"], "alloy");
    assert_eq!(update["session"]["input_audio_format"], "pcm16");
    assert!(update["event_id"].as_str().unwrap().starts_with("evt_"));
    assert_eq!(client.state(), ProtocolState::SessionPending);

    conn.send(session_created("sess_1"));
    assert!(wait_until(|| client.state() == ProtocolState::ResponseIdle).await);
    assert_eq!(client.get_status().session_id.as_deref(), Some("sess_1"));

    client.disconnect();
    assert_eq!(client.state(), ProtocolState::Disconnected);
}

#[tokio::test]
async fn test_output_format_follows_playback_width() {
    let mut server = MockRealtimeServer::start().await;
    let mut config = EngineConfig::default();
    config.connection = connection(&server.url);
    config.playback.width = waav_duplex::PcmWidth::Pcm24;
    let harness = Harness::new(config);

    harness.coordinator.start().await.unwrap();
    let mut conn = server.accept().await;
    let update = conn.expect("session.update").await;
    assert_eq!(update["session"]["output_audio_format"], "pcm24");

    harness.coordinator.client().disconnect();
}

#[tokio::test]
async fn test_heartbeat_pings_idle_connection() {
    let mut server = MockRealtimeServer::start().await;
    let client = SessionProtocolClient::new(ConnectionConfig {
        heartbeat_interval_ms: 50,
        ..connection(&server.url)
    });

    client.connect().await.unwrap();
    let mut conn = server.accept().await;
    assert!(conn.saw_within("ping", Duration::from_secs(2)).await);

    client.disconnect();
}

// =============================================================================
// Playback
// =============================================================================

#[tokio::test]
async fn test_response_audio_is_scheduled_back_to_back() {
    let mut server = MockRealtimeServer::start().await;
    let mut harness = Harness::with_url(&server.url);
    let conn = start_response(&mut server, &harness).await;

    let scheduled = harness.sink.scheduled();
    assert_eq!(scheduled[0].samples.len(), MS_20 * 5);
    for pair in scheduled.windows(2) {
        let end = pair[0].start_time + pair[0].samples.len() as f64 / OUTPUT_RATE as f64;
        assert!((pair[1].start_time - end).abs() < 1e-9, "gap between chunks");
    }
    assert!(harness.is_playing());

    match harness
        .next_action(|a| matches!(a, SessionAction::ResponseStarted { .. }))
        .await
    {
        SessionAction::ResponseStarted { response_id } => assert_eq!(response_id, "resp_1"),
        other => panic!("Expected ResponseStarted, got {other:?}"),
    }

    conn.send(response_done("resp_1"));
    harness
        .next_action(|a| matches!(a, SessionAction::ResponseFinished { .. }))
        .await;

    let stats = harness.coordinator.stats();
    assert_eq!(stats.engine.chunks_received, 3);
    assert_eq!(stats.engine.chunks_scheduled, 3);
    assert_eq!(stats.engine.decode_errors, 0);

    harness.coordinator.client().disconnect();
}

#[tokio::test]
async fn test_assistant_transcript_is_delivered() {
    let mut server = MockRealtimeServer::start().await;
    let mut harness = Harness::with_url(&server.url);
    let conn = start_response(&mut server, &harness).await;

    conn.send(transcript_delta("resp_1", "Hello"));
    conn.send(transcript_delta("resp_1", " there"));
    conn.send(transcript_done("resp_1", "Hello there."));

    let mut last = None;
    while let Ok(Some(update)) =
        tokio::time::timeout(mock_server::WAIT, harness.transcripts.recv()).await
    {
        let done = update.is_final;
        last = Some(update);
        if done {
            break;
        }
    }
    let update = last.expect("Expected transcript updates");
    assert!(update.is_final);
    assert_eq!(update.role, TranscriptRole::Assistant);
    assert_eq!(update.text, "Hello there.");

    let entries = harness.coordinator.transcripts();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].text, "Hello there.");

    harness.coordinator.client().disconnect();
}

// =============================================================================
// Barge-in
// =============================================================================

#[tokio::test]
async fn test_server_vad_barge_in_cancels_and_flushes() {
    let mut server = MockRealtimeServer::start().await;
    let mut harness = Harness::with_url(&server.url);
    let mut conn = start_response(&mut server, &harness).await;
    assert!(harness.is_playing());

    conn.send(speech_started(1200));

    let cancel = conn.expect("response.cancel").await;
    assert_eq!(cancel["response_id"], "resp_1");

    match harness
        .next_action(|a| matches!(a, SessionAction::Interrupted { .. }))
        .await
    {
        SessionAction::Interrupted {
            response_id,
            source,
        } => {
            assert_eq!(response_id, "resp_1");
            assert_eq!(source, InterruptSource::ServerVad);
        }
        other => panic!("Expected Interrupted, got {other:?}"),
    }
    assert!(!harness.is_playing());
    assert_eq!(harness.sink.stopped().len(), 3);
    assert_eq!(harness.sink.pending(), 0);

    // Audio still in flight for the cancelled response is dropped
    conn.send(audio_delta("resp_1", MS_20));
    let client = harness.coordinator.client().clone();
    assert!(wait_until(|| client.get_status().dropped_deltas == 1).await);
    assert_eq!(harness.sink.scheduled().len(), 3);
    assert_eq!(client.state(), ProtocolState::ResponseIdle);

    let stats = harness.coordinator.stats();
    assert_eq!(stats.engine.barge_ins, 1);
    assert_eq!(stats.playback.stopped_sources, 3);

    client.disconnect();
}

#[tokio::test]
async fn test_speech_without_active_response_sends_no_cancel() {
    let mut server = MockRealtimeServer::start().await;
    let harness = Harness::with_url(&server.url);
    harness.coordinator.start().await.unwrap();
    let mut conn = server.accept().await;
    conn.expect("session.update").await;
    conn.send(session_created("sess_1"));
    conn.send(speech_started(300));

    assert!(!conn.saw_within("response.cancel", Duration::from_millis(300)).await);
    assert_eq!(harness.coordinator.stats().engine.barge_ins, 0);

    harness.coordinator.client().disconnect();
}

#[tokio::test]
async fn test_local_speech_interrupts_playback() {
    let mut server = MockRealtimeServer::start().await;
    let mut config = EngineConfig::default();
    config.connection = connection(&server.url);
    config.capture.local_barge_in = true;
    config.capture.barge_in_threshold = 0.1;
    let mut harness = Harness::new(config);
    let mut conn = start_response(&mut server, &harness).await;

    let quiet = AudioFrame {
        seq: 0,
        data: Bytes::from(vec![0u8; 640]),
        rms: 0.01,
    };
    harness.coordinator.submit_frame(quiet);
    conn.expect("input_audio_buffer.append").await;
    assert!(harness.is_playing());

    let loud = AudioFrame {
        seq: 1,
        data: Bytes::from(codec_tone_16k()),
        rms: 0.35,
    };
    harness.coordinator.submit_frame(loud);

    let cancel = conn.expect("response.cancel").await;
    assert_eq!(cancel["response_id"], "resp_1");
    conn.expect("input_audio_buffer.append").await;

    match harness
        .next_action(|a| matches!(a, SessionAction::Interrupted { .. }))
        .await
    {
        SessionAction::Interrupted { source, .. } => assert_eq!(source, InterruptSource::LocalVad),
        other => panic!("Expected Interrupted, got {other:?}"),
    }
    assert!(!harness.is_playing());
    assert_eq!(harness.coordinator.stats().engine.frames_sent, 2);

    harness.coordinator.client().disconnect();
}

fn codec_tone_16k() -> Vec<u8> {
    waav_duplex::core::codec::encode(
        &sine(320, 300.0, 0.5, 16000),
        waav_duplex::PcmWidth::Pcm16,
    )
}

#[tokio::test]
async fn test_superseded_response_is_silenced() {
    let mut server = MockRealtimeServer::start().await;
    let harness = Harness::with_url(&server.url);
    let conn = start_response(&mut server, &harness).await;

    conn.send(response_created("resp_2"));
    conn.send(audio_delta("resp_1", MS_20));
    conn.send(audio_delta("resp_2", MS_20 * 5));

    assert!(wait_until(|| harness.sink.scheduled().len() == 4).await);
    assert_eq!(harness.sink.stopped().len(), 3);
    assert_eq!(harness.sink.pending(), 1);

    let client = harness.coordinator.client().clone();
    let status = client.get_status();
    assert_eq!(status.response_id.as_deref(), Some("resp_2"));
    assert_eq!(status.dropped_deltas, 1);
    assert_eq!(harness.coordinator.stats().engine.protocol_errors, 1);

    client.disconnect();
}

#[tokio::test]
async fn test_undecodable_chunk_is_skipped() {
    let mut server = MockRealtimeServer::start().await;
    let harness = Harness::with_url(&server.url);
    let conn = start_response(&mut server, &harness).await;

    conn.send(serde_json::json!({
        "type": "response.audio.delta",
        "response_id": "resp_1",
        "delta": "AAAA"
    }));
    conn.send(audio_delta("resp_1", MS_20));

    assert!(wait_until(|| harness.sink.scheduled().len() == 4).await);
    let stats = harness.coordinator.stats();
    assert_eq!(stats.engine.decode_errors, 1);
    assert_eq!(stats.engine.chunks_received, 5);

    harness.coordinator.client().disconnect();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_finish_waits_for_server_close() {
    let mut server = MockRealtimeServer::start().await;
    let harness = Harness::with_url(&server.url);
    let conn = start_response(&mut server, &harness).await;

    let server_side = tokio::spawn(async move {
        let mut conn = conn;
        conn.expect("session.finish").await;
        conn.close();
        conn
    });

    harness.coordinator.finish().await.unwrap();
    let _conn = server_side.await.unwrap();

    assert_eq!(harness.coordinator.client().state(), ProtocolState::Disconnected);
    assert!(!harness.is_playing());
}

#[tokio::test]
async fn test_reconnect_resends_session_config() {
    let mut server = MockRealtimeServer::start().await;
    let mut config = EngineConfig::default();
    config.connection = ConnectionConfig {
        reconnection: ReconnectionConfig {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 20,
        },
        ..connection(&server.url)
    };
    let mut harness = Harness::new(config);
    let conn = start_response(&mut server, &harness).await;

    conn.kill();

    match harness
        .next_action(|a| matches!(a, SessionAction::Reconnecting { .. }))
        .await
    {
        SessionAction::Reconnecting { attempt } => assert_eq!(attempt, 1),
        other => panic!("Expected Reconnecting, got {other:?}"),
    }

    let mut conn = server.accept().await;
    conn.expect("session.update").await;
    let coordinator = harness.coordinator.clone();
    assert!(wait_until(|| coordinator.stats().engine.reconnects == 1).await);

    // The old response does not survive the reconnect
    conn.send(session_created("sess_2"));
    let client = coordinator.client().clone();
    assert!(wait_until(|| client.state() == ProtocolState::ResponseIdle).await);
    assert_eq!(client.get_status().response_id, None);
    assert_eq!(client.get_status().reconnect_attempts, 0);

    client.disconnect();
}
