//! Session lifecycle scenarios
//!
//! Drives the session core the way two clients would: join, negotiate
//! through the relay, chat, disconnect, record and time out.

use std::sync::Arc;
use std::time::Duration;
use telehealth_consult::config::ConsultConfig;
use telehealth_consult::media::{
    MediaConstraints, MediaEndpoint, PeerTransport, SessionDescription, TransportState,
    TransportStats, VirtualDevices, VirtualTransport,
};
use telehealth_consult::quality::ConnectionQuality;
use telehealth_consult::session::{
    EndReason, ParticipantRole, Session, SessionManager, SessionStatus, SessionType,
};
use telehealth_consult::signaling::{
    Delivery, MessageKind, MpscChannel, OutboundFrame, OutboundSignal, SignalingMessage,
};
use telehealth_consult::store::MemoryStore;
use telehealth_consult::Error;
use tokio::sync::mpsc;

// =============================================================================
// Test Setup Helpers
// =============================================================================

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,telehealth_consult=debug")
        .try_init();
}

struct Fixture {
    manager: SessionManager,
    _dir: tempfile::TempDir,
}

fn fixture(config: ConsultConfig) -> Fixture {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = config.with_recording_dir(dir.path());
    Fixture {
        manager: SessionManager::new(&config, Arc::new(MemoryStore::new())),
        _dir: dir,
    }
}

async fn joined_session(manager: &SessionManager) -> Session {
    let session = manager
        .create_session("patientA", "providerB", SessionType::Video, None, None)
        .await
        .unwrap();
    manager
        .join(&session.id, "patientA", ParticipantRole::Patient)
        .await
        .unwrap();
    manager
        .join(&session.id, "providerB", ParticipantRole::Provider)
        .await
        .unwrap();
    session
}

async fn connect(
    manager: &SessionManager,
    session_id: &str,
    participant_id: &str,
) -> mpsc::Receiver<OutboundFrame> {
    let (channel, rx) = MpscChannel::new(64);
    manager
        .register_channel(session_id, participant_id, channel, None)
        .await
        .unwrap();
    rx
}

/// Wait for the next relayed message (`session.signal` or `chat.message`)
async fn next_message(rx: &mut mpsc::Receiver<OutboundFrame>) -> SignalingMessage {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match rx.recv().await {
                Some(OutboundFrame::Text(frame)) => {
                    let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
                    if json["method"] == "session.state" {
                        continue;
                    }
                    return serde_json::from_value(json["params"]["message"].clone()).unwrap();
                }
                other => panic!("channel ended: {:?}", other),
            }
        }
    })
    .await
    .expect("no relayed message within 2s")
}

fn endpoint() -> (Arc<MediaEndpoint>, Arc<VirtualTransport>) {
    let transport = Arc::new(VirtualTransport::new());
    let endpoint = MediaEndpoint::new(Arc::new(VirtualDevices::new()), transport.clone());
    (endpoint, transport)
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_two_joins_activate_session() {
    let f = fixture(ConsultConfig::default());
    let session = f
        .manager
        .create_session("patientA", "providerB", SessionType::Video, None, None)
        .await
        .unwrap();

    let first = f
        .manager
        .join(&session.id, "patientA", ParticipantRole::Patient)
        .await
        .unwrap();
    assert_eq!(first.session.status, SessionStatus::Waiting);

    let second = f
        .manager
        .join(&session.id, "providerB", ParticipantRole::Provider)
        .await
        .unwrap();
    assert_eq!(second.session.status, SessionStatus::Active);

    // repeating a join never moves the status further
    let repeat = f
        .manager
        .join(&session.id, "providerB", ParticipantRole::Provider)
        .await
        .unwrap();
    assert_eq!(repeat.session.status, SessionStatus::Active);
    assert!(repeat.rejoined);
}

#[tokio::test]
async fn test_chat_arrives_in_send_order() {
    let f = fixture(ConsultConfig::default());
    let session = joined_session(&f.manager).await;
    let _a_rx = connect(&f.manager, &session.id, "patientA").await;
    let mut b_rx = connect(&f.manager, &session.id, "providerB").await;

    f.manager
        .send_chat(&session.id, "patientA", "hello", true)
        .await
        .unwrap();
    f.manager
        .send_chat(&session.id, "providerB", "hi", true)
        .await
        .unwrap();

    let first = next_message(&mut b_rx).await;
    let second = next_message(&mut b_rx).await;
    assert_eq!(first.chat_text(), Some("hello"));
    assert_eq!(second.chat_text(), Some("hi"));
    assert!(first.id < second.id);
}

#[tokio::test]
async fn test_offer_answer_through_relay() {
    let f = fixture(ConsultConfig::default());
    let session = joined_session(&f.manager).await;
    let mut a_rx = connect(&f.manager, &session.id, "patientA").await;
    let mut b_rx = connect(&f.manager, &session.id, "providerB").await;

    let (patient, patient_transport) = endpoint();
    let (provider, _) = endpoint();
    patient
        .start_local_capture(&MediaConstraints::audio_video())
        .await
        .unwrap();
    provider
        .start_local_capture(&MediaConstraints::audio_video())
        .await
        .unwrap();

    let offer = patient.create_offer().await.unwrap();
    f.manager
        .relay(
            &session.id,
            "patientA",
            OutboundSignal::new(MessageKind::Offer, serde_json::to_value(&offer).unwrap()),
        )
        .await
        .unwrap();

    let received = next_message(&mut b_rx).await;
    assert_eq!(received.kind, MessageKind::Offer);
    let remote_offer: SessionDescription = serde_json::from_value(received.payload).unwrap();
    provider.apply_remote_description(remote_offer).await.unwrap();
    let answer = provider.create_answer().await.unwrap();

    f.manager
        .relay(
            &session.id,
            "providerB",
            OutboundSignal::new(MessageKind::Answer, serde_json::to_value(&answer).unwrap()),
        )
        .await
        .unwrap();

    let received = next_message(&mut a_rx).await;
    assert_eq!(received.kind, MessageKind::Answer);
    let remote_answer: SessionDescription = serde_json::from_value(received.payload).unwrap();
    patient.apply_remote_description(remote_answer).await.unwrap();

    assert_eq!(patient_transport.state(), TransportState::Connected);
    assert!(f.manager.get(&session.id).await.unwrap().negotiated);
}

#[tokio::test]
async fn test_ice_to_disconnected_peer_is_not_an_error() {
    let f = fixture(ConsultConfig::default());
    let session = joined_session(&f.manager).await;
    let _a_rx = connect(&f.manager, &session.id, "patientA").await;
    let b_rx = connect(&f.manager, &session.id, "providerB").await;

    f.manager.leave(&session.id, "providerB").await.unwrap();
    drop(b_rx);

    let outcome = f
        .manager
        .relay(
            &session.id,
            "patientA",
            OutboundSignal::new(
                MessageKind::IceCandidate,
                serde_json::json!({ "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host" }),
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome.delivery, Delivery::Disconnected);
    assert_eq!(
        f.manager.get(&session.id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn test_idle_timeout_finalizes_recording() {
    let mut config = ConsultConfig::default();
    config.session.idle_timeout_ms = 150;
    let f = fixture(config);
    let session = joined_session(&f.manager).await;
    let mut updates = f.manager.subscribe(&session.id).unwrap();

    let (patient, _) = endpoint();
    let stream = patient
        .start_local_capture(&MediaConstraints::audio_video())
        .await
        .unwrap();
    let recording = f
        .manager
        .start_recording(&session.id, "patientA", stream.clone())
        .await
        .unwrap();
    assert!(!recording.is_finalized());
    stream.publish(telehealth_consult::media::MediaChunk::new(
        vec![0u8; 32],
        Duration::from_millis(20),
    ));

    let ended = tokio::time::timeout(
        Duration::from_secs(2),
        updates.wait_for(|s| s.status.is_terminal()),
    )
    .await
    .expect("session did not time out")
    .unwrap()
    .clone();
    assert_eq!(ended.status, SessionStatus::Ended);
    assert_eq!(ended.end_reason, Some(EndReason::IdleTimeout));

    let recordings = f.manager.list_recordings(&session.id).await.unwrap();
    assert_eq!(recordings.len(), 1);
    assert!(recordings[0].is_finalized());
    assert!(recordings[0].duration_seconds >= 0.0);

    // stopping after the forced finalize returns the same record
    let stopped = f.manager.stop_recording(&recording.id).await.unwrap();
    assert_eq!(stopped.finalized_at, recordings[0].finalized_at);
}

#[tokio::test]
async fn test_traffic_keeps_session_alive() {
    let mut config = ConsultConfig::default();
    config.session.idle_timeout_ms = 200;
    let f = fixture(config);
    let session = joined_session(&f.manager).await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        f.manager
            .send_chat(&session.id, "patientA", "still here", false)
            .await
            .unwrap();
    }
    assert_eq!(
        f.manager.get(&session.id).await.unwrap().status,
        SessionStatus::Active
    );
}

#[tokio::test]
async fn test_stop_unknown_recording() {
    let f = fixture(ConsultConfig::default());
    let result = f.manager.stop_recording("never-started").await;
    assert!(matches!(result, Err(Error::NoActiveStream(_))));
}

#[tokio::test]
async fn test_recording_requires_active_session() {
    let f = fixture(ConsultConfig::default());
    let session = f
        .manager
        .create_session("patientA", "providerB", SessionType::Video, None, None)
        .await
        .unwrap();
    f.manager
        .join(&session.id, "patientA", ParticipantRole::Patient)
        .await
        .unwrap();

    let (patient, _) = endpoint();
    let stream = patient
        .start_local_capture(&MediaConstraints::audio_only())
        .await
        .unwrap();
    let result = f
        .manager
        .start_recording(&session.id, "patientA", stream)
        .await;
    assert!(matches!(result, Err(Error::SessionNotActive(_))));
}

#[tokio::test]
async fn test_quality_monitor_reports_until_session_end() {
    let f = fixture(ConsultConfig::default());
    let session = joined_session(&f.manager).await;
    let mut updates = f.manager.subscribe(&session.id).unwrap();

    let transport = Arc::new(VirtualTransport::new());
    transport.set_state(TransportState::Connected);
    transport.set_stats(TransportStats {
        packets_sent: 1000,
        packets_lost: 100,
        ..Default::default()
    });

    let monitor = f
        .manager
        .monitor_quality(&session.id, transport.clone(), Some(Duration::from_millis(20)))
        .unwrap();

    let degraded = tokio::time::timeout(
        Duration::from_secs(2),
        updates.wait_for(|s| s.connection_quality_last.is_some()),
    )
    .await
    .expect("no quality sample")
    .unwrap()
    .clone();
    assert_eq!(degraded.connection_quality_last, Some(ConnectionQuality::Poor));

    f.manager
        .end(&session.id, EndReason::EndedByParticipant, None)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !monitor.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("monitor kept sampling an ended session");

    // stopping an already stopped monitor is harmless
    f.manager.stop_monitoring(&monitor).await;
    f.manager.stop_monitoring(&monitor).await;
}

#[tokio::test]
async fn test_transport_failure_downgrades_to_poor() {
    let f = fixture(ConsultConfig::default());
    let session = joined_session(&f.manager).await;
    let mut updates = f.manager.subscribe(&session.id).unwrap();

    let transport = Arc::new(VirtualTransport::new());
    transport.set_state(TransportState::Failed);
    let monitor = f
        .manager
        .monitor_quality(&session.id, transport, Some(Duration::from_millis(20)))
        .unwrap();

    let current = tokio::time::timeout(
        Duration::from_secs(2),
        updates.wait_for(|s| s.connection_quality_last == Some(ConnectionQuality::Poor)),
    )
    .await
    .expect("transport loss not reported")
    .unwrap()
    .clone();
    assert_eq!(current.status, SessionStatus::Active);
    f.manager.stop_monitoring(&monitor).await;
}
