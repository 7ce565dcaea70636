//! End-to-end session tests
//!
//! Drive a `VoiceClient` with scripted audio devices against an in-process
//! voice service.

mod common;

use common::{states, test_config, wait_until, MockBackend, MockService};
use voicelink::codec::decode_inbound;
use voicelink::{ConnectionState, Role, SessionUpdate, VoiceClient, VoiceState};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_activation_reaches_listening() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();
    let updates = client.updates();

    let (activated, _conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    assert_eq!(client.state(), VoiceState::Listening);
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(client.session().unwrap().session_id, "s-1");
    assert_eq!(
        states(&updates),
        vec![VoiceState::Connecting, VoiceState::Listening],
        "Activation should pass through Connecting to Listening"
    );
    assert!(backend.mic_open(), "Microphone should be held while active");

    client.deactivate();
    assert_eq!(client.state(), VoiceState::Inactive);
    assert!(!backend.mic_open(), "Microphone should be released on deactivate");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capture_streams_fixed_blocks() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    // 1000 samples at a 480 block size: two blocks, 40 samples held back
    assert!(backend.speak(vec![0.5; 600]));
    assert!(backend.speak(vec![0.5; 400]));

    for _ in 0..2 {
        let event = conn.expect("audio").await;
        let samples = decode_inbound(event["data"].as_str().unwrap()).unwrap();
        assert_eq!(samples.len(), 480);
        assert!(samples.iter().all(|s| (s - 0.5).abs() < 1e-3));
    }
    assert!(wait_until(|| client.capture_stats().map_or(0, |s| s.blocks_sent()) == 2).await);

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_turn_with_playback_drain() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();
    let updates = client.updates();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    conn.send(r#"{"type":"wake_detected"}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Recording).await);

    conn.send(r#"{"type":"user_transcript","text":"what time is it"}"#).await;
    conn.send(r#"{"type":"user_stopped"}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Processing).await);

    conn.send_audio(&vec![0.2; 2400]).await;
    conn.send_audio(&vec![0.3; 2400]).await;
    conn.send(r#"{"type":"transcript","text":"It is noon."}"#).await;
    conn.send(r#"{"type":"response_complete"}"#).await;

    assert!(wait_until(|| client.playback_queue_len() == 2).await);
    assert_eq!(
        client.state(),
        VoiceState::Speaking,
        "Turn should not end while audio is still queued"
    );

    // The speaker pulls both segments in one buffer
    assert_eq!(backend.render(6000), 4800);
    assert!(wait_until(|| client.state() == VoiceState::Listening).await);

    let updates: Vec<SessionUpdate> = updates.try_iter().collect();
    let transcripts: Vec<(Role, String)> = updates
        .iter()
        .filter_map(|u| match u {
            SessionUpdate::Transcript(t) => Some((t.role, t.text.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(
        transcripts,
        vec![
            (Role::User, "what time is it".to_string()),
            (Role::Assistant, "It is noon.".to_string()),
        ]
    );

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_barge_in_clears_playback() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    conn.send(r#"{"type":"wake_detected"}"#).await;
    conn.send(r#"{"type":"user_stopped"}"#).await;
    for _ in 0..3 {
        conn.send_audio(&vec![0.1; 2400]).await;
    }
    assert!(wait_until(|| client.playback_queue_len() == 3).await);
    assert_eq!(client.state(), VoiceState::Speaking);

    conn.send(r#"{"type":"user_speaking"}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Recording).await);
    assert_eq!(client.playback_queue_len(), 0, "Barge-in should empty the queue");

    conn.expect("interrupt").await;

    // Audio still in flight from the interrupted response is not played
    conn.send_audio(&vec![0.1; 2400]).await;
    conn.send(r#"{"type":"user_stopped"}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Processing).await);
    assert_eq!(client.playback_queue_len(), 0);

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_corrupted_audio_is_dropped() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    conn.send(r#"{"type":"wake_detected"}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Recording).await);

    conn.send(r#"{"type":"user_stopped"}"#).await;
    conn.send(r#"{"type":"audio","data":"%%% not base64 %%%"}"#).await;
    conn.send(r#"{"type":"audio","data":"AAAA"}"#).await;
    conn.send(r#"{"type":"response_complete"}"#).await;

    assert!(wait_until(|| client.state() == VoiceState::Listening).await);
    assert_eq!(client.playback_queue_len(), 0);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    // Later segments are unaffected
    conn.send(r#"{"type":"wake_detected"}"#).await;
    conn.send(r#"{"type":"user_stopped"}"#).await;
    conn.send_audio(&vec![0.1; 1200]).await;
    assert!(wait_until(|| client.playback_queue_len() == 1).await);

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_and_unknown_messages_keep_connection() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();

    conn.send("{ this is not json").await;
    conn.send(r#"{"type":"tool_result","ok":true}"#).await;
    conn.send(r#"{"type":"wake_detected"}"#).await;

    assert!(wait_until(|| client.state() == VoiceState::Recording).await);
    assert_eq!(client.connection_state(), ConnectionState::Connected);

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_errors() {
    let service = MockService::start().await;
    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&service.url), backend.clone()).unwrap();
    let updates = client.updates();

    let (activated, mut conn) = tokio::join!(client.activate(), service.accept_ready("s-1"));
    activated.unwrap();
    let _ = states(&updates);

    conn.send(r#"{"type":"error","message":"Rate limited"}"#).await;
    let soft = updates.recv_timeout(std::time::Duration::from_secs(3)).unwrap();
    match soft {
        SessionUpdate::Status(status) => {
            assert_eq!(status.state, VoiceState::Listening);
            assert_eq!(status.text, "Rate limited");
        }
        other => panic!("unexpected update {:?}", other),
    }

    conn.send(r#"{"type":"error","message":"Session expired","fatal":true}"#).await;
    assert!(wait_until(|| client.state() == VoiceState::Error).await);
    assert!(!backend.mic_open(), "Fatal errors release the microphone");
    assert_eq!(
        client.connection_state(),
        ConnectionState::Connected,
        "The service decides when to hang up"
    );

    // Still connected: the client keeps reading until the service closes
    conn.send(r#"{"type":"wake_detected"}"#).await;
    conn.close().await;
    assert!(wait_until(|| client.connection_state() == ConnectionState::Disconnected).await);
    assert_eq!(client.state(), VoiceState::Error);

    // No reconnection after a fatal error
    assert!(!service.connection_attempted(std::time::Duration::from_millis(400)).await);

    // Reactivation is the way out
    let (activated, _conn) = tokio::join!(client.activate(), service.accept_ready("s-2"));
    activated.unwrap();
    assert_eq!(client.state(), VoiceState::Listening);
    assert_eq!(client.session().unwrap().session_id, "s-2");

    client.deactivate();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_service_enters_error() {
    let service = MockService::start().await;
    let url = service.url.clone();
    drop(service);

    let backend = MockBackend::new();
    let client = VoiceClient::new(test_config(&url), backend.clone()).unwrap();

    assert!(client.activate().await.is_err());
    assert_eq!(client.state(), VoiceState::Error);
    assert!(!backend.mic_open());
}
