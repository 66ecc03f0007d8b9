//! End-to-end receiver tests over real sockets

use audiovault_core::config::Config;
use audiovault_core::events::EventBus;
use audiovault_core::metrics::MetricsRegistry;
use audiovault_core::storage::StorageManager;
use audiovault_server::pipeline::AudioPipeline;
use audiovault_server::server::ReceiverServer;
use serde_json::json;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Harness {
    server: ReceiverServer,
    storage: Arc<StorageManager>,
    registry: MetricsRegistry,
    events: Arc<EventBus>,
}

fn start_receiver(data_dir: &Path, max_connections: usize) -> Harness {
    let mut config = Config::default();
    config.receiver.host = "127.0.0.1".to_string();
    config.receiver.port = 0; // ephemeral
    config.receiver.max_connections = max_connections;
    config.storage.data_dir = data_dir.to_path_buf();
    start_receiver_with(config)
}

fn start_receiver_with(config: Config) -> Harness {
    let registry = MetricsRegistry::new();
    let events = Arc::new(EventBus::new(2));
    let storage = Arc::new(StorageManager::new(&config));
    let pipeline = Arc::new(AudioPipeline::new(
        &config,
        Arc::clone(&storage),
        registry.clone(),
        Arc::clone(&events),
    ));

    let mut server = ReceiverServer::new(config, pipeline);
    server.start().expect("server start");
    Harness {
        server,
        storage,
        registry,
        events,
    }
}

fn connect(harness: &Harness) -> TcpStream {
    let addr = harness.server.local_addr().expect("bound address");
    TcpStream::connect(addr).expect("client connect")
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 5s");
        std::thread::sleep(Duration::from_millis(20));
    }
}

fn pcm16_tone(samples: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples * 2);
    for i in 0..samples {
        let value = ((i as f64 * 0.2).sin() * 8000.0) as i16;
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

fn pcm24_tone(samples: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples * 3);
    for i in 0..samples {
        let value = ((i as f64 * 0.2).sin() * 2_000_000.0) as i32;
        data.extend_from_slice(&value.to_le_bytes()[..3]);
    }
    data
}

#[test]
fn streams_audio_into_a_wav_segment() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let payload = pcm16_tone(1600);
    {
        let mut client = connect(&harness);
        client.write_all(&payload).unwrap();
        client.flush().unwrap();
        wait_until(|| harness.registry.counter("bytes_received") >= payload.len() as f64);
    }
    // Client dropped: disconnect finalizes the segment
    wait_until(|| harness.server.stats().active_connections == 0);
    wait_until(|| !harness.storage.list_segments(None).unwrap().is_empty());

    // Filtering preserves sample count, so the file holds exactly the
    // payload's worth of PCM after the 44-byte header
    let segments = harness.storage.list_segments(None).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].size_bytes, 44 + payload.len() as u64);

    let bytes = std::fs::read(&segments[0].path).unwrap();
    assert_eq!(&bytes[0..4], b"RIFF");
    assert_eq!(
        u32::from_le_bytes(bytes[40..44].try_into().unwrap()) as usize,
        payload.len()
    );

    harness.server.stop();
}

#[test]
fn streams_24_bit_audio_with_matching_frames_and_header() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.receiver.host = "127.0.0.1".to_string();
    config.receiver.port = 0;
    config.receiver.max_connections = 10;
    config.receiver.bits_per_sample = 24;
    config.storage.data_dir = dir.path().to_path_buf();
    let mut harness = start_receiver_with(config);

    let payload = pcm24_tone(1500);
    {
        let mut client = connect(&harness);
        client.write_all(&payload).unwrap();
        client.flush().unwrap();
        wait_until(|| harness.registry.counter("bytes_received") >= payload.len() as f64);
    }
    wait_until(|| harness.server.stats().active_connections == 0);
    wait_until(|| !harness.storage.list_segments(None).unwrap().is_empty());

    // Every 3-byte frame decodes and re-encodes, so nothing was dropped
    assert_eq!(harness.registry.counter("dropped_packets"), 0.0);

    let segments = harness.storage.list_segments(None).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].size_bytes, 44 + payload.len() as u64);

    let bytes = std::fs::read(&segments[0].path).unwrap();
    // Block align 3, 24 bits per sample
    assert_eq!(u16::from_le_bytes(bytes[32..34].try_into().unwrap()), 3);
    assert_eq!(u16::from_le_bytes(bytes[34..36].try_into().unwrap()), 24);

    harness.server.stop();
}

#[test]
fn refuses_connections_past_the_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 1);

    let _first = connect(&harness);
    wait_until(|| harness.server.stats().active_connections == 1);

    let mut second = connect(&harness);
    wait_until(|| harness.server.stats().refused_connections == 1);

    // The refused socket was closed without a handshake
    second
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(second.read(&mut buf).unwrap_or(0), 0);

    let stats = harness.server.stats();
    assert_eq!(stats.active_connections, 1);

    harness.server.stop();
}

#[test]
fn broadcasts_command_envelopes() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let client = connect(&harness);
    wait_until(|| harness.server.stats().active_connections == 1);

    let sent = harness
        .server
        .broadcast_command("set_gain", json!({"gain_db": -6}));
    assert_eq!(sent, 1);

    let mut reader = BufReader::new(client);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();

    let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope["command"], "set_gain");
    assert_eq!(envelope["data"]["gain_db"], -6);
    assert!(envelope["timestamp"].is_string());

    harness.server.stop();
}

#[test]
fn sends_a_command_to_one_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let client = connect(&harness);
    wait_until(|| harness.server.stats().active_connections == 1);

    let device_id = harness.server.stats().devices[0].device_id.clone();
    assert!(harness
        .server
        .send_command(&device_id, "mute", json!({"enabled": true})));
    assert!(!harness.server.send_command("no-such-device", "mute", json!({})));

    let mut reader = BufReader::new(client);
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(envelope["command"], "mute");
    assert_eq!(envelope["data"]["enabled"], true);

    harness.server.stop();
}

#[test]
fn counts_accepted_connections_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    {
        let _client = connect(&harness);
        wait_until(|| harness.server.stats().active_connections == 1);
    }
    wait_until(|| harness.server.stats().active_connections == 0);
    {
        let _client = connect(&harness);
        wait_until(|| harness.server.stats().active_connections == 1);
    }
    wait_until(|| harness.server.stats().active_connections == 0);

    let stats = harness.server.stats();
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.refused_connections, 0);

    harness.server.stop();
}

#[test]
fn publishes_device_lifecycle_events() {
    use std::sync::Mutex;

    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    harness.events.subscribe("device.", move |event| {
        sink.lock().unwrap().push(event.topic.clone());
        Ok(())
    });

    {
        let mut client = connect(&harness);
        client.write_all(&pcm16_tone(800)).unwrap();
        wait_until(|| harness.registry.counter("bytes_received") > 0.0);
    }
    wait_until(|| harness.server.stats().active_connections == 0);

    wait_until(|| {
        let topics = seen.lock().unwrap();
        topics.iter().any(|t| t == "device.connected")
            && topics.iter().any(|t| t == "device.streaming_started")
            && topics.iter().any(|t| t == "device.disconnected")
    });

    harness.server.stop();
}

#[test]
fn disconnect_device_removes_it_from_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let mut client = connect(&harness);
    client.write_all(&pcm16_tone(800)).unwrap();
    wait_until(|| harness.server.stats().active_connections == 1);
    wait_until(|| harness.registry.counter("bytes_received") > 0.0);

    let device_id = harness.server.stats().devices[0].device_id.clone();
    assert!(harness.server.disconnect_device(&device_id));
    wait_until(|| harness.server.stats().active_connections == 0);
    assert!(!harness.server.disconnect_device(&device_id));

    // The forced disconnect finalized the device's segment
    wait_until(|| !harness.storage.list_segments(None).unwrap().is_empty());

    harness.server.stop();
}

#[test]
fn stop_finalizes_open_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = start_receiver(dir.path(), 10);

    let mut client = connect(&harness);
    let payload = pcm16_tone(1600);
    client.write_all(&payload).unwrap();
    wait_until(|| harness.registry.counter("bytes_received") >= payload.len() as f64);

    harness.server.stop();

    let segments = harness.storage.list_segments(None).unwrap();
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].size_bytes, 44 + payload.len() as u64);
}
