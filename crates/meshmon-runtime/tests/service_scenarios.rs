//! End-to-end service scenarios over an in-memory device link
//!
//! The test plays the device: it accepts each link the connector opens,
//! reads the host's requests and writes framed envelopes back.

use std::sync::Arc;
use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use meshmon_core::protocol::schema::{to_radio, FromRadio, ToRadio};
use meshmon_core::protocol::StreamFramer;
use meshmon_core::registry::NewChannelKey;
use meshmon_core::reprocess::{CursorStore, MemoryCursorStore};
use meshmon_core::testing::{
    config_complete_envelope, encode_envelope, my_info_envelope, test_key, ManualTimeSource, PacketBuilder,
};
use meshmon_core::transport::ConnectionState;
use meshmon_core::{
    LogId, MeshEvent, MeshmonConfig, MeshmonError, NodeNum, PacketLog, PacketPipeline, QualityEventKind,
    SharedState, Timestamp, TransportError,
};
use meshmon_runtime::{virtual_link, MeshService, ReprocessTrigger, VirtualRadio};

const LONG_TEXT: &str = "weather station on the east hill reporting in";

// ----------------------------------------------------------------------------
// Device side
// ----------------------------------------------------------------------------

struct Device {
    stream: DuplexStream,
    framer: StreamFramer,
}

impl Device {
    async fn accept(radio: &mut VirtualRadio) -> Self {
        let stream = tokio::time::timeout(Duration::from_secs(30), radio.accept())
            .await
            .expect("connector opened a link")
            .expect("opener still alive");
        Self {
            stream,
            framer: StreamFramer::new(),
        }
    }

    /// Next message from the host, skipping heartbeats
    async fn next_request(&mut self) -> ToRadio {
        loop {
            while let Some(frame) = self.framer.next_frame() {
                let message = ToRadio::decode(frame.expect("host frames are well formed").as_slice())
                    .expect("host sends valid ToRadio");
                if !matches!(message.payload_variant, Some(to_radio::PayloadVariant::Heartbeat(_))) {
                    return message;
                }
            }
            let mut buf = [0u8; 256];
            let n = self.stream.read(&mut buf).await.expect("link readable");
            assert!(n > 0, "host closed the link");
            self.framer.push(&buf[..n]);
        }
    }

    async fn send(&mut self, envelope: &FromRadio) {
        self.stream.write_all(&encode_envelope(envelope)).await.unwrap();
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn config() -> MeshmonConfig {
    let mut config = MeshmonConfig::testing();
    config.security.enabled = false;
    config
}

async fn start(config: MeshmonConfig) -> (MeshService, VirtualRadio) {
    let (opener, radio) = virtual_link(4096);
    let service = MeshService::builder(config)
        .with_link_opener(std::sync::Arc::new(opener))
        .build_and_start()
        .await
        .unwrap();
    (service, radio)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<MeshEvent>, predicate: F) -> MeshEvent
where
    F: Fn(&MeshEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("expected event was published")
}

async fn connected(events: &mut broadcast::Receiver<MeshEvent>) {
    wait_for(events, |e| matches!(e, MeshEvent::Connection(s) if s.state.is_connected())).await;
}

// ----------------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_session_requests_config_then_publishes_packets() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();
    let mut device = Device::accept(&mut radio).await;

    let Some(to_radio::PayloadVariant::WantConfigId(config_id)) = device.next_request().await.payload_variant
    else {
        panic!("first request must ask for the configuration");
    };
    connected(&mut events).await;

    device.send(&my_info_envelope(0x100)).await;
    device.send(&config_complete_envelope(config_id)).await;
    // Console noise between frames
    device.send_raw(b"INFO | booting radio\r\n").await;
    device
        .send_raw(&PacketBuilder::text(0x200, "hello from the ridge").id(7).frame())
        .await;

    wait_for(&mut events, |e| matches!(e, MeshEvent::LocalNodeIdentified { node } if *node == NodeNum::new(0x100))).await;
    wait_for(&mut events, |e| matches!(e, MeshEvent::ConfigComplete { config_id: id } if *id == config_id)).await;
    wait_for(&mut events, |e| matches!(e, MeshEvent::Message { packet, .. } if packet.from == NodeNum::new(0x200))).await;

    assert_eq!(service.local_node(), Some(NodeNum::new(0x100)));
    assert!(service.node(NodeNum::new(0x200)).is_some());
    assert!(service.status().frames_received >= 3);
    assert_eq!(service.pipeline_stats().packets, 1);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_device_drops_link() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();

    let device = Device::accept(&mut radio).await;
    connected(&mut events).await;
    drop(device);

    wait_for(&mut events, |e| {
        matches!(e, MeshEvent::Connection(s) if matches!(s.state, ConnectionState::Reconnecting { .. }))
    })
    .await;
    let mut device = Device::accept(&mut radio).await;
    assert!(matches!(
        device.next_request().await.payload_variant,
        Some(to_radio::PayloadVariant::WantConfigId(_))
    ));
    connected(&mut events).await;

    let trail: Vec<String> = service.audit_trail().into_iter().map(|a| a.event).collect();
    assert!(trail.iter().any(|e| e == "ConnectionLost"));
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_max_attempts() {
    let (opener, radio) = virtual_link(4096);
    radio.set_online(false);
    let mut service = MeshService::builder(config())
        .with_link_opener(std::sync::Arc::new(opener))
        .build_and_start()
        .await
        .unwrap();
    let mut status = service.status_watch();

    tokio::time::timeout(Duration::from_secs(60), async {
        while !status.borrow_and_update().state.is_terminal() {
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .expect("connector gave up");

    assert!(service.status().state.is_terminal());
    assert!(service.status().last_error.is_some());
    let failures = service
        .audit_trail()
        .iter()
        .filter(|a| a.event == "ConnectFailed")
        .count();
    assert_eq!(failures, 3);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_requests_fail_fast_while_disconnected() {
    let (opener, radio) = virtual_link(4096);
    radio.set_online(false);
    let mut service = MeshService::builder(config())
        .with_link_opener(std::sync::Arc::new(opener))
        .build_and_start()
        .await
        .unwrap();

    let result = service.request_traceroute(NodeNum::new(0x300)).await;
    assert!(matches!(
        result,
        Err(MeshmonError::Transport(TransportError::NotConnected))
    ));
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_traceroute_costs_two_points() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();
    let mut device = Device::accept(&mut radio).await;
    device.next_request().await;
    connected(&mut events).await;

    let packet_id = service.request_traceroute(NodeNum::new(0x300)).await.unwrap();
    let request = device.next_request().await;
    let Some(to_radio::PayloadVariant::Packet(packet)) = request.payload_variant else {
        panic!("traceroute goes out as a mesh packet");
    };
    assert_eq!(packet.id, packet_id);
    assert_eq!(packet.to, 0x300);

    wait_for(&mut events, |e| matches!(e, MeshEvent::TracerouteFailed { destination, .. } if *destination == NodeNum::new(0x300))).await;
    let history = service.link_quality(NodeNum::new(0x300));
    let last = history.last().unwrap();
    assert_eq!(last.kind, QualityEventKind::FailedVerification);
    assert_eq!(last.score, 3);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_traceroutes_each_reach_the_device() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();
    let mut device = Device::accept(&mut radio).await;
    device.next_request().await;
    connected(&mut events).await;

    let destinations = [0x301u32, 0x302, 0x303];
    let results = futures::future::join_all(
        destinations
            .iter()
            .map(|d| service.request_traceroute(NodeNum::new(*d))),
    )
    .await;
    let mut sent = Vec::new();
    for result in results {
        sent.push(tokio_test::assert_ok!(result));
    }

    let mut seen = Vec::new();
    for _ in 0..destinations.len() {
        let Some(to_radio::PayloadVariant::Packet(packet)) = device.next_request().await.payload_variant else {
            panic!("traceroute goes out as a mesh packet");
        };
        assert!(destinations.contains(&packet.to));
        seen.push(packet.id);
    }
    sent.sort_unstable();
    seen.sort_unstable();
    assert_eq!(sent, seen);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_new_key_recovers_packets_seen_earlier() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();
    let mut device = Device::accept(&mut radio).await;
    device.next_request().await;
    connected(&mut events).await;

    let key = test_key(12);
    for id in 1..=5u32 {
        device
            .send_raw(&PacketBuilder::text(0x400, LONG_TEXT).id(id).encrypted("Rescue", &key).frame())
            .await;
    }
    for _ in 0..5 {
        wait_for(&mut events, |e| matches!(e, MeshEvent::Undecryptable { .. })).await;
    }

    service.create_key(NewChannelKey::new("Rescue", key)).unwrap();
    for _ in 0..5 {
        wait_for(&mut events, |e| matches!(e, MeshEvent::PacketRecovered { .. })).await;
    }
    service.wait_reprocess_idle().await;

    let status = service.reprocess_status();
    assert_eq!(status.packets_recovered, 5);
    assert_eq!(status.jobs_completed, 1);
    assert_eq!(service.list_keys()[0].decrypted_count, 5);
    service.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_tells_the_device() {
    let (mut service, mut radio) = start(config()).await;
    let mut events = service.subscribe();
    let mut device = Device::accept(&mut radio).await;
    device.next_request().await;
    connected(&mut events).await;

    service.shutdown().await.unwrap();
    assert!(matches!(
        device.next_request().await.payload_variant,
        Some(to_radio::PayloadVariant::Disconnect(true))
    ));
    assert!(service.status().state.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_pauses_reprocess_and_restart_resumes() {
    let mut config = config();
    config.reprocess.batch_size = 1;
    let key = test_key(13);
    let state = SharedState::new(&config);
    let clock = Arc::new(ManualTimeSource::new(Timestamp::new(1_000_000)));
    let mut pipeline = PacketPipeline::new(state.clone(), &config, clock);
    for id in 1..=5u32 {
        pipeline.process_packet(
            PacketBuilder::text(0x500, LONG_TEXT)
                .id(id)
                .encrypted("Rescue", &key)
                .build(),
        );
    }
    state
        .registry
        .write()
        .create(NewChannelKey::new("Rescue", key))
        .unwrap();
    let cursors = Arc::new(MemoryCursorStore::new());

    let (opener, radio) = virtual_link(4096);
    radio.set_online(false);
    let mut service = MeshService::builder(config.clone())
        .with_link_opener(Arc::new(opener))
        .with_state(state.clone())
        .with_cursor_store(cursors.clone())
        .build_and_start()
        .await
        .unwrap();

    // Shutdown lands before the second batch
    assert_eq!(service.reprocess_all(), ReprocessTrigger::Started);
    service.shutdown().await.unwrap();

    let status = service.reprocess_status();
    assert!(!status.running);
    assert_eq!(status.jobs_completed, 0);
    assert_eq!(status.packets_recovered, 1);
    assert_eq!(cursors.load().unwrap().unwrap().last_log_id, Some(LogId::new(1)));
    assert_eq!(state.packet_log.tag_counts().undecryptable, 4);
    assert_eq!(service.reprocess_all(), ReprocessTrigger::Stopped);

    let (opener, radio) = virtual_link(4096);
    radio.set_online(false);
    let mut restarted = MeshService::builder(config)
        .with_link_opener(Arc::new(opener))
        .with_state(state.clone())
        .with_cursor_store(cursors.clone())
        .build_and_start()
        .await
        .unwrap();
    restarted.wait_reprocess_idle().await;

    let status = restarted.reprocess_status();
    assert_eq!(status.jobs_completed, 1);
    assert_eq!(status.packets_recovered, 4);
    assert!(cursors.load().unwrap().is_none());
    assert_eq!(state.packet_log.tag_counts().undecryptable, 0);
    assert_eq!(restarted.list_keys()[0].decrypted_count, 5);
    restarted.shutdown().await.unwrap();
}
