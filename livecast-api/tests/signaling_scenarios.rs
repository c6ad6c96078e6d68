//! End-to-end signaling scenarios against the in-process engine
//!
//! Sessions are driven directly with text frames, the way the WebSocket
//! handler drives them.
//!
//! Run with: cargo test -p livecast-api --test signaling_scenarios

use std::sync::Arc;
use std::time::Duration;

use livecast_api::signaling::ServerFrame;
use livecast_api::{SignalingContext, SignalingSession};
use livecast_core::config::EngineConfig;
use livecast_core::models::{AudioPolicy, CreateLive, Live, MediaKind, Role, RoomRef};
use livecast_core::{JwtVerifier, LiveStore, MemoryLiveStore};
use livecast_sfu::{
    Action, AuthorizationGate, Handshake, LocalEngine, Resubscriber, RoomEvent, RoomNotifier,
    RoomRegistry, SeatRegistry, SfuError, SubscriptionState,
};
use serde_json::{json, Value};
use tokio::sync::mpsc::Receiver;

const SECRET: &[u8] = b"scenario-secret";
const SEAT_TTL: Duration = Duration::from_secs(30);

struct Harness {
    engine: LocalEngine,
    store: Arc<MemoryLiveStore>,
    verifier: JwtVerifier,
    ctx: Arc<SignalingContext>,
    live: Live,
}

struct Peer {
    session: SignalingSession,
    events: Receiver<RoomEvent>,
}

impl Harness {
    async fn new(exclusive: bool, audio_policy: AudioPolicy) -> Self {
        let engine = LocalEngine::new(&EngineConfig::default());
        let store = Arc::new(MemoryLiveStore::new(exclusive));
        let verifier = JwtVerifier::new(SECRET, None, Duration::from_secs(3600));
        let registry = Arc::new(RoomRegistry::new(store.clone(), RoomNotifier::new()));
        let gate = Arc::new(AuthorizationGate::new(
            Arc::new(verifier.clone()),
            store.clone(),
            SeatRegistry::new(SEAT_TTL),
            false,
        ));
        let ctx = Arc::new(SignalingContext {
            engine: Arc::new(engine.clone()),
            registry,
            gate,
            audio_policy,
        });
        let live = store
            .create(
                Some("alice"),
                CreateLive {
                    title: Some("Friday stream".to_string()),
                    ..CreateLive::default()
                },
            )
            .await
            .unwrap();

        Self {
            engine,
            store,
            verifier,
            ctx,
            live,
        }
    }

    fn token(&self, session: &str) -> String {
        self.verifier.issue("alice", Some(session), None).unwrap()
    }

    async fn admit(&self, role: Role, token: Option<String>) -> Result<Peer, SfuError> {
        let admission = self
            .ctx
            .gate
            .admit(Handshake {
                role,
                token,
                room: Some(RoomRef::Slug(self.live.slug.clone())),
            })
            .await?;
        let (session, events) = SignalingSession::open(Arc::clone(&self.ctx), admission).await?;
        Ok(Peer { session, events })
    }

    async fn broadcaster(&self, session: &str) -> Peer {
        self.admit(Role::Broadcaster, Some(self.token(session)))
            .await
            .unwrap()
    }

    async fn viewer(&self) -> Peer {
        self.admit(Role::Viewer, None).await.unwrap()
    }

    fn viewers(&self) -> usize {
        self.ctx.registry.viewer_count(&self.live.id)
    }
}

impl Peer {
    async fn call(&mut self, event: &str, data: Value) -> Value {
        let frame = json!({ "id": 1, "event": event, "data": data }).to_string();
        match self.session.handle(&frame).await {
            ServerFrame::Reply { id, data } => {
                assert_eq!(id, 1);
                data
            }
            other => panic!("expected a reply, got {other:?}"),
        }
    }

    async fn start_sending(&mut self) {
        let params = self.call("createSendTransport", Value::Null).await;
        assert!(params["id"].is_string(), "unexpected reply {params}");
        let ack = self
            .call("connectSendTransport", json!({ "dtlsParameters": dtls() }))
            .await;
        assert_eq!(ack, "ok");
    }

    async fn produce(&mut self, kind: MediaKind, audio: Option<&str>) -> Value {
        self.call(
            "produce",
            json!({ "kind": kind, "rtpParameters": rtp(kind), "audio": audio }),
        )
        .await
    }

    async fn start_receiving(&mut self) {
        let params = self.call("createRecvTransport", Value::Null).await;
        assert!(params["id"].is_string(), "unexpected reply {params}");
    }

    async fn consume(&mut self, kind: MediaKind) -> Value {
        let caps = self.call("getRtpCapabilities", Value::Null).await;
        self.call("consume", json!({ "kind": kind, "rtpCapabilities": caps }))
            .await
    }

    fn drain(&mut self) -> Vec<RoomEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event that is not a viewer count update
    async fn next_media_event(&mut self) -> RoomEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(1), self.events.recv())
                .await
                .expect("timed out waiting for room event")
                .expect("event queue closed");
            if !matches!(event, RoomEvent::ViewerCount { .. }) {
                return event;
            }
        }
    }
}

fn rtp(kind: MediaKind) -> Value {
    match kind {
        MediaKind::Video => json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }]
        }),
        MediaKind::Audio => json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 100, "clockRate": 48000, "channels": 2 }]
        }),
    }
}

fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "00:11:22" }]
    })
}

fn error_code(reply: &Value) -> &str {
    reply["code"].as_str().unwrap_or_default()
}

fn count_new_producers(events: &[RoomEvent], kind: MediaKind) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, RoomEvent::NewProducer { kind: k, .. } if *k == kind))
        .count()
}

#[tokio::test]
async fn test_source_switch_replaces_video_producer() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    let mut viewer1 = h.viewer().await;
    let mut viewer2 = h.viewer().await;

    host.start_sending().await;
    let first = host.produce(MediaKind::Video, None).await;
    let p1 = first["id"].as_str().unwrap().to_string();
    viewer1.drain();
    viewer2.drain();

    let second = host.produce(MediaKind::Video, None).await;
    let p2 = second["id"].as_str().unwrap().to_string();
    assert_ne!(p1, p2);

    let current = h.ctx.registry.producer(&h.live.id, MediaKind::Video).unwrap();
    assert_eq!(current.id().as_str(), p2);
    assert_eq!(h.engine.open_producers(), 1);

    for viewer in [&mut viewer1, &mut viewer2] {
        let events = viewer.drain();
        assert_eq!(count_new_producers(&events, MediaKind::Video), 1, "{events:?}");
    }
}

#[tokio::test]
async fn test_two_viewers_one_broadcaster_count() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    assert_eq!(h.viewers(), 0);

    let mut viewer1 = h.viewer().await;
    let mut viewer2 = h.viewer().await;
    assert_eq!(h.viewers(), 2);
    assert!(host
        .drain()
        .contains(&RoomEvent::ViewerCount { count: 2 }));
    viewer1.drain();

    viewer2.session.close();
    assert_eq!(h.viewers(), 1);
    assert_eq!(viewer1.drain(), vec![RoomEvent::ViewerCount { count: 1 }]);

    // An explicit join of the handshake room changes nothing
    let reply = viewer1
        .call("join", json!({ "roomId": h.live.id }))
        .await;
    assert_eq!(reply["viewers"], 1);
    assert!(viewer1.drain().is_empty());
}

#[tokio::test]
async fn test_consume_before_produce() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut viewer = h.viewer().await;
    viewer.start_receiving().await;

    let reply = viewer.consume(MediaKind::Video).await;
    assert_eq!(reply["error"], "no video producer");
    assert_eq!(error_code(&reply), "no_producer");
    assert_eq!(h.engine.open_consumers(), 0);

    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;

    assert_eq!(
        viewer.next_media_event().await,
        RoomEvent::NewProducer {
            room_id: h.live.id.clone(),
            kind: MediaKind::Video
        }
    );
    let reply = viewer.consume(MediaKind::Video).await;
    assert!(reply["id"].is_string(), "unexpected reply {reply}");
    assert_eq!(reply["kind"], "video");
    assert_eq!(h.engine.open_consumers(), 1);
}

#[tokio::test]
async fn test_consumers_start_paused_until_resume() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;

    let mut viewer = h.viewer().await;
    viewer.start_receiving().await;
    let reply = viewer.consume(MediaKind::Video).await;
    assert_eq!(reply["paused"], true);

    let consumer = h
        .ctx
        .registry
        .current_consumer(&h.live.id, viewer.session.peer_id(), MediaKind::Video)
        .unwrap();
    assert!(consumer.is_paused());

    let ack = viewer
        .call("resume", json!({ "consumerId": reply["id"] }))
        .await;
    assert_eq!(ack, "ok");
    assert!(!consumer.is_paused());

    let missing = viewer
        .call("resume", json!({ "consumerId": "nope" }))
        .await;
    assert_eq!(error_code(&missing), "consumer_not_found");

    let layers = viewer
        .call("setPreferredLayers", json!({ "spatialLayer": 1, "temporalLayer": 0 }))
        .await;
    assert_eq!(layers, "ok");
}

#[tokio::test]
async fn test_incompatible_capabilities_create_nothing() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;

    let mut viewer = h.viewer().await;
    viewer.start_receiving().await;
    let caps = json!({
        "codecs": [{ "kind": "video", "mimeType": "video/H264", "clockRate": 90000 }]
    });
    let reply = viewer
        .call("consume", json!({ "kind": "video", "rtpCapabilities": caps }))
        .await;
    assert_eq!(error_code(&reply), "incompatible_capabilities");
    assert_eq!(h.engine.open_consumers(), 0);
    assert_eq!(
        h.ctx
            .registry
            .peer_resources(&h.live.id, viewer.session.peer_id())
            .consumers,
        0
    );
}

#[tokio::test]
async fn test_disconnect_cleanup() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;

    let mut viewer = h.viewer().await;
    let mut other = h.viewer().await;
    viewer.start_receiving().await;
    viewer.consume(MediaKind::Video).await;
    let peer = viewer.session.peer_id().clone();
    assert!(!h.ctx.registry.peer_resources(&h.live.id, &peer).is_empty());
    assert_eq!(h.viewers(), 2);

    viewer.session.close();
    assert!(h.ctx.registry.peer_resources(&h.live.id, &peer).is_empty());
    assert_eq!(h.viewers(), 1);
    assert_eq!(h.engine.open_consumers(), 0);

    // Broadcaster goes away: viewers learn the producer is gone and the seat frees up
    other.drain();
    host.session.close();
    assert_eq!(
        other.next_media_event().await,
        RoomEvent::ProducerClosed {
            room_id: h.live.id.clone(),
            kind: MediaKind::Video
        }
    );
    assert!(h.ctx.registry.producer(&h.live.id, MediaKind::Video).is_none());
    assert_eq!(h.engine.open_producers(), 0);
    assert!(h.ctx.gate.seats().holder(&h.live.id).is_none());
}

#[tokio::test]
async fn test_seat_exclusivity() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut first = h.broadcaster("s1").await;
    first.start_sending().await;

    let second = h.admit(Role::Broadcaster, Some(h.token("s2"))).await;
    assert!(matches!(second, Err(SfuError::SeatBusy)));

    let reply = first.produce(MediaKind::Video, None).await;
    assert!(reply["id"].is_string(), "unexpected reply {reply}");
}

#[tokio::test]
async fn test_non_exclusive_live_allows_parallel_broadcasters() {
    let h = Harness::new(false, AudioPolicy::KeepExisting).await;
    let _first = h.broadcaster("s1").await;
    let mut second = h.broadcaster("s2").await;
    second.start_sending().await;
    let reply = second.produce(MediaKind::Audio, None).await;
    assert!(reply["id"].is_string(), "unexpected reply {reply}");
}

#[tokio::test(start_paused = true)]
async fn test_seat_expiry() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut first = h.broadcaster("s1").await;
    first.start_sending().await;
    first.produce(MediaKind::Video, None).await;

    tokio::time::advance(SEAT_TTL - Duration::from_secs(1)).await;
    assert!(matches!(
        h.admit(Role::Broadcaster, Some(h.token("s2"))).await,
        Err(SfuError::SeatBusy)
    ));

    tokio::time::advance(Duration::from_secs(2)).await;
    let mut second = h.admit(Role::Broadcaster, Some(h.token("s2"))).await.unwrap();

    let stale = first.produce(MediaKind::Video, None).await;
    assert_eq!(error_code(&stale), "seat_busy");

    second.start_sending().await;
    let reply = second.produce(MediaKind::Video, None).await;
    assert!(reply["id"].is_string(), "unexpected reply {reply}");
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_keeps_idle_seat() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;

    for _ in 0..3 {
        tokio::time::advance(SEAT_TTL / 2).await;
        assert_eq!(host.call("heartbeat", Value::Null).await, "ok");
    }
    assert!(matches!(
        h.admit(Role::Broadcaster, Some(h.token("s2"))).await,
        Err(SfuError::SeatBusy)
    ));

    let mut viewer = h.viewer().await;
    assert_eq!(viewer.call("heartbeat", Value::Null).await, "ok");
}

#[tokio::test]
async fn test_viewer_cannot_produce() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut viewer = h.viewer().await;
    let reply = viewer.call("createSendTransport", Value::Null).await;
    assert_eq!(error_code(&reply), "not_authorized");
    let reply = viewer.produce(MediaKind::Video, None).await;
    assert_eq!(error_code(&reply), "not_authorized");
}

#[tokio::test]
async fn test_produce_requires_connected_transport() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;

    let reply = host.produce(MediaKind::Video, None).await;
    assert_eq!(reply["error"], "no send transport");

    host.call("createSendTransport", Value::Null).await;
    let reply = host.produce(MediaKind::Video, None).await;
    assert_eq!(error_code(&reply), "no_transport");

    let again = host.call("createSendTransport", Value::Null).await;
    assert_eq!(error_code(&again), "transport_already_exists");
}

#[tokio::test]
async fn test_video_switch_with_dropped_audio() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Audio, None).await;
    host.produce(MediaKind::Video, None).await;

    let mut viewer = h.viewer().await;
    viewer.drain();

    // Screen share without a track of its own
    host.produce(MediaKind::Video, Some("drop")).await;
    let events = viewer.drain();
    assert!(events.contains(&RoomEvent::ProducerClosed {
        room_id: h.live.id.clone(),
        kind: MediaKind::Audio
    }));
    assert_eq!(count_new_producers(&events, MediaKind::Video), 1);
    assert!(h.ctx.registry.producer(&h.live.id, MediaKind::Audio).is_none());
}

#[tokio::test]
async fn test_configured_audio_policy_applies_by_default() {
    let h = Harness::new(true, AudioPolicy::Replace).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Audio, None).await;
    host.produce(MediaKind::Video, None).await;
    host.produce(MediaKind::Video, None).await;

    assert!(h.ctx.registry.producer(&h.live.id, MediaKind::Audio).is_none());
    host.produce(MediaKind::Audio, None).await;
    assert!(h.ctx.registry.producer(&h.live.id, MediaKind::Audio).is_some());
}

#[tokio::test]
async fn test_resubscriber_follows_source_switch() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;

    let mut viewer = h.viewer().await;
    viewer.start_receiving().await;
    let mut sub = Resubscriber::default();

    assert_eq!(sub.start(), Action::Consume);
    let reply = viewer.consume(MediaKind::Video).await;
    let first = reply["id"].as_str().unwrap().to_string();
    sub.on_consumed(first.as_str().into());

    viewer.drain();
    let switched = host.produce(MediaKind::Video, None).await;
    let event = viewer.next_media_event().await;
    assert!(matches!(event, RoomEvent::NewProducer { kind: MediaKind::Video, .. }));

    assert_eq!(sub.on_producer_changed(), Action::Consume);
    let reply = viewer.consume(MediaKind::Video).await;
    assert_eq!(reply["producerId"], switched["id"]);
    let second = reply["id"].as_str().unwrap().to_string();
    assert_eq!(sub.on_consumed(second.as_str().into()), Action::Nothing);
    assert_eq!(sub.state(), &SubscriptionState::Consuming(second.as_str().into()));

    let current = h
        .ctx
        .registry
        .current_consumer(&h.live.id, viewer.session.peer_id(), MediaKind::Video)
        .unwrap();
    assert_eq!(current.id().as_str(), second);
    assert_eq!(h.engine.open_consumers(), 1);
}

#[tokio::test]
async fn test_join_other_room_releases_previous() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let other = h.store.create(None, CreateLive::default()).await.unwrap();

    let mut host = h.broadcaster("s1").await;
    let mut viewer = h.viewer().await;
    assert_eq!(h.viewers(), 1);

    let reply = viewer.call("join", json!({ "roomId": other.slug })).await;
    assert_eq!(reply["roomId"], other.id.as_str());
    assert_eq!(reply["viewers"], 1);
    assert_eq!(h.viewers(), 0);
    assert_eq!(viewer.session.room(), Some(&other.id));

    // The seat belongs to the handshake room only
    host.call("join", json!({ "roomId": other.id })).await;
    assert!(!host.session.is_host());
    assert!(h.ctx.gate.seats().holder(&h.live.id).is_none());
    let reply = host.call("createSendTransport", Value::Null).await;
    assert_eq!(error_code(&reply), "not_authorized");

    let ack = viewer.call("leave", json!({ "roomId": other.id })).await;
    assert_eq!(ack, "ok");
    assert!(viewer.session.room().is_none());
    let reply = viewer.call("createRecvTransport", Value::Null).await;
    assert_eq!(error_code(&reply), "room_not_found");

    let missing = viewer.call("join", json!({ "roomId": "no-such-room" })).await;
    assert_eq!(error_code(&missing), "room_not_found");
}

#[tokio::test]
async fn test_live_end_notifies_members() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut host = h.broadcaster("s1").await;
    host.start_sending().await;
    host.produce(MediaKind::Video, None).await;
    let mut viewer = h.viewer().await;
    viewer.drain();

    h.store.end(&h.live.id).await.unwrap();
    assert!(h.ctx.registry.close_room(&h.live.id));
    assert_eq!(
        viewer.next_media_event().await,
        RoomEvent::LiveEnded {
            room_id: h.live.id.clone()
        }
    );
    assert_eq!(h.engine.open_producers(), 0);

    let late = h.admit(Role::Viewer, None).await;
    assert!(matches!(late, Err(SfuError::RoomNotFound(_))));
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_usable() {
    let h = Harness::new(true, AudioPolicy::KeepExisting).await;
    let mut viewer = h.viewer().await;

    let ServerFrame::Reply { id, data } = viewer.session.handle("{not json").await else {
        panic!("expected a reply");
    };
    assert_eq!(id, 0);
    assert!(data["error"].as_str().unwrap().starts_with("invalid request"));

    let reply = viewer.call("teleport", Value::Null).await;
    assert_eq!(reply["error"], "unknown event teleport");

    let caps = viewer.call("getRtpCapabilities", Value::Null).await;
    assert_eq!(caps["codecs"].as_array().map(Vec::len), Some(2));
}
