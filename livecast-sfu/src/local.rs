//! In-process media engine
//!
//! Implements the full handle lifecycle of the engine adapter without touching
//! the network: capability negotiation from the configured codecs, transports
//! with host candidates on the announced address, paused consumers, close
//! cascades and a health channel. Used for development and by the test suites.

use async_trait::async_trait;
use dashmap::DashMap;
use livecast_core::config::EngineConfig;
use livecast_core::models::{MediaKind, RoomId};
use parking_lot::Mutex;
use serde_json::{json, Map};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};

use crate::engine::{
    Consumer, ConsumerLayers, DtlsFingerprint, DtlsParameters, EngineError, EngineHealth,
    EngineResult, HandleEvent, MediaEngine, Producer, RtpCapabilities, RtpCodecCapability,
    RtpCodecParameters, RtpParameters, TransportParams, WebRtcTransport,
};
use crate::types::{ConsumerId, Direction, ProducerId, TransportId};

const EVENT_CAPACITY: usize = 16;

#[derive(Default)]
struct Counters {
    transports: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
}

struct EngineInner {
    codecs: Vec<RtpCodecCapability>,
    announced_ip: String,
    min_port: u16,
    max_port: u16,
    next_port: AtomicU32,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    counters: Arc<Counters>,
    health: watch::Sender<EngineHealth>,
}

/// In-process [`MediaEngine`]
#[derive(Clone)]
pub struct LocalEngine {
    inner: Arc<EngineInner>,
}

impl LocalEngine {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let codecs = config
            .codecs
            .iter()
            .enumerate()
            .map(|(i, codec)| RtpCodecCapability {
                kind: codec.kind,
                mime_type: codec.mime_type.clone(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                preferred_payload_type: u8::try_from(100 + i).ok(),
                parameters: Map::new(),
                extra: Map::new(),
            })
            .collect();
        let (health, _) = watch::channel(EngineHealth::Running);

        info!(
            announced_ip = %config.announced_ip,
            rtc_min_port = config.rtc_min_port,
            rtc_max_port = config.rtc_max_port,
            codecs = config.codecs.len(),
            "Local media engine started"
        );

        Self {
            inner: Arc::new(EngineInner {
                codecs,
                announced_ip: config.announced_ip.clone(),
                min_port: config.rtc_min_port,
                max_port: config.rtc_max_port.max(config.rtc_min_port),
                next_port: AtomicU32::new(0),
                transports: DashMap::new(),
                producers: DashMap::new(),
                counters: Arc::new(Counters::default()),
                health,
            }),
        }
    }

    #[must_use]
    pub fn open_transports(&self) -> usize {
        self.inner.counters.transports.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_producers(&self) -> usize {
        self.inner.counters.producers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn open_consumers(&self) -> usize {
        self.inner.counters.consumers.load(Ordering::SeqCst)
    }

    /// Simulate the worker dying: every transport closes and health turns `Dead`
    pub fn shutdown_with_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(reason = %reason, "Media engine died");

        let transports: Vec<_> = self
            .inner
            .transports
            .iter()
            .map(|t| Arc::clone(t.value()))
            .collect();
        for transport in transports {
            transport.close();
        }
        self.inner.health.send_replace(EngineHealth::Dead(reason));
    }

    fn is_dead(&self) -> bool {
        matches!(*self.inner.health.borrow(), EngineHealth::Dead(_))
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.inner.max_port - self.inner.min_port) + 1;
        let offset = self.inner.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within the configured range
        self.inner.min_port + u16::try_from(offset).unwrap_or(0)
    }
}

impl EngineInner {
    fn router_codec(&self, kind: MediaKind, codec: &RtpCodecParameters) -> bool {
        self.codecs
            .iter()
            .any(|c| c.kind == kind && c.matches(&codec.mime_type, codec.clock_rate, codec.channels))
    }
}

/// Codecs of `producer` that a peer with `capabilities` can decode
fn consumable_codecs(
    producer: &LocalProducer,
    capabilities: &RtpCapabilities,
) -> Vec<RtpCodecParameters> {
    producer
        .rtp_parameters
        .codecs
        .iter()
        .filter(|codec| {
            capabilities.codecs.iter().any(|cap| {
                cap.kind == producer.kind
                    && cap.matches(&codec.mime_type, codec.clock_rate, codec.channels)
            })
        })
        .cloned()
        .collect()
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.inner.codecs.clone(),
            header_extensions: Vec::new(),
            extra: Map::new(),
        }
    }

    async fn create_transport(
        &self,
        room: &RoomId,
        direction: Direction,
    ) -> EngineResult<Arc<dyn WebRtcTransport>> {
        if self.is_dead() {
            return Err(EngineError::Dead);
        }

        let id = TransportId::generate();
        let port = self.allocate_port();
        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": nanoid::nanoid!(16),
                "password": nanoid::nanoid!(32),
                "iceLite": true,
            }),
            ice_candidates: vec![json!({
                "foundation": "udpcandidate",
                "priority": 1_076_302_079_u32,
                "ip": self.inner.announced_ip,
                "address": self.inner.announced_ip,
                "protocol": "udp",
                "port": port,
                "type": "host",
            })],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: nanoid::nanoid!(64, &FINGERPRINT_ALPHABET),
                }],
            },
        };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let transport = Arc::new(LocalTransport {
            id: id.clone(),
            direction,
            params,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            events,
            engine: Arc::downgrade(&self.inner),
        });
        self.inner.transports.insert(id.clone(), Arc::clone(&transport));
        self.inner.counters.transports.fetch_add(1, Ordering::SeqCst);

        debug!(room_id = %room, transport_id = %id, direction = %direction, port, "Transport created");
        Ok(transport)
    }

    fn can_consume(&self, producer: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.inner
            .producers
            .get(producer)
            .is_some_and(|p| !consumable_codecs(&p, capabilities).is_empty())
    }

    fn health(&self) -> watch::Receiver<EngineHealth> {
        self.inner.health.subscribe()
    }
}

const FINGERPRINT_ALPHABET: [char; 16] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'A', 'B', 'C', 'D', 'E', 'F',
];

struct LocalTransport {
    id: TransportId,
    direction: Direction,
    params: TransportParams,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    events: broadcast::Sender<HandleEvent>,
    engine: Weak<EngineInner>,
}

impl LocalTransport {
    fn engine(&self) -> EngineResult<Arc<EngineInner>> {
        self.engine.upgrade().ok_or(EngineError::Dead)
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::TransportClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WebRtcTransport for LocalTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls: DtlsParameters) -> EngineResult<()> {
        self.ensure_open()?;
        if dtls.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters has no fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidParameters(
                "connect() already called".to_string(),
            ));
        }
        debug!(transport_id = %self.id, "Transport connected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;
        if self.direction != Direction::Send {
            return Err(EngineError::InvalidParameters(
                "cannot produce on a recv transport".to_string(),
            ));
        }
        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters has no codecs".to_string(),
            ));
        }

        let engine = self.engine()?;
        if let Some(codec) = rtp_parameters
            .codecs
            .iter()
            .find(|c| !engine.router_codec(kind, c))
        {
            return Err(EngineError::UnsupportedCodec(format!(
                "{} {}Hz",
                codec.mime_type, codec.clock_rate
            )));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let producer = Arc::new(LocalProducer {
            id: ProducerId::generate(),
            kind,
            rtp_parameters,
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            events,
            engine: Arc::downgrade(&engine),
            counters: Arc::clone(&engine.counters),
        });

        {
            let mut producers = self.producers.lock();
            producers.retain(|p| !p.closed.load(Ordering::SeqCst));
            producers.push(Arc::clone(&producer));
        }
        engine.producers.insert(producer.id.clone(), Arc::clone(&producer));
        engine.counters.producers.fetch_add(1, Ordering::SeqCst);

        // A close racing with this produce must not leave the producer behind
        if self.closed.load(Ordering::SeqCst) {
            producer.close_with(HandleEvent::TransportClose);
            return Err(EngineError::TransportClosed);
        }

        debug!(transport_id = %self.id, producer_id = %producer.id, kind = %kind, "Producer created");
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
    ) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;
        if self.direction != Direction::Recv {
            return Err(EngineError::InvalidParameters(
                "cannot consume on a send transport".to_string(),
            ));
        }

        let engine = self.engine()?;
        let producer = engine
            .producers
            .get(producer_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;

        let codecs = consumable_codecs(&producer, capabilities);
        if codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "no codec in common with the producer".to_string(),
            ));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::generate(),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                mid: None,
                codecs,
                extra: Map::new(),
            },
            paused: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            layers: Mutex::new(None),
            events,
            counters: Arc::clone(&engine.counters),
        });
        engine.counters.consumers.fetch_add(1, Ordering::SeqCst);

        producer.consumers.lock().push(Arc::downgrade(&consumer));
        {
            let mut consumers = self.consumers.lock();
            consumers.retain(|c| !c.closed.load(Ordering::SeqCst));
            consumers.push(Arc::clone(&consumer));
        }

        if producer.closed.load(Ordering::SeqCst) {
            consumer.close_with(HandleEvent::ProducerClose);
            return Err(EngineError::HandleClosed("producer"));
        }
        if self.closed.load(Ordering::SeqCst) {
            consumer.close_with(HandleEvent::TransportClose);
            return Err(EngineError::TransportClosed);
        }

        debug!(transport_id = %self.id, consumer_id = %consumer.id, producer_id = %producer_id, "Consumer created (paused)");
        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close_with(HandleEvent::TransportClose);
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close_with(HandleEvent::TransportClose);
        }

        if let Some(engine) = self.engine.upgrade() {
            engine.transports.remove(&self.id);
            engine.counters.transports.fetch_sub(1, Ordering::SeqCst);
        }
        let _ = self.events.send(HandleEvent::Close);
        debug!(transport_id = %self.id, "Transport closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }
}

struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    events: broadcast::Sender<HandleEvent>,
    engine: Weak<EngineInner>,
    counters: Arc<Counters>,
}

impl LocalProducer {
    fn close_with(&self, reason: HandleEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.producers.remove(&self.id);
        }
        self.counters.producers.fetch_sub(1, Ordering::SeqCst);

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            consumer.close_with(HandleEvent::ProducerClose);
        }

        let _ = self.events.send(reason);
        debug!(producer_id = %self.id, kind = %self.kind, reason = ?reason, "Producer closed");
    }
}

impl Producer for LocalProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.close_with(HandleEvent::Close);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }
}

struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    layers: Mutex<Option<ConsumerLayers>>,
    events: broadcast::Sender<HandleEvent>,
    counters: Arc<Counters>,
}

impl LocalConsumer {
    fn close_with(&self, reason: HandleEvent) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.counters.consumers.fetch_sub(1, Ordering::SeqCst);
        let _ = self.events.send(reason);
        debug!(consumer_id = %self.id, reason = ?reason, "Consumer closed");
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::HandleClosed("consumer"));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_preferred_layers(&self, layers: ConsumerLayers) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::HandleClosed("consumer"));
        }
        if self.kind != MediaKind::Video {
            return Err(EngineError::InvalidParameters(
                "layers only apply to video consumers".to_string(),
            ));
        }
        *self.layers.lock() = Some(layers);
        Ok(())
    }

    fn preferred_layers(&self) -> Option<ConsumerLayers> {
        *self.layers.lock()
    }

    fn close(&self) {
        self.close_with(HandleEvent::Close);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<HandleEvent> {
        self.events.subscribe()
    }
}
