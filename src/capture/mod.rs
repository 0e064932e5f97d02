//! The packet-to-flow pipeline.
//!
//! Three stages with bounded hand-offs: the capture thread samples,
//! deduplicates and enqueues raw frames without ever blocking on the
//! kernel callback path; a batch worker classifies packets and updates the
//! flow table; periodic workers sweep idle flows into finalization and
//! batch-write finalized flows to the store.

pub mod flow_table;
pub mod l7;
pub mod packet;
pub mod quality;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::cache::LruBatchCache;
use crate::config::CaptureConfig;
use crate::db::devices;
use crate::db::flows::{self, FlowStatus, NetworkFlow, Protocol, ThreatLevel};
use crate::devices::DeviceRegistry;
use crate::error::Error;
use crate::events::{Event, EventHub};
use crate::geo::GeoLookup;
use crate::identify::{is_local_ip, EnhancedIdentifier};
use crate::threat::ThreatScorer;

use flow_table::{FlowRecord, FlowTable};
use packet::{decode_frame, Decoded, DedupWindow, FlowTuple, KeyCache, ParsedPacket, Sampler};
use quality::QualityTracker;

// Memory bounds. Eviction always prefers dropping data over growth.
const FLOW_TABLE_CAP: usize = 10_000;
const KEY_CACHE_CAP: usize = 5_000;
const DEDUP_CAP: usize = 10_000;
const DEDUP_WINDOW_MS: u64 = 1;
const DEVICE_CACHE_CAP: usize = 1_000;
const DEVICE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Queue between the capture thread and the worker; full means drop.
const PACKET_QUEUE_CAP: usize = 10_000;

/// Classifier batch bounds: up to 100 packets or 10 ms, whichever first.
const BATCH_MAX: usize = 100;
const BATCH_WAIT_MS: u64 = 10;

/// Packets classified concurrently within the worker.
const WORKER_CONCURRENCY: usize = 4;

/// Where packets come from.
#[derive(Debug, Clone)]
pub enum PacketSource {
    /// Sniff a live interface (the configured one, or the first available).
    Interface,
    /// No capture thread; frames are fed through [`FlowEngine::ingest`].
    Replay,
}

/// Counters exposed by [`FlowEngine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub running: bool,
    pub packets_captured: u64,
    pub packets_dropped: u64,
    pub packets_duplicate: u64,
    pub flows_detected: u64,
    pub flows_finalized: u64,
    pub active_flows: usize,
    pub write_errors: u64,
    pub avg_processing_micros: u64,
}

struct RawPacket {
    data: Vec<u8>,
    ts_ms: i64,
}

/// Captures packets, reconstructs flows and drives them through scoring,
/// persistence and notification.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: CaptureConfig,
    db: SqlitePool,
    registry: Arc<DeviceRegistry>,
    scorer: Arc<ThreatScorer>,
    identifier: Arc<EnhancedIdentifier>,
    geo: Arc<dyn GeoLookup>,
    hub: Arc<EventHub>,
    extractors: Vec<l7::Extractor>,

    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    tx: Mutex<Option<mpsc::Sender<RawPacket>>>,
    capture_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    sampler: Sampler,
    dedup: Mutex<DedupWindow>,
    keys: Mutex<KeyCache>,
    table: Mutex<FlowTable>,
    quality: Mutex<QualityTracker>,
    device_cache: Mutex<LruBatchCache<IpAddr, (String, Instant)>>,
    /// Serializes cache-miss device creation so concurrent packets from a
    /// new device cannot race two inserts for the same MAC.
    device_create_lock: tokio::sync::Mutex<()>,
    write_queue: Mutex<Vec<NetworkFlow>>,
    retry_batch: Mutex<Option<Vec<NetworkFlow>>>,
    writer_wakeup: Notify,

    packets_captured: AtomicU64,
    packets_dropped: AtomicU64,
    packets_duplicate: AtomicU64,
    flows_detected: AtomicU64,
    flows_finalized: AtomicU64,
    write_errors: AtomicU64,
    processing_micros: AtomicU64,
    processing_samples: AtomicU64,
}

impl FlowEngine {
    pub fn new(
        config: CaptureConfig,
        db: SqlitePool,
        registry: Arc<DeviceRegistry>,
        scorer: Arc<ThreatScorer>,
        identifier: Arc<EnhancedIdentifier>,
        geo: Arc<dyn GeoLookup>,
        hub: Arc<EventHub>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let sampler = Sampler::new(config.sampling_rate);
        Self {
            inner: Arc::new(EngineInner {
                config,
                db,
                registry,
                scorer,
                identifier,
                geo,
                hub,
                extractors: l7::default_extractors(),
                running: AtomicBool::new(false),
                shutdown,
                tx: Mutex::new(None),
                capture_thread: Mutex::new(None),
                worker: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                sampler,
                dedup: Mutex::new(DedupWindow::new(DEDUP_CAP, DEDUP_WINDOW_MS)),
                keys: Mutex::new(KeyCache::new(KEY_CACHE_CAP)),
                table: Mutex::new(FlowTable::new(FLOW_TABLE_CAP)),
                quality: Mutex::new(QualityTracker::new()),
                device_cache: Mutex::new(LruBatchCache::new(DEVICE_CACHE_CAP)),
                device_create_lock: tokio::sync::Mutex::new(()),
                write_queue: Mutex::new(Vec::new()),
                retry_batch: Mutex::new(None),
                writer_wakeup: Notify::new(),
                packets_captured: AtomicU64::new(0),
                packets_dropped: AtomicU64::new(0),
                packets_duplicate: AtomicU64::new(0),
                flows_detected: AtomicU64::new(0),
                flows_finalized: AtomicU64::new(0),
                write_errors: AtomicU64::new(0),
                processing_micros: AtomicU64::new(0),
                processing_samples: AtomicU64::new(0),
            }),
        }
    }

    /// Start the pipeline. With [`PacketSource::Interface`] this opens the
    /// capture handle first so a missing capability surfaces here as
    /// [`Error::CaptureUnavailable`]; a missing interface is substituted
    /// with the first available one.
    pub async fn start(&self, source: PacketSource) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("Flow engine already running");
            return Ok(());
        }

        // Open the capture handle before spawning anything so a failure
        // leaves the engine fully stopped.
        let capture = if let PacketSource::Interface = source {
            match open_capture(&self.inner.config) {
                Ok(opened) => Some(opened),
                Err(e) => {
                    self.inner.running.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        } else {
            None
        };

        let (tx, rx) = mpsc::channel(PACKET_QUEUE_CAP);
        *self.inner.tx.lock().unwrap() = Some(tx);

        let worker = tokio::spawn(EngineInner::run_worker(self.inner.clone(), rx));
        *self.inner.worker.lock().unwrap() = Some(worker);

        let sweeper = tokio::spawn(EngineInner::run_sweeper(self.inner.clone()));
        let writer = tokio::spawn(EngineInner::run_writer(self.inner.clone()));
        self.inner.tasks.lock().unwrap().extend([sweeper, writer]);

        match capture {
            Some((iface, cap)) => {
                let inner = self.inner.clone();
                let handle = std::thread::Builder::new()
                    .name("netsentry-capture".to_string())
                    .spawn(move || capture_loop(inner, cap))
                    .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;
                *self.inner.capture_thread.lock().unwrap() = Some(handle);

                info!(
                    interface = %iface,
                    filter = %self.inner.config.bpf_filter,
                    sampling_rate = self.inner.config.sampling_rate,
                    "Packet capture started"
                );
            }
            None => info!("Flow engine started in replay mode"),
        }

        Ok(())
    }

    /// Stage-1 entry point: sample, deduplicate and enqueue one frame.
    /// Never blocks; a full queue drops the packet and counts it.
    pub fn ingest(&self, data: &[u8], ts_ms: i64) {
        self.inner.ingest(data, ts_ms);
    }

    /// Drain and shut down: stop capture, let the worker finish the queue,
    /// stop the periodic workers, finalize every remaining flow and flush
    /// the write queue synchronously.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping flow engine");

        if let Some(handle) = self.inner.capture_thread.lock().unwrap().take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }

        // Closing the channel lets the worker drain everything queued.
        drop(self.inner.tx.lock().unwrap().take());
        let worker = self.inner.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let _ = self.inner.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let remaining = self.inner.table.lock().unwrap().drain_all();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "Finalizing remaining active flows");
        }
        self.inner.finalize_flows(remaining).await;
        self.inner.flush_writes().await;

        info!("Flow engine stopped");
    }

    pub fn status(&self) -> EngineStatus {
        let inner = &self.inner;
        let samples = inner.processing_samples.load(Ordering::Relaxed);
        EngineStatus {
            running: inner.running.load(Ordering::Relaxed),
            packets_captured: inner.packets_captured.load(Ordering::Relaxed),
            packets_dropped: inner.packets_dropped.load(Ordering::Relaxed),
            packets_duplicate: inner.packets_duplicate.load(Ordering::Relaxed),
            flows_detected: inner.flows_detected.load(Ordering::Relaxed),
            flows_finalized: inner.flows_finalized.load(Ordering::Relaxed),
            active_flows: inner.table.lock().unwrap().len(),
            write_errors: inner.write_errors.load(Ordering::Relaxed),
            avg_processing_micros: inner.processing_micros.load(Ordering::Relaxed)
                / samples.max(1),
        }
    }
}

/// Resolve the interface and open a non-blocking-friendly capture handle
/// with the configured BPF filter applied.
fn open_capture(
    config: &CaptureConfig,
) -> Result<(String, pcap::Capture<pcap::Active>), Error> {
    let iface = resolve_interface(config.interface.as_deref())?;
    let mut cap = pcap::Capture::from_device(iface.as_str())
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?
        .promisc(true)
        .snaplen(65535)
        .timeout(500)
        .open()
        .map_err(|e| Error::CaptureUnavailable(e.to_string()))?;
    if let Err(e) = cap.filter(&config.bpf_filter, true) {
        warn!(filter = %config.bpf_filter, "Failed to apply BPF filter: {e}");
    }
    Ok((iface, cap))
}

/// Pick the capture interface: the configured one when it exists, else the
/// first non-loopback device with a warning.
fn resolve_interface(preferred: Option<&str>) -> Result<String, Error> {
    let devices =
        pcap::Device::list().map_err(|e| Error::CaptureUnavailable(e.to_string()))?;
    if let Some(name) = preferred {
        if devices.iter().any(|d| d.name == name) {
            return Ok(name.to_string());
        }
        warn!(
            interface = name,
            "Configured interface not found, substituting first available"
        );
    }
    devices
        .iter()
        .find(|d| d.name != "lo")
        .or_else(|| devices.first())
        .map(|d| d.name.clone())
        .ok_or_else(|| Error::CaptureUnavailable("no capture devices available".to_string()))
}

/// Blocking pcap read loop on its own OS thread. The only thing it does per
/// packet is the non-blocking stage-1 ingest.
fn capture_loop(inner: Arc<EngineInner>, mut cap: pcap::Capture<pcap::Active>) {
    info!("Capture thread running");
    while inner.running.load(Ordering::SeqCst) {
        match cap.next_packet() {
            Ok(packet) => {
                let ts_ms = packet.header.ts.tv_sec as i64 * 1000
                    + packet.header.ts.tv_usec as i64 / 1000;
                inner.ingest(packet.data, ts_ms);
            }
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                warn!("Capture read error: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
    info!("Capture thread exited");
}

impl EngineInner {
    fn ingest(&self, data: &[u8], ts_ms: i64) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.packets_captured.fetch_add(1, Ordering::Relaxed);

        if !self.sampler.keep() {
            return;
        }
        if self.dedup.lock().unwrap().is_duplicate(ts_ms, data.len()) {
            self.packets_duplicate.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let tx = match &*self.tx.lock().unwrap() {
            Some(tx) => tx.clone(),
            None => return,
        };
        if tx
            .try_send(RawPacket {
                data: data.to_vec(),
                ts_ms,
            })
            .is_err()
        {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Stage 2: pull packets in batches of up to 100 (or 10 ms) and classify
    /// them with bounded concurrency. Exits when the channel closes, after
    /// draining it.
    async fn run_worker(self: Arc<Self>, mut rx: mpsc::Receiver<RawPacket>) {
        let mut join_set: JoinSet<()> = JoinSet::new();
        loop {
            let Some(first) = rx.recv().await else { break };
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + Duration::from_millis(BATCH_WAIT_MS);
            while batch.len() < BATCH_MAX {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(pkt)) => batch.push(pkt),
                    Ok(None) | Err(_) => break,
                }
            }

            for pkt in batch {
                while join_set.len() >= WORKER_CONCURRENCY {
                    let _ = join_set.join_next().await;
                }
                let inner = self.clone();
                join_set.spawn(async move {
                    inner.process_packet(&pkt.data, pkt.ts_ms).await;
                });
            }
        }
        while join_set.join_next().await.is_some() {}
        debug!("Classifier worker drained");
    }

    async fn process_packet(&self, data: &[u8], ts_ms: i64) {
        let started = Instant::now();

        match decode_frame(data) {
            Ok(Decoded::Flow(pkt)) => self.process_flow_packet(pkt, ts_ms).await,
            Ok(Decoded::Arp(arp)) => {
                if let Err(e) = self.registry.process_arp(&arp).await {
                    warn!("ARP processing failed: {e}");
                }
            }
            Ok(Decoded::Ignored) => {}
            Err(e) => {
                debug!("{e}");
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.processing_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        self.processing_samples.fetch_add(1, Ordering::Relaxed);
    }

    async fn process_flow_packet(&self, pkt: ParsedPacket, ts_ms: i64) {
        if pkt.is_ipv6 && !self.config.enable_ipv6 {
            return;
        }
        if self.config.skip_local_traffic
            && (pkt.src_ip.is_loopback() || pkt.dst_ip.is_loopback())
        {
            return;
        }

        let tuple = FlowTuple::from_packet(&pkt);
        let (key, reverse_key) = {
            let mut keys = self.keys.lock().unwrap();
            (keys.canonical(&tuple), keys.canonical(&tuple.reverse()))
        };

        let device_id = self
            .resolve_device(pkt.src_ip, pkt.src_mac.as_deref())
            .await;

        // Passive DNS: answer addresses feed the domain map that flow
        // finalization consults for the destination.
        if pkt.protocol == Protocol::Udp && (pkt.src_port == 53 || pkt.dst_port == 53) {
            if let Some(msg) = l7::parse_dns(&pkt.payload) {
                if msg.is_response {
                    if let Some(name) = &msg.query_name {
                        for ip in &msg.answers {
                            self.identifier.track_dns_query(name, *ip);
                        }
                    }
                }
            }
        }

        let ctx = l7::ExtractCtx {
            payload: &pkt.payload,
            protocol: pkt.protocol,
            src_port: pkt.src_port,
            dst_port: pkt.dst_port,
        };
        let mut meta = l7::run_extractors(&self.extractors, &ctx);
        if meta.domain.is_none() {
            if let Some(host) = self.identifier.extract_http_host(&pkt.payload) {
                meta.domain = Some(host);
            }
        }
        if meta.application.is_none() && pkt.protocol == Protocol::Tcp {
            if let Some(protocols) = self.identifier.extract_tls_alpn(&pkt.payload) {
                if protocols.iter().any(|p| p == "h2") {
                    meta.application = Some("HTTP/2".to_string());
                }
            }
        }
        if meta.application.is_none() {
            if let Some(app) = self.identifier.detect_application_dpi(&pkt.payload) {
                meta.application = Some(app.to_string());
            }
        }

        let (rtt, jitter, is_retransmission) = {
            let mut quality = self.quality.lock().unwrap();
            let rtt = quality.record_rtt(&key, ts_ms);
            let jitter = quality.record_jitter(&key, ts_ms);
            let retrans = match &pkt.tcp {
                Some(tcp) => quality.record_retransmission(&key, tcp.seq),
                None => false,
            };
            (rtt, jitter, retrans)
        };

        let incoming = is_local_ip(pkt.dst_ip);
        let size = pkt.size as i64;

        let mut created = false;
        let evicted = {
            let mut table = self.table.lock().unwrap();
            if let Some(rec) = table.lookup_mut(&key, &reverse_key) {
                rec.add_packet(size, incoming, ts_ms);
                rec.observe_ttl(pkt.ttl);
                if is_retransmission {
                    rec.retransmissions += 1;
                }
                if let Some(rtt) = rtt {
                    rec.push_rtt(rtt);
                }
                if jitter.is_some() {
                    rec.jitter = jitter;
                }
                if let Some(tcp) = &pkt.tcp {
                    rec.tcp_flags.union(tcp.flags);
                    rec.connection_state =
                        quality::next_connection_state(tcp.flags, rec.connection_state);
                }
                if !meta.is_empty() {
                    rec.meta = std::mem::take(&mut rec.meta).merge(meta);
                }
                Vec::new()
            } else {
                let mut rec = FlowRecord::new(
                    uuid::Uuid::new_v4().to_string(),
                    key.clone(),
                    tuple,
                    device_id,
                    ts_ms,
                );
                rec.add_packet(size, incoming, ts_ms);
                rec.observe_ttl(pkt.ttl);
                if is_retransmission {
                    rec.retransmissions = 1;
                }
                if let Some(rtt) = rtt {
                    rec.push_rtt(rtt);
                }
                rec.jitter = jitter;
                if let Some(tcp) = &pkt.tcp {
                    rec.tcp_flags.union(tcp.flags);
                    rec.connection_state = quality::next_connection_state(tcp.flags, None);
                }
                rec.meta = meta;
                created = true;
                table.insert(rec)
            }
        };

        if created {
            self.flows_detected.fetch_add(1, Ordering::Relaxed);
            if !pkt.payload.is_empty() {
                self.identifier
                    .fingerprint_service(&pkt.payload, pkt.dst_ip, pkt.dst_port);
            }
        }
        if !evicted.is_empty() {
            warn!(
                "{}",
                Error::CacheOverflow {
                    cache: "active_flow_table",
                    evicted: evicted.len(),
                }
            );
            self.finalize_flows(evicted).await;
        }
    }

    /// Resolve the source device through a short-TTL cache so the hot path
    /// does not hit the store for every packet.
    async fn resolve_device(&self, ip: IpAddr, mac: Option<&str>) -> String {
        if let Some(id) = self.cached_device(ip) {
            return id;
        }

        // Serialize the miss path and re-check: another packet may have
        // resolved the same device while we waited.
        let _guard = self.device_create_lock.lock().await;
        if let Some(id) = self.cached_device(ip) {
            return id;
        }

        match self.registry.get_or_create(&ip.to_string(), mac).await {
            Ok(device) => {
                self.device_cache
                    .lock()
                    .unwrap()
                    .put(ip, (device.id.clone(), Instant::now()));
                device.id
            }
            Err(e) => {
                warn!(ip = %ip, "Device resolution failed: {e}");
                "unknown".to_string()
            }
        }
    }

    fn cached_device(&self, ip: IpAddr) -> Option<String> {
        let mut cache = self.device_cache.lock().unwrap();
        match cache.get(&ip) {
            Some((id, cached_at)) if cached_at.elapsed() < DEVICE_CACHE_TTL => Some(id.clone()),
            _ => None,
        }
    }

    /// Stage 3: score, enqueue for persistence and notify, in that order.
    async fn finalize_flows(&self, records: Vec<FlowRecord>) {
        for record in records {
            let key = record.key.clone();
            let mut flow = self.build_flow(record);

            flow.threat_level = match self.scorer.score(&flow).await {
                Ok(level) => level,
                Err(e) => {
                    warn!("{}", Error::Scorer(e.to_string()));
                    ThreatLevel::Safe
                }
            };

            self.flows_finalized.fetch_add(1, Ordering::Relaxed);

            if let Err(e) =
                devices::bump_counters(&self.db, &flow.device_id, flow.bytes_in + flow.bytes_out)
                    .await
            {
                warn!(device_id = %flow.device_id, "Failed to update device counters: {e}");
            }

            let queued = {
                let mut queue = self.write_queue.lock().unwrap();
                queue.push(flow.clone());
                queue.len()
            };
            if queued >= self.config.batch_size {
                self.writer_wakeup.notify_one();
            }

            self.hub.publish(Event::FlowUpdate { flow });
            self.quality.lock().unwrap().forget(&key);
        }
    }

    /// Turn an active-flow record into its persisted form: closed status,
    /// domain from the passive DNS map, geolocation, averaged RTT.
    fn build_flow(&self, record: FlowRecord) -> NetworkFlow {
        let tuple = record.tuple;
        let domain = record
            .meta
            .domain
            .clone()
            .or_else(|| self.identifier.get_domain_for_ip(tuple.dst_ip));
        let geo = self.geo.lookup(tuple.dst_ip).unwrap_or_default();

        let rtt = if record.rtt_samples.is_empty() {
            None
        } else {
            Some(record.rtt_samples.iter().sum::<i64>() / record.rtt_samples.len() as i64)
        };

        let tcp_flags = (tuple.protocol == Protocol::Tcp && !record.tcp_flags.is_empty())
            .then(|| record.tcp_flags.names());

        NetworkFlow {
            id: record.id,
            timestamp: record.first_seen,
            src_ip: tuple.src_ip.to_string(),
            src_port: tuple.src_port,
            dst_ip: tuple.dst_ip.to_string(),
            dst_port: tuple.dst_port,
            protocol: tuple.protocol,
            bytes_in: record.bytes_in,
            bytes_out: record.bytes_out,
            packets_in: record.packets_in,
            packets_out: record.packets_out,
            duration: record.last_seen - record.first_seen,
            status: FlowStatus::Closed,
            country: geo.country,
            city: geo.city,
            asn: geo.asn,
            domain,
            sni: record.meta.sni,
            threat_level: ThreatLevel::Safe,
            device_id: record.device_id,
            tcp_flags,
            ttl: record.ttl_min,
            connection_state: record.connection_state.map(|s| s.as_str().to_string()),
            rtt,
            retransmissions: (record.retransmissions > 0).then_some(record.retransmissions),
            jitter: record.jitter,
            application: record.meta.application,
            user_agent: record.meta.user_agent,
            http_method: record.meta.http_method,
            url: record.meta.url,
            dns_query_type: record.meta.dns_query_type,
            dns_response_code: record.meta.dns_response_code,
        }
    }

    /// Idle sweeper: every tick, move flows idle past the timeout out of the
    /// table (under the lock) and finalize them outside it.
    async fn run_sweeper(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.sweep_interval_s.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let now_ms = Utc::now().timestamp_millis();
            let idle_ms = (self.config.idle_timeout_s * 1000) as i64;
            let idle = self.table.lock().unwrap().take_idle(now_ms, idle_ms);
            if !idle.is_empty() {
                debug!(count = idle.len(), "Finalizing idle flows");
                self.finalize_flows(idle).await;
            }
        }
    }

    /// Batch writer: flush on the interval, when the queue fills past the
    /// batch size, or at shutdown.
    async fn run_writer(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.config.batch_interval_s.max(1))) => {}
                _ = self.writer_wakeup.notified() => {}
                _ = shutdown.changed() => break,
            }
            self.flush_writes().await;
        }
    }

    /// One bulk insert of everything queued, plus anything held back from a
    /// failed attempt. A batch survives exactly one failure; the second
    /// failure drops it so the queue cannot grow without bound.
    async fn flush_writes(&self) {
        let fresh = std::mem::take(&mut *self.write_queue.lock().unwrap());
        let retried = self.retry_batch.lock().unwrap().take();
        let had_retry = retried.is_some();

        let mut batch = retried.unwrap_or_default();
        batch.extend(fresh);
        if batch.is_empty() {
            return;
        }

        match flows::add_flows_batch(&self.db, &batch).await {
            Ok(()) => debug!(count = batch.len(), "Flushed flow batch"),
            Err(e) if had_retry => {
                self.write_errors.fetch_add(batch.len() as u64, Ordering::Relaxed);
                error!(
                    count = batch.len(),
                    "Dropping flow batch after failed retry: {e}"
                );
            }
            Err(e) => {
                warn!(
                    count = batch.len(),
                    "Flow batch write failed, holding for one retry: {e}"
                );
                *self.retry_batch.lock().unwrap() = Some(batch);
            }
        }
    }
}
