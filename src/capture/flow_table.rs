//! The active flow table: bounded, keyed by the interned canonical string,
//! with reverse-tuple lookup and oldest-first batch eviction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::capture::l7::Metadata;
use crate::capture::packet::{FlowTuple, TcpFlags};
use crate::capture::quality::ConnState;

/// In-progress state of one bidirectional flow.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub id: String,
    pub key: Arc<str>,
    pub tuple: FlowTuple,
    pub device_id: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub packets_in: i64,
    pub packets_out: i64,
    /// Minimum TTL observed across the flow's lifetime.
    pub ttl_min: Option<u8>,
    /// Union of all TCP flags observed.
    pub tcp_flags: TcpFlags,
    pub connection_state: Option<ConnState>,
    pub retransmissions: i64,
    /// Last few per-packet RTT estimates; averaged at finalization.
    pub rtt_samples: Vec<i64>,
    pub jitter: Option<f64>,
    pub meta: Metadata,
}

/// Maximum RTT samples kept per flow.
pub const RTT_SAMPLES_PER_FLOW: usize = 5;

impl FlowRecord {
    pub fn new(id: String, key: Arc<str>, tuple: FlowTuple, device_id: String, ts_ms: i64) -> Self {
        Self {
            id,
            key,
            tuple,
            device_id,
            first_seen: ts_ms,
            last_seen: ts_ms,
            bytes_in: 0,
            bytes_out: 0,
            packets_in: 0,
            packets_out: 0,
            ttl_min: None,
            tcp_flags: TcpFlags::default(),
            connection_state: None,
            retransmissions: 0,
            rtt_samples: Vec::new(),
            jitter: None,
            meta: Metadata::default(),
        }
    }

    /// Account one packet in the given direction.
    pub fn add_packet(&mut self, size: i64, incoming: bool, ts_ms: i64) {
        if incoming {
            self.bytes_in += size;
            self.packets_in += 1;
        } else {
            self.bytes_out += size;
            self.packets_out += 1;
        }
        if ts_ms > self.last_seen {
            self.last_seen = ts_ms;
        }
    }

    pub fn observe_ttl(&mut self, ttl: u8) {
        self.ttl_min = Some(match self.ttl_min {
            Some(current) => current.min(ttl),
            None => ttl,
        });
    }

    pub fn push_rtt(&mut self, rtt_ms: i64) {
        self.rtt_samples.push(rtt_ms);
        if self.rtt_samples.len() > RTT_SAMPLES_PER_FLOW {
            let drop = self.rtt_samples.len() - RTT_SAMPLES_PER_FLOW;
            self.rtt_samples.drain(..drop);
        }
    }

    pub fn duration(&self) -> i64 {
        self.last_seen - self.first_seen
    }
}

/// Bounded table of active flows.
pub struct FlowTable {
    cap: usize,
    flows: HashMap<Arc<str>, FlowRecord>,
}

impl FlowTable {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            flows: HashMap::new(),
        }
    }

    /// Find the flow for a key or its reverse.
    pub fn lookup_mut(&mut self, key: &Arc<str>, reverse: &Arc<str>) -> Option<&mut FlowRecord> {
        if self.flows.contains_key(key) {
            self.flows.get_mut(key)
        } else {
            self.flows.get_mut(reverse)
        }
    }

    /// Insert a new flow. When the table is at capacity, the fifth of flows
    /// with the oldest `last_seen` is removed first and returned so the
    /// caller can finalize them instead of losing the data.
    pub fn insert(&mut self, record: FlowRecord) -> Vec<FlowRecord> {
        let mut evicted = Vec::new();
        if self.flows.len() >= self.cap {
            let mut by_age: Vec<(Arc<str>, i64)> = self
                .flows
                .iter()
                .map(|(k, v)| (k.clone(), v.last_seen))
                .collect();
            by_age.sort_by_key(|(_, last_seen)| *last_seen);
            let count = (self.cap / 5).max(1);
            for (key, _) in by_age.into_iter().take(count) {
                if let Some(record) = self.flows.remove(&key) {
                    evicted.push(record);
                }
            }
        }
        self.flows.insert(record.key.clone(), record);
        evicted
    }

    /// Remove and return every flow idle for longer than `idle_ms`.
    pub fn take_idle(&mut self, now_ms: i64, idle_ms: i64) -> Vec<FlowRecord> {
        let idle_keys: Vec<Arc<str>> = self
            .flows
            .iter()
            .filter(|(_, record)| now_ms - record.last_seen > idle_ms)
            .map(|(key, _)| key.clone())
            .collect();
        idle_keys
            .into_iter()
            .filter_map(|key| self.flows.remove(&key))
            .collect()
    }

    /// Remove and return everything (shutdown path).
    pub fn drain_all(&mut self) -> Vec<FlowRecord> {
        self.flows.drain().map(|(_, record)| record).collect()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
