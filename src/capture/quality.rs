//! Per-flow network quality tracking: RTT estimates from inter-arrival
//! intervals, jitter as the population standard deviation of successive
//! deltas, TCP retransmission detection and the connection state machine.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::cache::LruBatchCache;
use crate::capture::packet::TcpFlags;

/// Flow keys tracked for RTT and jitter.
const WINDOW_CACHE_CAP: usize = 5_000;

/// Distinct (flow, sequence number) pairs remembered for retransmission
/// detection.
const RETRANS_CACHE_CAP: usize = 10_000;

const RTT_WINDOW: usize = 10;
const JITTER_WINDOW: usize = 20;

const RTT_MIN_MS: i64 = 1;
const RTT_MAX_MS: i64 = 10_000;

/// Derived TCP connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    SynSent,
    SynReceived,
    Established,
    FinWait,
    Reset,
}

impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::SynSent => "SYN_SENT",
            ConnState::SynReceived => "SYN_RECEIVED",
            ConnState::Established => "ESTABLISHED",
            ConnState::FinWait => "FIN_WAIT",
            ConnState::Reset => "RESET",
        }
    }
}

/// Advance the connection state with the flags of one packet.
///
/// An ACK without SYN or FIN keeps (or establishes) the current state even
/// when RST rides along, so the routine RST+ACK teardown does not flag the
/// flow; only a bare RST reaches the RESET arm.
pub fn next_connection_state(flags: TcpFlags, current: Option<ConnState>) -> Option<ConnState> {
    if flags.is_empty() {
        return current;
    }
    if flags.syn() && !flags.ack() {
        return Some(ConnState::SynSent);
    }
    if flags.syn() && flags.ack() {
        return Some(ConnState::SynReceived);
    }
    if flags.ack() && !flags.fin() {
        return Some(match current {
            Some(ConnState::SynSent) | Some(ConnState::SynReceived) | None => {
                ConnState::Established
            }
            Some(state) => state,
        });
    }
    if flags.fin() {
        return Some(ConnState::FinWait);
    }
    if flags.rst() {
        return Some(ConnState::Reset);
    }
    current
}

/// Rolling quality windows keyed by flow. Each cache is bounded with the
/// oldest fifth evicted in a batch on overflow.
pub struct QualityTracker {
    rtt: LruBatchCache<Arc<str>, VecDeque<i64>>,
    jitter: LruBatchCache<Arc<str>, VecDeque<i64>>,
    retrans: LruBatchCache<(Arc<str>, u32), u32>,
}

impl QualityTracker {
    pub fn new() -> Self {
        Self {
            rtt: LruBatchCache::new(WINDOW_CACHE_CAP),
            jitter: LruBatchCache::new(WINDOW_CACHE_CAP),
            retrans: LruBatchCache::new(RETRANS_CACHE_CAP),
        }
    }

    /// Push a packet timestamp and estimate RTT as twice the mean
    /// inter-arrival interval, clamped to [1, 10000] ms. Needs at least two
    /// timestamps.
    pub fn record_rtt(&mut self, key: &Arc<str>, ts_ms: i64) -> Option<i64> {
        if !self.rtt.contains(key) {
            self.rtt.put(key.clone(), VecDeque::new());
        }
        let window = self.rtt.get_mut(key).unwrap();
        window.push_back(ts_ms);
        while window.len() > RTT_WINDOW {
            window.pop_front();
        }
        if window.len() < 2 {
            return None;
        }
        let intervals: Vec<i64> = window
            .iter()
            .zip(window.iter().skip(1))
            .map(|(a, b)| b - a)
            .collect();
        let mean = intervals.iter().sum::<i64>() as f64 / intervals.len() as f64;
        let rtt = (mean * 2.0) as i64;
        Some(rtt.clamp(RTT_MIN_MS, RTT_MAX_MS))
    }

    /// Push a packet timestamp and compute jitter as the population standard
    /// deviation of successive inter-arrival deltas, in ms rounded to two
    /// decimals. Needs at least three timestamps.
    pub fn record_jitter(&mut self, key: &Arc<str>, ts_ms: i64) -> Option<f64> {
        if !self.jitter.contains(key) {
            self.jitter.put(key.clone(), VecDeque::new());
        }
        let window = self.jitter.get_mut(key).unwrap();
        window.push_back(ts_ms);
        while window.len() > JITTER_WINDOW {
            window.pop_front();
        }
        if window.len() < 3 {
            return None;
        }
        let deltas: Vec<f64> = window
            .iter()
            .zip(window.iter().skip(1))
            .map(|(a, b)| (b - a) as f64)
            .collect();
        let mean = deltas.iter().sum::<f64>() / deltas.len() as f64;
        let variance =
            deltas.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / deltas.len() as f64;
        Some((variance.sqrt() * 100.0).round() / 100.0)
    }

    /// Whether this sequence number was already seen for the flow. The first
    /// sighting records it; any later sighting is a retransmission.
    pub fn record_retransmission(&mut self, key: &Arc<str>, seq: u32) -> bool {
        let cache_key = (key.clone(), seq);
        if let Some(count) = self.retrans.get_mut(&cache_key) {
            *count += 1;
            return true;
        }
        self.retrans.put(cache_key, 1);
        false
    }

    /// Drop a finalized flow's rolling windows. Sequence entries are left to
    /// age out of the LRU.
    pub fn forget(&mut self, key: &Arc<str>) {
        self.rtt.pop(key);
        self.jitter.pop(key);
    }
}

impl Default for QualityTracker {
    fn default() -> Self {
        Self::new()
    }
}
