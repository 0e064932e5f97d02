//! Frame decoding and the stage-1 helpers: the deterministic sampler, the
//! short-lived duplicate window and the interned flow-key cache.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use etherparse::{IpHeader, PacketHeaders, TcpHeader, TransportHeader};

use crate::db::flows::Protocol;
use crate::devices::ArpObservation;
use crate::error::Error;

pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Union of TCP flags seen, packed into a byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn from_tcp(header: &TcpHeader) -> Self {
        let mut bits = 0u8;
        if header.fin {
            bits |= Self::FIN;
        }
        if header.syn {
            bits |= Self::SYN;
        }
        if header.rst {
            bits |= Self::RST;
        }
        if header.psh {
            bits |= Self::PSH;
        }
        if header.ack {
            bits |= Self::ACK;
        }
        if header.urg {
            bits |= Self::URG;
        }
        Self(bits)
    }

    pub fn union(&mut self, other: TcpFlags) {
        self.0 |= other.0;
    }

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }
    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }
    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }
    pub fn psh(&self) -> bool {
        self.0 & Self::PSH != 0
    }
    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }
    pub fn urg(&self) -> bool {
        self.0 & Self::URG != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (bit, name) in [
            (Self::SYN, "SYN"),
            (Self::ACK, "ACK"),
            (Self::FIN, "FIN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::URG, "URG"),
        ] {
            if self.0 & bit != 0 {
                names.push(name.to_string());
            }
        }
        names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpInfo {
    pub flags: TcpFlags,
    pub seq: u32,
}

/// One captured frame reduced to what the classifier needs.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub ttl: u8,
    pub is_ipv6: bool,
    pub src_mac: Option<String>,
    pub tcp: Option<TcpInfo>,
    pub payload: Vec<u8>,
    /// Full frame length, which is what the byte counters account.
    pub size: usize,
}

/// Result of decoding one frame.
#[derive(Debug, Clone)]
pub enum Decoded {
    Flow(ParsedPacket),
    Arp(ArpObservation),
    /// Not something the pipeline tracks (non-IP, port-less TCP, etc).
    Ignored,
}

/// Decode an Ethernet frame down to L4. ARP is diverted to device
/// discovery; anything that is not IP over TCP/UDP/ICMP is ignored.
pub fn decode_frame(data: &[u8]) -> Result<Decoded, Error> {
    let headers =
        PacketHeaders::from_ethernet_slice(data).map_err(|e| Error::Parse(e.to_string()))?;

    if let Some(ref eth) = headers.link {
        if eth.ether_type == ETHERTYPE_ARP {
            return Ok(match parse_arp(headers.payload) {
                Some(arp) => Decoded::Arp(arp),
                None => Decoded::Ignored,
            });
        }
    }
    let src_mac = headers.link.as_ref().map(|eth| format_mac(&eth.source));

    let (src_ip, dst_ip, ttl, is_ipv6) = match &headers.ip {
        Some(IpHeader::Version4(h, _)) => (
            IpAddr::from(h.source),
            IpAddr::from(h.destination),
            h.time_to_live,
            false,
        ),
        Some(IpHeader::Version6(h, _)) => (
            IpAddr::from(h.source),
            IpAddr::from(h.destination),
            h.hop_limit,
            true,
        ),
        None => return Ok(Decoded::Ignored),
    };

    let (protocol, src_port, dst_port, tcp) = match &headers.transport {
        Some(TransportHeader::Tcp(t)) => (
            Protocol::Tcp,
            t.source_port,
            t.destination_port,
            Some(TcpInfo {
                flags: TcpFlags::from_tcp(t),
                seq: t.sequence_number,
            }),
        ),
        Some(TransportHeader::Udp(u)) => (Protocol::Udp, u.source_port, u.destination_port, None),
        Some(TransportHeader::Icmpv4(_)) | Some(TransportHeader::Icmpv6(_)) => {
            (Protocol::Icmp, 0, 0, None)
        }
        None => return Ok(Decoded::Ignored),
    };

    if matches!(protocol, Protocol::Tcp | Protocol::Udp) && (src_port == 0 || dst_port == 0) {
        return Ok(Decoded::Ignored);
    }

    Ok(Decoded::Flow(ParsedPacket {
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        protocol,
        ttl,
        is_ipv6,
        src_mac,
        tcp,
        payload: headers.payload.to_vec(),
        size: data.len(),
    }))
}

/// Decode an IPv4-over-Ethernet ARP payload (28 bytes).
fn parse_arp(payload: &[u8]) -> Option<ArpObservation> {
    if payload.len() < 28 {
        return None;
    }
    let ptype = u16::from_be_bytes([payload[2], payload[3]]);
    let plen = payload[5];
    if ptype != 0x0800 || plen != 4 {
        return None;
    }
    let operation = u16::from_be_bytes([payload[6], payload[7]]);
    let sender_mac = format_mac(&payload[8..14].try_into().ok()?);
    let sender_ip = format!(
        "{}.{}.{}.{}",
        payload[14], payload[15], payload[16], payload[17]
    );
    Some(ArpObservation {
        operation,
        sender_mac,
        sender_ip,
    })
}

fn format_mac(bytes: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}

/// Bidirectional 5-tuple identity of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: Protocol,
}

impl FlowTuple {
    pub fn from_packet(pkt: &ParsedPacket) -> Self {
        Self {
            src_ip: pkt.src_ip,
            src_port: pkt.src_port,
            dst_ip: pkt.dst_ip,
            dst_port: pkt.dst_port,
            protocol: pkt.protocol,
        }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }

    /// Canonical string form used as the flow table key.
    pub fn canonical_string(&self) -> String {
        format!(
            "{}:{}-{}:{}-{}",
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.protocol.as_str()
        )
    }
}

/// Deterministic uniform sampler: keeps every ceil(1/rate)-th packet.
pub struct Sampler {
    keep_every: u64,
    counter: AtomicU64,
}

impl Sampler {
    pub fn new(rate: f64) -> Self {
        let keep_every = if rate >= 1.0 {
            1
        } else {
            (1.0 / rate).ceil() as u64
        };
        Self {
            keep_every: keep_every.max(1),
            counter: AtomicU64::new(0),
        }
    }

    pub fn keep(&self) -> bool {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n % self.keep_every == 0
    }
}

/// Short-lived duplicate detector over `(capture_timestamp, length)`.
///
/// Entries expire after the window; on overflow the oldest fifth is dropped.
pub struct DedupWindow {
    cap: usize,
    window_ms: u64,
    entries: HashMap<u64, i64>,
    order: VecDeque<(u64, i64)>,
}

impl DedupWindow {
    pub fn new(cap: usize, window_ms: u64) -> Self {
        Self {
            cap,
            window_ms,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn is_duplicate(&mut self, ts_ms: i64, len: usize) -> bool {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        (ts_ms, len).hash(&mut hasher);
        let key = hasher.finish();

        // Age out entries beyond the window.
        while let Some(&(front_key, front_ts)) = self.order.front() {
            if ts_ms.saturating_sub(front_ts) > self.window_ms as i64 {
                self.order.pop_front();
                self.entries.remove(&front_key);
            } else {
                break;
            }
        }

        if self.entries.contains_key(&key) {
            return true;
        }

        if self.entries.len() >= self.cap {
            let evict = (self.cap / 5).max(1);
            for _ in 0..evict {
                if let Some((old_key, _)) = self.order.pop_front() {
                    self.entries.remove(&old_key);
                }
            }
        }

        self.entries.insert(key, ts_ms);
        self.order.push_back((key, ts_ms));
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Interned canonical key strings, evicted in insertion order.
pub struct KeyCache {
    cap: usize,
    map: HashMap<FlowTuple, Arc<str>>,
    order: VecDeque<FlowTuple>,
}

impl KeyCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn canonical(&mut self, tuple: &FlowTuple) -> Arc<str> {
        if let Some(key) = self.map.get(tuple) {
            return key.clone();
        }
        if self.map.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.map.remove(&oldest);
            }
        }
        let key: Arc<str> = Arc::from(tuple.canonical_string());
        self.map.insert(*tuple, key.clone());
        self.order.push_back(*tuple);
        key
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
