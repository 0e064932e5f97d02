//! Auxiliary identification helpers: passive DNS maps, reverse DNS with a
//! negative cache, ALPN and HTTP Host extraction, payload-signature DPI and
//! service banner fingerprinting.

use std::net::IpAddr;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hickory_resolver::TokioAsyncResolver;
use ipnetwork::IpNetwork;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::LruBatchCache;
use crate::config::IdentifyConfig;

/// Entries per bounded cache.
const CACHE_CAP: usize = 1_000;

/// Lifetime of a passive DNS or reverse DNS entry.
const CACHE_TTL: Duration = Duration::from_secs(3_600);

/// Fraction of the domain map evicted on overflow.
const EVICT_FRACTION: usize = 5;

/// Service banner captured from the first payload bytes of a connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceFingerprint {
    pub banner: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct DomainEntry {
    ips: Vec<IpAddr>,
    last_seen: Instant,
}

#[derive(Debug, Clone)]
struct ReverseEntry {
    /// `None` records a failed lookup so it is not retried for the TTL.
    hostname: Option<String>,
    cached_at: Instant,
}

/// Payload signatures for application detection, checked in order against
/// the first 200 bytes.
static APP_PATTERNS: &[(&str, &[u8])] = &[
    ("SSH", b"SSH-"),
    ("SSH", b"OpenSSH"),
    ("FTP", b"220 "),
    ("SMTP", b"250 "),
    ("POP3", b"+OK"),
    ("IMAP", b"* OK"),
    ("BitTorrent", b"\x13BitTorrent"),
    ("Git", b"git-upload-pack"),
];

const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub struct EnhancedIdentifier {
    config: IdentifyConfig,
    ttl: Duration,
    domains: DashMap<String, DomainEntry>,
    reverse: Mutex<LruBatchCache<IpAddr, ReverseEntry>>,
    fingerprints: Mutex<LruBatchCache<String, ServiceFingerprint>>,
    resolver: Option<TokioAsyncResolver>,
}

impl EnhancedIdentifier {
    pub fn new(config: IdentifyConfig) -> Self {
        Self::with_ttl(config, CACHE_TTL)
    }

    fn with_ttl(config: IdentifyConfig, ttl: Duration) -> Self {
        let resolver = if config.reverse_dns_enabled {
            match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(error = %e, "Failed to load system DNS config; reverse DNS disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            config,
            ttl,
            domains: DashMap::new(),
            reverse: Mutex::new(LruBatchCache::new(CACHE_CAP)),
            fingerprints: Mutex::new(LruBatchCache::new(CACHE_CAP)),
            resolver,
        }
    }

    /// Record that a DNS answer mapped `domain` to `ip`.
    pub fn track_dns_query(&self, domain: &str, ip: IpAddr) {
        let mut entry = self
            .domains
            .entry(domain.to_string())
            .or_insert_with(|| DomainEntry {
                ips: Vec::new(),
                last_seen: Instant::now(),
            });
        if !entry.ips.contains(&ip) {
            entry.ips.push(ip);
        }
        entry.last_seen = Instant::now();
        drop(entry);

        self.evict_domains();
    }

    /// Drop expired entries and, past capacity, the oldest fifth of the map.
    fn evict_domains(&self) {
        let ttl = self.ttl;
        self.domains.retain(|_, e| e.last_seen.elapsed() < ttl);

        if self.domains.len() <= CACHE_CAP {
            return;
        }
        let mut by_age: Vec<(String, Instant)> = self
            .domains
            .iter()
            .map(|e| (e.key().clone(), e.value().last_seen))
            .collect();
        by_age.sort_by_key(|(_, seen)| *seen);
        let evict = by_age.len() / EVICT_FRACTION;
        for (domain, _) in by_age.into_iter().take(evict.max(1)) {
            self.domains.remove(&domain);
        }
    }

    /// The most recently seen live domain that resolved to `ip`.
    pub fn get_domain_for_ip(&self, ip: IpAddr) -> Option<String> {
        let mut best: Option<(String, Instant)> = None;
        for entry in self.domains.iter() {
            if entry.value().last_seen.elapsed() >= self.ttl {
                continue;
            }
            if entry.value().ips.contains(&ip) {
                let newer = match &best {
                    Some((_, seen)) => entry.value().last_seen > *seen,
                    None => true,
                };
                if newer {
                    best = Some((entry.key().clone(), entry.value().last_seen));
                }
            }
        }
        best.map(|(domain, _)| domain)
    }

    /// Reverse (PTR) lookup with timeout, bounded retries and a negative
    /// cache. Local and loopback addresses short-circuit to `None`.
    pub async fn reverse_dns(&self, ip: IpAddr) -> Option<String> {
        let resolver = self.resolver.as_ref()?;
        if is_local_ip(ip) {
            return None;
        }

        if let Some(entry) = self.reverse.lock().unwrap().get(&ip) {
            if entry.cached_at.elapsed() < self.ttl {
                return entry.hostname.clone();
            }
        }

        let timeout = Duration::from_secs(self.config.reverse_dns_timeout_s);
        for attempt in 0..self.config.reverse_dns_retries.max(1) {
            match tokio::time::timeout(timeout, resolver.reverse_lookup(ip)).await {
                Ok(Ok(lookup)) => {
                    if let Some(name) = lookup.iter().next() {
                        let hostname = name.to_string().trim_end_matches('.').to_string();
                        if !hostname.is_empty() && hostname != ip.to_string() {
                            self.reverse.lock().unwrap().put(
                                ip,
                                ReverseEntry {
                                    hostname: Some(hostname.clone()),
                                    cached_at: Instant::now(),
                                },
                            );
                            return Some(hostname);
                        }
                    }
                    break;
                }
                Ok(Err(e)) => {
                    debug!(ip = %ip, attempt, "Reverse DNS lookup failed: {e}");
                }
                Err(_) => {
                    debug!(ip = %ip, attempt, "Reverse DNS lookup timed out");
                }
            }
            tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt + 1))).await;
        }

        // Remember the failure so the address is not retried for a while.
        self.reverse.lock().unwrap().put(
            ip,
            ReverseEntry {
                hostname: None,
                cached_at: Instant::now(),
            },
        );
        None
    }

    /// Host header from an HTTP request payload.
    pub fn extract_http_host(&self, payload: &[u8]) -> Option<String> {
        if !self.config.enable_http_host {
            return None;
        }
        for line in payload.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if let Some(rest) = line.strip_prefix(b"Host:") {
                let host = String::from_utf8_lossy(rest).trim().to_string();
                if !host.is_empty() {
                    return Some(host);
                }
            }
        }
        None
    }

    /// Protocol names from the ALPN extension (0x0010) of a TLS ClientHello.
    pub fn extract_tls_alpn(&self, payload: &[u8]) -> Option<Vec<String>> {
        if !self.config.enable_alpn {
            return None;
        }
        let start = payload.windows(2).position(|w| w == [0x00, 0x10])?;
        let ext_len = be16(payload, start + 2)? as usize;
        if ext_len < 2 {
            return None;
        }
        let list_len = be16(payload, start + 4)? as usize;
        if list_len < 1 {
            return None;
        }

        let mut protocols = Vec::new();
        let mut offset = start + 6;
        let mut remaining = list_len;
        while remaining > 0 && offset < payload.len() {
            let proto_len = payload[offset] as usize;
            if proto_len == 0 || offset + 1 + proto_len > payload.len() {
                break;
            }
            let proto = String::from_utf8_lossy(&payload[offset + 1..offset + 1 + proto_len]);
            protocols.push(proto.into_owned());
            offset += 1 + proto_len;
            remaining = remaining.saturating_sub(1 + proto_len);
        }

        if protocols.is_empty() {
            None
        } else {
            Some(protocols)
        }
    }

    /// Application detection from payload signatures.
    pub fn detect_application_dpi(&self, payload: &[u8]) -> Option<&'static str> {
        if !self.config.enable_dpi || payload.is_empty() {
            return None;
        }
        let head = &payload[..payload.len().min(200)];

        if head.starts_with(HTTP2_PREFACE) {
            return Some("HTTP/2");
        }
        for (name, pattern) in APP_PATTERNS {
            if head.windows(pattern.len()).any(|w| w == *pattern) {
                return Some(name);
            }
        }
        None
    }

    /// Grab the first printable run of the payload as a service banner and
    /// memoize it per endpoint.
    pub fn fingerprint_service(
        &self,
        payload: &[u8],
        ip: IpAddr,
        port: u16,
    ) -> Option<ServiceFingerprint> {
        let head = &payload[..payload.len().min(500)];
        let banner = first_printable_run(head, 4)?;
        let fingerprint = ServiceFingerprint {
            banner: banner.chars().take(100).collect(),
            port,
        };
        self.fingerprints
            .lock()
            .unwrap()
            .put(format!("{ip}:{port}"), fingerprint.clone());
        Some(fingerprint)
    }

    /// Cached banner for an endpoint, if one was ever captured.
    pub fn service_fingerprint(&self, ip: IpAddr, port: u16) -> Option<ServiceFingerprint> {
        self.fingerprints
            .lock()
            .unwrap()
            .get(&format!("{ip}:{port}"))
            .cloned()
    }
}

fn be16(buf: &[u8], offset: usize) -> Option<u16> {
    if offset + 2 > buf.len() {
        return None;
    }
    Some(u16::from_be_bytes([buf[offset], buf[offset + 1]]))
}

fn first_printable_run(buf: &[u8], min_len: usize) -> Option<String> {
    let mut start = None;
    for (i, &b) in buf.iter().enumerate() {
        if (0x20..=0x7e).contains(&b) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            if i - s >= min_len {
                return Some(String::from_utf8_lossy(&buf[s..i]).into_owned());
            }
        }
    }
    if let Some(s) = start {
        if buf.len() - s >= min_len {
            return Some(String::from_utf8_lossy(&buf[s..]).into_owned());
        }
    }
    None
}

static LOCAL_NETS: OnceLock<Vec<IpNetwork>> = OnceLock::new();

/// Private, loopback and link-local ranges that never get reverse lookups.
pub fn is_local_ip(ip: IpAddr) -> bool {
    let nets = LOCAL_NETS.get_or_init(|| {
        [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "169.254.0.0/16",
            "::1/128",
            "fe80::/10",
        ]
        .iter()
        .map(|n| n.parse().expect("static network"))
        .collect()
    });
    nets.iter().any(|net| net.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_identifier() -> EnhancedIdentifier {
        let config = IdentifyConfig {
            reverse_dns_enabled: false,
            ..Default::default()
        };
        EnhancedIdentifier::new(config)
    }

    #[test]
    fn test_track_and_lookup_domain() {
        let identifier = test_identifier();
        let ip: IpAddr = "93.184.216.34".parse().unwrap();

        assert_eq!(identifier.get_domain_for_ip(ip), None);
        identifier.track_dns_query("example.com", ip);
        assert_eq!(
            identifier.get_domain_for_ip(ip),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn test_latest_mapping_wins() {
        let identifier = test_identifier();
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        identifier.track_dns_query("old.example.com", ip);
        std::thread::sleep(Duration::from_millis(5));
        identifier.track_dns_query("new.example.com", ip);

        assert_eq!(
            identifier.get_domain_for_ip(ip),
            Some("new.example.com".to_string())
        );
    }

    #[test]
    fn test_domain_ttl_expiry() {
        let config = IdentifyConfig {
            reverse_dns_enabled: false,
            ..Default::default()
        };
        let identifier = EnhancedIdentifier::with_ttl(config, Duration::from_millis(10));
        let ip: IpAddr = "1.2.3.4".parse().unwrap();

        identifier.track_dns_query("example.com", ip);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(identifier.get_domain_for_ip(ip), None);
    }

    #[tokio::test]
    async fn test_reverse_dns_disabled() {
        let identifier = test_identifier();
        assert_eq!(
            identifier.reverse_dns("8.8.8.8".parse().unwrap()).await,
            None
        );
    }

    #[test]
    fn test_is_local_ip() {
        for local in [
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "::1",
            "fe80::1",
        ] {
            assert!(is_local_ip(local.parse().unwrap()), "{local} should be local");
        }
        for public in ["8.8.8.8", "172.32.0.1", "93.184.216.34", "2606:2800:220:1::1"] {
            assert!(
                !is_local_ip(public.parse().unwrap()),
                "{public} should be public"
            );
        }
    }

    #[test]
    fn test_extract_http_host() {
        let identifier = test_identifier();
        let payload = b"GET / HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8\r\n\r\n";
        assert_eq!(
            identifier.extract_http_host(payload),
            Some("example.com".to_string())
        );
        assert_eq!(identifier.extract_http_host(b"no headers here"), None);
    }

    #[test]
    fn test_extract_tls_alpn() {
        let identifier = test_identifier();
        // ALPN extension: type 0x0010, ext_len 14, list_len 12,
        // then "h2" and "http/1.1" with length prefixes.
        let mut payload = vec![0u8; 4];
        payload.extend_from_slice(&[0x00, 0x10, 0x00, 0x0e, 0x00, 0x0c]);
        payload.push(2);
        payload.extend_from_slice(b"h2");
        payload.push(8);
        payload.extend_from_slice(b"http/1.1");

        let protos = identifier.extract_tls_alpn(&payload).unwrap();
        assert_eq!(protos, vec!["h2".to_string(), "http/1.1".to_string()]);

        assert_eq!(identifier.extract_tls_alpn(b"nothing"), None);
    }

    #[test]
    fn test_detect_application_dpi() {
        let identifier = test_identifier();
        assert_eq!(
            identifier.detect_application_dpi(b"SSH-2.0-OpenSSH_9.6"),
            Some("SSH")
        );
        assert_eq!(
            identifier.detect_application_dpi(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"),
            Some("HTTP/2")
        );
        assert_eq!(
            identifier.detect_application_dpi(b"\x13BitTorrent protocol"),
            Some("BitTorrent")
        );
        assert_eq!(identifier.detect_application_dpi(&[0u8; 64]), None);
    }

    #[test]
    fn test_fingerprint_service() {
        let identifier = test_identifier();
        let ip: IpAddr = "10.0.0.9".parse().unwrap();

        let fp = identifier
            .fingerprint_service(b"SSH-2.0-OpenSSH_9.6p1 Debian\r\n", ip, 22)
            .unwrap();
        assert!(fp.banner.starts_with("SSH-2.0-OpenSSH"));
        assert_eq!(fp.port, 22);

        // Memoized per endpoint.
        let cached = identifier.service_fingerprint(ip, 22).unwrap();
        assert_eq!(cached, fp);
        assert!(identifier.service_fingerprint(ip, 23).is_none());

        // All-binary payload produces no banner.
        assert!(identifier
            .fingerprint_service(&[0u8, 1, 2, 3], ip, 9999)
            .is_none());
    }
}
