//! Best-effort L7 metadata extraction.
//!
//! Extractors are independent pure functions from packet context to partial
//! metadata, composed by a right-biased merge: adding one means appending to
//! [`default_extractors`], nothing else. A parse failure yields empty
//! metadata and never affects flow accounting.

use std::net::IpAddr;

use crate::db::flows::Protocol;

/// TCP ports where a raw TLS ClientHello scan is attempted.
const TLS_PORTS: [u16; 4] = [443, 8443, 993, 995];

/// TCP ports treated as HTTP for request-line extraction.
const HTTP_PORTS: [u16; 4] = [80, 8080, 8000, 8888];

/// Well-known port to application tags.
const PORT_APPLICATIONS: &[(u16, &str)] = &[
    (21, "FTP"),
    (22, "SSH"),
    (25, "SMTP"),
    (53, "DNS"),
    (80, "HTTP"),
    (110, "POP3"),
    (143, "IMAP"),
    (443, "HTTPS"),
    (993, "IMAPS"),
    (995, "POP3S"),
    (3306, "MySQL"),
    (3389, "RDP"),
    (5432, "PostgreSQL"),
    (5900, "VNC"),
];

/// Partial flow metadata produced by one extractor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub domain: Option<String>,
    pub sni: Option<String>,
    pub application: Option<String>,
    pub http_method: Option<String>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub dns_query_type: Option<String>,
    pub dns_response_code: Option<String>,
}

impl Metadata {
    /// Right-biased merge: fields set in `newer` win.
    pub fn merge(mut self, newer: Metadata) -> Metadata {
        if newer.domain.is_some() {
            self.domain = newer.domain;
        }
        if newer.sni.is_some() {
            self.sni = newer.sni;
        }
        if newer.application.is_some() {
            self.application = newer.application;
        }
        if newer.http_method.is_some() {
            self.http_method = newer.http_method;
        }
        if newer.url.is_some() {
            self.url = newer.url;
        }
        if newer.user_agent.is_some() {
            self.user_agent = newer.user_agent;
        }
        if newer.dns_query_type.is_some() {
            self.dns_query_type = newer.dns_query_type;
        }
        if newer.dns_response_code.is_some() {
            self.dns_response_code = newer.dns_response_code;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Metadata::default()
    }
}

/// What an extractor gets to look at.
pub struct ExtractCtx<'a> {
    pub payload: &'a [u8],
    pub protocol: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
}

pub type Extractor = fn(&ExtractCtx) -> Metadata;

/// The extractor set run against every packet.
pub fn default_extractors() -> Vec<Extractor> {
    vec![extract_dns, extract_tls_sni, extract_http, extract_application]
}

/// Fold all extractors over a packet, later extractors winning on conflict.
pub fn run_extractors(extractors: &[Extractor], ctx: &ExtractCtx) -> Metadata {
    extractors
        .iter()
        .fold(Metadata::default(), |acc, extract| acc.merge(extract(ctx)))
}

// ---------------------------------------------------------------------------
// DNS
// ---------------------------------------------------------------------------

/// A parsed DNS message, reduced to what the pipeline consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsMessage {
    pub is_response: bool,
    pub query_name: Option<String>,
    pub query_type: Option<String>,
    pub response_code: Option<String>,
    /// A/AAAA answer addresses. CNAME chains collapse onto the queried name,
    /// so every address maps to `query_name`.
    pub answers: Vec<IpAddr>,
}

fn query_type_name(qtype: u16) -> String {
    match qtype {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        other => format!("TYPE{other}"),
    }
}

fn response_code_name(rcode: u8) -> String {
    match rcode {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        other => format!("RCODE{other}"),
    }
}

/// Read a possibly-compressed DNS name starting at `offset`. Returns the
/// name and the offset just past it in the original read position.
fn read_dns_name(buf: &[u8], offset: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut jumped = false;
    let mut end = offset;
    let mut hops = 0;

    loop {
        let len = *buf.get(pos)? as usize;
        if len == 0 {
            if !jumped {
                end = pos + 1;
            }
            break;
        }
        // Compression pointer: two bytes, high bits set.
        if len & 0xc0 == 0xc0 {
            let low = *buf.get(pos + 1)? as usize;
            if !jumped {
                end = pos + 2;
            }
            pos = ((len & 0x3f) << 8) | low;
            jumped = true;
            hops += 1;
            if hops > 8 {
                return None;
            }
            continue;
        }
        if len > 63 || pos + 1 + len > buf.len() {
            return None;
        }
        labels.push(String::from_utf8_lossy(&buf[pos + 1..pos + 1 + len]).into_owned());
        pos += 1 + len;
        if labels.len() > 64 {
            return None;
        }
    }

    Some((labels.join("."), end))
}

/// Parse a DNS message from a UDP payload. Returns `None` on anything
/// malformed; extraction never fails the packet.
pub fn parse_dns(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < 12 {
        return None;
    }
    let flags = u16::from_be_bytes([payload[2], payload[3]]);
    let is_response = flags & 0x8000 != 0;
    let rcode = (flags & 0x000f) as u8;
    let qdcount = u16::from_be_bytes([payload[4], payload[5]]);
    let ancount = u16::from_be_bytes([payload[6], payload[7]]);

    let mut pos = 12;
    let mut query_name = None;
    let mut query_type = None;

    for _ in 0..qdcount {
        let (name, after) = read_dns_name(payload, pos)?;
        if after + 4 > payload.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([payload[after], payload[after + 1]]);
        if query_name.is_none() {
            query_name = Some(name);
            query_type = Some(query_type_name(qtype));
        }
        pos = after + 4;
    }

    let mut answers = Vec::new();
    if is_response {
        for _ in 0..ancount {
            let (_, after) = read_dns_name(payload, pos)?;
            if after + 10 > payload.len() {
                break;
            }
            let rtype = u16::from_be_bytes([payload[after], payload[after + 1]]);
            let rdlength =
                u16::from_be_bytes([payload[after + 8], payload[after + 9]]) as usize;
            let rdata_start = after + 10;
            if rdata_start + rdlength > payload.len() {
                break;
            }
            match (rtype, rdlength) {
                (1, 4) => {
                    let octets: [u8; 4] =
                        payload[rdata_start..rdata_start + 4].try_into().ok()?;
                    answers.push(IpAddr::from(octets));
                }
                (28, 16) => {
                    let octets: [u8; 16] =
                        payload[rdata_start..rdata_start + 16].try_into().ok()?;
                    answers.push(IpAddr::from(octets));
                }
                _ => {}
            }
            pos = rdata_start + rdlength;
        }
    }

    Some(DnsMessage {
        is_response,
        query_name,
        query_type,
        response_code: is_response.then(|| response_code_name(rcode)),
        answers,
    })
}

/// DNS metadata extractor: query name, type and response code.
pub fn extract_dns(ctx: &ExtractCtx) -> Metadata {
    if ctx.protocol != Protocol::Udp || (ctx.src_port != 53 && ctx.dst_port != 53) {
        return Metadata::default();
    }
    let Some(msg) = parse_dns(ctx.payload) else {
        return Metadata::default();
    };
    Metadata {
        domain: msg.query_name,
        dns_query_type: msg.query_type,
        dns_response_code: msg.response_code,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// TLS SNI
// ---------------------------------------------------------------------------

fn be16(buf: &[u8], offset: usize) -> Option<usize> {
    if offset + 2 > buf.len() {
        return None;
    }
    Some(u16::from_be_bytes([buf[offset], buf[offset + 1]]) as usize)
}

fn plausible_hostname(name: &str) -> bool {
    name.contains('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

/// Walk a TLS ClientHello record to the server_name extension (0x0000).
fn parse_client_hello_sni(payload: &[u8]) -> Option<String> {
    // TLS record: content type 22 (handshake), version, length.
    if payload.len() < 5 || payload[0] != 0x16 {
        return None;
    }
    // Handshake type 1 (ClientHello), 3-byte length, then the body.
    if payload.get(5) != Some(&0x01) {
        return None;
    }
    let mut pos = 9; // record header (5) + handshake header (4)
    pos += 2 + 32; // client version + random

    let session_id_len = *payload.get(pos)? as usize;
    pos += 1 + session_id_len;

    let cipher_suites_len = be16(payload, pos)?;
    pos += 2 + cipher_suites_len;

    let compression_len = *payload.get(pos)? as usize;
    pos += 1 + compression_len;

    let extensions_len = be16(payload, pos)?;
    pos += 2;
    let extensions_end = (pos + extensions_len).min(payload.len());

    while pos + 4 <= extensions_end {
        let ext_type = be16(payload, pos)?;
        let ext_len = be16(payload, pos + 2)?;
        let ext_start = pos + 4;
        if ext_type == 0x0000 {
            // server_name_list length, entry type (0 = host_name), name length.
            let list_len = be16(payload, ext_start)?;
            if !(3..=256).contains(&list_len) {
                return None;
            }
            if payload.get(ext_start + 2) != Some(&0x00) {
                return None;
            }
            let name_len = be16(payload, ext_start + 3)?;
            if !(1..=255).contains(&name_len) {
                return None;
            }
            let name_start = ext_start + 5;
            if name_start + name_len > payload.len() {
                return None;
            }
            let name =
                String::from_utf8_lossy(&payload[name_start..name_start + name_len]).into_owned();
            return plausible_hostname(&name).then_some(name);
        }
        pos = ext_start + ext_len;
    }
    None
}

/// Fallback raw scan for the SNI extension with sane length checks.
fn scan_raw_sni(payload: &[u8]) -> Option<String> {
    let mut i = 0;
    while i + 9 <= payload.len() {
        if payload[i] == 0 && payload[i + 1] == 0 {
            if let (Some(list_len), Some(name_len)) = (be16(payload, i + 4), be16(payload, i + 7))
            {
                if (3..=256).contains(&list_len)
                    && (1..=255).contains(&name_len)
                    && payload.get(i + 6) == Some(&0x00)
                    && i + 9 + name_len <= payload.len()
                {
                    let name =
                        String::from_utf8_lossy(&payload[i + 9..i + 9 + name_len]).into_owned();
                    if plausible_hostname(&name) {
                        return Some(name);
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// SNI extractor: structured ClientHello walk first, raw scan as fallback,
/// both restricted to the usual TLS ports.
pub fn extract_tls_sni(ctx: &ExtractCtx) -> Metadata {
    if ctx.protocol != Protocol::Tcp
        || !(TLS_PORTS.contains(&ctx.dst_port) || TLS_PORTS.contains(&ctx.src_port))
    {
        return Metadata::default();
    }
    let sni = parse_client_hello_sni(ctx.payload).or_else(|| scan_raw_sni(ctx.payload));
    Metadata {
        sni,
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

const HTTP_METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// HTTP request extractor: method, path and User-Agent on the usual ports.
pub fn extract_http(ctx: &ExtractCtx) -> Metadata {
    if ctx.protocol != Protocol::Tcp
        || !(HTTP_PORTS.contains(&ctx.dst_port) || HTTP_PORTS.contains(&ctx.src_port))
    {
        return Metadata::default();
    }
    let payload = ctx.payload;
    let method = HTTP_METHODS
        .iter()
        .find(|m| {
            payload.len() > m.len()
                && payload.starts_with(m.as_bytes())
                && payload[m.len()] == b' '
        })
        .copied();
    let Some(method) = method else {
        return Metadata::default();
    };

    let mut meta = Metadata {
        application: Some("HTTP".to_string()),
        http_method: Some(method.to_string()),
        ..Default::default()
    };

    let mut lines = payload.split(|&b| b == b'\n');
    if let Some(request_line) = lines.next() {
        let request_line = String::from_utf8_lossy(request_line);
        if let Some(path) = request_line.split(' ').nth(1) {
            if !path.is_empty() {
                meta.url = Some(path.to_string());
            }
        }
    }
    for line in lines {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(rest) = line.strip_prefix(b"User-Agent:") {
            let agent = String::from_utf8_lossy(rest).trim().to_string();
            if !agent.is_empty() {
                meta.user_agent = Some(agent);
            }
            break;
        }
    }
    meta
}

// ---------------------------------------------------------------------------
// Application tag
// ---------------------------------------------------------------------------

/// Application extractor: the port table first, then payload signatures.
pub fn extract_application(ctx: &ExtractCtx) -> Metadata {
    let by_port = PORT_APPLICATIONS
        .iter()
        .find(|(port, _)| *port == ctx.dst_port)
        .or_else(|| {
            PORT_APPLICATIONS
                .iter()
                .find(|(port, _)| *port == ctx.src_port)
        })
        .map(|(_, app)| app.to_string());

    let application = by_port.or_else(|| {
        let head = &ctx.payload[..ctx.payload.len().min(100)];
        if ctx.payload.starts_with(b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n") {
            Some("HTTP/2".to_string())
        } else if head.windows(4).any(|w| w == b"SSH-") {
            Some("SSH".to_string())
        } else if head.windows(3).any(|w| w == b"FTP") {
            Some("FTP".to_string())
        } else if head.windows(4).any(|w| w == b"SMTP") {
            Some("SMTP".to_string())
        } else if ctx.payload.starts_with(b"\x13BitTorrent") {
            Some("BitTorrent".to_string())
        } else {
            None
        }
    });

    Metadata {
        application,
        ..Default::default()
    }
}
