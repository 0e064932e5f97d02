//! End-to-end pipeline scenarios: synthesized Ethernet frames are replayed
//! through the engine's ingest path and the persisted results are checked.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use etherparse::PacketBuilder;
use netsentry::capture::PacketSource;
use netsentry::config::AppConfig;
use netsentry::db;
use netsentry::db::flows::{FlowFilter, FlowStatus, Protocol, ThreatLevel};
use netsentry::db::threats::{Severity, ThreatType};
use netsentry::Services;

const CLIENT_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0x01];
const ROUTER_MAC: [u8; 6] = [0xaa, 0xbb, 0xcc, 0x00, 0x00, 0xfe];

const CLIENT_IP: [u8; 4] = [192, 168, 1, 10];
const SERVER_IP: [u8; 4] = [93, 184, 216, 34];

fn temp_db_path(tag: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir()
        .join(format!("netsentry-{tag}-{}-{nanos}.db", std::process::id()))
        .to_string_lossy()
        .into_owned()
}

fn test_config(tag: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.db_path = temp_db_path(tag);
    config.capture.batch_interval_s = 1;
    config.identify.reverse_dns_enabled = false;
    config
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as i64
}

fn cleanup_db(path: &str) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{path}{suffix}"));
    }
}

#[derive(Clone, Copy)]
enum Tf {
    Syn,
    SynAck,
    Ack,
    PshAck,
    Rst,
}

fn tcp_frame(
    src_mac: [u8; 6],
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    seq: u32,
    flags: Tf,
    payload: &[u8],
) -> Vec<u8> {
    let base = PacketBuilder::ethernet2(src_mac, ROUTER_MAC)
        .ipv4(src, dst, 64)
        .tcp(sport, dport, seq, 64_000);
    let step = match flags {
        Tf::Syn => base.syn(),
        Tf::SynAck => base.syn().ack(seq.wrapping_add(1)),
        Tf::Ack => base.ack(1),
        Tf::PshAck => base.psh().ack(1),
        Tf::Rst => base.rst(),
    };
    let mut frame = Vec::with_capacity(step.size(payload.len()));
    step.write(&mut frame, payload).unwrap();
    frame
}

fn udp_frame(
    src_mac: [u8; 6],
    src: [u8; 4],
    sport: u16,
    dst: [u8; 4],
    dport: u16,
    payload: &[u8],
) -> Vec<u8> {
    let builder = PacketBuilder::ethernet2(src_mac, ROUTER_MAC)
        .ipv4(src, dst, 64)
        .udp(sport, dport);
    let mut frame = Vec::with_capacity(builder.size(payload.len()));
    builder.write(&mut frame, payload).unwrap();
    frame
}

/// A minimal TLS ClientHello carrying an SNI extension for `host`.
fn client_hello(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let list_len = name.len() + 3;
    let mut ext = Vec::new();
    ext.extend_from_slice(&[0x00, 0x00]);
    ext.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
    ext.extend_from_slice(&(list_len as u16).to_be_bytes());
    ext.push(0x00);
    ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
    ext.extend_from_slice(name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0xab; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
    body.extend_from_slice(&ext);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

/// A DNS A response mapping `example.com` to 93.184.216.34.
fn dns_a_response() -> Vec<u8> {
    let mut msg = Vec::new();
    msg.extend_from_slice(&0x1234u16.to_be_bytes());
    msg.extend_from_slice(&0x8180u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes());
    msg.push(7);
    msg.extend_from_slice(b"example");
    msg.push(3);
    msg.extend_from_slice(b"com");
    msg.push(0);
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&[0xc0, 0x0c]);
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&1u16.to_be_bytes());
    msg.extend_from_slice(&300u32.to_be_bytes());
    msg.extend_from_slice(&4u16.to_be_bytes());
    msg.extend_from_slice(&SERVER_IP);
    msg
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_simple_http_get() {
    let config = test_config("http");
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let base = now_ms();
    let request = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: curl/8\r\n\r\n";
    // Request (67 B) plus response (83 B) give 150 B of application payload.
    let mut response = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n".to_vec();
    response.resize(83, b'x');

    let frames: Vec<Vec<u8>> = vec![
        tcp_frame(CLIENT_MAC, CLIENT_IP, 52000, SERVER_IP, 80, 1000, Tf::Syn, b""),
        tcp_frame(ROUTER_MAC, SERVER_IP, 80, CLIENT_IP, 52000, 2000, Tf::SynAck, b""),
        tcp_frame(CLIENT_MAC, CLIENT_IP, 52000, SERVER_IP, 80, 1001, Tf::Ack, b""),
        tcp_frame(CLIENT_MAC, CLIENT_IP, 52000, SERVER_IP, 80, 1002, Tf::PshAck, request),
        tcp_frame(ROUTER_MAC, SERVER_IP, 80, CLIENT_IP, 52000, 2001, Tf::PshAck, &response),
    ];
    let total_bytes: i64 = frames.iter().map(|f| f.len() as i64).sum();

    for (i, frame) in frames.iter().enumerate() {
        services.engine.ingest(frame, base + i as i64 * 10);
        settle().await;
    }

    services.engine.stop().await;

    let filter = FlowFilter {
        protocol: Some(Protocol::Tcp),
        ..Default::default()
    };
    let flows = db::flows::get_flows(&services.db, &filter, 100, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1, "expected exactly one TCP flow");
    let flow = &flows[0];

    assert_eq!(flow.status, FlowStatus::Closed);
    assert_eq!(flow.protocol, Protocol::Tcp);
    assert_eq!(flow.application.as_deref(), Some("HTTP"));
    assert_eq!(flow.http_method.as_deref(), Some("GET"));
    assert_eq!(flow.url.as_deref(), Some("/index.html"));
    assert_eq!(flow.user_agent.as_deref(), Some("curl/8"));
    assert_eq!(flow.connection_state.as_deref(), Some("ESTABLISHED"));
    assert_eq!(flow.domain.as_deref(), Some("example.com"));
    assert!(flow.bytes_out > 0, "client sent data");
    assert!(flow.bytes_in > 0, "server responded");
    assert_eq!(flow.threat_level, ThreatLevel::Safe);

    // Accounting invariants: every observed byte and packet is attributed.
    assert_eq!(flow.bytes_in + flow.bytes_out, total_bytes);
    assert_eq!(flow.packets_in + flow.packets_out, 5);
    assert_eq!(flow.duration, 40);

    // No threat for a plain HTTP fetch.
    assert!(db::threats::get_threats(&services.db, false)
        .await
        .unwrap()
        .is_empty());

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_port_scan_pattern() {
    let config = test_config("scan");
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let scanner_ip = [10, 0, 0, 5];
    let target_ip = [10, 0, 0, 1];
    let base = now_ms();

    for port in 1..=2000u16 {
        let frame = tcp_frame(
            CLIENT_MAC,
            scanner_ip,
            40000,
            target_ip,
            port,
            u32::from(port),
            Tf::Rst,
            b"",
        );
        services.engine.ingest(&frame, base + i64::from(port));
    }

    services.engine.stop().await;

    let flows = db::flows::get_flows(&services.db, &FlowFilter::default(), 1000, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1000, "page is capped at the limit");
    assert_eq!(db::flows::count_flows(&services.db).await.unwrap(), 2000);

    // Every scan flow scored past the threshold.
    let scan_threats = db::threats::get_threats(&services.db, true).await.unwrap();
    assert!(!scan_threats.is_empty(), "scan threats must exist");
    assert!(scan_threats
        .iter()
        .any(|t| t.threat_type == ThreatType::Scan && t.severity >= Severity::Low));

    // The scanning device accumulated a threat score.
    let scanner = db::devices::search_devices(&services.db, "10.0.0.5", 10)
        .await
        .unwrap();
    assert_eq!(scanner.len(), 1);
    assert!(scanner[0].threat_score > 0.0);

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_exfiltration_with_suspicious_sni() {
    let config = test_config("exfil");
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let exfil_dst = [203, 0, 113, 9];
    let base = now_ms();

    let hello = client_hello("drop.tk");
    let frame = tcp_frame(
        CLIENT_MAC, CLIENT_IP, 53000, exfil_dst, 443, 1, Tf::PshAck, &hello,
    );
    services.engine.ingest(&frame, base);
    settle().await;

    // Push well past 12 MiB outbound.
    let chunk = vec![0x41u8; 60_000];
    for i in 0..210u32 {
        let frame = tcp_frame(
            CLIENT_MAC,
            CLIENT_IP,
            53000,
            exfil_dst,
            443,
            1000 + i * 60_000,
            Tf::PshAck,
            &chunk,
        );
        services.engine.ingest(&frame, base + 10 + i64::from(i));
    }

    services.engine.stop().await;

    let filter = FlowFilter {
        dst_ip: Some("203.0.113.9".to_string()),
        ..Default::default()
    };
    let flows = db::flows::get_flows(&services.db, &filter, 100, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1);
    let flow = &flows[0];

    assert!(flow.bytes_out > 12 * 1024 * 1024, "12 MiB exfiltrated");
    assert_eq!(flow.sni.as_deref(), Some("drop.tk"));
    assert!(
        flow.threat_level == ThreatLevel::High || flow.threat_level == ThreatLevel::Critical,
        "exfiltration plus suspicious TLD scores at least high, got {:?}",
        flow.threat_level
    );

    let threats = db::threats::get_threats(&services.db, true).await.unwrap();
    assert_eq!(threats.len(), 1);
    assert!(
        threats[0].threat_type == ThreatType::Exfiltration
            || threats[0].threat_type == ThreatType::Phishing
    );
    assert_eq!(threats[0].flow_id, flow.id);

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_dns_resolution_correlates_flows() {
    let config = test_config("dns");
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let resolver_ip = [8, 8, 8, 8];
    let base = now_ms();

    // DNS answer arrives first and populates the passive DNS map.
    let dns = udp_frame(
        ROUTER_MAC,
        resolver_ip,
        53,
        CLIENT_IP,
        51342,
        &dns_a_response(),
    );
    services.engine.ingest(&dns, base);
    settle().await;

    // Then the client talks to the answered address.
    let syn = tcp_frame(CLIENT_MAC, CLIENT_IP, 54000, SERVER_IP, 443, 1, Tf::Syn, b"");
    services.engine.ingest(&syn, base + 20);

    services.engine.stop().await;

    let filter = FlowFilter {
        protocol: Some(Protocol::Tcp),
        dst_ip: Some("93.184.216.34".to_string()),
        ..Default::default()
    };
    let flows = db::flows::get_flows(&services.db, &filter, 100, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1);
    assert_eq!(flows[0].domain.as_deref(), Some("example.com"));

    // The DNS flow itself carries its protocol details.
    let filter = FlowFilter {
        protocol: Some(Protocol::Udp),
        ..Default::default()
    };
    let dns_flows = db::flows::get_flows(&services.db, &filter, 100, 0)
        .await
        .unwrap();
    assert_eq!(dns_flows.len(), 1);
    assert_eq!(dns_flows[0].dns_query_type.as_deref(), Some("A"));
    assert_eq!(dns_flows[0].dns_response_code.as_deref(), Some("NOERROR"));

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_duplicate_suppression() {
    let config = test_config("dup");
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let frame = udp_frame(CLIENT_MAC, CLIENT_IP, 55000, SERVER_IP, 9999, b"ping");
    let ts = now_ms();
    // The same frame delivered twice within the dedup window.
    services.engine.ingest(&frame, ts);
    services.engine.ingest(&frame, ts);
    settle().await;

    let status = services.engine.status();
    assert_eq!(status.packets_captured, 2);
    assert_eq!(status.packets_duplicate, 1);

    services.engine.stop().await;

    let flows = db::flows::get_flows(&services.db, &FlowFilter::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1);
    // Counted exactly once.
    assert_eq!(flows[0].packets_in + flows[0].packets_out, 1);
    assert_eq!(flows[0].bytes_in + flows[0].bytes_out, frame.len() as i64);

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_retention_purges_old_flows() {
    let config = test_config("retention");
    let db_path = config.db_path.clone();
    let pool = db::init(&config.db_path).await.unwrap();

    let now = now_ms();
    let forty_days_ago = now - 40 * 86_400_000;

    let mut old_flows = Vec::new();
    let mut new_flows = Vec::new();
    for i in 0..100 {
        let mut flow = sample_flow(&format!("old-{i}"), forty_days_ago + i);
        flow.device_id = "d-1".to_string();
        old_flows.push(flow);
        new_flows.push(sample_flow(&format!("new-{i}"), now - i));
    }
    db::flows::add_flows_batch(&pool, &old_flows).await.unwrap();
    db::flows::add_flows_batch(&pool, &new_flows).await.unwrap();
    assert_eq!(db::flows::count_flows(&pool).await.unwrap(), 200);

    let result = db::cleanup_old_data(&pool, 30).await.unwrap();
    assert_eq!(result.flows_deleted, 100);
    assert_eq!(db::flows::count_flows(&pool).await.unwrap(), 100);

    cleanup_db(&db_path);
}

#[tokio::test]
async fn test_idle_timeout_finalizes_without_stop() {
    let mut config = test_config("idle");
    config.capture.idle_timeout_s = 1;
    config.capture.sweep_interval_s = 1;
    let db_path = config.db_path.clone();
    let services = Services::build(config).await.unwrap();
    services.engine.start(PacketSource::Replay).await.unwrap();

    let frame = udp_frame(CLIENT_MAC, CLIENT_IP, 56000, SERVER_IP, 9999, b"one-shot");
    services.engine.ingest(&frame, now_ms());

    // Idle timeout (1 s) + sweeper tick (1 s) + writer flush (1 s), with
    // slack for scheduling.
    tokio::time::sleep(Duration::from_secs(4)).await;

    let flows = db::flows::get_flows(&services.db, &FlowFilter::default(), 100, 0)
        .await
        .unwrap();
    assert_eq!(flows.len(), 1, "flow finalized by the idle sweeper");
    assert_eq!(flows[0].status, FlowStatus::Closed);
    assert_eq!(services.engine.status().active_flows, 0);

    services.engine.stop().await;
    cleanup_db(&db_path);
}

fn sample_flow(id: &str, ts: i64) -> netsentry::db::flows::NetworkFlow {
    netsentry::db::flows::NetworkFlow {
        id: id.to_string(),
        timestamp: ts,
        src_ip: "192.168.1.10".to_string(),
        src_port: 50000,
        dst_ip: "1.1.1.1".to_string(),
        dst_port: 443,
        protocol: Protocol::Tcp,
        bytes_in: 100,
        bytes_out: 100,
        packets_in: 1,
        packets_out: 1,
        duration: 10,
        status: FlowStatus::Closed,
        country: None,
        city: None,
        asn: None,
        domain: None,
        sni: None,
        threat_level: ThreatLevel::Safe,
        device_id: "d-1".to_string(),
        tcp_flags: None,
        ttl: Some(64),
        connection_state: None,
        rtt: None,
        retransmissions: None,
        jitter: None,
        application: Some("HTTPS".to_string()),
        user_agent: None,
        http_method: None,
        url: None,
        dns_query_type: None,
        dns_response_code: None,
    }
}
