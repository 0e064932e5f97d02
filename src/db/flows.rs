use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{classify_store, is_transient, Error};

use super::{backoff_delay, WRITE_RETRIES};

/// Maximum page size for filtered reads.
pub const MAX_LIMIT: i64 = 1000;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Other,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Icmp => "ICMP",
            Protocol::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "TCP" => Protocol::Tcp,
            "UDP" => Protocol::Udp,
            "ICMP" => Protocol::Icmp,
            _ => Protocol::Other,
        }
    }
}

/// Whether a flow is still accumulating packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowStatus {
    Active,
    Closed,
}

impl FlowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowStatus::Active => "active",
            FlowStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => FlowStatus::Active,
            _ => FlowStatus::Closed,
        }
    }
}

/// Threat level assigned to a flow at finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Safe => "safe",
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => ThreatLevel::Low,
            "medium" => ThreatLevel::Medium,
            "high" => ThreatLevel::High,
            "critical" => ThreatLevel::Critical,
            _ => ThreatLevel::Safe,
        }
    }
}

/// A finalized (or snapshotted) bidirectional flow.
///
/// `bytes_in`/`packets_in` count traffic toward the local network;
/// `timestamp` is the first-seen instant and `duration` spans to last-seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFlow {
    pub id: String,
    pub timestamp: i64,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub protocol: Protocol,
    pub bytes_in: i64,
    pub bytes_out: i64,
    pub packets_in: i64,
    pub packets_out: i64,
    pub duration: i64,
    pub status: FlowStatus,
    pub country: Option<String>,
    pub city: Option<String>,
    pub asn: Option<i64>,
    pub domain: Option<String>,
    pub sni: Option<String>,
    pub threat_level: ThreatLevel,
    pub device_id: String,
    pub tcp_flags: Option<Vec<String>>,
    pub ttl: Option<u8>,
    pub connection_state: Option<String>,
    pub rtt: Option<i64>,
    pub retransmissions: Option<i64>,
    pub jitter: Option<f64>,
    pub application: Option<String>,
    pub user_agent: Option<String>,
    pub http_method: Option<String>,
    pub url: Option<String>,
    pub dns_query_type: Option<String>,
    pub dns_response_code: Option<String>,
}

/// Composable filters for `get_flows`. Unset fields do not constrain.
#[derive(Debug, Clone, Default)]
pub struct FlowFilter {
    pub device_id: Option<String>,
    pub status: Option<FlowStatus>,
    pub protocol: Option<Protocol>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub threat_level: Option<ThreatLevel>,
    pub min_bytes: Option<i64>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub application: Option<String>,
    pub min_rtt: Option<i64>,
    pub max_rtt: Option<i64>,
    pub max_jitter: Option<f64>,
    pub max_retransmissions: Option<i64>,
    /// Substring match over the SNI column.
    pub sni: Option<String>,
    pub connection_state: Option<String>,
}

fn row_to_flow(row: &SqliteRow) -> NetworkFlow {
    let tcp_flags: Option<String> = row.get("tcp_flags");
    NetworkFlow {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        src_ip: row.get("src_ip"),
        src_port: row.get::<i64, _>("src_port") as u16,
        dst_ip: row.get("dst_ip"),
        dst_port: row.get::<i64, _>("dst_port") as u16,
        protocol: Protocol::parse(&row.get::<String, _>("protocol")),
        bytes_in: row.get("bytes_in"),
        bytes_out: row.get("bytes_out"),
        packets_in: row.get("packets_in"),
        packets_out: row.get("packets_out"),
        duration: row.get("duration"),
        status: FlowStatus::parse(&row.get::<String, _>("status")),
        country: row.get("country"),
        city: row.get("city"),
        asn: row.get("asn"),
        domain: row.get("domain"),
        sni: row.get("sni"),
        threat_level: ThreatLevel::parse(&row.get::<String, _>("threat_level")),
        device_id: row.get("device_id"),
        tcp_flags: tcp_flags.map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|f| !f.is_empty())
                .map(String::from)
                .collect()
        }),
        ttl: row.get::<Option<i64>, _>("ttl").map(|t| t as u8),
        connection_state: row.get("connection_state"),
        rtt: row.get("rtt"),
        retransmissions: row.get("retransmissions"),
        jitter: row.get("jitter"),
        application: row.get("application"),
        user_agent: row.get("user_agent"),
        http_method: row.get("http_method"),
        url: row.get("url"),
        dns_query_type: row.get("dns_query_type"),
        dns_response_code: row.get("dns_response_code"),
    }
}

fn insert_query(flow: &NetworkFlow) -> sqlx::query::Query<'_, Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        "INSERT OR REPLACE INTO flows \
         (id, timestamp, src_ip, src_port, dst_ip, dst_port, protocol, \
          bytes_in, bytes_out, packets_in, packets_out, duration, status, \
          country, city, asn, domain, sni, threat_level, device_id, \
          tcp_flags, ttl, connection_state, rtt, retransmissions, jitter, \
          application, user_agent, http_method, url, dns_query_type, dns_response_code) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
                 ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&flow.id)
    .bind(flow.timestamp)
    .bind(&flow.src_ip)
    .bind(flow.src_port)
    .bind(&flow.dst_ip)
    .bind(flow.dst_port)
    .bind(flow.protocol.as_str())
    .bind(flow.bytes_in)
    .bind(flow.bytes_out)
    .bind(flow.packets_in)
    .bind(flow.packets_out)
    .bind(flow.duration)
    .bind(flow.status.as_str())
    .bind(&flow.country)
    .bind(&flow.city)
    .bind(flow.asn)
    .bind(&flow.domain)
    .bind(&flow.sni)
    .bind(flow.threat_level.as_str())
    .bind(&flow.device_id)
    .bind(flow.tcp_flags.as_ref().map(|f| f.join(",")))
    .bind(flow.ttl.map(i64::from))
    .bind(&flow.connection_state)
    .bind(flow.rtt)
    .bind(flow.retransmissions)
    .bind(flow.jitter)
    .bind(&flow.application)
    .bind(&flow.user_agent)
    .bind(&flow.http_method)
    .bind(&flow.url)
    .bind(&flow.dns_query_type)
    .bind(&flow.dns_response_code)
}

/// Persist one flow, retrying transient failures with backoff.
pub async fn add_flow(pool: &SqlitePool, flow: &NetworkFlow) -> Result<(), Error> {
    let mut attempt = 0u32;
    loop {
        match insert_query(flow).execute(pool).await {
            Ok(_) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(attempt, "Transient error inserting flow, retrying: {e}");
                sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(classify_store(e)),
        }
    }
}

/// Persist a batch of flows in a single transaction.
///
/// Equivalent in effect to inserting each flow individually, but with one
/// fsync. Transient failures retry the whole batch with backoff.
pub async fn add_flows_batch(pool: &SqlitePool, flows: &[NetworkFlow]) -> Result<(), Error> {
    if flows.is_empty() {
        return Ok(());
    }

    let mut attempt = 0u32;
    loop {
        match try_add_batch(pool, flows).await {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(
                    attempt,
                    count = flows.len(),
                    "Transient error writing flow batch, retrying: {e}"
                );
                sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(classify_store(e)),
        }
    }
}

async fn try_add_batch(pool: &SqlitePool, flows: &[NetworkFlow]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for flow in flows {
        insert_query(flow).execute(&mut *tx).await?;
    }
    tx.commit().await
}

pub async fn get_flow(pool: &SqlitePool, id: &str) -> Result<Option<NetworkFlow>, Error> {
    let row = sqlx::query("SELECT * FROM flows WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(classify_store)?;
    Ok(row.as_ref().map(row_to_flow))
}

pub async fn count_flows(pool: &SqlitePool) -> Result<i64, Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM flows")
        .fetch_one(pool)
        .await
        .map_err(classify_store)
}

/// Filtered, paginated read over flows, newest first.
///
/// `limit` is clamped to [`MAX_LIMIT`]; a time range with `start > end` is
/// rejected rather than silently returning nothing.
pub async fn get_flows(
    pool: &SqlitePool,
    filter: &FlowFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<NetworkFlow>, Error> {
    if let (Some(start), Some(end)) = (filter.start_time, filter.end_time) {
        if start > end {
            return Err(Error::InvalidFilter(format!(
                "time range start {start} is after end {end}"
            )));
        }
    }
    if offset < 0 {
        return Err(Error::InvalidFilter(format!("offset must be >= 0, got {offset}")));
    }
    let limit = limit.clamp(0, MAX_LIMIT);

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM flows WHERE 1=1");
    if let Some(v) = &filter.device_id {
        qb.push(" AND device_id = ").push_bind(v.clone());
    }
    if let Some(v) = filter.status {
        qb.push(" AND status = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.protocol {
        qb.push(" AND protocol = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.start_time {
        qb.push(" AND timestamp >= ").push_bind(v);
    }
    if let Some(v) = filter.end_time {
        qb.push(" AND timestamp <= ").push_bind(v);
    }
    if let Some(v) = &filter.src_ip {
        qb.push(" AND src_ip = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.dst_ip {
        qb.push(" AND dst_ip = ").push_bind(v.clone());
    }
    if let Some(v) = filter.threat_level {
        qb.push(" AND threat_level = ").push_bind(v.as_str());
    }
    if let Some(v) = filter.min_bytes {
        qb.push(" AND (bytes_in + bytes_out) >= ").push_bind(v);
    }
    if let Some(v) = &filter.country {
        qb.push(" AND country = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.city {
        qb.push(" AND city LIKE ").push_bind(format!("%{v}%"));
    }
    if let Some(v) = &filter.application {
        qb.push(" AND application = ").push_bind(v.clone());
    }
    if let Some(v) = filter.min_rtt {
        qb.push(" AND rtt >= ").push_bind(v);
    }
    if let Some(v) = filter.max_rtt {
        qb.push(" AND rtt <= ").push_bind(v);
    }
    if let Some(v) = filter.max_jitter {
        qb.push(" AND jitter <= ").push_bind(v);
    }
    if let Some(v) = filter.max_retransmissions {
        qb.push(" AND retransmissions <= ").push_bind(v);
    }
    if let Some(v) = &filter.sni {
        qb.push(" AND sni LIKE ").push_bind(format!("%{v}%"));
    }
    if let Some(v) = &filter.connection_state {
        qb.push(" AND connection_state = ").push_bind(v.clone());
    }
    qb.push(" ORDER BY timestamp DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb
        .build()
        .fetch_all(pool)
        .await
        .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_flow).collect())
}

/// LIKE search over source IP, destination IP and domain.
pub async fn search_flows(
    pool: &SqlitePool,
    text: &str,
    limit: i64,
) -> Result<Vec<NetworkFlow>, Error> {
    let pattern = format!("%{text}%");
    let rows = sqlx::query(
        "SELECT * FROM flows WHERE src_ip LIKE ? OR dst_ip LIKE ? OR domain LIKE ? \
         ORDER BY timestamp DESC LIMIT ?",
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit.clamp(0, MAX_LIMIT))
    .fetch_all(pool)
    .await
    .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_flow).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn test_pool() -> SqlitePool {
        db::init(":memory:").await.expect("DB init failed")
    }

    fn test_flow(id: &str, ts: i64) -> NetworkFlow {
        NetworkFlow {
            id: id.to_string(),
            timestamp: ts,
            src_ip: "192.168.1.10".to_string(),
            src_port: 51000,
            dst_ip: "93.184.216.34".to_string(),
            dst_port: 443,
            protocol: Protocol::Tcp,
            bytes_in: 4200,
            bytes_out: 800,
            packets_in: 6,
            packets_out: 5,
            duration: 1500,
            status: FlowStatus::Closed,
            country: Some("US".to_string()),
            city: None,
            asn: Some(15133),
            domain: Some("example.com".to_string()),
            sni: Some("example.com".to_string()),
            threat_level: ThreatLevel::Safe,
            device_id: "d-1".to_string(),
            tcp_flags: Some(vec!["SYN".to_string(), "ACK".to_string()]),
            ttl: Some(64),
            connection_state: Some("ESTABLISHED".to_string()),
            rtt: Some(23),
            retransmissions: None,
            jitter: Some(1.25),
            application: Some("HTTPS".to_string()),
            user_agent: None,
            http_method: None,
            url: None,
            dns_query_type: None,
            dns_response_code: None,
        }
    }

    #[tokio::test]
    async fn test_insert_then_get_round_trip() {
        let pool = test_pool().await;
        let flow = test_flow("f-1", 1_700_000_000_000);

        add_flow(&pool, &flow).await.unwrap();
        let fetched = get_flow(&pool, "f-1").await.unwrap().expect("flow");
        assert_eq!(fetched, flow);
    }

    #[tokio::test]
    async fn test_batch_equals_individual_inserts() {
        let pool_a = test_pool().await;
        let pool_b = test_pool().await;

        let flows: Vec<NetworkFlow> = (0..5)
            .map(|i| test_flow(&format!("f-{i}"), 1_700_000_000_000 + i))
            .collect();

        add_flows_batch(&pool_a, &flows).await.unwrap();
        for flow in &flows {
            add_flow(&pool_b, flow).await.unwrap();
        }

        let a = get_flows(&pool_a, &FlowFilter::default(), 100, 0)
            .await
            .unwrap();
        let b = get_flows(&pool_b, &FlowFilter::default(), 100, 0)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }

    #[tokio::test]
    async fn test_get_flows_filters() {
        let pool = test_pool().await;

        let mut tcp = test_flow("f-tcp", 1_700_000_001_000);
        tcp.device_id = "d-1".to_string();
        let mut udp = test_flow("f-udp", 1_700_000_002_000);
        udp.protocol = Protocol::Udp;
        udp.device_id = "d-2".to_string();
        udp.threat_level = ThreatLevel::High;
        udp.sni = Some("update.drop.tk".to_string());
        add_flows_batch(&pool, &[tcp, udp]).await.unwrap();

        let filter = FlowFilter {
            protocol: Some(Protocol::Udp),
            ..Default::default()
        };
        let udp_only = get_flows(&pool, &filter, 100, 0).await.unwrap();
        assert_eq!(udp_only.len(), 1);
        assert_eq!(udp_only[0].id, "f-udp");

        let filter = FlowFilter {
            device_id: Some("d-1".to_string()),
            ..Default::default()
        };
        assert_eq!(get_flows(&pool, &filter, 100, 0).await.unwrap().len(), 1);

        let filter = FlowFilter {
            threat_level: Some(ThreatLevel::High),
            ..Default::default()
        };
        assert_eq!(get_flows(&pool, &filter, 100, 0).await.unwrap().len(), 1);

        // SNI substring match.
        let filter = FlowFilter {
            sni: Some("drop.tk".to_string()),
            ..Default::default()
        };
        assert_eq!(get_flows(&pool, &filter, 100, 0).await.unwrap().len(), 1);

        // min_bytes excludes everything when set above both flows.
        let filter = FlowFilter {
            min_bytes: Some(1_000_000),
            ..Default::default()
        };
        assert!(get_flows(&pool, &filter, 100, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_flows_time_range() {
        let pool = test_pool().await;
        add_flow(&pool, &test_flow("f-1", 1_000)).await.unwrap();
        add_flow(&pool, &test_flow("f-2", 2_000)).await.unwrap();
        add_flow(&pool, &test_flow("f-3", 3_000)).await.unwrap();

        let filter = FlowFilter {
            start_time: Some(1_500),
            end_time: Some(2_500),
            ..Default::default()
        };
        let in_range = get_flows(&pool, &filter, 100, 0).await.unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].id, "f-2");

        // start > end is rejected.
        let filter = FlowFilter {
            start_time: Some(3_000),
            end_time: Some(1_000),
            ..Default::default()
        };
        assert!(matches!(
            get_flows(&pool, &filter, 100, 0).await,
            Err(Error::InvalidFilter(_))
        ));
    }

    #[tokio::test]
    async fn test_get_flows_pagination_boundaries() {
        let pool = test_pool().await;
        for i in 0..10 {
            add_flow(&pool, &test_flow(&format!("f-{i}"), 1_000 + i))
                .await
                .unwrap();
        }

        // limit 0 yields empty.
        assert!(get_flows(&pool, &FlowFilter::default(), 0, 0)
            .await
            .unwrap()
            .is_empty());

        // limit above MAX_LIMIT is clamped, not an error.
        let all = get_flows(&pool, &FlowFilter::default(), MAX_LIMIT + 1, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 10);

        // offset beyond the result set yields empty.
        assert!(get_flows(&pool, &FlowFilter::default(), 100, 100)
            .await
            .unwrap()
            .is_empty());

        // Negative offset is rejected.
        assert!(matches!(
            get_flows(&pool, &FlowFilter::default(), 100, -1).await,
            Err(Error::InvalidFilter(_))
        ));

        // Newest first.
        let page = get_flows(&pool, &FlowFilter::default(), 3, 0).await.unwrap();
        assert_eq!(page[0].id, "f-9");
    }

    #[tokio::test]
    async fn test_search_flows() {
        let pool = test_pool().await;
        add_flow(&pool, &test_flow("f-1", 1_000)).await.unwrap();

        let by_domain = search_flows(&pool, "example", 50).await.unwrap();
        assert_eq!(by_domain.len(), 1);

        let by_ip = search_flows(&pool, "93.184", 50).await.unwrap();
        assert_eq!(by_ip.len(), 1);

        let none = search_flows(&pool, "no-such-thing", 50).await.unwrap();
        assert!(none.is_empty());
    }
}
