//! Threat scoring and classification over finalized flows.
//!
//! The score is additive over independent signals; the level comes from
//! fixed thresholds only, so a flow's verdict is deterministic over its
//! final state. Anything above safe produces a persisted threat record.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::warn;

use crate::db::devices;
use crate::db::flows::{NetworkFlow, ThreatLevel};
use crate::db::threats::{self, Severity, Threat, ThreatType};
use crate::error::Error;
use crate::events::{Event, EventHub};

const LARGE_UPLOAD_BYTES: i64 = 10 * 1024 * 1024;
const SUSPICIOUS_PORTS: [u16; 5] = [4444, 5555, 6666, 6667, 31337];
const HIGH_PACKET_COUNT: i64 = 1000;
const LOW_DATA_TRANSFER: i64 = 1000;
const HIGH_JITTER_MS: f64 = 100.0;
const HIGH_RTT_MS: i64 = 1000;
const HIGH_RETRANSMISSION_RATE_PCT: f64 = 10.0;
const SUSPICIOUS_TLDS: [&str; 5] = [".tk", ".ml", ".ga", ".cf", ".xyz"];
const HIGH_RISK_COUNTRIES: [&str; 4] = ["CN", "RU", "KP", "IR"];
const ALLOWED_APPLICATIONS: [&str; 4] = ["HTTP", "HTTPS", "SSH", "DNS"];

const BOTNET_RETRANSMISSIONS: i64 = 10;
const BOTNET_JITTER_MS: f64 = 100.0;

// Score increments.
const SCORE_EXFILTRATION: i32 = 30;
const SCORE_SUSPICIOUS_PORT: i32 = 50;
const SCORE_PACKET_BURST: i32 = 20;
const SCORE_TCP_ANOMALY: i32 = 25;
const SCORE_CONNECTION_RESET: i32 = 15;
const SCORE_HIGH_RETRANSMISSION: i32 = 20;
const SCORE_HIGH_JITTER: i32 = 10;
const SCORE_HIGH_RTT: i32 = 10;
const SCORE_SUSPICIOUS_DOMAIN: i32 = 30;
const SCORE_HIGH_RISK_COUNTRY: i32 = 25;
const SCORE_UNEXPECTED_APPLICATION: i32 = 15;
const SCORE_DNS_ANOMALY: i32 = 10;

// Level thresholds: at or above the threshold classifies the higher band.
const THRESHOLD_CRITICAL: i32 = 70;
const THRESHOLD_HIGH: i32 = 50;
const THRESHOLD_MEDIUM: i32 = 30;
const THRESHOLD_LOW: i32 = 15;

fn flags_contain(flow: &NetworkFlow, name: &str) -> bool {
    flow.tcp_flags
        .as_ref()
        .map(|flags| flags.iter().any(|f| f == name))
        .unwrap_or(false)
}

fn suspicious_name(flow: &NetworkFlow) -> Option<&str> {
    let name = flow.sni.as_deref().or(flow.domain.as_deref())?;
    let lower = name.to_lowercase();
    SUSPICIOUS_TLDS
        .iter()
        .any(|tld| lower.ends_with(tld))
        .then_some(name)
}

/// Additive threat score of a finalized flow.
pub fn score_flow(flow: &NetworkFlow) -> i32 {
    let mut score = 0;

    if flow.bytes_out > LARGE_UPLOAD_BYTES {
        score += SCORE_EXFILTRATION;
    }
    if SUSPICIOUS_PORTS.contains(&flow.dst_port) {
        score += SCORE_SUSPICIOUS_PORT;
    }

    let total_packets = flow.packets_in + flow.packets_out;
    if total_packets > HIGH_PACKET_COUNT && flow.bytes_in < LOW_DATA_TRANSFER {
        score += SCORE_PACKET_BURST;
    }

    if flags_contain(flow, "RST") && !flags_contain(flow, "SYN") {
        score += SCORE_TCP_ANOMALY;
    }
    if flow.connection_state.as_deref() == Some("RESET") {
        score += SCORE_CONNECTION_RESET;
    }

    let retransmissions = flow.retransmissions.unwrap_or(0);
    if total_packets > 0 {
        let rate = retransmissions as f64 * 100.0 / total_packets as f64;
        if rate > HIGH_RETRANSMISSION_RATE_PCT {
            score += SCORE_HIGH_RETRANSMISSION;
        }
    }

    if flow.jitter.map(|j| j > HIGH_JITTER_MS).unwrap_or(false) {
        score += SCORE_HIGH_JITTER;
    }
    if flow.rtt.map(|r| r > HIGH_RTT_MS).unwrap_or(false) {
        score += SCORE_HIGH_RTT;
    }

    if suspicious_name(flow).is_some() {
        score += SCORE_SUSPICIOUS_DOMAIN;
    }

    if let Some(country) = flow.country.as_deref() {
        if HIGH_RISK_COUNTRIES.contains(&country) {
            score += SCORE_HIGH_RISK_COUNTRY;
        }
    }

    if let Some(application) = flow.application.as_deref() {
        if !ALLOWED_APPLICATIONS.contains(&application) {
            score += SCORE_UNEXPECTED_APPLICATION;
        }
    }

    if let Some(rcode) = flow.dns_response_code.as_deref() {
        if rcode != "NOERROR" {
            score += SCORE_DNS_ANOMALY;
        }
    }

    score
}

/// Map a score onto the level bands.
pub fn level_for_score(score: i32) -> ThreatLevel {
    if score >= THRESHOLD_CRITICAL {
        ThreatLevel::Critical
    } else if score >= THRESHOLD_HIGH {
        ThreatLevel::High
    } else if score >= THRESHOLD_MEDIUM {
        ThreatLevel::Medium
    } else if score >= THRESHOLD_LOW {
        ThreatLevel::Low
    } else {
        ThreatLevel::Safe
    }
}

/// Classify a non-safe flow; the first matching rule wins.
pub fn classify(flow: &NetworkFlow) -> ThreatType {
    if flow.bytes_out > LARGE_UPLOAD_BYTES {
        return ThreatType::Exfiltration;
    }
    let total_packets = flow.packets_in + flow.packets_out;
    if (flags_contain(flow, "RST") && !flags_contain(flow, "SYN"))
        || (total_packets > HIGH_PACKET_COUNT && flow.bytes_in < LOW_DATA_TRANSFER)
    {
        return ThreatType::Scan;
    }
    if flow.retransmissions.unwrap_or(0) > BOTNET_RETRANSMISSIONS
        && flow.jitter.unwrap_or(0.0) > BOTNET_JITTER_MS
    {
        return ThreatType::Botnet;
    }
    if suspicious_name(flow).is_some() {
        return ThreatType::Phishing;
    }
    ThreatType::Anomaly
}

fn describe(flow: &NetworkFlow, threat_type: ThreatType) -> String {
    let name = flow
        .sni
        .as_deref()
        .or(flow.domain.as_deref())
        .unwrap_or(&flow.dst_ip);
    let country_suffix = flow
        .country
        .as_deref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default();

    match threat_type {
        ThreatType::Exfiltration => format!(
            "Large data exfiltration detected: {:.2} MB to {}{}",
            flow.bytes_out as f64 / 1024.0 / 1024.0,
            name,
            country_suffix
        ),
        ThreatType::Scan => format!(
            "Port scanning detected on port {} ({} -> {})",
            flow.dst_port, flow.src_ip, flow.dst_ip
        ),
        ThreatType::Botnet => format!(
            "Potential DDoS/network attack: {} retransmissions, jitter: {:.1}ms",
            flow.retransmissions.unwrap_or(0),
            flow.jitter.unwrap_or(0.0)
        ),
        ThreatType::Phishing => format!(
            "Suspicious domain detected: {}{}",
            name, country_suffix
        ),
        ThreatType::Malware | ThreatType::Anomaly => format!(
            "Behavioral anomaly: {} connection to {}",
            flow.application.as_deref().unwrap_or("unknown protocol"),
            name
        ),
    }
}

fn recommend(threat_type: ThreatType) -> &'static str {
    match threat_type {
        ThreatType::Exfiltration => {
            "Review device for unauthorized applications and check for data breaches"
        }
        ThreatType::Scan => "Investigate device for compromise and check for malware",
        ThreatType::Anomaly => "Monitor device closely and investigate if behavior continues",
        _ => "Monitor device and review network activity",
    }
}

fn severity_for(level: ThreatLevel) -> Severity {
    match level {
        ThreatLevel::Critical => Severity::Critical,
        ThreatLevel::High => Severity::High,
        ThreatLevel::Medium => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Scores finalized flows against the policy and persists the resulting
/// threats. Holds only the store handle and the event hub.
pub struct ThreatScorer {
    db: SqlitePool,
    hub: Arc<EventHub>,
}

impl ThreatScorer {
    pub fn new(db: SqlitePool, hub: Arc<EventHub>) -> Self {
        Self { db, hub }
    }

    /// Score one finalized flow. When the level is above safe, a threat
    /// record is persisted, the owning device's score accumulates, and
    /// subscribers are notified.
    pub async fn score(&self, flow: &NetworkFlow) -> Result<ThreatLevel, Error> {
        let score = score_flow(flow);
        let level = level_for_score(score);
        if level == ThreatLevel::Safe {
            return Ok(level);
        }

        let threat_type = classify(flow);
        let threat = Threat {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            threat_type,
            severity: severity_for(level),
            device_id: flow.device_id.clone(),
            flow_id: flow.id.clone(),
            description: describe(flow, threat_type),
            recommendation: recommend(threat_type).to_string(),
            dismissed: false,
        };

        threats::add_threat(&self.db, &threat).await?;
        if let Err(e) = devices::record_threat(&self.db, &flow.device_id, f64::from(score)).await
        {
            warn!(device_id = %flow.device_id, "Failed to update device threat score: {e}");
        }

        warn!(
            threat_type = threat.threat_type.as_str(),
            severity = threat.severity.as_str(),
            flow_id = %threat.flow_id,
            "Threat detected: {}",
            threat.description
        );
        self.hub.publish(Event::ThreatUpdate { threat });

        Ok(level)
    }
}
