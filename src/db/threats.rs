use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{classify_store, is_transient, Error};

use super::{backoff_delay, WRITE_RETRIES};

/// Category a detected threat falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatType {
    Malware,
    Exfiltration,
    Scan,
    Botnet,
    Phishing,
    Anomaly,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::Malware => "malware",
            ThreatType::Exfiltration => "exfiltration",
            ThreatType::Scan => "scan",
            ThreatType::Botnet => "botnet",
            ThreatType::Phishing => "phishing",
            ThreatType::Anomaly => "anomaly",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "malware" => ThreatType::Malware,
            "exfiltration" => ThreatType::Exfiltration,
            "scan" => ThreatType::Scan,
            "botnet" => ThreatType::Botnet,
            "phishing" => ThreatType::Phishing,
            _ => ThreatType::Anomaly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Low,
        }
    }
}

/// A threat detected when scoring a finalized flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threat {
    pub id: String,
    pub timestamp: i64,
    pub threat_type: ThreatType,
    pub severity: Severity,
    pub device_id: String,
    pub flow_id: String,
    pub description: String,
    pub recommendation: String,
    pub dismissed: bool,
}

fn row_to_threat(row: &SqliteRow) -> Threat {
    Threat {
        id: row.get("id"),
        timestamp: row.get("timestamp"),
        threat_type: ThreatType::parse(&row.get::<String, _>("type")),
        severity: Severity::parse(&row.get::<String, _>("severity")),
        device_id: row.get("device_id"),
        flow_id: row.get("flow_id"),
        description: row.get("description"),
        recommendation: row.get("recommendation"),
        dismissed: row.get::<i64, _>("dismissed") != 0,
    }
}

/// Persist a threat, retrying transient failures with backoff.
pub async fn add_threat(pool: &SqlitePool, threat: &Threat) -> Result<(), Error> {
    let mut attempt = 0u32;
    loop {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO threats \
             (id, timestamp, type, severity, device_id, flow_id, description, recommendation, dismissed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&threat.id)
        .bind(threat.timestamp)
        .bind(threat.threat_type.as_str())
        .bind(threat.severity.as_str())
        .bind(&threat.device_id)
        .bind(&threat.flow_id)
        .bind(&threat.description)
        .bind(&threat.recommendation)
        .bind(threat.dismissed as i64)
        .execute(pool)
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(attempt, "Transient error inserting threat, retrying: {e}");
                sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(classify_store(e)),
        }
    }
}

pub async fn get_threat(pool: &SqlitePool, id: &str) -> Result<Option<Threat>, Error> {
    let row = sqlx::query("SELECT * FROM threats WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(classify_store)?;
    Ok(row.as_ref().map(row_to_threat))
}

/// List threats, newest first. `active_only` hides dismissed ones.
pub async fn get_threats(pool: &SqlitePool, active_only: bool) -> Result<Vec<Threat>, Error> {
    let query = if active_only {
        "SELECT * FROM threats WHERE dismissed = 0 ORDER BY timestamp DESC"
    } else {
        "SELECT * FROM threats ORDER BY timestamp DESC"
    };
    let rows = sqlx::query(query)
        .fetch_all(pool)
        .await
        .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_threat).collect())
}

/// LIKE search over type, description and severity.
pub async fn search_threats(
    pool: &SqlitePool,
    text: &str,
    limit: i64,
    active_only: bool,
) -> Result<Vec<Threat>, Error> {
    let pattern = format!("%{text}%");
    let query = if active_only {
        "SELECT * FROM threats \
         WHERE (type LIKE ? OR description LIKE ? OR severity LIKE ?) AND dismissed = 0 \
         ORDER BY timestamp DESC LIMIT ?"
    } else {
        "SELECT * FROM threats \
         WHERE type LIKE ? OR description LIKE ? OR severity LIKE ? \
         ORDER BY timestamp DESC LIMIT ?"
    };
    let rows = sqlx::query(query)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .bind(limit.clamp(0, 1000))
        .fetch_all(pool)
        .await
        .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_threat).collect())
}

/// Mark a threat dismissed. Idempotent; returns false only when the threat
/// does not exist.
pub async fn dismiss_threat(pool: &SqlitePool, id: &str) -> Result<bool, Error> {
    let result = sqlx::query("UPDATE threats SET dismissed = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(classify_store)?;
    Ok(result.rows_affected() > 0)
}
