use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::time::sleep;
use tracing::warn;

use crate::error::{classify_store, is_transient, Error};

use super::{backoff_delay, WRITE_RETRIES};

/// Device category inferred from address and OUI heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Smartphone,
    Laptop,
    Desktop,
    Tablet,
    Iot,
    Server,
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Smartphone => "smartphone",
            DeviceType::Laptop => "laptop",
            DeviceType::Desktop => "desktop",
            DeviceType::Tablet => "tablet",
            DeviceType::Iot => "iot",
            DeviceType::Server => "server",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Capitalized form for generated device names.
    pub fn title(&self) -> &'static str {
        match self {
            DeviceType::Smartphone => "Smartphone",
            DeviceType::Laptop => "Laptop",
            DeviceType::Desktop => "Desktop",
            DeviceType::Tablet => "Tablet",
            DeviceType::Iot => "IoT",
            DeviceType::Server => "Server",
            DeviceType::Unknown => "Device",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "smartphone" => DeviceType::Smartphone,
            "laptop" => DeviceType::Laptop,
            "desktop" => DeviceType::Desktop,
            "tablet" => DeviceType::Tablet,
            "iot" => DeviceType::Iot,
            "server" => DeviceType::Server,
            _ => DeviceType::Unknown,
        }
    }
}

/// Learned behavior of a device, stored as JSON on the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Behavioral {
    #[serde(default)]
    pub peak_hours: Vec<u8>,
    #[serde(default)]
    pub common_ports: Vec<u16>,
    #[serde(default)]
    pub common_domains: Vec<String>,
    #[serde(default)]
    pub anomaly_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A device observed on the network.
///
/// The natural key is the MAC address when known; devices seen only by IP
/// keep `mac = None` until an ARP reply or an Ethernet header fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub mac: Option<String>,
    pub device_type: DeviceType,
    pub vendor: String,
    pub os: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
    pub bytes_total: i64,
    pub connections_count: i64,
    pub threat_score: f64,
    pub behavioral: Behavioral,
    pub notes: Option<String>,
    pub ipv6_support: bool,
    pub avg_rtt: Option<f64>,
    pub connection_quality: Option<String>,
    pub applications: Vec<String>,
}

fn row_to_device(row: &SqliteRow) -> Device {
    let behavioral: String = row.get("behavioral");
    let applications: Option<String> = row.get("applications");
    Device {
        id: row.get("id"),
        name: row.get("name"),
        ip: row.get("ip"),
        mac: row.get("mac"),
        device_type: DeviceType::parse(&row.get::<String, _>("type")),
        vendor: row.get("vendor"),
        os: row.get("os"),
        first_seen: row.get("first_seen"),
        last_seen: row.get("last_seen"),
        bytes_total: row.get("bytes_total"),
        connections_count: row.get("connections_count"),
        threat_score: row.get("threat_score"),
        behavioral: serde_json::from_str(&behavioral).unwrap_or_default(),
        notes: row.get("notes"),
        ipv6_support: row.get::<i64, _>("ipv6_support") != 0,
        avg_rtt: row.get("avg_rtt"),
        connection_quality: row.get("connection_quality"),
        applications: applications
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Insert or replace a device row. Transient errors are retried with
/// exponential backoff before surfacing.
pub async fn upsert_device(pool: &SqlitePool, device: &Device) -> Result<(), Error> {
    let behavioral =
        serde_json::to_string(&device.behavioral).unwrap_or_else(|_| "{}".to_string());
    let applications = if device.applications.is_empty() {
        None
    } else {
        Some(device.applications.join(","))
    };

    let mut attempt = 0u32;
    loop {
        let result = sqlx::query(
            "INSERT OR REPLACE INTO devices \
             (id, name, ip, mac, type, vendor, os, first_seen, last_seen, bytes_total, \
              connections_count, threat_score, behavioral, notes, ipv6_support, avg_rtt, \
              connection_quality, applications) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&device.id)
        .bind(&device.name)
        .bind(&device.ip)
        .bind(&device.mac)
        .bind(device.device_type.as_str())
        .bind(&device.vendor)
        .bind(&device.os)
        .bind(device.first_seen)
        .bind(device.last_seen)
        .bind(device.bytes_total)
        .bind(device.connections_count)
        .bind(device.threat_score)
        .bind(&behavioral)
        .bind(&device.notes)
        .bind(device.ipv6_support as i64)
        .bind(device.avg_rtt)
        .bind(&device.connection_quality)
        .bind(&applications)
        .execute(pool)
        .await;

        match result {
            Ok(_) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < WRITE_RETRIES => {
                attempt += 1;
                warn!(attempt, "Transient error upserting device, retrying: {e}");
                sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(classify_store(e)),
        }
    }
}

pub async fn get_device(pool: &SqlitePool, id: &str) -> Result<Option<Device>, Error> {
    let row = sqlx::query("SELECT * FROM devices WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(classify_store)?;
    Ok(row.as_ref().map(row_to_device))
}

/// Primary identification path: look the device up by its MAC address.
pub async fn get_device_by_mac(pool: &SqlitePool, mac: &str) -> Result<Option<Device>, Error> {
    let row = sqlx::query("SELECT * FROM devices WHERE mac = ?")
        .bind(mac)
        .fetch_optional(pool)
        .await
        .map_err(classify_store)?;
    Ok(row.as_ref().map(row_to_device))
}

/// Fallback identification for devices whose MAC has never been observed.
pub async fn get_unknown_device_by_ip(
    pool: &SqlitePool,
    ip: &str,
) -> Result<Option<Device>, Error> {
    let row = sqlx::query("SELECT * FROM devices WHERE mac IS NULL AND ip = ?")
        .bind(ip)
        .fetch_optional(pool)
        .await
        .map_err(classify_store)?;
    Ok(row.as_ref().map(row_to_device))
}

pub async fn list_devices(pool: &SqlitePool) -> Result<Vec<Device>, Error> {
    let rows = sqlx::query("SELECT * FROM devices ORDER BY last_seen DESC")
        .fetch_all(pool)
        .await
        .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_device).collect())
}

/// LIKE search over name, IP and MAC.
pub async fn search_devices(
    pool: &SqlitePool,
    text: &str,
    limit: i64,
) -> Result<Vec<Device>, Error> {
    let pattern = format!("%{text}%");
    let rows = sqlx::query(
        "SELECT * FROM devices WHERE name LIKE ? OR ip LIKE ? OR mac LIKE ? \
         ORDER BY last_seen DESC LIMIT ?",
    )
    .bind(&pattern)
    .bind(&pattern)
    .bind(&pattern)
    .bind(limit.clamp(0, 1000))
    .fetch_all(pool)
    .await
    .map_err(classify_store)?;
    Ok(rows.iter().map(row_to_device).collect())
}

pub async fn touch_last_seen(pool: &SqlitePool, id: &str, ts_ms: i64) -> Result<(), Error> {
    sqlx::query("UPDATE devices SET last_seen = ? WHERE id = ?")
        .bind(ts_ms)
        .bind(id)
        .execute(pool)
        .await
        .map_err(classify_store)?;
    Ok(())
}

/// Account a finalized flow to its owning device.
pub async fn bump_counters(pool: &SqlitePool, id: &str, bytes: i64) -> Result<(), Error> {
    sqlx::query(
        "UPDATE devices SET connections_count = connections_count + 1, \
         bytes_total = bytes_total + ? WHERE id = ?",
    )
    .bind(bytes)
    .bind(id)
    .execute(pool)
    .await
    .map_err(classify_store)?;
    Ok(())
}

/// Accumulate a threat's score onto the device and count the anomaly in its
/// behavioral record.
pub async fn record_threat(
    pool: &SqlitePool,
    id: &str,
    score_delta: f64,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE devices SET \
         threat_score = threat_score + ?, \
         behavioral = json_set(behavioral, '$.anomaly_count', \
                               COALESCE(json_extract(behavioral, '$.anomaly_count'), 0) + 1) \
         WHERE id = ?",
    )
    .bind(score_delta)
    .bind(id)
    .execute(pool)
    .await
    .map_err(classify_store)?;
    Ok(())
}
