pub mod oui;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::devices::{self, Behavioral, Device, DeviceType};
use crate::error::Error;
use crate::events::{Event, EventHub};
use crate::identify::EnhancedIdentifier;

/// An ARP packet reduced to the fields device discovery needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpObservation {
    /// 1 = request, 2 = reply.
    pub operation: u16,
    pub sender_mac: String,
    pub sender_ip: String,
}

/// Identifies devices from (MAC, IP) observations and keeps their store
/// records current. Holds only the store handle plus the shared identifier
/// for best-effort reverse-DNS naming; all caches live in the flow engine.
pub struct DeviceRegistry {
    db: SqlitePool,
    hub: Arc<EventHub>,
    identifier: Arc<EnhancedIdentifier>,
}

impl DeviceRegistry {
    pub fn new(db: SqlitePool, hub: Arc<EventHub>, identifier: Arc<EnhancedIdentifier>) -> Self {
        Self {
            db,
            hub,
            identifier,
        }
    }

    /// Handle a diverted ARP packet. Requests are ignored; replies announce
    /// a live (IP, MAC) pair and feed discovery.
    pub async fn process_arp(&self, arp: &ArpObservation) -> Result<(), Error> {
        if arp.operation != 2 {
            return Ok(());
        }
        self.get_or_create(&arp.sender_ip, Some(&arp.sender_mac))
            .await?;
        Ok(())
    }

    /// Resolve an observation to a device, creating one on first sight.
    ///
    /// Lookup order: by MAC when present, else by IP among devices whose MAC
    /// has never been seen. Hits bump `last_seen` and notify subscribers.
    pub async fn get_or_create(&self, ip: &str, mac: Option<&str>) -> Result<Device, Error> {
        let now = Utc::now().timestamp_millis();
        let mac = mac.map(|m| m.to_lowercase().replace('-', ":"));

        let existing = match mac.as_deref() {
            Some(mac) => devices::get_device_by_mac(&self.db, mac).await?,
            None => devices::get_unknown_device_by_ip(&self.db, ip).await?,
        };

        if let Some(mut device) = existing {
            device.last_seen = now;
            devices::touch_last_seen(&self.db, &device.id, now).await?;
            self.hub.publish(Event::DeviceUpdate {
                device: device.clone(),
            });
            return Ok(device);
        }

        let vendor = mac
            .as_deref()
            .and_then(oui::lookup)
            .unwrap_or("Unknown")
            .to_string();
        let device_type = detect_device_type(ip, mac.as_deref());
        let name = self.pick_name(ip, &vendor, device_type).await;

        let device = Device {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            ip: ip.to_string(),
            mac,
            device_type,
            vendor,
            os: None,
            first_seen: now,
            last_seen: now,
            bytes_total: 0,
            connections_count: 0,
            threat_score: 0.0,
            behavioral: Behavioral::default(),
            notes: None,
            ipv6_support: ip.parse::<IpAddr>().map(|a| a.is_ipv6()).unwrap_or(false),
            avg_rtt: None,
            connection_quality: None,
            applications: Vec::new(),
        };

        devices::upsert_device(&self.db, &device).await?;
        info!(name = %device.name, ip = %device.ip, vendor = %device.vendor, "New device discovered");
        self.hub.publish(Event::DeviceUpdate {
            device: device.clone(),
        });

        Ok(device)
    }

    /// Best-effort device naming: reverse DNS first label, then vendor plus
    /// type, then the last octet of the address.
    async fn pick_name(&self, ip: &str, vendor: &str, device_type: DeviceType) -> String {
        if let Ok(addr) = ip.parse::<IpAddr>() {
            if let Some(hostname) = self.identifier.reverse_dns(addr).await {
                if let Some(label) = hostname.split('.').next() {
                    if !label.is_empty() {
                        debug!(ip, hostname = %hostname, "Device named via reverse DNS");
                        return label.to_string();
                    }
                }
            }
        }

        if vendor != "Unknown" {
            return format!("{} {}", vendor, device_type.title());
        }

        let last_octet = ip.rsplit(['.', ':']).next().unwrap_or(ip);
        format!("Device {last_octet}")
    }
}

/// Address and OUI heuristics for the device category.
fn detect_device_type(ip: &str, mac: Option<&str>) -> DeviceType {
    // Gateways conventionally sit on .1.
    if ip.ends_with(".1") {
        return DeviceType::Server;
    }
    if let Some(mac) = mac {
        if oui::is_raspberry_pi(mac) {
            return DeviceType::Server;
        }
    }
    DeviceType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentifyConfig;
    use crate::db;

    async fn test_registry() -> (DeviceRegistry, SqlitePool) {
        let pool = db::init(":memory:").await.expect("DB init failed");
        let hub = EventHub::new();
        let identify = IdentifyConfig {
            reverse_dns_enabled: false,
            ..Default::default()
        };
        let identifier = Arc::new(EnhancedIdentifier::new(identify));
        (
            DeviceRegistry::new(pool.clone(), hub, identifier),
            pool,
        )
    }

    #[test]
    fn test_detect_device_type() {
        assert_eq!(detect_device_type("192.168.1.1", None), DeviceType::Server);
        assert_eq!(
            detect_device_type("10.0.0.5", Some("b8:27:eb:00:00:01")),
            DeviceType::Server
        );
        assert_eq!(
            detect_device_type("10.0.0.5", Some("02:00:00:00:00:01")),
            DeviceType::Unknown
        );
        assert_eq!(detect_device_type("10.0.0.5", None), DeviceType::Unknown);
    }

    #[tokio::test]
    async fn test_get_or_create_creates_once() {
        let (registry, pool) = test_registry().await;

        let first = registry
            .get_or_create("192.168.1.50", Some("AA:BB:CC:DD:EE:FF"))
            .await
            .unwrap();
        // MAC is normalized to lowercase colons.
        assert_eq!(first.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));

        let second = registry
            .get_or_create("192.168.1.50", Some("aa:bb:cc:dd:ee:ff"))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);

        let all = devices::list_devices(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_create_without_mac_keys_by_ip() {
        let (registry, pool) = test_registry().await;

        let a = registry.get_or_create("10.0.0.20", None).await.unwrap();
        let b = registry.get_or_create("10.0.0.20", None).await.unwrap();
        assert_eq!(a.id, b.id);

        let other = registry.get_or_create("10.0.0.21", None).await.unwrap();
        assert_ne!(other.id, a.id);

        assert_eq!(devices::list_devices(&pool).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_vendor_and_name_fallbacks() {
        let (registry, _pool) = test_registry().await;

        // Known OUI: vendor plus type.
        let pi = registry
            .get_or_create("10.0.0.30", Some("b8:27:eb:11:22:33"))
            .await
            .unwrap();
        assert_eq!(pi.vendor, "Raspberry Pi");
        assert_eq!(pi.device_type, DeviceType::Server);
        assert_eq!(pi.name, "Raspberry Pi Server");

        // Unknown OUI: falls back to the last address octet.
        let unknown = registry
            .get_or_create("10.0.0.31", Some("02:00:00:00:00:02"))
            .await
            .unwrap();
        assert_eq!(unknown.vendor, "Unknown");
        assert_eq!(unknown.name, "Device 31");
    }

    #[tokio::test]
    async fn test_arp_request_ignored_reply_processed() {
        let (registry, pool) = test_registry().await;

        registry
            .process_arp(&ArpObservation {
                operation: 1,
                sender_mac: "aa:bb:cc:dd:ee:01".to_string(),
                sender_ip: "192.168.1.60".to_string(),
            })
            .await
            .unwrap();
        assert!(devices::list_devices(&pool).await.unwrap().is_empty());

        registry
            .process_arp(&ArpObservation {
                operation: 2,
                sender_mac: "aa:bb:cc:dd:ee:01".to_string(),
                sender_ip: "192.168.1.60".to_string(),
            })
            .await
            .unwrap();
        let all = devices::list_devices(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ip, "192.168.1.60");
    }

    #[tokio::test]
    async fn test_device_update_event_published() {
        let pool = db::init(":memory:").await.unwrap();
        let hub = EventHub::new();
        let identify = IdentifyConfig {
            reverse_dns_enabled: false,
            ..Default::default()
        };
        let identifier = Arc::new(EnhancedIdentifier::new(identify));
        let registry = DeviceRegistry::new(pool, hub.clone(), identifier);

        let mut rx = hub.subscribe();
        registry
            .get_or_create("192.168.1.70", Some("aa:bb:cc:dd:ee:02"))
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Event::DeviceUpdate { device } => assert_eq!(device.ip, "192.168.1.70"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
