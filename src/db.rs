use crate::models::domain::{DecodedPacket, Direction};
use crate::models::dto::{port_string, ConnectionRecord, RemoteIpStats};
use multimap::MultiMap;
use parking_lot::RwLock;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::trace;

pub type SharedStats = Arc<RwLock<RemoteIpStats>>;

#[derive(Default)]
struct StoreInner {
    stats: HashMap<String, SharedStats>,
    /// IP -> domains learned from DNS answers, deduplicated on insert.
    dns_cache: MultiMap<String, String>,
}

/// Per-remote-IP aggregation with DNS name correlation.
#[derive(Default)]
pub struct TrafficStore {
    inner: RwLock<StoreInner>,
}

impl TrafficStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, info: &DecodedPacket) {
        let Some(remote_ip) = info.remote_ip else {
            return;
        };
        let remote_ip = remote_ip.to_string();

        let mut guard = self.inner.write();
        let inner = &mut *guard;

        let entry = match inner.stats.get(&remote_ip) {
            Some(existing) => Arc::clone(existing),
            None => {
                let mut fresh = RemoteIpStats::new(remote_ip.clone(), info.timestamp);
                if let Some(domains) = inner.dns_cache.get_vec(&remote_ip) {
                    for domain in domains {
                        *fresh.dns_names.entry(domain.clone()).or_insert(0) += 1;
                    }
                }
                let shared = Arc::new(RwLock::new(fresh));
                inner.stats.insert(remote_ip.clone(), Arc::clone(&shared));
                shared
            }
        };

        {
            let mut stats = entry.write();
            let bytes = u64::from(info.length);

            stats.records.push(ConnectionRecord::from(info));
            stats.total_packets += 1;
            stats.total_bytes += bytes;
            stats.last_seen = info.timestamp;

            match info.direction {
                Direction::Send => {
                    stats.send_packets += 1;
                    stats.send_bytes += bytes;
                }
                Direction::Recv => {
                    stats.recv_packets += 1;
                    stats.recv_bytes += bytes;
                }
                Direction::Local => {}
            }

            if info.remote_port.is_some() {
                bump(&mut stats.remote_ports, port_string(info.remote_port));
            }
            if info.local_port.is_some() {
                bump(&mut stats.local_ports, port_string(info.local_port));
            }
            if !info.sni.is_empty() {
                bump(&mut stats.sni_names, info.sni.clone());
            }
            if !info.process_name.is_empty() {
                bump(&mut stats.processes, info.process_name.clone());
            }
            if info.is_tls {
                stats.tls_count += 1;
            }
            if !info.protocol.is_empty() {
                bump(&mut stats.protocols, info.protocol.clone());
            }
        }

        if info.is_dns_answer() {
            for resolved in &info.dns_response_ips {
                let known = inner
                    .dns_cache
                    .get_vec(resolved)
                    .map_or(false, |domains| domains.contains(&info.dns_query_name));
                if !known {
                    trace!(ip = %resolved, name = %info.dns_query_name, "caching dns answer");
                    inner
                        .dns_cache
                        .insert(resolved.clone(), info.dns_query_name.clone());
                }

                if let Some(existing) = inner.stats.get(resolved) {
                    bump(&mut existing.write().dns_names, info.dns_query_name.clone());
                }
            }
        }
    }

    /// Point-in-time set of entries. The entries themselves keep changing.
    pub fn snapshot(&self) -> HashMap<String, SharedStats> {
        self.inner.read().stats.clone()
    }

    pub fn get(&self, remote_ip: &str) -> Option<SharedStats> {
        self.inner.read().stats.get(remote_ip).cloned()
    }

    pub fn dns_names_for(&self, ip: &str) -> Vec<String> {
        self.inner
            .read()
            .dns_cache
            .get_vec(ip)
            .cloned()
            .unwrap_or_default()
    }

    pub fn total_packets(&self) -> u64 {
        self.inner
            .read()
            .stats
            .values()
            .map(|s| s.read().total_packets)
            .sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner
            .read()
            .stats
            .values()
            .map(|s| s.read().total_bytes)
            .sum()
    }

    pub fn ip_count(&self) -> usize {
        self.inner.read().stats.len()
    }
}

fn bump(table: &mut HashMap<String, u64>, key: String) {
    *table.entry(key).or_insert(0) += 1;
}

/// Serializes a snapshot as `{ "<ip>": RemoteIpStats, ... }`, read-locking
/// each entry while it is written out.
pub struct SnapshotView<'a>(pub &'a HashMap<String, SharedStats>);

impl Serialize for SnapshotView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let ordered: BTreeMap<&String, &SharedStats> = self.0.iter().collect();
        let mut map = serializer.serialize_map(Some(ordered.len()))?;
        for (ip, stats) in ordered {
            map.serialize_entry(ip, &*stats.read())?;
        }
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::net::{IpAddr, Ipv4Addr};

    fn packet(remote: [u8; 4], direction: Direction, length: u32) -> DecodedPacket {
        DecodedPacket {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            length,
            protocol: "TCP".into(),
            direction,
            remote_ip: Some(IpAddr::V4(Ipv4Addr::from(remote))),
            local_port: Some(50123),
            remote_port: Some(443),
            ..Default::default()
        }
    }

    fn dns_answer(name: &str, ips: &[&str]) -> DecodedPacket {
        DecodedPacket {
            protocol: "UDP".into(),
            is_dns: true,
            dns_query_name: name.into(),
            dns_response_ips: ips.iter().map(|s| s.to_string()).collect(),
            direction: Direction::Recv,
            remote_ip: Some(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))),
            local_port: Some(40000),
            remote_port: Some(53),
            length: 90,
            ..Default::default()
        }
    }

    #[test]
    fn no_remote_ip_is_ignored() {
        let store = TrafficStore::new();
        store.record(&DecodedPacket::default());
        assert_eq!(store.ip_count(), 0);
    }

    #[test]
    fn accumulates_counters_and_tables() {
        let store = TrafficStore::new();
        let mut first = packet([1, 1, 1, 1], Direction::Send, 100);
        first.is_tls = true;
        first.sni = "one.one".into();
        first.process_name = "curl".into();
        first.tcp_flags = "ACK,PSH".into();
        let mut second = packet([1, 1, 1, 1], Direction::Recv, 1500);
        second.timestamp = first.timestamp + Duration::seconds(2);

        store.record(&first);
        store.record(&second);
        store.record(&packet([9, 9, 9, 9], Direction::Send, 60));

        let stats = store.get("1.1.1.1").unwrap();
        let stats = stats.read();
        assert_eq!(stats.total_packets, 2);
        assert_eq!(stats.total_bytes, 1600);
        assert_eq!((stats.send_packets, stats.recv_packets), (1, 1));
        assert_eq!((stats.send_bytes, stats.recv_bytes), (100, 1500));
        assert_eq!(stats.first_seen, first.timestamp);
        assert_eq!(stats.last_seen, second.timestamp);
        assert_eq!(stats.remote_ports["443"], 2);
        assert_eq!(stats.local_ports["50123"], 2);
        assert_eq!(stats.sni_names["one.one"], 1);
        assert_eq!(stats.processes["curl"], 1);
        assert_eq!(stats.protocols["TCP"], 2);
        assert_eq!(stats.tls_count, 1);
        assert_eq!(stats.records.len(), 2);
        assert_eq!(stats.records[0].tcp_flags, "ACK,PSH");

        assert_eq!(store.ip_count(), 2);
        assert_eq!(store.total_packets(), 3);
        assert_eq!(store.total_bytes(), 1660);
    }

    #[test]
    fn dns_before_traffic_attaches_once() {
        let store = TrafficStore::new();
        store.record(&dns_answer("bad.example", &["1.2.3.4"]));
        store.record(&dns_answer("bad.example", &["1.2.3.4"]));
        assert_eq!(store.dns_names_for("1.2.3.4"), vec!["bad.example".to_string()]);

        store.record(&packet([1, 2, 3, 4], Direction::Send, 80));
        let stats = store.get("1.2.3.4").unwrap();
        assert_eq!(stats.read().dns_names.get("bad.example"), Some(&1));
    }

    #[test]
    fn dns_after_traffic_updates_live_stats() {
        let store = TrafficStore::new();
        store.record(&packet([1, 2, 3, 4], Direction::Send, 80));
        store.record(&dns_answer("bad.example", &["1.2.3.4", "5.6.7.8"]));

        let stats = store.get("1.2.3.4").unwrap();
        assert_eq!(stats.read().dns_names.get("bad.example"), Some(&1));
        assert_eq!(store.dns_names_for("5.6.7.8"), vec!["bad.example".to_string()]);
        assert!(store.get("5.6.7.8").is_none());
    }

    #[test]
    fn dns_query_without_answers_is_not_cached() {
        let store = TrafficStore::new();
        store.record(&dns_answer("quiet.example", &[]));
        assert!(store.dns_names_for("1.2.3.4").is_empty());
    }

    #[test]
    fn snapshot_is_shallow() {
        let store = TrafficStore::new();
        store.record(&packet([1, 1, 1, 1], Direction::Send, 10));
        let snap = store.snapshot();
        store.record(&packet([1, 1, 1, 1], Direction::Send, 10));
        store.record(&packet([2, 2, 2, 2], Direction::Send, 10));

        assert_eq!(snap.len(), 1);
        assert_eq!(snap["1.1.1.1"].read().total_packets, 2);
    }

    #[test]
    fn snapshot_serializes_by_ip() {
        let store = TrafficStore::new();
        store.record(&packet([1, 1, 1, 1], Direction::Send, 10));
        let snap = store.snapshot();
        let json = serde_json::to_value(SnapshotView(&snap)).unwrap();
        let entry = &json["1.1.1.1"];
        assert_eq!(entry["remote_ip"], "1.1.1.1");
        assert_eq!(entry["total_bytes"], 10);
        assert_eq!(entry["first_seen"], "2024-05-01T12:00:00.000000Z");
        assert_eq!(entry["records"][0]["direction"], "send");
        assert_eq!(entry["remote_ports"]["443"], 1);
    }
}
