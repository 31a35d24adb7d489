// Console sinks and JSON snapshot export.
use crate::db::{SnapshotView, TrafficStore};
use crate::error::Result;
use crate::models::domain::DecodedPacket;
use crate::models::dto::{ConnectionRecord, RemoteIpStats};
use chrono::{DateTime, Local, Utc};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

const RECORD_PREVIEW: usize = 10;

fn clock(ts: &DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%H:%M:%S%.6f").to_string()
}

fn endpoint(ip: Option<IpAddr>, port: Option<u16>) -> String {
    let ip = ip.map(|ip| ip.to_string()).unwrap_or_default();
    match port {
        Some(port) => format!("{}:{}", ip, port),
        None => ip,
    }
}

/// One-line summary of a recorded packet.
pub fn packet_line(info: &DecodedPacket) -> String {
    let mut line = format!(
        "[{}] {} {} -> {}",
        clock(&info.timestamp),
        info.protocol,
        endpoint(info.src_ip, info.src_port),
        endpoint(info.dst_ip, info.dst_port),
    );
    if !info.tcp_flags.is_empty() {
        let _ = write!(line, " [{}]", info.tcp_flags);
    }
    let _ = write!(line, " Len:{}", info.length);
    if !info.process_name.is_empty() {
        let _ = write!(line, " [{}]", info.process_name);
    }
    if info.is_tls {
        line.push_str(" [TLS");
        if !info.tls_version.is_empty() {
            line.push(' ');
            line.push_str(&info.tls_version);
        }
        line.push(']');
    }
    if !info.sni.is_empty() {
        let _ = write!(line, " SNI: {}", info.sni);
    }
    if info.is_dns {
        let _ = write!(line, " Dns: {}", info.dns_query_name);
    }
    line
}

pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = b"KMGTPE"[exp] as char;
    format!("{:.2} {}B", bytes as f64 / div as f64, suffix)
}

fn counted(table: &HashMap<String, u64>) -> String {
    let mut items: Vec<String> = table.iter().map(|(k, v)| format!("{}({})", k, v)).collect();
    items.sort();
    items.join(", ")
}

fn record_line(index: usize, record: &ConnectionRecord) -> String {
    let mut line = format!(
        "    [{}] {} | {} | {} | local:{} remote:{} | size:{} bytes",
        index,
        clock(&record.timestamp),
        record.direction,
        record.protocol,
        record.local_port,
        record.remote_port,
        record.packet_size,
    );
    if !record.tcp_flags.is_empty() {
        let _ = write!(line, " | Flags:{}", record.tcp_flags);
    }
    if record.is_tls {
        line.push_str(" | TLS");
    }
    if !record.sni.is_empty() {
        let _ = write!(line, " | SNI:{}", record.sni);
    }
    if !record.process_name.is_empty() {
        let _ = write!(line, " | [{}]", record.process_name);
    }
    line
}

/// Per-IP report block. With `verbose`, the records are listed too: all of
/// them when short, otherwise the first and last ten.
pub fn render_ip_stats(s: &RemoteIpStats, verbose: bool) -> String {
    let rule = "-".repeat(100);
    let mut out = String::new();
    let _ = writeln!(out, "\nRemote IP: {}", s.remote_ip);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(
        out,
        "  Packets: {} (send: {}, recv: {})",
        s.total_packets, s.send_packets, s.recv_packets
    );
    let _ = writeln!(
        out,
        "  Bytes: {} (send: {}, recv: {})",
        format_bytes(s.total_bytes),
        format_bytes(s.send_bytes),
        format_bytes(s.recv_bytes)
    );
    let _ = writeln!(out, "  First seen: {}", s.first_seen.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f"));
    let _ = writeln!(out, "  Last seen: {}", s.last_seen.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S%.3f"));
    let span = s.last_seen - s.first_seen;
    let _ = writeln!(out, "  Duration: {:.3}s", span.num_milliseconds() as f64 / 1000.0);

    let tables = [
        ("Protocols", &s.protocols),
        ("Remote ports", &s.remote_ports),
        ("Local ports", &s.local_ports),
        ("SNI names", &s.sni_names),
        ("DNS names", &s.dns_names),
        ("Processes", &s.processes),
    ];
    for (label, table) in tables {
        if !table.is_empty() {
            let _ = writeln!(out, "  {}: {}", label, counted(table));
        }
    }
    if s.tls_count > 0 {
        let _ = writeln!(out, "  TLS packets: {}", s.tls_count);
    }

    if verbose {
        let _ = writeln!(out, "\n  Records:");
        let records = &s.records;
        if records.len() <= RECORD_PREVIEW * 2 {
            for (i, record) in records.iter().enumerate() {
                let _ = writeln!(out, "{}", record_line(i + 1, record));
            }
        } else {
            for (i, record) in records.iter().enumerate().take(RECORD_PREVIEW) {
                let _ = writeln!(out, "{}", record_line(i + 1, record));
            }
            let _ = writeln!(out, "    ... ({} records omitted) ...", records.len() - RECORD_PREVIEW * 2);
            let tail_start = records.len() - RECORD_PREVIEW;
            for (i, record) in records.iter().enumerate().skip(tail_start) {
                let _ = writeln!(out, "{}", record_line(i + 1, record));
            }
        }
    }
    out
}

pub fn render_report(store: &TrafficStore, verbose: bool) -> String {
    let rule = "=".repeat(100);
    let snapshot = store.snapshot();
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "Remote IP interaction report");
    let _ = writeln!(out, "{}", rule);

    if snapshot.is_empty() {
        let _ = writeln!(out, "No remote IP interactions recorded");
        return out;
    }

    let mut ips: Vec<&String> = snapshot.keys().collect();
    ips.sort();

    let mut total_bytes = 0u64;
    let mut total_packets = 0u64;
    for ip in ips {
        let stats = snapshot[ip].read();
        total_bytes += stats.total_bytes;
        total_packets += stats.total_packets;
        out.push_str(&render_ip_stats(&stats, verbose));
    }

    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "Totals:");
    let _ = writeln!(out, "  Distinct remote IPs: {}", snapshot.len());
    let _ = writeln!(out, "  Packets: {}", total_packets);
    let _ = writeln!(out, "  Bytes: {}", format_bytes(total_bytes));
    let _ = writeln!(out, "{}", rule);
    out
}

pub fn default_snapshot_path(now: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("capture_stats_{}.json", now.format("%Y%m%d_%H%M%S")))
}

/// Write the store as pretty JSON (two-space indent) to `writer`.
pub fn write_snapshot<W: Write>(store: &TrafficStore, writer: W) -> Result<()> {
    let snapshot = store.snapshot();
    let mut writer = writer;
    serde_json::to_writer_pretty(&mut writer, &SnapshotView(&snapshot))?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}

pub fn save_snapshot(store: &TrafficStore, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    write_snapshot(store, BufWriter::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::domain::Direction;
    use chrono::{Duration, TimeZone};
    use std::net::Ipv4Addr;

    fn packet(i: i64) -> DecodedPacket {
        DecodedPacket {
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(i),
            length: 1024,
            protocol: "TCP".into(),
            src_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2))),
            dst_ip: Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
            src_port: Some(50000),
            dst_port: Some(443),
            tcp_flags: "ACK".into(),
            is_tls: true,
            tls_version: "TLS 1.2".into(),
            sni: "one.one".into(),
            direction: Direction::Send,
            remote_ip: Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
            local_port: Some(50000),
            remote_port: Some(443),
            ..Default::default()
        }
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn packet_line_lists_tls_details() {
        let line = packet_line(&packet(0));
        assert!(line.contains("TCP 192.168.1.2:50000 -> 1.1.1.1:443 [ACK] Len:1024"));
        assert!(line.ends_with("[TLS TLS 1.2] SNI: one.one"));
    }

    #[test]
    fn long_record_lists_are_elided() {
        let store = TrafficStore::new();
        for i in 0..25 {
            store.record(&packet(i));
        }
        let report = render_report(&store, true);
        assert!(report.contains("Remote IP: 1.1.1.1"));
        assert!(report.contains("... (5 records omitted) ..."));
        assert!(report.contains("[25] "));
        assert!(!report.contains("[11] "));
        assert!(report.contains("Bytes: 25.00 KB"));
    }

    #[test]
    fn snapshot_json_is_pretty_and_parseable() {
        let store = TrafficStore::new();
        store.record(&packet(0));
        let mut buf = Vec::new();
        write_snapshot(&store, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("{\n  \"1.1.1.1\": {"));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["1.1.1.1"]["sni_names"]["one.one"], 1);
        assert_eq!(value["1.1.1.1"]["records"][0]["sni"], "one.one");
    }

    #[test]
    fn default_path_is_timestamped() {
        let now = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(default_snapshot_path(now), PathBuf::from("capture_stats_20240309_070501.json"));
    }
}
