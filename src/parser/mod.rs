// Turns a captured frame plus (optionally) reassembled bytes into a DecodedPacket.
pub mod dns;
pub mod tls;

use crate::layers::{PacketView, Transport};
use crate::models::domain::{CapturedPacket, DecodedPacket, Direction};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolParser;

impl ProtocolParser {
    pub fn new() -> Self {
        ProtocolParser
    }

    /// Build the structured record for one admitted packet. Never fails:
    /// anything that does not parse is left at its default.
    pub fn decode(
        &self,
        packet: &CapturedPacket,
        view: &PacketView<'_>,
        reassembled: Option<&[u8]>,
    ) -> DecodedPacket {
        let mut info = DecodedPacket {
            timestamp: packet.timestamp,
            length: packet.wire_len,
            src_ip: Some(view.src),
            dst_ip: Some(view.dst),
            protocol: view.transport.name().to_string(),
            raw_data: packet.data.clone(),
            ..Default::default()
        };

        if let Some((src_port, dst_port)) = view.transport.ports() {
            info.src_port = Some(src_port);
            info.dst_port = Some(dst_port);
        }
        if let Transport::Tcp(tcp) = view.transport {
            info.sequence_num = tcp.seq;
            info.ack_num = tcp.ack;
            info.tcp_flags = tcp.flags.describe();
        }

        info.payload = match reassembled {
            Some(bytes) if !bytes.is_empty() => bytes.to_vec(),
            _ => view.transport.payload().to_vec(),
        };

        if !info.payload.is_empty() {
            parse_tls(&mut info);
        }
        if let Transport::Udp(udp) = view.transport {
            if udp.src_port == dns::DNS_PORT || udp.dst_port == dns::DNS_PORT {
                parse_dns(udp.payload, &mut info);
            }
        }

        classify_direction(&mut info);
        info
    }
}

fn parse_tls(info: &mut DecodedPacket) {
    let Some(version) = tls::handshake_version(&info.payload) else {
        return;
    };
    info.is_tls = true;
    info.tls_version = tls::version_label(version);
    if let Some(sni) = tls::extract_sni(&info.payload) {
        info.sni = sni;
    }
}

fn parse_dns(payload: &[u8], info: &mut DecodedPacket) {
    let Some(message) = dns::parse(payload) else {
        return;
    };
    info.is_dns = true;
    if !message.is_response {
        return;
    }
    info.dns_query_name = message.query_name;
    info.dns_response_ips = message.answer_ips.iter().map(IpAddr::to_string).collect();
}

/// Private, loopback and link-local IPv4 ranges.
pub fn is_local_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            a == 10
                || a == 127
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
                || (a == 172 && (16..=31).contains(&b))
        }
        IpAddr::V6(_) => false,
    }
}

fn classify_direction(info: &mut DecodedPacket) {
    let (Some(src), Some(dst)) = (info.src_ip, info.dst_ip) else {
        return;
    };
    let src_local = is_local_ip(&src);
    let dst_local = is_local_ip(&dst);

    let (direction, remote_is_src) = match (src_local, dst_local) {
        (true, false) => (Direction::Send, false),
        (false, true) => (Direction::Recv, true),
        // Both remote: treated as forwarded traffic towards dst.
        (false, false) => (Direction::Send, false),
        (true, true) => (Direction::Local, false),
    };

    info.direction = direction;
    if remote_is_src {
        info.remote_ip = Some(src);
        info.local_port = info.dst_port;
        info.remote_port = info.src_port;
    } else {
        info.remote_ip = Some(dst);
        info.local_port = info.src_port;
        info.remote_port = info.dst_port;
    }
}
