pub mod domain {
    use chrono::{DateTime, Utc};
    use std::fmt;
    use std::net::IpAddr;

    /// Link-layer framing of a captured buffer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LinkKind {
        Ethernet,
        RawIp,
    }

    /// One frame as handed over by the capture source.
    #[derive(Debug, Clone)]
    pub struct CapturedPacket {
        pub timestamp: DateTime<Utc>,
        pub wire_len: u32,
        pub link: LinkKind,
        pub data: Vec<u8>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum TransportKind {
        Tcp,
        Udp,
    }

    impl TransportKind {
        pub fn as_str(&self) -> &'static str {
            match self {
                TransportKind::Tcp => "TCP",
                TransportKind::Udp => "UDP",
            }
        }
    }

    /// Direction-aware 5-tuple identifying one flow.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FlowKey {
        pub src_addr: IpAddr,
        pub dst_addr: IpAddr,
        pub src_port: u16,
        pub dst_port: u16,
        pub transport: TransportKind,
    }

    impl FlowKey {
        /// Key of the opposite direction of the same conversation.
        pub fn reverse(&self) -> FlowKey {
            FlowKey {
                src_addr: self.dst_addr,
                dst_addr: self.src_addr,
                src_port: self.dst_port,
                dst_port: self.src_port,
                transport: self.transport,
            }
        }
    }

    impl fmt::Display for FlowKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}:{}->{}:{}/{}",
                self.src_addr,
                self.src_port,
                self.dst_addr,
                self.dst_port,
                self.transport.as_str()
            )
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Direction {
        Send,
        Recv,
        #[default]
        Local,
    }

    impl Direction {
        pub fn as_str(&self) -> &'static str {
            match self {
                Direction::Send => "send",
                Direction::Recv => "recv",
                Direction::Local => "local",
            }
        }
    }

    impl fmt::Display for Direction {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// A fully parsed observation of one admitted packet.
    #[derive(Debug, Clone, Default)]
    pub struct DecodedPacket {
        pub timestamp: DateTime<Utc>,
        pub length: u32,

        pub src_ip: Option<IpAddr>,
        pub dst_ip: Option<IpAddr>,

        pub protocol: String,
        pub src_port: Option<u16>,
        pub dst_port: Option<u16>,
        pub tcp_flags: String,
        pub sequence_num: u32,
        pub ack_num: u32,

        pub payload: Vec<u8>,

        pub is_tls: bool,
        pub tls_version: String,
        pub sni: String,

        pub is_dns: bool,
        pub dns_query_name: String,
        pub dns_response_ips: Vec<String>,

        pub direction: Direction,
        pub remote_ip: Option<IpAddr>,
        pub local_port: Option<u16>,
        pub remote_port: Option<u16>,

        pub process_name: String,
        pub process_pid: u32,

        pub raw_data: Vec<u8>,
    }

    impl DecodedPacket {
        /// Response carrying a name and at least one address to correlate.
        pub fn is_dns_answer(&self) -> bool {
            self.is_dns && !self.dns_query_name.is_empty() && !self.dns_response_ips.is_empty()
        }
    }
}

pub mod dto {
    use super::domain::{DecodedPacket, Direction};
    use chrono::{DateTime, Utc};
    use serde::Serialize;
    use std::collections::HashMap;

    /// Single observed packet kept for audit inside [`RemoteIpStats`].
    #[derive(Debug, Serialize, Clone)]
    pub struct ConnectionRecord {
        #[serde(with = "timestamp")]
        pub timestamp: DateTime<Utc>,
        pub local_port: String,
        pub remote_port: String,
        pub packet_size: u32,
        pub direction: Direction,
        pub protocol: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub tcp_flags: String,
        pub is_tls: bool,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub sni: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        pub process_name: String,
    }

    impl From<&DecodedPacket> for ConnectionRecord {
        fn from(info: &DecodedPacket) -> Self {
            ConnectionRecord {
                timestamp: info.timestamp,
                local_port: port_string(info.local_port),
                remote_port: port_string(info.remote_port),
                packet_size: info.length,
                direction: info.direction,
                protocol: info.protocol.clone(),
                tcp_flags: info.tcp_flags.clone(),
                is_tls: info.is_tls,
                sni: info.sni.clone(),
                process_name: info.process_name.clone(),
            }
        }
    }

    /// Running behavior of one remote endpoint.
    #[derive(Debug, Serialize, Clone)]
    pub struct RemoteIpStats {
        pub remote_ip: String,
        pub records: Vec<ConnectionRecord>,
        pub total_packets: u64,
        pub total_bytes: u64,
        pub send_packets: u64,
        pub recv_packets: u64,
        pub send_bytes: u64,
        pub recv_bytes: u64,
        #[serde(with = "timestamp")]
        pub first_seen: DateTime<Utc>,
        #[serde(with = "timestamp")]
        pub last_seen: DateTime<Utc>,
        pub remote_ports: HashMap<String, u64>,
        pub local_ports: HashMap<String, u64>,
        pub sni_names: HashMap<String, u64>,
        pub dns_names: HashMap<String, u64>,
        pub processes: HashMap<String, u64>,
        pub tls_count: u64,
        pub protocols: HashMap<String, u64>,
    }

    impl RemoteIpStats {
        pub fn new(remote_ip: String, first_seen: DateTime<Utc>) -> Self {
            RemoteIpStats {
                remote_ip,
                records: Vec::new(),
                total_packets: 0,
                total_bytes: 0,
                send_packets: 0,
                recv_packets: 0,
                send_bytes: 0,
                recv_bytes: 0,
                first_seen,
                last_seen: first_seen,
                remote_ports: HashMap::new(),
                local_ports: HashMap::new(),
                sni_names: HashMap::new(),
                dns_names: HashMap::new(),
                processes: HashMap::new(),
                tls_count: 0,
                protocols: HashMap::new(),
            }
        }
    }

    pub(crate) fn port_string(port: Option<u16>) -> String {
        port.map(|p| p.to_string()).unwrap_or_default()
    }

    /// RFC 3339, UTC, microsecond precision: `2024-01-02T03:04:05.123456Z`.
    pub mod timestamp {
        use chrono::{DateTime, SecondsFormat, Utc};
        use serde::Serializer;

        pub fn format(ts: &DateTime<Utc>) -> String {
            ts.to_rfc3339_opts(SecondsFormat::Micros, true)
        }

        pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&format(ts))
        }
    }
}
