// Borrowed network/transport view over a captured frame.
use crate::models::domain::{CapturedPacket, LinkKind};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
    pub urg: bool,
}

impl TcpFlags {
    /// Comma-joined names in SYN,ACK,FIN,RST,PSH,URG order.
    pub fn describe(&self) -> String {
        let flags = [
            (self.syn, "SYN"),
            (self.ack, "ACK"),
            (self.fin, "FIN"),
            (self.rst, "RST"),
            (self.psh, "PSH"),
            (self.urg, "URG"),
        ];
        flags
            .iter()
            .filter(|(set, _)| *set)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Icmp { v6: bool, payload: &'a [u8] },
    None,
}

impl<'a> Transport<'a> {
    pub fn payload(&self) -> &'a [u8] {
        match self {
            Transport::Tcp(tcp) => tcp.payload,
            Transport::Udp(udp) => udp.payload,
            Transport::Icmp { payload, .. } => payload,
            Transport::None => &[],
        }
    }

    pub fn ports(&self) -> Option<(u16, u16)> {
        match self {
            Transport::Tcp(tcp) => Some((tcp.src_port, tcp.dst_port)),
            Transport::Udp(udp) => Some((udp.src_port, udp.dst_port)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transport::Tcp(_) => "TCP",
            Transport::Udp(_) => "UDP",
            Transport::Icmp { v6: false, .. } => "ICMP",
            Transport::Icmp { v6: true, .. } => "ICMPv6",
            Transport::None => "",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub transport: Transport<'a>,
}

impl<'a> PacketView<'a> {
    /// Slice the frame down to its IP and transport layers.
    /// Frames without an IP layer (ARP, malformed) yield `None`.
    pub fn parse(packet: &'a CapturedPacket) -> Option<PacketView<'a>> {
        let sliced = match packet.link {
            LinkKind::Ethernet => SlicedPacket::from_ethernet(&packet.data).ok()?,
            LinkKind::RawIp => SlicedPacket::from_ip(&packet.data).ok()?,
        };

        let (src, dst) = match sliced.net.as_ref()? {
            NetSlice::Ipv4(ipv4) => (
                IpAddr::V4(ipv4.header().source_addr()),
                IpAddr::V4(ipv4.header().destination_addr()),
            ),
            NetSlice::Ipv6(ipv6) => (
                IpAddr::V6(ipv6.header().source_addr()),
                IpAddr::V6(ipv6.header().destination_addr()),
            ),
        };

        let transport = match sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => Transport::Tcp(TcpSegment {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                ack: tcp.acknowledgment_number(),
                flags: TcpFlags {
                    syn: tcp.syn(),
                    ack: tcp.ack(),
                    fin: tcp.fin(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    urg: tcp.urg(),
                },
                payload: tcp.payload(),
            }),
            Some(TransportSlice::Udp(udp)) => Transport::Udp(UdpDatagram {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                payload: udp.payload(),
            }),
            Some(TransportSlice::Icmpv4(icmp)) => Transport::Icmp {
                v6: false,
                payload: icmp.payload(),
            },
            Some(TransportSlice::Icmpv6(icmp)) => Transport::Icmp {
                v6: true,
                payload: icmp.payload(),
            },
            None => Transport::None,
        };

        Some(PacketView { src, dst, transport })
    }
}
