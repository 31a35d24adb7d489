use crate::db::TrafficStore;
use crate::layers::PacketView;
use crate::models::domain::{CapturedPacket, DecodedPacket};
use crate::output;
use crate::parser::ProtocolParser;
use crate::process::{FlowEndpoints, ProcessFilter, ProcessResolver};
use crate::reassembly::StreamReassembler;
use std::sync::Arc;
use tracing::trace;

/// Sequential per-packet processing, driven by the main loop.
pub struct Pipeline {
    reassembler: Arc<StreamReassembler>,
    parser: ProtocolParser,
    store: Arc<TrafficStore>,
    resolver: Option<Arc<dyn ProcessResolver>>,
    filter: ProcessFilter,
    live: bool,
    captured: u64,
    kept: u64,
}

impl Pipeline {
    pub fn new(reassembler: Arc<StreamReassembler>, store: Arc<TrafficStore>) -> Self {
        Pipeline {
            reassembler,
            parser: ProtocolParser::new(),
            store,
            resolver: None,
            filter: ProcessFilter::default(),
            live: false,
            captured: 0,
            kept: 0,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ProcessResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_filter(mut self, filter: ProcessFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Print one line per recorded packet on stdout.
    pub fn with_live_output(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn captured(&self) -> u64 {
        self.captured
    }

    pub fn kept(&self) -> u64 {
        self.kept
    }

    /// Returns the packet as recorded, or `None` when it was not ready,
    /// not IP, or filtered out.
    pub fn handle(&mut self, packet: &CapturedPacket) -> Option<DecodedPacket> {
        self.captured += 1;

        let view = PacketView::parse(packet)?;
        let reassembled = self.reassembler.process(&view);
        if !reassembled.ready {
            return None;
        }

        let mut info = self
            .parser
            .decode(packet, &view, reassembled.payload.as_deref());
        self.attribute(&mut info);

        if self.filter.is_active() && !self.filter.allows(&info.process_name) {
            trace!(process = %info.process_name, "filtered out");
            return None;
        }

        self.store.record(&info);
        self.kept += 1;
        if self.live {
            println!("{}", output::packet_line(&info));
        }
        Some(info)
    }

    fn attribute(&self, info: &mut DecodedPacket) {
        let Some(resolver) = &self.resolver else {
            return;
        };
        let Some(endpoints) = FlowEndpoints::from_packet(info) else {
            return;
        };
        if let Some(process) = resolver.resolve(&endpoints) {
            info.process_name = process.name;
            info.process_pid = process.pid;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::models::domain::LinkKind;
    use crate::process::ProcessInfo;
    use crate::reassembly::ReassemblerConfig;
    use chrono::Utc;
    use etherparse::PacketBuilder;

    struct Fixed(&'static str);

    impl ProcessResolver for Fixed {
        fn resolve(&self, endpoints: &FlowEndpoints) -> Option<ProcessInfo> {
            (endpoints.src.port() == 40000).then(|| ProcessInfo {
                name: self.0.to_string(),
                pid: 77,
            })
        }

        fn refresh(&self) -> Result<()> {
            Ok(())
        }
    }

    fn udp_frame(src_port: u16, payload: &[u8]) -> CapturedPacket {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [6, 5, 4, 3, 2, 1])
            .ipv4([192, 168, 1, 5], [9, 9, 9, 9], 64)
            .udp(src_port, 9000);
        let mut data = Vec::with_capacity(builder.size(payload.len()));
        builder.write(&mut data, payload).unwrap();
        CapturedPacket {
            timestamp: Utc::now(),
            wire_len: data.len() as u32,
            link: LinkKind::Ethernet,
            data,
        }
    }

    fn pipeline() -> (Pipeline, Arc<TrafficStore>) {
        let store = Arc::new(TrafficStore::new());
        let reassembler = Arc::new(StreamReassembler::new(ReassemblerConfig::default()));
        (Pipeline::new(reassembler, Arc::clone(&store)), store)
    }

    #[test]
    fn attributes_and_records() {
        let (pipeline, store) = pipeline();
        let mut pipeline = pipeline.with_resolver(Arc::new(Fixed("beacon")));

        let info = pipeline.handle(&udp_frame(40000, b"ping")).unwrap();
        assert_eq!(info.process_name, "beacon");
        assert_eq!(info.process_pid, 77);
        assert_eq!(store.get("9.9.9.9").unwrap().read().processes["beacon"], 1);
        assert_eq!((pipeline.captured(), pipeline.kept()), (1, 1));
    }

    #[test]
    fn include_list_drops_other_processes() {
        let (pipeline, store) = pipeline();
        let mut pipeline = pipeline
            .with_resolver(Arc::new(Fixed("beacon")))
            .with_filter(ProcessFilter::new(vec!["BEACON".into()], Vec::new()));

        assert!(pipeline.handle(&udp_frame(40000, b"ping")).is_some());
        assert!(pipeline.handle(&udp_frame(40001, b"ping")).is_none());
        assert_eq!(store.total_packets(), 1);
        assert_eq!((pipeline.captured(), pipeline.kept()), (2, 1));
    }

    #[test]
    fn non_ip_frames_are_counted_but_skipped() {
        let (mut pipeline, store) = pipeline();
        let junk = CapturedPacket {
            timestamp: Utc::now(),
            wire_len: 3,
            link: LinkKind::Ethernet,
            data: vec![0, 1, 2],
        };
        assert!(pipeline.handle(&junk).is_none());
        assert_eq!(pipeline.captured(), 1);
        assert_eq!(store.ip_count(), 0);
    }
}
