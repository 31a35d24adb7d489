//! Per-flow TCP payload buffering.
//!
//! Each TCP direction is buffered independently until the bytes form a
//! complete application unit: a whole TLS record when the buffer starts with
//! a handshake content type, otherwise whatever has accumulated. Memory is
//! bounded by [`ReassemblerConfig::max_buffer`] per flow and by the idle
//! sweep across flows. There is no reorder queue: a gap or an overflow
//! restarts the buffer from the newest segment.

use crate::layers::{PacketView, Transport};
use crate::models::domain::{FlowKey, TransportKind};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

pub const MAX_BUFFER_SIZE: usize = 65535;
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(3);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

const TLS_HANDSHAKE: u8 = 0x16;
const TLS_RECORD_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ReassemblerConfig {
    pub max_buffer: usize,
    pub stream_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        ReassemblerConfig {
            max_buffer: MAX_BUFFER_SIZE,
            stream_timeout: STREAM_TIMEOUT,
            cleanup_interval: CLEANUP_INTERVAL,
        }
    }
}

#[derive(Debug)]
struct StreamBuffer {
    buffer: Vec<u8>,
    last_activity: Instant,
    next_seq: u32,
    initialized: bool,
}

impl StreamBuffer {
    fn new(now: Instant) -> Self {
        StreamBuffer {
            buffer: Vec::new(),
            last_activity: now,
            next_seq: 0,
            initialized: false,
        }
    }

    /// Replace the contents with just this segment.
    fn restart(&mut self, seq: u32, payload: &[u8]) {
        self.buffer = payload.to_vec();
        self.next_seq = seq.wrapping_add(payload.len() as u32);
    }
}

/// Result of feeding one packet to the reassembler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reassembled {
    /// Completed application bytes, present only when `ready`.
    pub payload: Option<Vec<u8>>,
    pub ready: bool,
    /// `None` for non-TCP traffic.
    pub flow: Option<FlowKey>,
}

impl Reassembled {
    fn pending(flow: Option<FlowKey>) -> Self {
        Reassembled {
            payload: None,
            ready: false,
            flow,
        }
    }

    fn complete(payload: Vec<u8>, flow: Option<FlowKey>) -> Self {
        Reassembled {
            payload: Some(payload),
            ready: true,
            flow,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub flow: String,
    pub buffer_size: usize,
    pub age_seconds: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub active_streams: usize,
    pub streams: Vec<StreamInfo>,
}

pub struct StreamReassembler {
    streams: RwLock<HashMap<FlowKey, StreamBuffer>>,
    config: ReassemblerConfig,
}

impl StreamReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        StreamReassembler {
            streams: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    pub fn process(&self, view: &PacketView<'_>) -> Reassembled {
        self.process_at(view, Instant::now())
    }

    pub(crate) fn process_at(&self, view: &PacketView<'_>, now: Instant) -> Reassembled {
        let tcp = match view.transport {
            Transport::Tcp(tcp) => tcp,
            other => {
                let payload = other.payload();
                if payload.is_empty() {
                    return Reassembled::pending(None);
                }
                return Reassembled::complete(payload.to_vec(), None);
            }
        };

        let flow = FlowKey {
            src_addr: view.src,
            dst_addr: view.dst,
            src_port: tcp.src_port,
            dst_port: tcp.dst_port,
            transport: TransportKind::Tcp,
        };

        if tcp.payload.is_empty() {
            return Reassembled::pending(Some(flow));
        }

        let mut streams = self.streams.write();
        let stream = streams
            .entry(flow)
            .or_insert_with(|| StreamBuffer::new(now));
        stream.last_activity = now;

        if !stream.initialized {
            stream.restart(tcp.seq, tcp.payload);
            stream.initialized = true;
        } else if tcp.seq == stream.next_seq {
            if stream.buffer.len() + tcp.payload.len() <= self.config.max_buffer {
                stream.buffer.extend_from_slice(tcp.payload);
                stream.next_seq = tcp.seq.wrapping_add(tcp.payload.len() as u32);
            } else {
                trace!(%flow, buffered = stream.buffer.len(), "stream buffer overflow, resetting");
                stream.restart(tcp.seq, tcp.payload);
            }
        } else if tcp.seq > stream.next_seq {
            trace!(%flow, expected = stream.next_seq, got = tcp.seq, "sequence gap, resetting");
            stream.restart(tcp.seq, tcp.payload);
        }
        // seq < next_seq: retransmission of bytes already buffered.

        match peek_record(&stream.buffer) {
            Some(len) => {
                let mut buffered = match streams.remove(&flow) {
                    Some(stream) => stream.buffer,
                    None => return Reassembled::pending(Some(flow)),
                };
                buffered.truncate(len);
                Reassembled::complete(buffered, Some(flow))
            }
            None => Reassembled::pending(Some(flow)),
        }
    }

    /// Drop every buffer idle for longer than the stream timeout.
    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub(crate) fn evict_idle_at(&self, now: Instant) -> usize {
        let timeout = self.config.stream_timeout;
        let mut streams = self.streams.write();
        let before = streams.len();
        streams.retain(|_, stream| now.saturating_duration_since(stream.last_activity) <= timeout);
        before - streams.len()
    }

    pub fn stream_stats(&self) -> StreamStats {
        let now = Instant::now();
        let streams = self.streams.read();
        StreamStats {
            active_streams: streams.len(),
            streams: streams
                .iter()
                .map(|(key, stream)| StreamInfo {
                    flow: key.to_string(),
                    buffer_size: stream.buffer.len(),
                    age_seconds: now.saturating_duration_since(stream.last_activity).as_secs_f64(),
                })
                .collect(),
        }
    }

    /// Run the idle sweep on its own task until `shutdown` flips to true.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let reassembler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(reassembler.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = reassembler.evict_idle();
                        if evicted > 0 {
                            debug!(evicted, "evicted idle streams");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("stream sweeper stopped");
        })
    }
}

/// Length of the complete unit at the head of `buffer`, if there is one.
fn peek_record(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < TLS_RECORD_HEADER_LEN {
        return None;
    }
    if buffer[0] != TLS_HANDSHAKE {
        return Some(buffer.len());
    }
    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let total = TLS_RECORD_HEADER_LEN + record_len;
    (buffer.len() >= total).then_some(total)
}
