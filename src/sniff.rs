// src/sniff.rs
use crate::error::{Result, SniffError};
use crate::models::domain::{CapturedPacket, LinkKind};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use pcap::{Active, Capture, Device, Linktype, Savefile};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub interface: Option<String>,
    pub filter: Option<String>,
    pub snaplen: i32,
    pub promisc: bool,
    pub read_timeout_ms: i32,
    /// Raw pcap archive of every captured frame.
    pub archive: Option<PathBuf>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        CaptureOptions {
            interface: None,
            filter: None,
            snaplen: 1600,
            promisc: false,
            read_timeout_ms: 1000,
            archive: None,
        }
    }
}

/// An opened, filtered live capture, not yet reading.
pub struct LiveCapture {
    cap: Capture<Active>,
    link: LinkKind,
    device: String,
    archive: Option<PathBuf>,
}

impl LiveCapture {
    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn link(&self) -> LinkKind {
        self.link
    }
}

pub fn list_interfaces() -> Result<Vec<Device>> {
    Ok(Device::list()?)
}

pub fn print_interfaces(devices: &[Device]) {
    println!("Available network interfaces:");
    for device in devices {
        println!("  {}", device.name);
        if let Some(desc) = &device.desc {
            println!("    Description: {}", desc);
        }
        for address in &device.addresses {
            match address.netmask {
                Some(mask) => println!("    Address: {} (netmask {})", address.addr, mask),
                None => println!("    Address: {}", address.addr),
            }
        }
    }
}

/// Open the device and apply the BPF filter. Any failure here is fatal.
pub fn start_sniffing(options: &CaptureOptions) -> Result<LiveCapture> {
    let (mut cap, device) = create_capture(options)?;
    configure_capture(&mut cap, options.filter.as_deref())?;

    let link = link_kind(cap.get_datalink())?;
    info!(device = %device, ?link, "capture opened");

    Ok(LiveCapture {
        cap,
        link,
        device,
        archive: options.archive.clone(),
    })
}

fn create_capture(options: &CaptureOptions) -> Result<(Capture<Active>, String)> {
    let device = match options.interface.as_deref() {
        Some(name) => Device::from(name),
        None => Device::lookup()?.ok_or(SniffError::NoDevice)?,
    };
    let name = device.name.clone();

    let cap = Capture::from_device(device)?
        .promisc(options.promisc)
        .snaplen(options.snaplen)
        .timeout(options.read_timeout_ms)
        .immediate_mode(true)
        .open()?;
    Ok((cap, name))
}

fn configure_capture(cap: &mut Capture<Active>, filter: Option<&str>) -> Result<()> {
    if let Some(filter) = filter.filter(|f| !f.trim().is_empty()) {
        cap.filter(filter, true)?;
        info!(filter, "bpf filter applied");
    }
    Ok(())
}

/// DLT values for Ethernet and the raw-IP encapsulations.
pub fn link_kind(linktype: Linktype) -> Result<LinkKind> {
    match linktype.0 {
        1 => Ok(LinkKind::Ethernet),
        12 | 14 | 101 | 228 | 229 => Ok(LinkKind::RawIp),
        _ => Err(SniffError::UnsupportedLink(
            linktype
                .get_name()
                .unwrap_or_else(|_| linktype.0.to_string()),
        )),
    }
}

/// Move the capture onto its own thread. Frames go out on `sender` until
/// `stop` is set, the receiver hangs up, or the device errors.
pub fn spawn_capture(
    capture: LiveCapture,
    sender: Sender<CapturedPacket>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<Result<u64>>> {
    let handle = thread::Builder::new()
        .name("capture".into())
        .spawn(move || process_packets(capture, sender, stop))?;
    Ok(handle)
}

fn open_archive(cap: &Capture<Active>, path: &Option<PathBuf>) -> Option<Savefile> {
    let path = path.as_ref()?;
    match cap.savefile(path) {
        Ok(file) => {
            info!(path = %path.display(), "archiving raw frames");
            Some(file)
        }
        Err(e) => {
            warn!(path = %path.display(), "could not open pcap archive: {}", e);
            None
        }
    }
}

fn process_packets(
    capture: LiveCapture,
    sender: Sender<CapturedPacket>,
    stop: Arc<AtomicBool>,
) -> Result<u64> {
    let LiveCapture {
        mut cap,
        link,
        archive,
        ..
    } = capture;
    let mut savefile = open_archive(&cap, &archive);
    let mut captured = 0u64;
    let mut outcome = Ok(());

    while !stop.load(Ordering::Relaxed) {
        let packet = match cap.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                warn!("capture read failed: {}", e);
                outcome = Err(SniffError::Capture(e));
                break;
            }
        };

        if let Some(file) = savefile.as_mut() {
            file.write(&packet);
        }

        captured += 1;
        let frame = CapturedPacket {
            timestamp: packet_time(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64),
            wire_len: packet.header.len,
            link,
            data: packet.data.to_vec(),
        };
        if sender.send(frame).is_err() {
            debug!("packet receiver closed, stopping capture");
            break;
        }
    }

    if let Some(mut file) = savefile {
        if let Err(e) = file.flush() {
            warn!("pcap archive flush failed: {}", e);
        }
    }
    match cap.stats() {
        Ok(stats) => info!(
            captured,
            received = stats.received,
            dropped = stats.dropped,
            if_dropped = stats.if_dropped,
            "capture stopped"
        ),
        Err(_) => info!(captured, "capture stopped"),
    }

    outcome.map(|_| captured)
}

fn packet_time(secs: i64, micros: i64) -> DateTime<Utc> {
    let nanos = u32::try_from(micros.clamp(0, 999_999) * 1000).unwrap_or(0);
    DateTime::from_timestamp(secs, nanos).unwrap_or_else(Utc::now)
}
