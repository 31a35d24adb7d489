//! Best-effort attribution of packets to local processes.
//!
//! The resolver keeps a socket-owner table that a background task rebuilds
//! on a fixed cadence; lookups on the packet path only take a read lock.
//! Any failure just means no attribution.

use crate::error::{Result, SniffError};
use crate::models::domain::{DecodedPacket, TransportKind};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEndpoints {
    pub transport: TransportKind,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowEndpoints {
    pub fn from_packet(info: &DecodedPacket) -> Option<Self> {
        let transport = match info.protocol.as_str() {
            "TCP" => TransportKind::Tcp,
            "UDP" => TransportKind::Udp,
            _ => return None,
        };
        Some(FlowEndpoints {
            transport,
            src: SocketAddr::new(info.src_ip?, info.src_port?),
            dst: SocketAddr::new(info.dst_ip?, info.dst_port?),
        })
    }
}

pub trait ProcessResolver: Send + Sync {
    fn resolve(&self, endpoints: &FlowEndpoints) -> Option<ProcessInfo>;

    /// Rebuild whatever tables `resolve` reads from.
    fn refresh(&self) -> Result<()>;
}

/// Used where no platform mechanism exists.
#[derive(Debug, Default)]
pub struct NullResolver;

impl ProcessResolver for NullResolver {
    fn resolve(&self, _endpoints: &FlowEndpoints) -> Option<ProcessInfo> {
        None
    }

    fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SocketTables {
    owners: HashMap<(TransportKind, SocketAddr), u32>,
    names: HashMap<u32, String>,
}

/// Socket ownership from procfs: `net/{tcp,tcp6,udp,udp6}` give the inode
/// of each local endpoint, `<pid>/fd` links map inodes back to pids.
pub struct ProcfsResolver {
    root: PathBuf,
    tables: RwLock<SocketTables>,
}

impl ProcfsResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        ProcfsResolver {
            root: root.into(),
            tables: RwLock::new(SocketTables::default()),
        }
    }

    fn scan_processes(&self) -> Result<(HashMap<u64, u32>, HashMap<u32, String>)> {
        let mut inodes = HashMap::new();
        let mut names = HashMap::new();

        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Other users' fds are unreadable without privileges.
            let Ok(fds) = fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let mut owns_socket = false;
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else { continue };
                if let Some(inode) = socket_inode(&target) {
                    inodes.insert(inode, pid);
                    owns_socket = true;
                }
            }
            if owns_socket {
                if let Ok(comm) = fs::read_to_string(entry.path().join("comm")) {
                    names.insert(pid, comm.trim().to_string());
                }
            }
        }
        Ok((inodes, names))
    }
}

impl ProcessResolver for ProcfsResolver {
    fn resolve(&self, endpoints: &FlowEndpoints) -> Option<ProcessInfo> {
        let tables = self.tables.read();
        let lookup = |addr: SocketAddr| tables.owners.get(&(endpoints.transport, addr)).copied();

        let pid = lookup(endpoints.src)
            .or_else(|| lookup(endpoints.dst))
            .or_else(|| lookup(unspecified(endpoints.src)))
            .or_else(|| lookup(unspecified(endpoints.dst)))?;

        Some(ProcessInfo {
            name: tables.names.get(&pid).cloned().unwrap_or_default(),
            pid,
        })
    }

    fn refresh(&self) -> Result<()> {
        let (inodes, names) = self.scan_processes()?;
        let mut owners = HashMap::new();

        let sources = [
            ("tcp", TransportKind::Tcp),
            ("tcp6", TransportKind::Tcp),
            ("udp", TransportKind::Udp),
            ("udp6", TransportKind::Udp),
        ];
        let mut read_any = false;
        for (file, transport) in sources {
            let Ok(table) = fs::read_to_string(self.root.join("net").join(file)) else {
                continue;
            };
            read_any = true;
            for (local, inode) in table.lines().skip(1).filter_map(parse_socket_line) {
                if let Some(pid) = inodes.get(&inode) {
                    owners.insert((transport, local), *pid);
                }
            }
        }
        if !read_any {
            return Err(SniffError::ProcessTable(format!(
                "no socket tables under {}",
                self.root.join("net").display()
            )));
        }

        *self.tables.write() = SocketTables { owners, names };
        Ok(())
    }
}

/// Resolver for the host platform.
pub fn platform_resolver() -> Arc<dyn ProcessResolver> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(ProcfsResolver::new("/proc"))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(NullResolver)
    }
}

/// Rebuild the resolver tables every `interval` until `shutdown` flips.
pub fn spawn_refresher(
    resolver: Arc<dyn ProcessResolver>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let resolver = Arc::clone(&resolver);
                    match tokio::task::spawn_blocking(move || resolver.refresh()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("process table refresh failed: {}", e),
                        Err(e) => debug!("process table refresh task failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("process refresher stopped");
    })
}

/// Include/exclude rules on process names, case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl ProcessFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>) -> Self {
        ProcessFilter { include, exclude }
    }

    pub fn is_active(&self) -> bool {
        !self.include.is_empty() || !self.exclude.is_empty()
    }

    pub fn allows(&self, process_name: &str) -> bool {
        let matches = |list: &[String]| list.iter().any(|n| n.eq_ignore_ascii_case(process_name));
        if !self.include.is_empty() && !matches(&self.include) {
            return false;
        }
        !matches(&self.exclude)
    }
}

fn unspecified(addr: SocketAddr) -> SocketAddr {
    let ip = match addr.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, addr.port())
}

fn socket_inode(link: &Path) -> Option<u64> {
    link.to_str()?
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// `(local endpoint, inode)` from one row of a procfs socket table.
fn parse_socket_line(line: &str) -> Option<(SocketAddr, u64)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let local = parse_hex_endpoint(fields.get(1)?)?;
    let inode = fields.get(9)?.parse().ok()?;
    Some((local, inode))
}

/// Kernel prints addresses as native-endian 32-bit words in hex.
fn parse_hex_endpoint(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(u32::from_str_radix(addr, 16).ok()?.to_ne_bytes())),
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(addr.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_rules() {
        let none = ProcessFilter::default();
        assert!(!none.is_active());
        assert!(none.allows(""));

        let include = ProcessFilter::new(vec!["Python".into()], vec![]);
        assert!(include.allows("python"));
        assert!(!include.allows("curl"));
        assert!(!include.allows(""));

        let exclude = ProcessFilter::new(vec![], vec!["chrome".into(), "firefox".into()]);
        assert!(exclude.allows("curl"));
        assert!(!exclude.allows("Firefox"));
    }

    #[cfg(target_endian = "little")]
    #[test]
    fn parses_proc_net_rows() {
        let row = "   0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 777 1 0000000000000000 100 0 0 10 0";
        let (addr, inode) = parse_socket_line(row).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(inode, 777);

        let v6 = parse_hex_endpoint("00000000000000000000000001000000:0035").unwrap();
        assert_eq!(v6, "[::1]:53".parse().unwrap());
    }

    #[test]
    fn socket_link_format() {
        assert_eq!(socket_inode(Path::new("socket:[4242]")), Some(4242));
        assert_eq!(socket_inode(Path::new("pipe:[4242]")), None);
    }

    #[cfg(all(unix, target_endian = "little"))]
    #[test]
    fn procfs_fixture_round_trip() {
        let root = std::env::temp_dir().join(format!("c2sniff-procfs-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(root.join("net")).unwrap();
        fs::create_dir_all(root.join("4242/fd")).unwrap();
        fs::write(
            root.join("net/tcp"),
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
             0: 0A00000A:C350 22D8B85D:01BB 01 00000000:00000000 00:00000000 00000000  1000        0 777 1\n",
        )
        .unwrap();
        fs::write(
            root.join("net/udp"),
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
             0: 00000000:14E9 00000000:0000 07 00000000:00000000 00:00000000 00000000  1000        0 778 2\n",
        )
        .unwrap();
        fs::write(root.join("4242/comm"), "curl\n").unwrap();
        std::os::unix::fs::symlink("socket:[777]", root.join("4242/fd/3")).unwrap();
        std::os::unix::fs::symlink("socket:[778]", root.join("4242/fd/4")).unwrap();

        let resolver = ProcfsResolver::new(&root);
        resolver.refresh().unwrap();

        let tcp = FlowEndpoints {
            transport: TransportKind::Tcp,
            src: "93.184.216.34:443".parse().unwrap(),
            dst: "10.0.0.10:50000".parse().unwrap(),
        };
        assert_eq!(
            resolver.resolve(&tcp),
            Some(ProcessInfo {
                name: "curl".into(),
                pid: 4242
            })
        );

        // Bound to 0.0.0.0:5353
        let udp = FlowEndpoints {
            transport: TransportKind::Udp,
            src: "192.168.1.9:5353".parse().unwrap(),
            dst: "224.0.0.251:5353".parse().unwrap(),
        };
        assert_eq!(resolver.resolve(&udp).map(|p| p.pid), Some(4242));

        let unknown = FlowEndpoints {
            transport: TransportKind::Udp,
            ..tcp
        };
        assert_eq!(resolver.resolve(&unknown), None);

        fs::remove_dir_all(&root).unwrap();
    }

    #[derive(Default)]
    struct Counting(std::sync::atomic::AtomicUsize);

    impl ProcessResolver for Counting {
        fn resolve(&self, _endpoints: &FlowEndpoints) -> Option<ProcessInfo> {
            None
        }

        fn refresh(&self) -> Result<()> {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Err(SniffError::ProcessTable("unavailable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_keeps_running_through_failures() {
        let resolver = Arc::new(Counting::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_refresher(resolver.clone(), REFRESH_INTERVAL, rx);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(resolver.0.load(std::sync::atomic::Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_loads_tables_before_the_first_interval() {
        let resolver = Arc::new(Counting::default());
        let (tx, rx) = watch::channel(false);
        let handle = spawn_refresher(resolver.clone(), REFRESH_INTERVAL, rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(resolver.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[test]
    fn missing_tables_is_an_error() {
        let resolver = ProcfsResolver::new(std::env::temp_dir().join("c2sniff-no-such-procfs"));
        assert!(resolver.refresh().is_err());
        assert!(NullResolver.refresh().is_ok());
    }
}
