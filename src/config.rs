use crate::error::{Result, SniffError};
use crate::reassembly::{ReassemblerConfig, CLEANUP_INTERVAL, MAX_BUFFER_SIZE, STREAM_TIMEOUT};
use crate::sniff::CaptureOptions;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "c2sniff")]
#[command(about = "Passive TLS SNI / DNS observer with per-remote-IP aggregation", long_about = None)]
pub struct Args {
    /// Capture interface; the pcap default device when omitted.
    #[arg(short, long, env = "C2SNIFF_INTERFACE")]
    pub interface: Option<String>,

    /// BPF filter expression.
    #[arg(short, long, env = "C2SNIFF_FILTER")]
    pub filter: Option<String>,

    #[arg(short, long = "list-interfaces")]
    pub list_interfaces: bool,

    /// Write every captured frame to this pcap file.
    #[arg(short, long, env = "C2SNIFF_WRITE")]
    pub write: Option<PathBuf>,

    /// Only keep packets from these processes (comma separated).
    #[arg(long, env = "C2SNIFF_INCLUDE")]
    pub include: Option<String>,

    /// Drop packets from these processes (comma separated).
    #[arg(long, env = "C2SNIFF_EXCLUDE")]
    pub exclude: Option<String>,

    /// JSON snapshot path; capture_stats_<timestamp>.json by default.
    #[arg(short, long, env = "C2SNIFF_OUTPUT")]
    pub output: Option<PathBuf>,

    #[arg(long, env = "C2SNIFF_SNAPLEN", default_value_t = 1600)]
    pub snaplen: i32,

    #[arg(long, env = "C2SNIFF_PROMISC")]
    pub promisc: bool,

    #[arg(long, env = "C2SNIFF_READ_TIMEOUT_MS", default_value_t = 1000)]
    pub read_timeout_ms: i32,

    /// Suppress the per-packet console line.
    #[arg(short, long, env = "C2SNIFF_QUIET")]
    pub quiet: bool,

    #[arg(long, env = "C2SNIFF_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Idle time after which a partial TCP stream is dropped.
    #[arg(long, env = "C2SNIFF_STREAM_TIMEOUT_SECS", default_value_t = STREAM_TIMEOUT.as_secs())]
    pub stream_timeout_secs: u64,
}

impl Args {
    /// `.env` first, then the command line (which wins over the environment).
    pub fn load() -> Self {
        dotenv::dotenv().ok();
        Args::parse()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub capture: CaptureOptions,
    pub list_interfaces: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub output: Option<PathBuf>,
    pub quiet: bool,
    pub log_level: String,
    pub reassembly: ReassemblerConfig,
}

impl TryFrom<Args> for Config {
    type Error = SniffError;

    fn try_from(args: Args) -> Result<Self> {
        if args.snaplen <= 0 {
            return Err(SniffError::Config(format!(
                "snaplen must be positive, got {}",
                args.snaplen
            )));
        }
        if args.read_timeout_ms < 0 {
            return Err(SniffError::Config(format!(
                "read timeout must not be negative, got {}",
                args.read_timeout_ms
            )));
        }
        if args.stream_timeout_secs == 0 {
            return Err(SniffError::Config("stream timeout must be at least 1s".into()));
        }

        let include = split_names(args.include.as_deref());
        let exclude = split_names(args.exclude.as_deref());
        if let Some(both) = include.iter().find(|n| exclude.contains(n)) {
            return Err(SniffError::Config(format!(
                "process '{}' is both included and excluded",
                both
            )));
        }

        Ok(Config {
            capture: CaptureOptions {
                interface: args.interface.filter(|i| !i.is_empty()),
                filter: args.filter,
                snaplen: args.snaplen,
                promisc: args.promisc,
                read_timeout_ms: args.read_timeout_ms,
                archive: args.write,
            },
            list_interfaces: args.list_interfaces,
            include,
            exclude,
            output: args.output,
            quiet: args.quiet,
            log_level: args.log_level,
            reassembly: ReassemblerConfig {
                max_buffer: MAX_BUFFER_SIZE,
                stream_timeout: Duration::from_secs(args.stream_timeout_secs),
                cleanup_interval: CLEANUP_INTERVAL,
            },
        })
    }
}

/// Comma-separated list, trimmed and lowercased, empties dropped.
fn split_names(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|n| n.trim().to_lowercase())
            .filter(|n| !n.is_empty())
            .collect()
    })
    .unwrap_or_default()
}
