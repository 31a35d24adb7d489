use anyhow::{Context, Result};
use c2sniff::config::{Args, Config};
use c2sniff::db::TrafficStore;
use c2sniff::models::domain::CapturedPacket;
use c2sniff::output;
use c2sniff::pipeline::Pipeline;
use c2sniff::process::{self, ProcessFilter, REFRESH_INTERVAL};
use c2sniff::reassembly::StreamReassembler;
use c2sniff::sniff;
use chrono::Local;
use crossbeam_channel::{bounded, select, unbounded, Receiver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::try_from(Args::load())?;

    if config.list_interfaces {
        let devices = sniff::list_interfaces().context("failed to list interfaces")?;
        sniff::print_interfaces(&devices);
        return Ok(());
    }

    init_logging(&config.log_level);

    let capture = sniff::start_sniffing(&config.capture).context("failed to open capture")?;
    info!(device = capture.device(), "starting c2sniff");

    let reassembler = Arc::new(StreamReassembler::new(config.reassembly));
    let store = Arc::new(TrafficStore::new());
    let resolver = process::platform_resolver();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = reassembler.spawn_sweeper(shutdown_rx.clone());
    let refresher = process::spawn_refresher(Arc::clone(&resolver), REFRESH_INTERVAL, shutdown_rx);

    let (signal_tx, signal_rx) = bounded(1);
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })
    .context("failed to install signal handler")?;

    let (packet_tx, packet_rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let capture_thread = sniff::spawn_capture(capture, packet_tx, Arc::clone(&stop))?;

    let pipeline = Pipeline::new(Arc::clone(&reassembler), Arc::clone(&store))
        .with_resolver(resolver)
        .with_filter(ProcessFilter::new(config.include.clone(), config.exclude.clone()))
        .with_live_output(!config.quiet);

    let pipeline =
        tokio::task::spawn_blocking(move || process_events(pipeline, packet_rx, signal_rx)).await?;

    stop.store(true, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    for task in [sweeper, refresher] {
        if let Err(e) = task.await {
            warn!("background task failed: {}", e);
        }
    }

    match tokio::task::spawn_blocking(move || capture_thread.join()).await? {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("capture ended with error: {}", e),
        Err(_) => error!("capture thread panicked"),
    }

    let streams = reassembler.stream_stats();
    info!(
        captured = pipeline.captured(),
        kept = pipeline.kept(),
        remote_ips = store.ip_count(),
        pending_streams = streams.active_streams,
        "capture finished"
    );

    print!("{}", output::render_report(&store, true));

    let path = config
        .output
        .clone()
        .unwrap_or_else(|| output::default_snapshot_path(Local::now()));
    match output::save_snapshot(&store, &path) {
        Ok(()) => info!(path = %path.display(), "snapshot written"),
        Err(e) => error!(path = %path.display(), "snapshot export failed: {}", e),
    }

    Ok(())
}

fn process_events(
    mut pipeline: Pipeline,
    packets: Receiver<CapturedPacket>,
    shutdown: Receiver<()>,
) -> Pipeline {
    loop {
        select! {
            recv(packets) -> packet => match packet {
                Ok(packet) => {
                    pipeline.handle(&packet);
                }
                Err(_) => {
                    warn!("capture source closed");
                    break;
                }
            },
            recv(shutdown) -> _ => {
                info!("shutdown requested");
                break;
            }
        }
    }
    pipeline
}
