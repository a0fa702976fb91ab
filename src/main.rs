//! cam-acquire binary: round-robin acquisition across every discovered device.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cam_acquire::logging::{self, LogConfig};
use cam_acquire::{AcquisitionConfig, AcquisitionSession, DefaultLoader, DeviceRegistry};
use clap::Parser;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(
    name = "cam-acquire",
    about = "Fetch frames round-robin from every device of the given sources"
)]
struct Args {
    /// Producer source: a device directory such as /dev, or mock://<count>
    #[arg(long = "source", value_name = "PATH", required = true)]
    sources: Vec<PathBuf>,

    /// Frames to fetch from each device
    #[arg(long, default_value_t = 10)]
    frames: u64,

    /// Per-fetch timeout in milliseconds; overrides the configured one
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Capture inside fetch instead of on a background thread
    #[arg(long)]
    on_demand: bool,

    /// TOML file with acquisition settings
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Tracing filter directives (default: RUST_LOG, then "info")
    #[arg(long, value_name = "FILTER")]
    log_filter: Option<String>,
}

fn main() {
    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> cam_acquire::Result<()> {
    logging::init(&LogConfig {
        filter: args.log_filter.clone(),
        file: None,
    })?;

    let mut config = match &args.config {
        Some(path) => AcquisitionConfig::load_from(path)?,
        None => AcquisitionConfig::load()?,
    };
    if let Some(ms) = args.timeout_ms {
        config.fetch_timeout = Some(Duration::from_millis(ms));
        config.validate()?;
    }
    let timeout = config.fetch_timeout;

    let mut registry = DeviceRegistry::with_config(Arc::new(DefaultLoader::default()), config);
    for source in &args.sources {
        registry.add_source(source)?;
    }
    let report = registry.update()?;
    for (source, err) in &report.failures {
        warn!(source = %source.display(), error = %err, "source skipped");
    }

    for info in registry.device_info_list() {
        println!("Device: {info}");
    }

    let mut sessions = Vec::new();
    for index in 0..registry.device_info_list().len() {
        let session = registry.create(index)?;
        session.start(!args.on_demand)?;
        sessions.push(session);
    }

    let result = acquire(&sessions, args.frames, timeout);

    for session in &sessions {
        let stats = session.stats();
        println!(
            "{}: captured {}, delivered {}, transient failures {}",
            session.device_info().id,
            stats.frames_captured,
            stats.frames_delivered,
            stats.transient_failures
        );
        session.destroy()?;
    }
    let reset = registry.reset();
    for (device, err) in &reset.errors {
        warn!(device = %device, error = %err, "unclean teardown");
    }
    result
}

/// Fetch from each session in turn until every one has delivered `frames`.
fn acquire(
    sessions: &[AcquisitionSession],
    frames: u64,
    timeout: Option<Duration>,
) -> cam_acquire::Result<()> {
    let mut counts = vec![0_u64; sessions.len()];
    while counts.iter().any(|&count| count < frames) {
        for (session, count) in sessions.iter().zip(counts.iter_mut()) {
            if *count >= frames {
                continue;
            }
            let frame = session.fetch(timeout)?;
            println!(
                "{} frame {}: seq={}, {} bytes, ts={:?}",
                session.device_info().id,
                frame.frame_id(),
                frame.metadata().device_sequence,
                frame.bytes().len(),
                frame.metadata().timestamp
            );
            *count += 1;
        }
    }
    Ok(())
}
