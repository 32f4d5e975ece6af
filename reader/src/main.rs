use std::error::Error;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use lattice_shmem::{lifecycle, LatticeError, LatticeReader, Rgb, ShmemConfig};

mod summary;

use summary::VolumeSummary;

type CaReader = LatticeReader<Rgb, 32, 32, 32>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
enum ConsumeMode {
    /// Check for fresh data on every display tick without blocking.
    Poll,
    /// Sleep on the data-ready event.
    Blocking,
}

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "lattice-reader.toml")]
    config: String,
    #[clap(long, value_enum)]
    mode: Option<ConsumeMode>,
    /// Stop after this many frames; 0 reads until the writer goes away.
    #[clap(long)]
    frames: Option<u64>,
    /// Print the middle z-slice of every frame.
    #[clap(long = "show-slice")]
    show_slice: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
struct ConsumerConfig {
    mode: ConsumeMode,
    frames: u64,
    tick_ms: u64,
    wait_timeout_ms: u64,
    /// A writer that has not published for this long is reported stale.
    max_staleness_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            mode: ConsumeMode::Poll,
            frames: 0,
            tick_ms: 16,
            wait_timeout_ms: 1000,
            max_staleness_ms: 5000,
        }
    }
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ReaderAppConfig {
    shmem: ShmemConfig,
    consumer: ConsumerConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .init();

    let opts: Opts = Opts::parse();
    let mut cfg: ReaderAppConfig = confy::load_path(&opts.config)?;
    if let Some(v) = opts.mode {
        cfg.consumer.mode = v;
    }
    if let Some(v) = opts.frames {
        cfg.consumer.frames = v;
    }
    info!("{:?}", &cfg);

    let shutdown = lifecycle::install_shutdown_handler(Duration::from_millis(200))?;
    let mut reader = CaReader::attach_with_retry(&cfg.shmem)?;
    let mut summary = VolumeSummary::new(opts.show_slice);
    let start = Instant::now();
    run(&mut reader, &cfg.consumer, &shutdown, &mut summary)?;
    reader.close();

    let duration = start.elapsed();
    info!(
        "{} frames in {:#?}, {} publishes skipped",
        summary.frames, duration, summary.skipped
    );
    Ok(())
}

fn print_frame(summary: &VolumeSummary) {
    println!("{}", summary);
    for row in &summary.center_slice {
        println!("  {}", row);
    }
}

/// Returns false once the writer is gone for good.
fn writer_alive(reader: &CaReader, cfg: &ConsumerConfig) -> Result<bool, LatticeError> {
    let status = reader.writer_status()?;
    if status.alive == Some(false) {
        info!("writer {} exited after {} publishes", status.pid, status.version);
        return Ok(false);
    }
    if status.is_stale(Duration::from_millis(cfg.max_staleness_ms)) {
        warn!(
            "writer {} has not published for {:?}",
            status.pid,
            status.age().unwrap_or_default()
        );
    }
    Ok(true)
}

fn run(
    reader: &mut CaReader,
    cfg: &ConsumerConfig,
    shutdown: &lifecycle::ShutdownHandle,
    summary: &mut VolumeSummary,
) -> Result<(), LatticeError> {
    let tick = Duration::from_millis(cfg.tick_ms);
    let timeout = Duration::from_millis(cfg.wait_timeout_ms);
    let mut last_check = Instant::now();
    while cfg.frames == 0 || summary.frames < cfg.frames {
        if shutdown.is_requested() {
            break;
        }
        let received = match cfg.mode {
            ConsumeMode::Poll => {
                let received = reader.try_consume_with(summary)?;
                if received.is_none() {
                    thread::sleep(tick);
                }
                received
            }
            ConsumeMode::Blocking => match reader.consume_blocking_with(summary, Some(timeout)) {
                Ok(v) => Some(v),
                Err(LatticeError::Timeout(_)) => None,
                Err(e) => return Err(e),
            },
        };
        match received {
            Some(version) => {
                debug!("received version {}", version);
                print_frame(summary);
            }
            None if last_check.elapsed() >= timeout => {
                last_check = Instant::now();
                if !writer_alive(reader, cfg)? {
                    break;
                }
            }
            None => {}
        }
    }
    Ok(())
}
