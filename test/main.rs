use std::env;
use std::error::Error;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{self, Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use lattice_shmem::{AttachRetry, LatticeError, LatticeReader, Rgb, SharedRegion, ShmemConfig};
use tempfile::Builder;

type CaReader = LatticeReader<Rgb, 32, 32, 32>;

fn failure(message: String) -> Box<dyn Error> {
    Box::new(io::Error::new(io::ErrorKind::Other, message))
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".."))
}

/// Builds the writer and reader binaries and returns the directory they land in.
fn build_binaries() -> Result<PathBuf, Box<dyn Error>> {
    let root = workspace_root();
    let cargo_executable = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    println!("Building lattice-writer and lattice-reader in {}", root.display());
    let status = Command::new(&cargo_executable)
        .current_dir(&root)
        .args(["build", "--package", "lattice-writer", "--package", "lattice-reader"])
        .status()?;
    if !status.success() {
        return Err(failure(format!("cargo build failed with status: {}", status)));
    }
    let target_dir = env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| root.join("target"));
    Ok(target_dir.join("debug"))
}

fn write_config(path: &Path, region: &str, extra: &str) -> Result<(), Box<dyn Error>> {
    let content = format!(
        "[shmem]\n\
        name = \"{}\"\n\
        freshness = \"per_reader_version\"\n\
        poll_interval_ms = 1\n\
        \n\
        [shmem.attach]\n\
        max_attempts = 0\n\
        initial_backoff_ms = 5\n\
        max_backoff_ms = 100\n\
        \n\
        {}",
        region, extra
    );
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

struct Binaries {
    dir: PathBuf,
    writer_config: PathBuf,
    reader_config: PathBuf,
}

impl Binaries {
    fn writer(&self, steps: u64, interval_ms: u64) -> io::Result<Child> {
        Command::new(self.dir.join("lattice-writer"))
            .arg("--config")
            .arg(&self.writer_config)
            .arg("--steps")
            .arg(steps.to_string())
            .arg("--interval-ms")
            .arg(interval_ms.to_string())
            .stdout(Stdio::null())
            .spawn()
    }

    fn reader(&self, mode: &str, frames: u64) -> io::Result<Child> {
        Command::new(self.dir.join("lattice-reader"))
            .arg("--config")
            .arg(&self.reader_config)
            .arg("--mode")
            .arg(mode)
            .arg("--frames")
            .arg(frames.to_string())
            .stdout(Stdio::piped())
            .spawn()
    }
}

fn frame_versions(stdout: &[u8]) -> Vec<u64> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter_map(|line| line.strip_prefix("frame version="))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|v| v.parse().ok())
        .collect()
}

fn attach_config(region: &str) -> ShmemConfig {
    ShmemConfig {
        name: region.to_string(),
        attach: AttachRetry {
            max_attempts: 400,
            initial_backoff_ms: 5,
            max_backoff_ms: 25,
        },
        ..ShmemConfig::default()
    }
}

fn expect_removed(region: &str) -> Result<(), Box<dyn Error>> {
    match SharedRegion::attach(region) {
        Err(LatticeError::NotFound { .. }) => Ok(()),
        Ok(_) => Err(failure(format!("region `{}` still exists", region))),
        Err(e) => Err(Box::new(e)),
    }
}

/// A reader started before the writer waits for it, then receives frames in
/// publish order. The writer unlinks the region when it finishes.
fn reader_before_writer(bins: &Binaries, region: &str, mode: &str) -> Result<(), Box<dyn Error>> {
    println!("\n--- reader ({}) started before writer ---", mode);
    let reader = bins.reader(mode, 10)?;
    thread::sleep(Duration::from_millis(200));
    let mut writer = bins.writer(80, 20)?;

    let output = reader.wait_with_output()?;
    let versions = frame_versions(&output.stdout);
    println!("reader versions: {:?}", versions);
    if !output.status.success() {
        return Err(failure(format!("lattice-reader failed with status: {}", output.status)));
    }
    if versions.len() != 10 {
        return Err(failure(format!("expected 10 frames, got {}", versions.len())));
    }
    if versions.windows(2).any(|w| w[0] >= w[1]) {
        return Err(failure(format!("versions not increasing: {:?}", versions)));
    }

    let status = writer.wait()?;
    if !status.success() {
        return Err(failure(format!("lattice-writer failed with status: {}", status)));
    }
    expect_removed(region)?;
    println!("reader-before-writer ({}) passed.", mode);
    Ok(())
}

/// Crash recovery: a SIGKILLed writer leaves its region behind, a new writer
/// reclaims the name, and a SIGTERMed writer cleans up after itself.
fn writer_restart_after_crash(bins: &Binaries, region: &str) -> Result<(), Box<dyn Error>> {
    println!("\n--- writer restart after crash ---");
    let cfg = attach_config(region);

    // A long step interval keeps the writer asleep, outside the header lock,
    // right after the publish we wait for; a kill inside the lock would leave
    // the region locked for good.
    let mut crashed = bins.writer(0, 2000)?;
    let crashed_pid = crashed.id();
    {
        let mut reader = CaReader::attach_with_retry(&cfg)?;
        reader.consume_blocking(Some(Duration::from_secs(5)))?;
        // Attached late in the interval: wait for the next publish instead.
        if reader.writer_status()?.age().unwrap_or_default() > Duration::from_millis(500) {
            reader.consume_blocking(Some(Duration::from_secs(5)))?;
        }
        crashed.kill()?;
    }
    crashed.wait()?;
    println!("killed writer {}", crashed_pid);

    {
        let reader = CaReader::attach(&cfg)?;
        let status = reader.writer_status()?;
        println!("stale region: {:?}", status);
        if status.pid != crashed_pid || status.alive == Some(true) {
            return Err(failure(format!("expected a dead writer {}, got {:?}", crashed_pid, status)));
        }
    }

    let mut restarted = bins.writer(0, 10)?;
    let restarted_pid = restarted.id();
    let started = Instant::now();
    let snapshot = loop {
        let mut reader = CaReader::attach_with_retry(&cfg)?;
        if reader.writer_status()?.pid == restarted_pid {
            break reader.consume_blocking(Some(Duration::from_secs(5)))?;
        }
        if started.elapsed() > Duration::from_secs(10) {
            return Err(failure("restarted writer never replaced the stale region".to_string()));
        }
        thread::sleep(Duration::from_millis(20));
    };
    println!("restarted writer {} published version {}", restarted_pid, snapshot.version);

    let rc = unsafe { libc::kill(restarted_pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        return Err(Box::new(io::Error::last_os_error()));
    }
    let status = restarted.wait()?;
    println!("writer exited on SIGTERM with {}", status);
    expect_removed(region)?;
    println!("writer-restart-after-crash passed.");
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting lattice channel process tests...");

    let temp_dir = Builder::new().prefix("lattice_it").tempdir()?;
    let region = format!("lattice-it-{}", process::id());
    let writer_config = temp_dir.path().join("writer.toml");
    let reader_config = temp_dir.path().join("reader.toml");
    write_config(&writer_config, &region, "[simulation]\nseed = 7\ndensity = 0.3\n")?;
    write_config(&reader_config, &region, "[consumer]\ntick_ms = 2\nwait_timeout_ms = 500\n")?;

    let bins = Binaries {
        dir: build_binaries()?,
        writer_config,
        reader_config,
    };

    reader_before_writer(&bins, &region, "poll")?;
    reader_before_writer(&bins, &region, "blocking")?;
    writer_restart_after_crash(&bins, &region)?;

    println!("\nAll process tests passed.");
    Ok(())
}
