use std::collections::HashSet;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use once_cell::sync::{Lazy, OnceCell};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use crate::errors::{LatticeError, Result};
use crate::region::SharedRegion;

static OWNED_REGIONS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));
static SHUTDOWN: OnceCell<ShutdownHandle> = OnceCell::new();
static CLOSING: AtomicBool = AtomicBool::new(false);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachRetry {
    /// 0 retries forever.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AttachRetry {
    fn default() -> Self {
        AttachRetry {
            max_attempts: 50,
            initial_backoff_ms: 10,
            max_backoff_ms: 500,
        }
    }
}

impl AttachRetry {
    pub fn once() -> AttachRetry {
        AttachRetry {
            max_attempts: 1,
            ..AttachRetry::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(LatticeError::Config(format!(
                "attach backoff must satisfy 0 < initial ({}) <= max ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }

    /// Pause after the `attempt`-th failure (1-based): doubling, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Retries `f` while its error is retriable. The last error is returned.
    pub fn run<R, F>(&self, mut f: F) -> Result<R>
    where
        F: FnMut() -> Result<R>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f() {
                Err(e)
                    if e.is_retriable()
                        && (self.max_attempts == 0 || attempt < self.max_attempts) =>
                {
                    let pause = self.backoff(attempt);
                    debug!("{} (attempt {}), retrying in {:?}", e, attempt, pause);
                    thread::sleep(pause);
                }
                other => return other,
            }
        }
    }
}

pub(crate) fn register_owned(name: &str) {
    if let Ok(mut names) = OWNED_REGIONS.lock() {
        names.insert(name.to_string());
    }
}

pub(crate) fn unregister_owned(name: &str) {
    if let Ok(mut names) = OWNED_REGIONS.lock() {
        names.remove(name);
    }
}

pub fn owned_regions() -> Vec<String> {
    match OWNED_REGIONS.lock() {
        Ok(names) => names.iter().cloned().collect(),
        Err(_) => Vec::new(),
    }
}

/// Unlinks every region still owned by a writer of this process.
pub fn remove_owned_regions() -> usize {
    let names: Vec<String> = match OWNED_REGIONS.lock() {
        Ok(mut names) => names.drain().collect(),
        Err(_) => return 0,
    };
    let mut removed = 0;
    for name in names {
        match SharedRegion::remove(&name) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => error!("failed to remove `{}` during shutdown: {}", name, e),
        }
    }
    removed
}

/// True once a termination signal arrived. Writers refuse to publish after that.
pub fn shutdown_requested() -> bool {
    CLOSING.load(Ordering::Relaxed)
}

#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    grace: Duration,
}

impl ShutdownHandle {
    pub fn is_requested(&self) -> bool {
        shutdown_requested()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}

/// On SIGHUP, SIGINT, SIGQUIT or SIGTERM: raise the shutdown flag, give the
/// main loop `grace` to close its channels, then unlink what is left and exit.
pub fn install_shutdown_handler(grace: Duration) -> Result<ShutdownHandle> {
    SHUTDOWN
        .get_or_try_init(|| {
            let mut signals =
                Signals::new([SIGHUP, SIGINT, SIGQUIT, SIGTERM]).map_err(LatticeError::Signal)?;
            thread::Builder::new()
                .name("lattice-shutdown".into())
                .spawn(move || {
                    if let Some(sig) = signals.forever().next() {
                        warn!("received signal {}, shutting down", sig);
                        CLOSING.store(true, Ordering::SeqCst);
                        // wait for the main loop to close its channels.
                        thread::sleep(grace);
                        let removed = remove_owned_regions();
                        info!("removed {} shared memory region(s) on exit", removed);
                        process::exit(128 + sig);
                    }
                })
                .map_err(LatticeError::Signal)?;
            Ok(ShutdownHandle { grace })
        })
        .cloned()
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WriterStatus {
    pub pid: u32,
    pub version: u64,
    pub published_at: Option<SystemTime>,
    /// `None` where liveness cannot be checked.
    pub alive: Option<bool>,
}

impl WriterStatus {
    pub fn age(&self) -> Option<Duration> {
        self.published_at
            .and_then(|t| SystemTime::now().duration_since(t).ok())
    }

    /// A writer is stale when its process is gone or it has not published for
    /// longer than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        if self.alive == Some(false) {
            return true;
        }
        self.age().map_or(false, |age| age > max_age)
    }
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> Option<bool> {
    if pid == 0 {
        return None;
    }
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return Some(true);
    }
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => Some(true),
        Some(libc::ESRCH) => Some(false),
        _ => None,
    }
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> Option<bool> {
    None
}
