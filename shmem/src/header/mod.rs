// [ Mutex | Event data_ready | Event consumed | HeaderState ] [ payload ... ]
//
// Both events are manual-reset and only change state with the mutex held.
// A process killed while holding the mutex leaves it locked.

use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::debug;
use raw_sync::events::{Event, EventImpl, EventInit, EventState};
use raw_sync::locks::{LockImpl, LockInit, Mutex};
use raw_sync::Timeout;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};
use crate::lattice::Dims;

const MAGIC: u32 = 0x4c41_5431;
const LAYOUT_VERSION: u32 = 1;

/// How readers decide whether the payload holds data they have not seen.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessPolicy {
    /// The first reader to consume a publish clears it for everyone.
    FirstConsumerClears,
    PerReaderVersion,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        FreshnessPolicy::FirstConsumerClears
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FreshnessCursor {
    policy: FreshnessPolicy,
    last_seen: u64,
}

impl FreshnessCursor {
    pub fn new(policy: FreshnessPolicy) -> FreshnessCursor {
        FreshnessCursor {
            policy,
            last_seen: 0,
        }
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }
}

/// What the creator recorded about the payload, checked by every attach.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct Descriptor {
    pub layout_version: u32,
    pub dims: Dims,
    pub element_size: usize,
}

impl Descriptor {
    pub fn new(dims: Dims, element_size: usize) -> Descriptor {
        Descriptor {
            layout_version: LAYOUT_VERSION,
            dims,
            element_size,
        }
    }
}

#[repr(C)]
pub(crate) struct HeaderState {
    // Written last by the creator; zero means "not initialized yet".
    magic: AtomicU32,
    layout_version: u32,
    dims: [u64; 3],
    element_size: u64,
    fresh: u32,
    writer_pid: u32,
    version: u64,
    published_at_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeaderLayout {
    pub ready_offset: usize,
    pub consumed_offset: usize,
    pub state_offset: usize,
    pub len: usize,
}

impl HeaderLayout {
    // Regions are page aligned, so every process computes the same offsets.
    pub fn at(base: *mut u8) -> HeaderLayout {
        let lock_len = Mutex::size_of(Some(base));
        let ready_offset = lock_len;
        let ready_len = Event::size_of(Some(unsafe { base.add(ready_offset) }));
        let consumed_offset = ready_offset + ready_len;
        let consumed_len = Event::size_of(Some(unsafe { base.add(consumed_offset) }));
        let unaligned = consumed_offset + consumed_len;
        let state_offset = unaligned
            + unsafe { base.add(unaligned) }.align_offset(mem::align_of::<HeaderState>());
        HeaderLayout {
            ready_offset,
            consumed_offset,
            state_offset,
            len: state_offset + mem::size_of::<HeaderState>(),
        }
    }

    pub fn max_len() -> usize {
        Mutex::size_of(None)
            + 2 * Event::size_of(None)
            + mem::align_of::<HeaderState>()
            + mem::size_of::<HeaderState>()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Signal {
    DataReady,
    Consumed,
}

pub(crate) struct Header {
    lock: Box<dyn LockImpl>,
    data_ready: Box<dyn EventImpl>,
    consumed: Box<dyn EventImpl>,
    state: *mut HeaderState,
}

impl Header {
    /// # Safety
    /// `base` must point to at least `layout.len` writable bytes that no other
    /// process uses yet.
    pub unsafe fn init(base: *mut u8, layout: &HeaderLayout, desc: Descriptor) -> Result<Header> {
        let state = base.add(layout.state_offset) as *mut HeaderState;
        let (lock, _) =
            Mutex::new(base, state as *mut u8).map_err(|e| LatticeError::lock("init mutex", e))?;
        let (data_ready, _) = Event::new(base.add(layout.ready_offset), false)
            .map_err(|e| LatticeError::lock("init data_ready event", e))?;
        let (consumed, _) = Event::new(base.add(layout.consumed_offset), false)
            .map_err(|e| LatticeError::lock("init consumed event", e))?;

        let s = &mut *state;
        s.layout_version = desc.layout_version;
        s.dims = [desc.dims.x as u64, desc.dims.y as u64, desc.dims.z as u64];
        s.element_size = desc.element_size as u64;
        s.fresh = 0;
        s.writer_pid = std::process::id();
        s.version = 0;
        s.published_at_ms = 0;
        s.magic.store(MAGIC, Ordering::Release);

        Ok(Header {
            lock,
            data_ready,
            consumed,
            state,
        })
    }

    /// `None` while the header is not initialized.
    ///
    /// # Safety
    /// `base` must point to at least `layout.len` readable bytes.
    pub unsafe fn descriptor(base: *mut u8, layout: &HeaderLayout) -> Option<Descriptor> {
        let state = &*(base.add(layout.state_offset) as *const HeaderState);
        if state.magic.load(Ordering::Acquire) != MAGIC {
            return None;
        }
        Some(Descriptor {
            layout_version: state.layout_version,
            dims: Dims::new(
                state.dims[0] as usize,
                state.dims[1] as usize,
                state.dims[2] as usize,
            ),
            element_size: state.element_size as usize,
        })
    }

    /// # Safety
    /// [`Header::descriptor`] must have returned `Some` for the same region.
    pub unsafe fn open(base: *mut u8, layout: &HeaderLayout) -> Result<Header> {
        let state = base.add(layout.state_offset) as *mut HeaderState;
        let (lock, _) = Mutex::from_existing(base, state as *mut u8)
            .map_err(|e| LatticeError::lock("open mutex", e))?;
        let (data_ready, _) = Event::from_existing(base.add(layout.ready_offset))
            .map_err(|e| LatticeError::lock("open data_ready event", e))?;
        let (consumed, _) = Event::from_existing(base.add(layout.consumed_offset))
            .map_err(|e| LatticeError::lock("open consumed event", e))?;
        Ok(Header {
            lock,
            data_ready,
            consumed,
            state,
        })
    }

    pub fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut HeaderGuard<'_>) -> R,
    {
        let guard = self.lock.lock().map_err(|e| LatticeError::lock("lock", e))?;
        let mut locked = HeaderGuard {
            state: unsafe { &mut *self.state },
            header: self,
        };
        let result = f(&mut locked);
        drop(locked);
        drop(guard);
        Ok(result)
    }

    /// Returns `false` on timeout. Must be called without the mutex held.
    pub fn wait(&self, signal: Signal, deadline: Option<Instant>) -> Result<bool> {
        let event = match signal {
            Signal::DataReady => &self.data_ready,
            Signal::Consumed => &self.consumed,
        };
        let deadline = match deadline {
            Some(v) => v,
            None => {
                return event
                    .wait(Timeout::Infinite)
                    .map(|_| true)
                    .map_err(|e| LatticeError::lock("wait", e))
            }
        };
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let slice = match wait_slice(remaining) {
                Some(v) => v,
                None => {
                    thread::sleep(remaining.min(SECOND_EDGE));
                    continue;
                }
            };
            match event.wait(Timeout::Val(slice)) {
                Ok(()) => return Ok(true),
                // Timed out on this slice, or failed early; the deadline decides.
                Err(e) => debug!("timed wait slice of {:?} ended: {}", slice, e),
            }
        }
    }
}

// raw_sync adds a timed wait's duration to CLOCK_REALTIME without carrying
// the nanoseconds into the seconds, and pthread rejects the result with
// EINVAL. A slice that ends before the next wall-clock second never carries.
const SECOND_EDGE: Duration = Duration::from_millis(5);

fn wait_slice(remaining: Duration) -> Option<Duration> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    slice_before_edge(remaining, nanos)
}

fn slice_before_edge(remaining: Duration, subsec_nanos: u32) -> Option<Duration> {
    let room = Duration::from_nanos(u64::from(1_000_000_000u32.saturating_sub(subsec_nanos)));
    if room <= SECOND_EDGE {
        return None;
    }
    Some(remaining.min(room - SECOND_EDGE))
}

pub(crate) struct HeaderGuard<'h> {
    state: &'h mut HeaderState,
    header: &'h Header,
}

impl<'h> HeaderGuard<'h> {
    pub fn is_fresh(&self) -> bool {
        self.state.fresh != 0
    }

    pub fn try_is_fresh(&self, cursor: &FreshnessCursor) -> bool {
        match cursor.policy {
            FreshnessPolicy::FirstConsumerClears => self.state.fresh != 0,
            FreshnessPolicy::PerReaderVersion => self.state.version > cursor.last_seen,
        }
    }

    pub fn mark_fresh(&mut self) -> Result<u64> {
        self.state.version += 1;
        self.state.fresh = 1;
        self.state.published_at_ms = now_ms();
        self.header
            .consumed
            .set(EventState::Clear)
            .map_err(|e| LatticeError::lock("reset consumed event", e))?;
        self.header
            .data_ready
            .set(EventState::Signaled)
            .map_err(|e| LatticeError::lock("signal data_ready event", e))?;
        Ok(self.state.version)
    }

    pub fn consume_fresh(&mut self, cursor: &mut FreshnessCursor) -> Result<u64> {
        cursor.last_seen = self.state.version;
        self.state.fresh = 0;
        if cursor.policy == FreshnessPolicy::FirstConsumerClears {
            self.header
                .data_ready
                .set(EventState::Clear)
                .map_err(|e| LatticeError::lock("reset data_ready event", e))?;
        }
        self.header
            .consumed
            .set(EventState::Signaled)
            .map_err(|e| LatticeError::lock("signal consumed event", e))?;
        Ok(cursor.last_seen)
    }

    pub fn version(&self) -> u64 {
        self.state.version
    }

    pub fn writer_pid(&self) -> u32 {
        self.state.writer_pid
    }

    pub fn published_at(&self) -> Option<SystemTime> {
        match self.state.published_at_ms {
            0 => None,
            ms => Some(UNIX_EPOCH + Duration::from_millis(ms)),
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
