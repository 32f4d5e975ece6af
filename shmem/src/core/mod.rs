use std::mem;
use std::slice;
use std::thread;
use std::time::{Duration, Instant};

use log::info;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};
use crate::header::{Descriptor, FreshnessPolicy, Header, HeaderGuard, HeaderLayout, Signal};
use crate::lattice::{Dims, Voxel};
use crate::lifecycle::AttachRetry;
use crate::region::SharedRegion;

pub static DEFAULT_REGION_NAME: &str = "lattice-ipc";

// Start of the payload relative to the region base.
const PAYLOAD_ALIGN: usize = 64;

/// What `publish` does when the previous value has not been consumed yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffMode {
    LatestValue,
    Strict,
}

impl Default for HandoffMode {
    fn default() -> Self {
        HandoffMode::LatestValue
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Created,
    Attached,
    Closed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmemConfig {
    pub name: String,
    pub freshness: FreshnessPolicy,
    pub handoff: HandoffMode,
    /// Bound for a strict-mode publish waiting on a reader. `None` waits forever.
    pub handoff_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    pub attach: AttachRetry,
}

impl Default for ShmemConfig {
    fn default() -> Self {
        ShmemConfig {
            name: DEFAULT_REGION_NAME.to_string(),
            freshness: FreshnessPolicy::default(),
            handoff: HandoffMode::default(),
            handoff_timeout_ms: None,
            poll_interval_ms: 1,
            attach: AttachRetry::default(),
        }
    }
}

impl ShmemConfig {
    pub fn builder() -> ShmemConfigBuilder {
        ShmemConfigBuilder {
            cfg: ShmemConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let bare = self.name.strip_prefix('/').unwrap_or(&self.name);
        if bare.is_empty() {
            return Err(LatticeError::Config("region name must not be empty".into()));
        }
        if bare.contains('/') || bare.contains('\0') {
            return Err(LatticeError::Config(format!(
                "region name `{}` must not contain `/` or NUL after the leading slash",
                self.name
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(LatticeError::Config("poll_interval_ms must be positive".into()));
        }
        self.attach.validate()
    }

    pub fn handoff_timeout(&self) -> Option<Duration> {
        self.handoff_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub struct ShmemConfigBuilder {
    cfg: ShmemConfig,
}

impl ShmemConfigBuilder {
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.name = name.into();
        self
    }

    pub fn freshness(mut self, policy: FreshnessPolicy) -> Self {
        self.cfg.freshness = policy;
        self
    }

    pub fn handoff(mut self, mode: HandoffMode) -> Self {
        self.cfg.handoff = mode;
        self
    }

    pub fn handoff_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.handoff_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.cfg.poll_interval_ms = millis(interval);
        self
    }

    pub fn attach(mut self, retry: AttachRetry) -> Self {
        self.cfg.attach = retry;
        self
    }

    pub fn build(self) -> Result<ShmemConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

// Saturates instead of wrapping; sub-millisecond values round down to 0.
fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub header: HeaderLayout,
    pub payload_offset: usize,
    pub payload_len: usize,
}

impl RegionLayout {
    // Large enough for any base alignment.
    pub fn required_size<T: Voxel>(volume: usize) -> usize {
        HeaderLayout::max_len() + payload_align::<T>() + volume * mem::size_of::<T>()
    }

    pub fn at<T: Voxel>(base: *mut u8, volume: usize) -> RegionLayout {
        let header = HeaderLayout::at(base);
        let payload_offset =
            header.len + unsafe { base.add(header.len) }.align_offset(payload_align::<T>());
        RegionLayout {
            header,
            payload_offset,
            payload_len: volume * mem::size_of::<T>(),
        }
    }

    pub fn end(&self) -> usize {
        self.payload_offset + self.payload_len
    }
}

fn payload_align<T: Voxel>() -> usize {
    PAYLOAD_ALIGN.max(mem::align_of::<T>())
}

pub(crate) struct Locked<'g, 'h, T> {
    pub header: &'g mut HeaderGuard<'h>,
    pub payload: &'g mut [T],
}

pub(crate) struct ChannelCore<T: Voxel> {
    // Declared before `region` so the lock handles go before the mapping.
    header: Header,
    payload: *mut T,
    dims: Dims,
    region: SharedRegion,
}

impl<T: Voxel> ChannelCore<T> {
    pub fn create(name: &str, dims: Dims) -> Result<ChannelCore<T>> {
        let size = RegionLayout::required_size::<T>(dims.volume());
        let region = SharedRegion::create(name, size)?;
        let base = region.as_ptr();
        let layout = RegionLayout::at::<T>(base, dims.volume());
        debug_assert!(layout.end() <= region.len());

        // SharedRegion::create zero-filled the payload already.
        let header = unsafe {
            Header::init(base, &layout.header, Descriptor::new(dims, mem::size_of::<T>()))?
        };
        info!(
            "initialized {} lattice of {}-byte voxels in `{}`",
            dims,
            mem::size_of::<T>(),
            region.name()
        );
        Ok(ChannelCore {
            header,
            payload: unsafe { base.add(layout.payload_offset) } as *mut T,
            dims,
            region,
        })
    }

    pub fn attach(name: &str, dims: Dims) -> Result<ChannelCore<T>> {
        let region = SharedRegion::attach(name)?;
        let base = region.as_ptr();
        let layout = RegionLayout::at::<T>(base, dims.volume());
        let name = region.name().to_string();

        if region.len() < layout.header.len {
            return Err(LatticeError::SizeMismatch {
                name,
                expected: layout.end(),
                found: region.len(),
            });
        }
        let desc = match unsafe { Header::descriptor(base, &layout.header) } {
            Some(v) => v,
            None => return Err(LatticeError::NotReady { name }),
        };
        let expected = Descriptor::new(dims, mem::size_of::<T>());
        if desc.layout_version != expected.layout_version {
            return Err(LatticeError::IncompatibleLayout {
                name,
                reason: format!(
                    "header layout version {}, expected {}",
                    desc.layout_version, expected.layout_version
                ),
            });
        }
        if desc.element_size != expected.element_size {
            return Err(LatticeError::IncompatibleLayout {
                name,
                reason: format!(
                    "{}-byte voxels, expected {}-byte voxels",
                    desc.element_size, expected.element_size
                ),
            });
        }
        if desc.dims != dims {
            return Err(LatticeError::DimensionMismatch {
                name,
                expected: dims,
                found: desc.dims,
            });
        }
        if region.len() < layout.end() {
            return Err(LatticeError::SizeMismatch {
                name,
                expected: layout.end(),
                found: region.len(),
            });
        }

        let header = unsafe { Header::open(base, &layout.header)? };
        Ok(ChannelCore {
            header,
            payload: unsafe { base.add(layout.payload_offset) } as *mut T,
            dims,
            region,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    pub fn dims(&self) -> Dims {
        self.dims
    }

    /// The only way to touch the payload.
    pub fn with_lock<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Locked<'_, '_, T>) -> R,
    {
        self.header.with_lock(|guard| {
            let payload = unsafe { slice::from_raw_parts_mut(self.payload, self.dims.volume()) };
            let mut locked = Locked {
                header: guard,
                payload,
            };
            f(&mut locked)
        })
    }

    /// `attempt` runs under the mutex; on `None` the caller sleeps on `signal`
    /// without it and tries again.
    pub fn wait_until<R, F>(
        &self,
        signal: Signal,
        timeout: Option<Duration>,
        poll_interval: Duration,
        mut attempt: F,
    ) -> Result<R>
    where
        F: FnMut(&mut Locked<'_, '_, T>) -> Result<Option<R>>,
    {
        // A timeout past the end of `Instant` waits forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut woken = false;
        loop {
            if let Some(v) = self.with_lock(|locked| attempt(locked))?? {
                return Ok(v);
            }
            // The event may stay set for other readers, so a wakeup with
            // nothing new for us must not turn into a spin.
            if woken {
                let pause = match deadline {
                    Some(d) => poll_interval.min(d.saturating_duration_since(Instant::now())),
                    None => poll_interval,
                };
                thread::sleep(pause);
            }
            if !self.header.wait(signal, deadline)? {
                return Err(LatticeError::Timeout(timeout.unwrap_or_default()));
            }
            woken = true;
        }
    }
}
