use std::time::Duration;

use log::{debug, info};
use serde_derive::{Deserialize, Serialize};

use crate::core::{ChannelCore, ChannelState, Locked, ShmemConfig};
use crate::errors::{LatticeError, Result};
use crate::header::{FreshnessCursor, Signal};
use crate::lattice::{Dims, Lattice, Voxel};
use crate::lifecycle::{self, WriterStatus};

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub shmem: ShmemConfig,
}

/// `voxels` points into shared memory and is only valid during the call.
pub trait VolumeConsumer<T: Voxel> {
    fn on_lattice_received(&mut self, voxels: &[T], dims: Dims, version: u64);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Snapshot<T: Voxel, const X: usize, const Y: usize, const Z: usize> {
    pub version: u64,
    pub lattice: Lattice<T, X, Y, Z>,
}

pub struct LatticeReader<T: Voxel, const X: usize, const Y: usize, const Z: usize> {
    core: Option<ChannelCore<T>>,
    name: String,
    cursor: FreshnessCursor,
    poll_interval: Duration,
}

fn take_fresh<T, R, F>(locked: &mut Locked<'_, '_, T>, cursor: &mut FreshnessCursor, f: F) -> Result<Option<R>>
where
    T: Voxel,
    F: FnOnce(&[T], u64) -> R,
{
    if !locked.header.try_is_fresh(cursor) {
        return Ok(None);
    }
    let version = locked.header.version();
    let result = f(&*locked.payload, version);
    locked.header.consume_fresh(cursor)?;
    Ok(Some(result))
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> LatticeReader<T, X, Y, Z> {
    pub const DIMS: Dims = Lattice::<T, X, Y, Z>::DIMS;

    pub fn new(cfg: &ReaderConfig) -> Result<LatticeReader<T, X, Y, Z>> {
        LatticeReader::attach(&cfg.shmem)
    }

    pub fn attach(cfg: &ShmemConfig) -> Result<LatticeReader<T, X, Y, Z>> {
        cfg.validate()?;
        let core = ChannelCore::<T>::attach(&cfg.name, Self::DIMS)?;
        let name = core.name().to_string();
        info!("reader attached to `{}` ({:?})", name, cfg.freshness);
        Ok(LatticeReader {
            core: Some(core),
            name,
            cursor: FreshnessCursor::new(cfg.freshness),
            poll_interval: cfg.poll_interval(),
        })
    }

    pub fn attach_with_retry(cfg: &ShmemConfig) -> Result<LatticeReader<T, X, Y, Z>> {
        cfg.attach.run(|| LatticeReader::attach(cfg))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        match self.core {
            Some(_) => ChannelState::Attached,
            None => ChannelState::Closed,
        }
    }

    pub fn cursor(&self) -> FreshnessCursor {
        self.cursor
    }

    fn core(&self) -> Result<&ChannelCore<T>> {
        self.core.as_ref().ok_or_else(|| LatticeError::Closed {
            name: self.name.clone(),
        })
    }

    pub fn try_consume(&mut self) -> Result<Option<Snapshot<T, X, Y, Z>>> {
        self.try_consume_map(|voxels, version| {
            Lattice::from_slice(voxels).map(|lattice| Snapshot { version, lattice })
        })?
        .transpose()
    }

    pub fn try_consume_into(&mut self, dst: &mut Lattice<T, X, Y, Z>) -> Result<Option<u64>> {
        self.try_consume_map(|voxels, version| dst.copy_from_slice(voxels).map(|_| version))?
            .transpose()
    }

    pub fn try_consume_with<C>(&mut self, consumer: &mut C) -> Result<Option<u64>>
    where
        C: VolumeConsumer<T>,
    {
        self.try_consume_map(|voxels, version| {
            consumer.on_lattice_received(voxels, Self::DIMS, version);
            version
        })
    }

    fn try_consume_map<R, F>(&mut self, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&[T], u64) -> R,
    {
        let cursor = &mut self.cursor;
        let core = self.core.as_ref().ok_or_else(|| LatticeError::Closed {
            name: self.name.clone(),
        })?;
        let result = core.with_lock(|locked| take_fresh(locked, cursor, f))??;
        if result.is_some() {
            debug!("consumed version {} from `{}`", cursor.last_seen(), self.name);
        }
        Ok(result)
    }

    /// `None` waits forever.
    pub fn consume_blocking(&mut self, timeout: Option<Duration>) -> Result<Snapshot<T, X, Y, Z>> {
        self.consume_blocking_map(timeout, |voxels, version| {
            Lattice::from_slice(voxels).map(|lattice| Snapshot { version, lattice })
        })?
    }

    pub fn consume_blocking_with<C>(&mut self, consumer: &mut C, timeout: Option<Duration>) -> Result<u64>
    where
        C: VolumeConsumer<T>,
    {
        self.consume_blocking_map(timeout, |voxels, version| {
            consumer.on_lattice_received(voxels, Self::DIMS, version);
            version
        })
    }

    fn consume_blocking_map<R, F>(&mut self, timeout: Option<Duration>, mut f: F) -> Result<R>
    where
        F: FnMut(&[T], u64) -> R,
    {
        let cursor = &mut self.cursor;
        let core = self.core.as_ref().ok_or_else(|| LatticeError::Closed {
            name: self.name.clone(),
        })?;
        let result = core.wait_until(Signal::DataReady, timeout, self.poll_interval, |locked| {
            take_fresh(locked, cursor, &mut f)
        })?;
        debug!("consumed version {} from `{}`", cursor.last_seen(), self.name);
        Ok(result)
    }

    /// The payload under the lock, fresh or not. Does not touch freshness.
    pub fn read_with<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&[T], u64) -> R,
    {
        self.core()?
            .with_lock(|locked| f(&*locked.payload, locked.header.version()))
    }

    pub fn writer_status(&self) -> Result<WriterStatus> {
        let (pid, version, published_at) = self.core()?.with_lock(|locked| {
            (
                locked.header.writer_pid(),
                locked.header.version(),
                locked.header.published_at(),
            )
        })?;
        Ok(WriterStatus {
            pid,
            version,
            published_at,
            alive: lifecycle::pid_alive(pid),
        })
    }

    /// Unmaps the region. The name stays registered; only the writer removes it.
    pub fn close(&mut self) {
        if self.core.take().is_some() {
            info!("reader detached from `{}`", self.name);
        }
    }
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> Drop for LatticeReader<T, X, Y, Z> {
    fn drop(&mut self) {
        self.close();
    }
}
