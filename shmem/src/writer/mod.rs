use std::time::Duration;

use log::{debug, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::core::{ChannelCore, ChannelState, HandoffMode, ShmemConfig};
use crate::errors::{LatticeError, Result};
use crate::header::Signal;
use crate::lattice::{Dims, Lattice, Voxel};
use crate::lifecycle;
use crate::region::SharedRegion;

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct WriterConfig {
    pub shmem: ShmemConfig,
}

/// Computes the next simulation state. Called outside the channel lock.
pub trait LatticeProducer<T: Voxel, const X: usize, const Y: usize, const Z: usize> {
    fn compute_next(&mut self, previous: &Lattice<T, X, Y, Z>) -> Lattice<T, X, Y, Z>;
}

/// Creating a writer replaces whatever region had the same name. Closing or
/// dropping it unlinks the name again.
pub struct LatticeWriter<T: Voxel, const X: usize, const Y: usize, const Z: usize> {
    core: Option<ChannelCore<T>>,
    name: String,
    handoff: HandoffMode,
    handoff_timeout: Option<Duration>,
    poll_interval: Duration,
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> LatticeWriter<T, X, Y, Z> {
    pub const DIMS: Dims = Lattice::<T, X, Y, Z>::DIMS;

    pub fn new(cfg: &WriterConfig) -> Result<LatticeWriter<T, X, Y, Z>> {
        LatticeWriter::create(&cfg.shmem)
    }

    pub fn create(cfg: &ShmemConfig) -> Result<LatticeWriter<T, X, Y, Z>> {
        cfg.validate()?;
        let core = ChannelCore::<T>::create(&cfg.name, Self::DIMS)?;
        let name = core.name().to_string();
        lifecycle::register_owned(&name);
        info!("writer ready on `{}` ({:?} hand-off)", name, cfg.handoff);
        Ok(LatticeWriter {
            core: Some(core),
            name,
            handoff: cfg.handoff,
            handoff_timeout: cfg.handoff_timeout(),
            poll_interval: cfg.poll_interval(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ChannelState {
        match self.core {
            Some(_) => ChannelState::Created,
            None => ChannelState::Closed,
        }
    }

    fn core(&self) -> Result<&ChannelCore<T>> {
        if lifecycle::shutdown_requested() {
            return Err(LatticeError::ShuttingDown {
                name: self.name.clone(),
            });
        }
        self.core.as_ref().ok_or_else(|| LatticeError::Closed {
            name: self.name.clone(),
        })
    }

    /// Returns the version of this publish.
    pub fn publish(&mut self, lattice: &Lattice<T, X, Y, Z>) -> Result<u64> {
        self.publish_slice(lattice.as_slice())
    }

    pub fn publish_slice(&mut self, values: &[T]) -> Result<u64> {
        if values.len() != Lattice::<T, X, Y, Z>::VOLUME {
            return Err(LatticeError::LengthMismatch {
                expected: Lattice::<T, X, Y, Z>::VOLUME,
                actual: values.len(),
            });
        }
        self.publish_with(|payload| payload.copy_from_slice(values))
    }

    /// Readers are locked out while `fill` runs.
    pub fn publish_with<F>(&mut self, fill: F) -> Result<u64>
    where
        F: FnOnce(&mut [T]),
    {
        let core = self.core()?;
        let version = match self.handoff {
            HandoffMode::LatestValue => core.with_lock(|locked| {
                fill(&mut *locked.payload);
                locked.header.mark_fresh()
            })??,
            HandoffMode::Strict => {
                let mut fill = Some(fill);
                core.wait_until(
                    Signal::Consumed,
                    self.handoff_timeout,
                    self.poll_interval,
                    |locked| {
                        if locked.header.is_fresh() {
                            return Ok(None);
                        }
                        if let Some(fill) = fill.take() {
                            fill(&mut *locked.payload);
                        }
                        locked.header.mark_fresh().map(Some)
                    },
                )?
            }
        };
        debug!("published version {} to `{}`", version, self.name);
        Ok(version)
    }

    pub fn step<P>(&mut self, producer: &mut P, previous: &Lattice<T, X, Y, Z>) -> Result<Lattice<T, X, Y, Z>>
    where
        P: LatticeProducer<T, X, Y, Z>,
    {
        let next = producer.compute_next(previous);
        self.publish(&next)?;
        Ok(next)
    }

    pub fn version(&self) -> Result<u64> {
        self.core()?.with_lock(|locked| locked.header.version())
    }

    pub fn close(&mut self) -> Result<()> {
        let core = match self.core.take() {
            Some(v) => v,
            None => return Ok(()),
        };
        drop(core);
        lifecycle::unregister_owned(&self.name);
        SharedRegion::remove(&self.name)?;
        info!("writer closed `{}`", self.name);
        Ok(())
    }
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> Drop for LatticeWriter<T, X, Y, Z> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("failed to close writer `{}`: {}", self.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_config;

    type Grid = Lattice<u8, 4, 4, 4>;

    struct Increment;

    impl LatticeProducer<u8, 4, 4, 4> for Increment {
        fn compute_next(&mut self, previous: &Grid) -> Grid {
            let cells = previous.as_slice().iter().map(|v| v.wrapping_add(1)).collect();
            Grid::from_vec(cells).unwrap()
        }
    }

    #[test]
    fn versions_count_publishes() {
        let cfg = test_config("writer-versions");
        let mut writer = LatticeWriter::<u8, 4, 4, 4>::create(&cfg).unwrap();
        assert_eq!(writer.state(), ChannelState::Created);
        assert_eq!(writer.version().unwrap(), 0);
        assert_eq!(writer.publish(&Grid::filled(1)).unwrap(), 1);
        assert_eq!(writer.publish(&Grid::filled(2)).unwrap(), 2);
        assert_eq!(writer.version().unwrap(), 2);
    }

    #[test]
    fn wrong_length_publish_is_rejected() {
        let cfg = test_config("writer-length");
        let mut writer = LatticeWriter::<u8, 4, 4, 4>::create(&cfg).unwrap();
        match writer.publish_slice(&[0u8; 10]) {
            Err(LatticeError::LengthMismatch { expected, actual }) => {
                assert_eq!(expected, 64);
                assert_eq!(actual, 10);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(writer.version().unwrap(), 0);
    }

    #[test]
    fn step_publishes_the_computed_state() {
        let cfg = test_config("writer-step");
        let mut writer = LatticeWriter::<u8, 4, 4, 4>::create(&cfg).unwrap();
        let mut producer = Increment;
        let first = writer.step(&mut producer, &Grid::zeroed()).unwrap();
        let second = writer.step(&mut producer, &first).unwrap();
        assert!(second.as_slice().iter().all(|v| *v == 2));
        assert_eq!(writer.version().unwrap(), 2);
    }

    #[test]
    fn close_unlinks_and_is_idempotent() {
        let cfg = test_config("writer-close");
        let mut writer = LatticeWriter::<u8, 4, 4, 4>::create(&cfg).unwrap();
        let name = writer.name().to_string();
        assert!(lifecycle::owned_regions().contains(&name));

        writer.close().unwrap();
        writer.close().unwrap();
        assert_eq!(writer.state(), ChannelState::Closed);
        assert!(!lifecycle::owned_regions().contains(&name));
        assert!(matches!(
            SharedRegion::attach(&name),
            Err(LatticeError::NotFound { .. })
        ));
        assert!(matches!(
            writer.publish(&Grid::zeroed()),
            Err(LatticeError::Closed { .. })
        ));
    }
}
