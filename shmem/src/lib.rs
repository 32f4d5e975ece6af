pub mod core;
mod errors;
pub mod header;
pub mod lattice;
pub mod lifecycle;
pub mod reader;
pub mod region;
pub mod writer;

#[cfg(test)]
mod tests;

pub use crate::core::{ChannelState, HandoffMode, ShmemConfig, DEFAULT_REGION_NAME};
pub use crate::errors::{LatticeError, Result};
pub use crate::header::{FreshnessCursor, FreshnessPolicy};
pub use crate::lattice::{CaVolume, Dims, Lattice, Rgb, Voxel};
pub use crate::lifecycle::{install_shutdown_handler, AttachRetry, ShutdownHandle, WriterStatus};
pub use crate::reader::{LatticeReader, ReaderConfig, Snapshot, VolumeConsumer};
pub use crate::region::SharedRegion;
pub use crate::writer::{LatticeProducer, LatticeWriter, WriterConfig};
