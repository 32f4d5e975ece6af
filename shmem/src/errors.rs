use std::fmt;
use std::io;
use std::time::Duration;

use shared_memory::ShmemError;
use thiserror::Error;

use crate::lattice::Dims;

#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("failed to allocate shared memory region `{name}` ({size} bytes): {source}")]
    Allocation {
        name: String,
        size: usize,
        #[source]
        source: ShmemError,
    },

    #[error("shared memory region `{name}` does not exist")]
    NotFound { name: String },

    #[error("shared memory region `{name}` is not initialized yet")]
    NotReady { name: String },

    #[error("failed to open shared memory region `{name}`: {source}")]
    Open {
        name: String,
        #[source]
        source: ShmemError,
    },

    #[error("failed to remove shared memory region `{name}`: {source}")]
    Remove {
        name: String,
        #[source]
        source: io::Error,
    },

    // raw_sync reports failures as boxed trait objects that are not Send.
    #[error("lock error during {op}: {message}")]
    Lock { op: &'static str, message: String },

    #[error("shared memory region `{name}` holds a {found} lattice, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: Dims,
        found: Dims,
    },

    #[error("shared memory region `{name}` is {found} bytes, expected at least {expected}")]
    SizeMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("shared memory region `{name}` has an incompatible layout: {reason}")]
    IncompatibleLayout { name: String, reason: String },

    #[error("expected {expected} voxels, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("channel `{name}` is closed")]
    Closed { name: String },

    #[error("shutdown requested, refusing to touch `{name}`")]
    ShuttingDown { name: String },

    #[error("signal handling error: {0}")]
    Signal(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl LatticeError {
    pub(crate) fn lock<E: fmt::Display>(op: &'static str, err: E) -> Self {
        LatticeError::Lock {
            op,
            message: err.to_string(),
        }
    }

    // Only the startup race between a reader and its writer is retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            LatticeError::NotFound { .. } | LatticeError::NotReady { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_startup_race_is_retriable() {
        assert!(LatticeError::NotFound { name: "/a".into() }.is_retriable());
        assert!(LatticeError::NotReady { name: "/a".into() }.is_retriable());
        assert!(!LatticeError::Timeout(Duration::from_millis(5)).is_retriable());
        assert!(!LatticeError::Lock {
            op: "lock",
            message: "EINVAL".into()
        }
        .is_retriable());
    }

    #[test]
    fn messages_name_the_region() {
        let err = LatticeError::DimensionMismatch {
            name: "/grid64".into(),
            expected: Dims::new(4, 4, 4),
            found: Dims::new(8, 8, 8),
        };
        let msg = err.to_string();
        assert!(msg.contains("/grid64"));
        assert!(msg.contains("4x4x4"));
        assert!(msg.contains("8x8x8"));
    }
}
