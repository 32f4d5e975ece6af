use std::fmt;
use std::ops::{Index, IndexMut};

use bytemuck::{Pod, Zeroable};
use serde_derive::{Deserialize, Serialize};

use crate::errors::{LatticeError, Result};

// Copied byte-for-byte between processes; endianness is not negotiated.
pub trait Voxel: Pod + Send + 'static {}

impl<T: Pod + Send + 'static> Voxel for T {}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Pod, Zeroable)]
#[repr(C)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Rgb {
        Rgb { r, g, b }
    }

    pub fn is_black(&self) -> bool {
        *self == Rgb::BLACK
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dims {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dims {
    pub const fn new(x: usize, y: usize, z: usize) -> Dims {
        Dims { x, y, z }
    }

    pub const fn volume(&self) -> usize {
        self.x * self.y * self.z
    }

    #[inline]
    pub const fn linear_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.x + k * self.x * self.y
    }

    #[inline]
    pub const fn coords(&self, index: usize) -> (usize, usize, usize) {
        let plane = self.x * self.y;
        (index % self.x, (index % plane) / self.x, index / plane)
    }

    pub const fn contains(&self, i: usize, j: usize, k: usize) -> bool {
        i < self.x && j < self.y && k < self.z
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Flat `X * Y * Z` storage, x fastest: `(i, j, k)` is at `i + j * X + k * X * Y`.
#[derive(Clone, PartialEq, Eq)]
pub struct Lattice<T: Voxel, const X: usize, const Y: usize, const Z: usize> {
    cells: Box<[T]>,
}

/// The lattice exchanged by the `lattice-writer` and `lattice-reader` demos.
pub type CaVolume = Lattice<Rgb, 32, 32, 32>;

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> Lattice<T, X, Y, Z> {
    pub const DIMS: Dims = Dims::new(X, Y, Z);
    pub const VOLUME: usize = X * Y * Z;

    pub fn zeroed() -> Self {
        Lattice {
            cells: vec![T::zeroed(); Self::VOLUME].into_boxed_slice(),
        }
    }

    pub fn filled(value: T) -> Self {
        Lattice {
            cells: vec![value; Self::VOLUME].into_boxed_slice(),
        }
    }

    pub fn from_vec(cells: Vec<T>) -> Result<Self> {
        if cells.len() != Self::VOLUME {
            return Err(LatticeError::LengthMismatch {
                expected: Self::VOLUME,
                actual: cells.len(),
            });
        }
        Ok(Lattice {
            cells: cells.into_boxed_slice(),
        })
    }

    pub fn from_slice(cells: &[T]) -> Result<Self> {
        if cells.len() != Self::VOLUME {
            return Err(LatticeError::LengthMismatch {
                expected: Self::VOLUME,
                actual: cells.len(),
            });
        }
        Ok(Lattice {
            cells: cells.to_vec().into_boxed_slice(),
        })
    }

    pub fn from_fn<F>(mut f: F) -> Self
    where
        F: FnMut(usize, usize, usize) -> T,
    {
        let mut cells = Vec::with_capacity(Self::VOLUME);
        for k in 0..Z {
            for j in 0..Y {
                for i in 0..X {
                    cells.push(f(i, j, k));
                }
            }
        }
        Lattice {
            cells: cells.into_boxed_slice(),
        }
    }

    pub fn dims(&self) -> Dims {
        Self::DIMS
    }

    pub fn get(&self, i: usize, j: usize, k: usize) -> Option<&T> {
        if Self::DIMS.contains(i, j, k) {
            Some(&self.cells[Self::DIMS.linear_index(i, j, k)])
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, i: usize, j: usize, k: usize) -> Option<&mut T> {
        if Self::DIMS.contains(i, j, k) {
            Some(&mut self.cells[Self::DIMS.linear_index(i, j, k)])
        } else {
            None
        }
    }

    /// Neighbor lookup on a torus: coordinates wrap around every face.
    pub fn get_wrapping(&self, i: isize, j: isize, k: isize) -> &T {
        let i = i.rem_euclid(X as isize) as usize;
        let j = j.rem_euclid(Y as isize) as usize;
        let k = k.rem_euclid(Z as isize) as usize;
        &self.cells[Self::DIMS.linear_index(i, j, k)]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.cells
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.cells
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.cells)
    }

    pub fn copy_from_slice(&mut self, src: &[T]) -> Result<()> {
        if src.len() != Self::VOLUME {
            return Err(LatticeError::LengthMismatch {
                expected: Self::VOLUME,
                actual: src.len(),
            });
        }
        self.cells.copy_from_slice(src);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = ((usize, usize, usize), &T)> + '_ {
        self.cells
            .iter()
            .enumerate()
            .map(|(n, v)| (Self::DIMS.coords(n), v))
    }
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> Default for Lattice<T, X, Y, Z> {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> Index<(usize, usize, usize)>
    for Lattice<T, X, Y, Z>
{
    type Output = T;

    fn index(&self, (i, j, k): (usize, usize, usize)) -> &T {
        assert!(Self::DIMS.contains(i, j, k), "voxel ({}, {}, {}) outside {}", i, j, k, Self::DIMS);
        &self.cells[Self::DIMS.linear_index(i, j, k)]
    }
}

impl<T: Voxel, const X: usize, const Y: usize, const Z: usize> IndexMut<(usize, usize, usize)>
    for Lattice<T, X, Y, Z>
{
    fn index_mut(&mut self, (i, j, k): (usize, usize, usize)) -> &mut T {
        assert!(Self::DIMS.contains(i, j, k), "voxel ({}, {}, {}) outside {}", i, j, k, Self::DIMS);
        &mut self.cells[Self::DIMS.linear_index(i, j, k)]
    }
}

impl<T: Voxel + fmt::Debug, const X: usize, const Y: usize, const Z: usize> fmt::Debug
    for Lattice<T, X, Y, Z>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lattice")
            .field("dims", &Self::DIMS)
            .field("cells", &self.cells.len())
            .finish()
    }
}
