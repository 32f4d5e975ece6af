use std::fmt;

use lattice_shmem::{Dims, Rgb, VolumeConsumer};

/// What the visualization side needs per frame: occupancy and the middle
/// z-slice as text.
#[derive(Default, Debug)]
pub struct VolumeSummary {
    pub frames: u64,
    pub last_version: u64,
    pub skipped: u64,
    pub occupied: usize,
    pub volume: usize,
    pub mean: [f64; 3],
    pub center_slice: Vec<String>,
    keep_slice: bool,
}

impl VolumeSummary {
    pub fn new(keep_slice: bool) -> VolumeSummary {
        VolumeSummary {
            keep_slice,
            ..VolumeSummary::default()
        }
    }

    pub fn occupancy(&self) -> f64 {
        if self.volume == 0 {
            return 0.0;
        }
        self.occupied as f64 / self.volume as f64
    }
}

impl VolumeConsumer<Rgb> for VolumeSummary {
    fn on_lattice_received(&mut self, voxels: &[Rgb], dims: Dims, version: u64) {
        if self.frames > 0 && version > self.last_version + 1 {
            self.skipped += version - self.last_version - 1;
        }
        self.frames += 1;
        self.last_version = version;
        self.volume = voxels.len();

        let mut sum = [0u64; 3];
        self.occupied = 0;
        for v in voxels.iter().filter(|v| !v.is_black()) {
            self.occupied += 1;
            sum[0] += v.r as u64;
            sum[1] += v.g as u64;
            sum[2] += v.b as u64;
        }
        let n = self.occupied.max(1) as f64;
        self.mean = [sum[0] as f64 / n, sum[1] as f64 / n, sum[2] as f64 / n];

        self.center_slice.clear();
        if self.keep_slice {
            let k = dims.z / 2;
            for j in 0..dims.y {
                let row = (0..dims.x)
                    .map(|i| {
                        if voxels[dims.linear_index(i, j, k)].is_black() {
                            '.'
                        } else {
                            '#'
                        }
                    })
                    .collect();
                self.center_slice.push(row);
            }
        }
    }
}

impl fmt::Display for VolumeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frame version={} occupied={}/{} ({:.1}%) mean_rgb=({:.0},{:.0},{:.0}) skipped={}",
            self.last_version,
            self.occupied,
            self.volume,
            self.occupancy() * 100.0,
            self.mean[0],
            self.mean[1],
            self.mean[2],
            self.skipped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_shmem::Lattice;

    type Grid = Lattice<Rgb, 4, 4, 2>;

    #[test]
    fn counts_occupied_voxels_and_renders_center_slice() {
        let mut grid = Grid::zeroed();
        grid[(0, 0, 1)] = Rgb::new(10, 20, 30);
        grid[(3, 2, 1)] = Rgb::new(30, 40, 50);
        grid[(1, 1, 0)] = Rgb::new(2, 0, 0);

        let mut summary = VolumeSummary::new(true);
        summary.on_lattice_received(grid.as_slice(), grid.dims(), 1);
        assert_eq!(summary.frames, 1);
        assert_eq!(summary.occupied, 3);
        assert_eq!(summary.volume, 32);
        assert_eq!(summary.center_slice, vec!["#...", "....", "...#", "...."]);
        assert!((summary.mean[1] - 20.0).abs() < 1e-9);
    }

    #[test]
    fn tracks_skipped_versions() {
        let grid = Grid::zeroed();
        let mut summary = VolumeSummary::new(false);
        for version in [1, 2, 5, 6, 10] {
            summary.on_lattice_received(grid.as_slice(), grid.dims(), version);
        }
        assert_eq!(summary.frames, 5);
        assert_eq!(summary.last_version, 10);
        assert_eq!(summary.skipped, 5);
        assert!(summary.center_slice.is_empty());
        assert_eq!(summary.occupancy(), 0.0);
    }

    #[test]
    fn first_frame_is_never_a_skip() {
        let grid = Grid::filled(Rgb::new(1, 1, 1));
        let mut summary = VolumeSummary::new(false);
        summary.on_lattice_received(grid.as_slice(), grid.dims(), 40);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.occupancy(), 1.0);
        assert!(summary.to_string().starts_with("frame version=40 occupied=32/32"));
    }
}
