use derive_more::Display;

/// Three-dimensional extent of a grid or a block.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("({x}, {y}, {z})")]
pub struct Dim3 {
    /// Extent along x.
    pub x: u32,
    /// Extent along y.
    pub y: u32,
    /// Extent along z.
    pub z: u32,
}

/// Grid and block geometry of a kernel launch.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[display("<<<{grid}, {block}>>>")]
pub struct LaunchConfig {
    /// Number of blocks.
    pub grid: Dim3,
    /// Number of threads per block.
    pub block: Dim3,
    /// Dynamic shared memory per block.
    pub shared_mem_bytes: u32,
}

/// Argument of a kernel body: the geometry it was launched with.
#[derive(Debug, Clone, Copy)]
pub struct Launch {
    config: LaunchConfig,
}

/// Position of one emulated thread in the launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadIndex {
    /// Index of the block in the grid.
    pub block: Dim3,
    /// Index of the thread in its block.
    pub thread: Dim3,
    block_dim: Dim3,
}

impl Dim3 {
    /// An extent of `x * y * z`.
    #[must_use]
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Number of points covered.
    #[must_use]
    pub fn volume(self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    fn unflatten(self, flat: u64) -> Self {
        let (x, y) = (u64::from(self.x), u64::from(self.y));
        // `flat < volume` so every coordinate fits the matching extent.
        Self {
            x: (flat % x) as u32,
            y: ((flat / x) % y) as u32,
            z: (flat / (x * y)) as u32,
        }
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32)> for Dim3 {
    fn from((x, y): (u32, u32)) -> Self {
        Self::new(x, y, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

fn blocks_for(len: usize, tile: u32) -> u32 {
    let tile = usize::try_from(tile.max(1)).unwrap_or(usize::MAX);
    u32::try_from(len.div_ceil(tile)).unwrap_or(u32::MAX)
}

impl LaunchConfig {
    /// A launch of `grid` blocks with `block` threads each.
    #[must_use]
    pub fn new(grid: impl Into<Dim3>, block: impl Into<Dim3>) -> Self {
        Self {
            grid: grid.into(),
            block: block.into(),
            shared_mem_bytes: 0,
        }
    }

    /// A one-dimensional launch covering at least `len` threads.
    #[must_use]
    pub fn for_elements(len: usize, block: u32) -> Self {
        Self::new(blocks_for(len, block), block)
    }

    /// A two-dimensional launch of `tile * tile` blocks covering at least
    /// `width * height` threads.
    #[must_use]
    pub fn for_grid_2d(width: usize, height: usize, tile: u32) -> Self {
        Self::new(
            (blocks_for(width, tile), blocks_for(height, tile)),
            (tile, tile),
        )
    }

    /// Same launch with `bytes` of shared memory per block.
    #[must_use]
    pub fn with_shared_mem(mut self, bytes: u32) -> Self {
        self.shared_mem_bytes = bytes;
        self
    }

    /// Number of threads of the launch.
    #[must_use]
    pub fn total_threads(&self) -> u64 {
        self.grid.volume() * self.block.volume()
    }
}

impl Launch {
    pub(crate) fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    /// Geometry of the launch.
    #[must_use]
    pub fn config(&self) -> LaunchConfig {
        self.config
    }

    /// Every thread of the launch, block by block.
    pub fn threads(&self) -> impl Iterator<Item = ThreadIndex> + use<> {
        let LaunchConfig { grid, block, .. } = self.config;
        let per_block = block.volume();
        (0..self.config.total_threads()).map(move |flat| ThreadIndex {
            block: grid.unflatten(flat / per_block),
            thread: block.unflatten(flat % per_block),
            block_dim: block,
        })
    }
}

impl ThreadIndex {
    /// Global x coordinate.
    #[must_use]
    pub fn global_x(&self) -> usize {
        global(self.block.x, self.block_dim.x, self.thread.x)
    }

    /// Global y coordinate.
    #[must_use]
    pub fn global_y(&self) -> usize {
        global(self.block.y, self.block_dim.y, self.thread.y)
    }

    /// Global z coordinate.
    #[must_use]
    pub fn global_z(&self) -> usize {
        global(self.block.z, self.block_dim.z, self.thread.z)
    }
}

fn global(block: u32, dim: u32, thread: u32) -> usize {
    block as usize * dim as usize + thread as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn for_elements_rounds_up() {
        let launch = LaunchConfig::for_elements(1000, 256);
        assert_eq!(launch.grid, Dim3::new(4, 1, 1));
        assert_eq!(launch.block, Dim3::new(256, 1, 1));
        assert_eq!(launch.total_threads(), 1024);
        assert_eq!(LaunchConfig::for_elements(0, 64).total_threads(), 0);
    }

    #[test]
    fn grid_2d_covers_every_cell_once() {
        let config = LaunchConfig::for_grid_2d(5, 3, 2);
        assert_eq!(config.grid, Dim3::new(3, 2, 1));
        let mut seen = vec![0u8; 6 * 4];
        for thread in Launch::new(config).threads() {
            assert_eq!(thread.global_z(), 0);
            seen[thread.global_y() * 6 + thread.global_x()] += 1;
        }
        assert!(seen.iter().all(|&hits| hits == 1));
    }

    #[test]
    fn thread_indexes_stay_within_their_block() {
        let launch = Launch::new(LaunchConfig::new((2, 1, 2), (3, 2, 1)));
        let threads: Vec<_> = launch.threads().collect();
        assert_eq!(threads.len(), 24);
        assert!(threads.iter().all(|t| t.thread.x < 3 && t.thread.y < 2));
        let last = threads.last().unwrap();
        assert_eq!(
            (last.global_x(), last.global_y(), last.global_z()),
            (5, 1, 1)
        );
    }
}
