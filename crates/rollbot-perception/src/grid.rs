//! 2-D occupancy grid shared between the safety monitor (writer) and the
//! planner (reader).
//!
//! The grid keeps two boolean layers:
//!
//! * a **static** layer edited cell by cell through [`OccupancyGrid::mark`]
//!   and [`OccupancyGrid::clear`] (known fixtures, walls, …);
//! * a **sensed** layer replaced wholesale by every sensor sweep through
//!   [`OccupancyGrid::replace_sensed`].
//!
//! A cell is free when neither layer marks it.  Every mutation that changes
//! the free/occupied state of any cell bumps the monotonically increasing
//! [`revision`](OccupancyGrid::revision); a no-op edit leaves it alone so
//! that plans are only invalidated by real changes.
//!
//! # Example
//!
//! ```rust
//! use rollbot_perception::grid::{Cell, OccupancyGrid};
//!
//! let mut grid = OccupancyGrid::new(10, 10, 50.0).unwrap();
//! assert!(grid.mark(Cell::new(3, 4)).unwrap());
//! assert!(!grid.is_free(Cell::new(3, 4)));
//! assert_eq!(grid.revision(), 1);
//!
//! // Out-of-bounds cells are rejected, never clamped.
//! assert!(grid.mark(Cell::new(10, 0)).is_err());
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use rollbot_types::{Point2, RobotError};
use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Cell
// ────────────────────────────────────────────────────────────────────────────

/// Integer grid coordinate.  Signed so that neighbours of border cells and
/// projected sensor hits can be represented before the bounds check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cell {
    pub x: i32,
    pub y: i32,
}

impl Cell {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// The 8-connected neighbourhood, axis-aligned moves first.
    pub fn neighbors_8(self) -> [Cell; 8] {
        let Cell { x, y } = self;
        [
            Cell::new(x + 1, y),
            Cell::new(x - 1, y),
            Cell::new(x, y + 1),
            Cell::new(x, y - 1),
            Cell::new(x + 1, y + 1),
            Cell::new(x + 1, y - 1),
            Cell::new(x - 1, y + 1),
            Cell::new(x - 1, y - 1),
        ]
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Grid geometry and the fixed obstacles marked at start-up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub width: u32,
    pub height: u32,
    /// World units (odometry units) per cell edge.
    pub resolution: f32,
    /// Cells marked in the static layer at start-up.
    pub obstacles: Vec<Cell>,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            width: 30,
            height: 20,
            resolution: 100.0,
            obstacles: Vec::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// OccupancyGrid
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyGrid {
    width: u32,
    height: u32,
    resolution: f32,
    fixed: Vec<bool>,
    sensed: Vec<bool>,
    revision: u64,
}

impl OccupancyGrid {
    /// Create an obstacle-free grid.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] for an empty grid or a
    /// non-positive resolution.
    pub fn new(width: u32, height: u32, resolution: f32) -> Result<Self, RobotError> {
        if width == 0 || height == 0 {
            return Err(RobotError::validation(format!(
                "grid must be non-empty, got {width}x{height}"
            )));
        }
        if !(resolution.is_finite() && resolution > 0.0) {
            return Err(RobotError::validation(format!(
                "grid resolution must be positive, got {resolution}"
            )));
        }
        let len = width as usize * height as usize;
        Ok(Self {
            width,
            height,
            resolution,
            fixed: vec![false; len],
            sensed: vec![false; len],
            revision: 0,
        })
    }

    /// Build a grid from `config`, marking its static obstacles.
    pub fn from_config(config: &GridConfig) -> Result<Self, RobotError> {
        let mut grid = Self::new(config.width, config.height, config.resolution)?;
        for cell in &config.obstacles {
            grid.mark(*cell)?;
        }
        Ok(grid)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn resolution(&self) -> f32 {
        self.resolution
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn in_bounds(&self, cell: Cell) -> bool {
        cell.x >= 0 && cell.y >= 0 && (cell.x as u32) < self.width && (cell.y as u32) < self.height
    }

    fn index(&self, cell: Cell) -> Option<usize> {
        self.in_bounds(cell)
            .then(|| cell.y as usize * self.width as usize + cell.x as usize)
    }

    fn checked_index(&self, cell: Cell) -> Result<usize, RobotError> {
        self.index(cell).ok_or_else(|| {
            RobotError::validation(format!(
                "cell {cell} outside grid {}x{}",
                self.width, self.height
            ))
        })
    }

    /// `true` when `cell` is in bounds and marked by neither layer.
    pub fn is_free(&self, cell: Cell) -> bool {
        self.index(cell)
            .is_some_and(|i| !self.fixed[i] && !self.sensed[i])
    }

    /// Mark `cell` as a static obstacle.  Returns whether the grid changed.
    pub fn mark(&mut self, cell: Cell) -> Result<bool, RobotError> {
        self.set_fixed(cell, true)
    }

    /// Remove a static obstacle.  Returns whether the grid changed.
    pub fn clear(&mut self, cell: Cell) -> Result<bool, RobotError> {
        self.set_fixed(cell, false)
    }

    fn set_fixed(&mut self, cell: Cell, occupied: bool) -> Result<bool, RobotError> {
        let i = self.checked_index(cell)?;
        if self.fixed[i] == occupied {
            return Ok(false);
        }
        let was_free = !self.sensed[i] && !self.fixed[i];
        self.fixed[i] = occupied;
        let changed = was_free != (!self.sensed[i] && !self.fixed[i]);
        if changed {
            self.revision += 1;
        }
        Ok(changed)
    }

    /// Replace the sensed layer with `cells`.  Out-of-bounds cells are
    /// dropped.  Returns whether the grid changed; the revision is bumped
    /// at most once.
    pub fn replace_sensed(&mut self, cells: impl IntoIterator<Item = Cell>) -> bool {
        let mut layer = vec![false; self.sensed.len()];
        for cell in cells {
            if let Some(i) = self.index(cell) {
                layer[i] = true;
            }
        }
        let changed = layer
            .iter()
            .zip(&self.sensed)
            .zip(&self.fixed)
            .any(|((new, old), fixed)| !fixed && new != old);
        self.sensed = layer;
        if changed {
            self.revision += 1;
        }
        changed
    }

    /// Every occupied cell, row-major.
    pub fn occupied(&self) -> impl Iterator<Item = Cell> + '_ {
        let width = self.width as usize;
        self.fixed
            .iter()
            .zip(&self.sensed)
            .enumerate()
            .filter(|(_, (fixed, sensed))| **fixed || **sensed)
            .map(move |(i, _)| Cell::new((i % width) as i32, (i / width) as i32))
    }

    /// Cell containing the world point `p`.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] when `p` lies outside the grid.
    pub fn world_to_cell(&self, p: Point2) -> Result<Cell, RobotError> {
        let cell = self.project(p).ok_or_else(|| {
            RobotError::validation(format!("world point ({}, {}) outside grid", p.x, p.y))
        })?;
        self.checked_index(cell)?;
        Ok(cell)
    }

    /// Unchecked projection; `None` only for non-finite coordinates.
    pub fn project(&self, p: Point2) -> Option<Cell> {
        if !(p.x.is_finite() && p.y.is_finite()) {
            return None;
        }
        let x = (p.x / self.resolution).floor();
        let y = (p.y / self.resolution).floor();
        let range = i32::MIN as f32..i32::MAX as f32;
        (range.contains(&x) && range.contains(&y)).then(|| Cell::new(x as i32, y as i32))
    }

    /// World position of the centre of `cell`.
    pub fn cell_center(&self, cell: Cell) -> Point2 {
        Point2::new(
            (cell.x as f32 + 0.5) * self.resolution,
            (cell.y as f32 + 0.5) * self.resolution,
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SharedGrid
// ────────────────────────────────────────────────────────────────────────────

/// Thread-safe grid handle.  The revision is mirrored in an atomic so
/// staleness checks never take the lock.
#[derive(Debug)]
pub struct SharedGrid {
    grid: RwLock<OccupancyGrid>,
    revision: AtomicU64,
}

impl SharedGrid {
    pub fn new(grid: OccupancyGrid) -> Self {
        let revision = AtomicU64::new(grid.revision());
        Self {
            grid: RwLock::new(grid),
            revision,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Copy of the grid and the revision it was taken at.
    pub fn snapshot(&self) -> (OccupancyGrid, u64) {
        let grid = self.grid.read().unwrap_or_else(PoisonError::into_inner);
        let revision = grid.revision();
        (grid.clone(), revision)
    }

    /// Run `f` against the grid under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&OccupancyGrid) -> R) -> R {
        let grid = self.grid.read().unwrap_or_else(PoisonError::into_inner);
        f(&grid)
    }

    /// Run `f` against the grid under the write lock and publish the new
    /// revision.
    pub fn update<R>(&self, f: impl FnOnce(&mut OccupancyGrid) -> R) -> R {
        let mut grid = self.grid.write().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut grid);
        self.revision.store(grid.revision(), Ordering::Release);
        out
    }

    pub fn mark(&self, cell: Cell) -> Result<bool, RobotError> {
        self.update(|grid| grid.mark(cell))
    }

    pub fn clear(&self, cell: Cell) -> Result<bool, RobotError> {
        self.update(|grid| grid.clear(cell))
    }

    pub fn replace_sensed(&self, cells: impl IntoIterator<Item = Cell>) -> bool {
        self.update(|grid| grid.replace_sensed(cells))
    }
}
