//! Grid path planner: A* search, collinear simplification and line-of-sight
//! shortcutting.
//!
//! [`PathPlanner::plan`] runs the three stages in order:
//!
//! 1. **Search** – A* over the 8-connected neighbourhood of free cells, edge
//!    weight 1 (axis-aligned) or √2 (diagonal), with a pluggable
//!    [`Heuristic`].  An exhausted open set yields
//!    [`PlanOutcome::PathNotFound`], which is an ordinary outcome.
//! 2. **Simplify** – drop interior waypoints whose incoming and outgoing unit
//!    directions differ by less than a threshold (collinear runs).
//! 3. **Vectorize** – from the first waypoint, jump straight to the furthest
//!    waypoint reachable along an unobstructed Bresenham line.
//!
//! # Example
//!
//! ```rust
//! use rollbot_perception::grid::{Cell, OccupancyGrid};
//! use rollbot_perception::planner::{PathPlanner, PlanOutcome, PlannerConfig};
//!
//! let grid = OccupancyGrid::new(10, 10, 1.0).unwrap();
//! let planner = PathPlanner::new(&PlannerConfig::default());
//!
//! match planner.plan(&grid, Cell::new(0, 0), Cell::new(9, 9)).unwrap() {
//!     PlanOutcome::Found(path) => {
//!         assert_eq!(path.waypoints(), &[Cell::new(0, 0), Cell::new(9, 9)]);
//!     }
//!     PlanOutcome::PathNotFound => unreachable!(),
//! }
//! ```

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::f32::consts::SQRT_2;

use rollbot_types::RobotError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::grid::{Cell, OccupancyGrid};

// ────────────────────────────────────────────────────────────────────────────
// Heuristics
// ────────────────────────────────────────────────────────────────────────────

/// Estimate of the remaining cost from a cell to the goal.
pub trait Heuristic: Send + Sync {
    fn estimate(&self, from: Cell, goal: Cell) -> f32;
}

/// Always 1.  Adds the same amount to every candidate, so the search
/// expands in uniform-cost (Dijkstra) order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstantHeuristic;

impl Heuristic for ConstantHeuristic {
    fn estimate(&self, _from: Cell, _goal: Cell) -> f32 {
        1.0
    }
}

/// Octile distance: exact cost on an obstacle-free 8-connected grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct OctileHeuristic;

impl Heuristic for OctileHeuristic {
    fn estimate(&self, from: Cell, goal: Cell) -> f32 {
        let dx = (from.x - goal.x).unsigned_abs() as f32;
        let dy = (from.y - goal.y).unsigned_abs() as f32;
        let (min, max) = if dx < dy { (dx, dy) } else { (dy, dx) };
        min * SQRT_2 + (max - min)
    }
}

/// Heuristic selection for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeuristicKind {
    #[default]
    Constant,
    Octile,
}

impl HeuristicKind {
    pub fn build(self) -> Box<dyn Heuristic> {
        match self {
            HeuristicKind::Constant => Box::new(ConstantHeuristic),
            HeuristicKind::Octile => Box::new(OctileHeuristic),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration and results
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub heuristic: HeuristicKind,
    /// Direction-change threshold below which a waypoint is considered
    /// collinear with its neighbours.
    pub simplify_threshold: f32,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            heuristic: HeuristicKind::Constant,
            simplify_threshold: 0.1,
        }
    }
}

/// Ordered waypoints from the query start to the query goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    waypoints: Vec<Cell>,
}

impl Path {
    fn new(waypoints: Vec<Cell>) -> Self {
        Self { waypoints }
    }

    pub fn waypoints(&self) -> &[Cell] {
        &self.waypoints
    }

    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    pub fn start(&self) -> Option<Cell> {
        self.waypoints.first().copied()
    }

    pub fn goal(&self) -> Option<Cell> {
        self.waypoints.last().copied()
    }

    /// Euclidean length in cells.
    pub fn cost(&self) -> f32 {
        self.waypoints
            .windows(2)
            .map(|w| {
                let dx = (w[1].x - w[0].x) as f32;
                let dy = (w[1].y - w[0].y) as f32;
                dx.hypot(dy)
            })
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOutcome {
    Found(Path),
    PathNotFound,
}

impl PlanOutcome {
    pub fn found(self) -> Option<Path> {
        match self {
            PlanOutcome::Found(path) => Some(path),
            PlanOutcome::PathNotFound => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Search
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct OpenNode {
    cell: Cell,
    g: f32,
    f: f32,
    /// Insertion order; equal-`f` candidates pop first-in first-out.
    seq: u64,
}

impl PartialEq for OpenNode {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OpenNode {}

impl Ord for OpenNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for a min-heap.
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for OpenNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct PathPlanner {
    heuristic: Box<dyn Heuristic>,
    simplify_threshold: f32,
}

impl PathPlanner {
    pub fn new(config: &PlannerConfig) -> Self {
        Self {
            heuristic: config.heuristic.build(),
            simplify_threshold: config.simplify_threshold,
        }
    }

    pub fn with_heuristic(mut self, heuristic: Box<dyn Heuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }

    /// Search, simplify and vectorize.
    ///
    /// # Errors
    ///
    /// Returns [`RobotError::Validation`] when `start` or `goal` lies
    /// outside the grid.
    pub fn plan(
        &self,
        grid: &OccupancyGrid,
        start: Cell,
        goal: Cell,
    ) -> Result<PlanOutcome, RobotError> {
        let Some(raw) = self.search(grid, start, goal)?.found() else {
            debug!(%start, %goal, "no path");
            return Ok(PlanOutcome::PathNotFound);
        };
        let simplified = simplify(raw.waypoints(), self.simplify_threshold);
        let waypoints = vectorize(grid, &simplified);
        debug!(
            %start,
            %goal,
            raw = raw.len(),
            simplified = simplified.len(),
            waypoints = waypoints.len(),
            "path planned"
        );
        Ok(PlanOutcome::Found(Path::new(waypoints)))
    }

    /// Raw A* search.  The start cell itself need not be free; every other
    /// cell on the path is.
    pub fn search(
        &self,
        grid: &OccupancyGrid,
        start: Cell,
        goal: Cell,
    ) -> Result<PlanOutcome, RobotError> {
        for (role, cell) in [("start", start), ("goal", goal)] {
            if !grid.in_bounds(cell) {
                return Err(RobotError::validation(format!(
                    "{role} {cell} outside grid {}x{}",
                    grid.width(),
                    grid.height()
                )));
            }
        }
        if start == goal {
            return Ok(PlanOutcome::Found(Path::new(vec![start])));
        }

        let mut open = BinaryHeap::new();
        let mut closed = HashSet::new();
        let mut came_from: HashMap<Cell, Cell> = HashMap::new();
        let mut g_score: HashMap<Cell, f32> = HashMap::new();
        let mut seq = 0u64;

        g_score.insert(start, 0.0);
        open.push(OpenNode {
            cell: start,
            g: 0.0,
            f: self.heuristic.estimate(start, goal),
            seq,
        });

        while let Some(current) = open.pop() {
            if current.cell == goal {
                trace!(expanded = closed.len(), cost = current.g, "goal reached");
                return Ok(PlanOutcome::Found(reconstruct(&came_from, goal)));
            }
            if !closed.insert(current.cell) {
                continue;
            }

            for (i, next) in current.cell.neighbors_8().into_iter().enumerate() {
                if closed.contains(&next) || !grid.is_free(next) {
                    continue;
                }
                let step = if i < 4 { 1.0 } else { SQRT_2 };
                let tentative = current.g + step;
                if tentative < g_score.get(&next).copied().unwrap_or(f32::INFINITY) {
                    came_from.insert(next, current.cell);
                    g_score.insert(next, tentative);
                    seq += 1;
                    open.push(OpenNode {
                        cell: next,
                        g: tentative,
                        f: tentative + self.heuristic.estimate(next, goal),
                        seq,
                    });
                }
            }
        }

        trace!(expanded = closed.len(), "open set exhausted");
        Ok(PlanOutcome::PathNotFound)
    }
}

fn reconstruct(came_from: &HashMap<Cell, Cell>, goal: Cell) -> Path {
    let mut waypoints = vec![goal];
    let mut current = goal;
    while let Some(&prev) = came_from.get(&current) {
        waypoints.push(prev);
        current = prev;
    }
    waypoints.reverse();
    Path::new(waypoints)
}

// ────────────────────────────────────────────────────────────────────────────
// Post-processing
// ────────────────────────────────────────────────────────────────────────────

fn unit(from: Cell, to: Cell) -> (f32, f32) {
    let dx = (to.x - from.x) as f32;
    let dy = (to.y - from.y) as f32;
    let norm = dx.hypot(dy);
    if norm == 0.0 { (0.0, 0.0) } else { (dx / norm, dy / norm) }
}

/// Drop interior waypoints where `|u_in - u_out| < threshold`.  The first
/// and last waypoints are always kept.
pub fn simplify(waypoints: &[Cell], threshold: f32) -> Vec<Cell> {
    let mut out = waypoints.to_vec();
    let mut i = 1;
    while i + 1 < out.len() {
        let (ax, ay) = unit(out[i - 1], out[i]);
        let (bx, by) = unit(out[i], out[i + 1]);
        if (ax - bx).hypot(ay - by) < threshold {
            out.remove(i);
        } else {
            i += 1;
        }
    }
    out
}

/// Shortcut from the first waypoint to the furthest one in line of sight,
/// dropping everything in between.  The goal is never dropped.
pub fn vectorize(grid: &OccupancyGrid, waypoints: &[Cell]) -> Vec<Cell> {
    let Some((&from, rest)) = waypoints.split_first() else {
        return Vec::new();
    };
    match (1..waypoints.len())
        .rev()
        .find(|&i| line_of_sight(grid, from, waypoints[i]))
    {
        Some(i) => std::iter::once(from)
            .chain(waypoints[i..].iter().copied())
            .collect(),
        None => std::iter::once(from).chain(rest.iter().copied()).collect(),
    }
}

/// `true` when every cell of the rasterized segment `a → b` after `a` is
/// free.  The robot may already stand on an occupied start cell.
pub fn line_of_sight(grid: &OccupancyGrid, a: Cell, b: Cell) -> bool {
    bresenham(a, b).into_iter().skip(1).all(|c| grid.is_free(c))
}

/// Integer line rasterization from `a` to `b`, both endpoints included.
pub fn bresenham(a: Cell, b: Cell) -> Vec<Cell> {
    let dx = (b.x - a.x).abs();
    let dy = -(b.y - a.y).abs();
    let sx = if a.x < b.x { 1 } else { -1 };
    let sy = if a.y < b.y { 1 } else { -1 };
    let mut err = dx + dy;
    let mut cell = a;
    let mut line = Vec::with_capacity((dx - dy) as usize + 1);
    loop {
        line.push(cell);
        if cell == b {
            return line;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            cell.x += sx;
        }
        if e2 <= dx {
            err += dx;
            cell.y += sy;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: u32, h: u32) -> OccupancyGrid {
        OccupancyGrid::new(w, h, 1.0).unwrap()
    }

    fn planner() -> PathPlanner {
        PathPlanner::new(&PlannerConfig::default())
    }

    fn wall_with_gap(gap: Option<i32>) -> OccupancyGrid {
        let mut g = grid(10, 10);
        for x in 0..10 {
            if Some(x) != gap {
                g.mark(Cell::new(x, 5)).unwrap();
            }
        }
        g
    }

    fn assert_segments_clear(g: &OccupancyGrid, waypoints: &[Cell]) {
        for pair in waypoints.windows(2) {
            assert!(
                line_of_sight(g, pair[0], pair[1]),
                "segment {} -> {} crosses an obstacle",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn empty_grid_corner_to_corner() {
        let g = grid(10, 10);
        let raw = planner()
            .search(&g, Cell::new(0, 0), Cell::new(9, 9))
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(raw.start(), Some(Cell::new(0, 0)));
        assert_eq!(raw.goal(), Some(Cell::new(9, 9)));
        assert!((raw.cost() - 9.0 * SQRT_2).abs() < 1e-4);

        let simplified = simplify(raw.waypoints(), 0.1);
        assert_eq!(simplified.first(), Some(&Cell::new(0, 0)));
        assert_eq!(simplified.last(), Some(&Cell::new(9, 9)));
        for w in simplified.windows(3) {
            let (ax, ay) = unit(w[0], w[1]);
            let (bx, by) = unit(w[1], w[2]);
            assert!((ax - bx).hypot(ay - by) >= 0.1);
        }
    }

    #[test]
    fn wall_gap_is_used() {
        let g = wall_with_gap(Some(7));
        let raw = planner()
            .search(&g, Cell::new(1, 1), Cell::new(2, 8))
            .unwrap()
            .found()
            .unwrap();
        assert!(raw.waypoints().contains(&Cell::new(7, 5)));
        assert!(raw.waypoints()[1..].iter().all(|c| g.is_free(*c)));

        let planned = planner()
            .plan(&g, Cell::new(1, 1), Cell::new(2, 8))
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(planned.start(), Some(Cell::new(1, 1)));
        assert_eq!(planned.goal(), Some(Cell::new(2, 8)));
        assert_segments_clear(&g, planned.waypoints());
    }

    #[test]
    fn solid_wall_means_no_path() {
        let g = wall_with_gap(None);
        let outcome = planner().plan(&g, Cell::new(1, 1), Cell::new(2, 8)).unwrap();
        assert_eq!(outcome, PlanOutcome::PathNotFound);
    }

    #[test]
    fn occupied_goal_means_no_path() {
        let mut g = grid(5, 5);
        g.mark(Cell::new(4, 4)).unwrap();
        let outcome = planner().search(&g, Cell::new(0, 0), Cell::new(4, 4)).unwrap();
        assert_eq!(outcome, PlanOutcome::PathNotFound);
    }

    #[test]
    fn occupied_start_can_still_leave() {
        let mut g = grid(5, 5);
        g.mark(Cell::new(0, 0)).unwrap();
        let path = planner()
            .search(&g, Cell::new(0, 0), Cell::new(3, 0))
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn out_of_bounds_endpoints_are_validation_errors() {
        let g = grid(5, 5);
        assert!(matches!(
            planner().plan(&g, Cell::new(-1, 0), Cell::new(2, 2)),
            Err(RobotError::Validation(_))
        ));
        assert!(matches!(
            planner().plan(&g, Cell::new(0, 0), Cell::new(5, 2)),
            Err(RobotError::Validation(_))
        ));
    }

    #[test]
    fn start_equals_goal() {
        let g = grid(5, 5);
        let path = planner()
            .plan(&g, Cell::new(2, 2), Cell::new(2, 2))
            .unwrap()
            .found()
            .unwrap();
        assert_eq!(path.waypoints(), &[Cell::new(2, 2)]);
    }

    #[test]
    fn heuristics_agree_on_cost() {
        let mut g = grid(20, 20);
        for y in 2..18 {
            g.mark(Cell::new(10, y)).unwrap();
        }
        for x in 4..10 {
            g.mark(Cell::new(x, 12)).unwrap();
        }
        let (start, goal) = (Cell::new(2, 15), Cell::new(17, 6));
        let constant = planner().search(&g, start, goal).unwrap().found().unwrap();
        let octile = planner()
            .with_heuristic(Box::new(OctileHeuristic))
            .search(&g, start, goal)
            .unwrap()
            .found()
            .unwrap();
        assert!((constant.cost() - octile.cost()).abs() < 1e-3);
    }

    #[test]
    fn octile_matches_free_space_cost() {
        let h = OctileHeuristic;
        assert!((h.estimate(Cell::new(0, 0), Cell::new(3, 5)) - (3.0 * SQRT_2 + 2.0)).abs() < 1e-5);
        assert_eq!(ConstantHeuristic.estimate(Cell::new(0, 0), Cell::new(9, 9)), 1.0);
    }

    #[test]
    fn simplify_collapses_collinear_runs() {
        let raw = [
            Cell::new(0, 0),
            Cell::new(1, 0),
            Cell::new(2, 0),
            Cell::new(3, 1),
            Cell::new(4, 2),
        ];
        assert_eq!(
            simplify(&raw, 0.1),
            vec![Cell::new(0, 0), Cell::new(2, 0), Cell::new(4, 2)]
        );
        assert_eq!(simplify(&raw[..2], 0.1), raw[..2].to_vec());
    }

    #[test]
    fn vectorize_keeps_goal_and_avoids_obstacles() {
        let mut g = grid(10, 10);
        for y in 0..7 {
            g.mark(Cell::new(5, y)).unwrap();
        }
        let raw = planner()
            .search(&g, Cell::new(1, 1), Cell::new(8, 1))
            .unwrap()
            .found()
            .unwrap();
        let simplified = simplify(raw.waypoints(), 0.1);
        let vectorized = vectorize(&g, &simplified);

        assert_eq!(vectorized.first(), Some(&Cell::new(1, 1)));
        assert_eq!(vectorized.last(), Some(&Cell::new(8, 1)));
        assert!(vectorized.len() >= 3, "wall forces a detour: {vectorized:?}");
        assert!(vectorized.len() <= simplified.len());
        assert_segments_clear(&g, &vectorized);
    }

    #[test]
    fn vectorize_shortcuts_from_occupied_start() {
        let mut g = grid(10, 10);
        g.mark(Cell::new(1, 1)).unwrap();
        let raw = planner()
            .search(&g, Cell::new(1, 1), Cell::new(8, 1))
            .unwrap()
            .found()
            .unwrap();
        let vectorized = vectorize(&g, raw.waypoints());
        assert_eq!(vectorized, vec![Cell::new(1, 1), Cell::new(8, 1)]);

        assert!(line_of_sight(&g, Cell::new(1, 1), Cell::new(4, 1)));
        assert!(!line_of_sight(&g, Cell::new(4, 1), Cell::new(0, 1)));
    }

    #[test]
    fn vectorize_short_paths_unchanged() {
        let g = grid(3, 3);
        assert!(vectorize(&g, &[]).is_empty());
        assert_eq!(vectorize(&g, &[Cell::new(1, 1)]), vec![Cell::new(1, 1)]);
    }

    #[test]
    fn bresenham_includes_endpoints() {
        let line = bresenham(Cell::new(0, 0), Cell::new(5, 2));
        assert_eq!(line.len(), 6);
        assert_eq!(line.first(), Some(&Cell::new(0, 0)));
        assert_eq!(line.last(), Some(&Cell::new(5, 2)));

        let back = bresenham(Cell::new(3, 7), Cell::new(-1, 1));
        assert_eq!(back.last(), Some(&Cell::new(-1, 1)));
        assert_eq!(bresenham(Cell::new(2, 2), Cell::new(2, 2)), vec![Cell::new(2, 2)]);
    }

    #[test]
    fn heuristic_kind_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            planner: PlannerConfig,
        }
        let w: Wrapper = serde_json::from_str(r#"{"planner":{"heuristic":"octile"}}"#).unwrap();
        assert_eq!(w.planner.heuristic, HeuristicKind::Octile);
        assert_eq!(w.planner.simplify_threshold, 0.1);
    }
}
