//! Partitioning search (simultaneous optimistic optimization).
//!
//! The unit cube is split into a tree of hyper-rectangles, each scored at its
//! center. A sweep walks the tree depth by depth and expands the best
//! evaluated leaf at each depth, provided it is at least as good as every
//! leaf expanded at a shallower depth during the same sweep. Expansion
//! trisects a cell along its longest side; the middle child shares the
//! parent's center and inherits its score, so only the two outer children
//! need evaluating.

use std::collections::VecDeque;
use tracing::debug;

use crate::search::{Point, SearchSpace, SearchStrategy};

#[derive(Debug, Clone)]
struct Cell {
    lower: Vec<f64>,
    upper: Vec<f64>,
    depth: usize,
    score: Option<f64>,
    expanded: bool,
}

impl Cell {
    fn center(&self) -> Point {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| (lo + hi) / 2.0)
            .collect()
    }

    fn longest_side(&self) -> usize {
        let mut best = 0;
        let mut best_width = f64::NEG_INFINITY;
        for (d, (lo, hi)) in self.lower.iter().zip(&self.upper).enumerate() {
            if hi - lo > best_width {
                best = d;
                best_width = hi - lo;
            }
        }
        best
    }
}

/// SOO-style branch-and-bound search over the schema's bounds box.
#[derive(Debug, Clone)]
pub struct PartitionSearch {
    space: SearchSpace,
    cells: Vec<Cell>,
    /// Cells whose centers still have to be suggested.
    queue: VecDeque<usize>,
    /// Suggested centers waiting for a report.
    awaiting: Vec<(usize, Point)>,
    observations: Vec<(Point, f64)>,
    max_depth: usize,
}

impl PartitionSearch {
    pub fn new(space: SearchSpace, max_depth: usize) -> Self {
        let dim = space.dim();
        let root = Cell {
            lower: vec![0.0; dim],
            upper: vec![1.0; dim],
            depth: 0,
            score: None,
            expanded: false,
        };
        Self {
            space,
            cells: vec![root],
            queue: VecDeque::from([0]),
            awaiting: Vec::new(),
            observations: Vec::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Number of cells in the partition tree.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn split(&mut self, index: usize) {
        let parent = self.cells[index].clone();
        let d = parent.longest_side();
        let width = (parent.upper[d] - parent.lower[d]) / 3.0;

        for k in 0..3 {
            let mut lower = parent.lower.clone();
            let mut upper = parent.upper.clone();
            lower[d] = parent.lower[d] + k as f64 * width;
            upper[d] = parent.lower[d] + (k + 1) as f64 * width;

            let middle = k == 1;
            self.cells.push(Cell {
                lower,
                upper,
                depth: parent.depth + 1,
                score: if middle { parent.score } else { None },
                expanded: false,
            });
            if !middle {
                self.queue.push_back(self.cells.len() - 1);
            }
        }
        self.cells[index].expanded = true;
    }

    /// One pass over the depths. Returns whether any cell was expanded.
    fn sweep(&mut self) -> bool {
        let deepest = self
            .cells
            .iter()
            .filter(|c| !c.expanded)
            .map(|c| c.depth)
            .max()
            .unwrap_or(0)
            .min(self.max_depth - 1);

        let mut v_max = f64::NEG_INFINITY;
        let mut expanded_any = false;

        for depth in 0..=deepest {
            let candidate = self
                .cells
                .iter()
                .enumerate()
                .filter(|(_, c)| c.depth == depth && !c.expanded)
                .filter_map(|(i, c)| c.score.map(|s| (i, s)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((index, score)) = candidate {
                if score >= v_max {
                    debug!(cell = index, depth, score, "expanding cell");
                    self.split(index);
                    v_max = score;
                    expanded_any = true;
                }
            }
        }

        expanded_any
    }
}

impl SearchStrategy for PartitionSearch {
    fn suggest(&mut self, count: usize) -> Vec<Point> {
        let mut points = Vec::with_capacity(count);
        while points.len() < count {
            if self.queue.is_empty() && !self.sweep() {
                break;
            }
            let Some(index) = self.queue.pop_front() else {
                break;
            };
            let point = self.space.denormalize(&self.cells[index].center());
            self.awaiting.push((index, point.clone()));
            points.push(point);
        }
        points
    }

    fn report(&mut self, point: &[f64], objective: f64) {
        self.observations.push((point.to_vec(), objective));
        match self
            .awaiting
            .iter()
            .position(|(_, p)| p.as_slice() == point)
        {
            Some(pos) => {
                let (index, _) = self.awaiting.remove(pos);
                self.cells[index].score = Some(objective);
            }
            None => debug!("report for a point outside the partition tree: {:?}", point),
        }
    }

    fn observations(&self) -> &[(Point, f64)] {
        &self.observations
    }

    fn name(&self) -> &str {
        "partition"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lt_types::HyperparameterSchema;

    fn unit_space(dim: usize) -> SearchSpace {
        let schema = (0..dim).fold(HyperparameterSchema::new(), |s, i| {
            s.add_float(format!("x{i}"), 0.0, 1.0)
        });
        SearchSpace::new(schema).unwrap()
    }

    fn drive<F: Fn(&[f64]) -> f64>(search: &mut PartitionSearch, budget: usize, f: F) -> usize {
        let mut calls = 0;
        while calls < budget {
            let Some(point) = search.suggest(1).pop() else {
                break;
            };
            let y = f(&point);
            search.report(&point, y);
            calls += 1;
        }
        calls
    }

    #[test]
    fn first_point_is_the_center() {
        let space = SearchSpace::new(HyperparameterSchema::lora_default()).unwrap();
        let mut search = PartitionSearch::new(space.clone(), 10);
        assert_eq!(search.suggest(1), vec![space.midpoint()]);
        // Nothing else to propose until the root is scored.
        assert!(search.suggest(1).is_empty());
    }

    #[test]
    fn expansion_trisects_longest_side() {
        let mut search = PartitionSearch::new(unit_space(2), 10);
        let root = search.suggest(1).remove(0);
        search.report(&root, 1.0);

        let children = search.suggest(2);
        assert_eq!(children.len(), 2);
        assert!((children[0][0] - 1.0 / 6.0).abs() < 1e-12);
        assert!((children[1][0] - 5.0 / 6.0).abs() < 1e-12);
        assert!(children.iter().all(|c| c[1] == 0.5));
        assert_eq!(search.cell_count(), 4);
    }

    #[test]
    fn exhausts_a_shallow_tree() {
        // Root (1) + first split (2) + three depth-1 splits (6) = 9 centers.
        let mut search = PartitionSearch::new(unit_space(1), 2);
        let calls = drive(&mut search, 100, |x| -x[0]);
        assert_eq!(calls, 9);
        assert!(search.suggest(1).is_empty());

        let mut seen: Vec<f64> = search.observations().iter().map(|(p, _)| p[0]).collect();
        seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
        seen.dedup();
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn converges_toward_the_maximum() {
        let mut search = PartitionSearch::new(unit_space(2), 30);
        drive(&mut search, 80, |x| -((x[0] - 0.7).powi(2) + (x[1] - 0.2).powi(2)));
        let (best, score) = search.best().unwrap();
        assert!(*score > -0.01, "best {best:?} scored {score}");
    }

    #[test]
    fn suggestions_stay_in_bounds() {
        let space = SearchSpace::new(HyperparameterSchema::lora_default()).unwrap();
        let mut search = PartitionSearch::new(space.clone(), 12);
        drive(&mut search, 40, |x| -x[0].abs());
        assert!(search
            .observations()
            .iter()
            .all(|(p, _)| space.contains(p)));
    }

    #[test]
    fn foreign_reports_are_recorded_but_ignored_by_the_tree() {
        let mut search = PartitionSearch::new(unit_space(1), 5);
        search.report(&[0.9], 3.0);
        assert_eq!(search.observations().len(), 1);
        assert_eq!(search.suggest(1), vec![vec![0.5]]);
    }
}
