//! Visiting order for a set of paths.
//!
//! A greedy nearest-neighbour tour: from the current head position, go to
//! the closest unvisited path, then continue from where that path ends.
//! Closed loops end where they start; open lines end at their far endpoint.

use crate::geometry::Point;

#[derive(Debug, Clone, Copy)]
struct Entry<'a> {
    points: &'a [Point],
    closed: bool,
}

impl Entry<'_> {
    /// Lines (and two-point loops) are entered at either endpoint.
    fn enters_at_endpoints(&self) -> bool {
        !self.closed || self.points.len() <= 2
    }

    fn last_idx(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    fn exit_idx(&self, start_idx: usize) -> usize {
        if !self.enters_at_endpoints() {
            start_idx
        } else if start_idx == 0 {
            self.last_idx()
        } else {
            0
        }
    }
}

fn dist2(a: Point, b: Point) -> f64 {
    (a - b).length_squared() as f64
}

/// Index of the vertex nearest `p`; the lowest index wins ties.
fn nearest_vertex(points: &[Point], p: Point) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, &q) in points.iter().enumerate() {
        let d = dist2(q, p);
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Greedy path order optimizer.
///
/// After [`optimize`](Self::optimize), `order` lists every added path index
/// exactly once and `start_indices[i]` is the vertex path `i` starts at.
#[derive(Debug, Clone)]
pub struct PathOrderOptimizer<'a> {
    start_point: Point,
    entries: Vec<Entry<'a>>,
    /// Visiting order, as indices in insertion order.
    pub order: Vec<usize>,
    /// Start vertex per path, indexed by insertion order.
    pub start_indices: Vec<usize>,
}

impl<'a> PathOrderOptimizer<'a> {
    /// Create an optimizer starting from `start_point`.
    pub fn new(start_point: Point) -> Self {
        Self {
            start_point,
            entries: Vec::new(),
            order: Vec::new(),
            start_indices: Vec::new(),
        }
    }

    /// Add a closed loop.
    pub fn add_polygon(&mut self, points: &'a [Point]) {
        self.entries.push(Entry {
            points,
            closed: true,
        });
    }

    /// Add an open line, printed from one endpoint to the other.
    pub fn add_polyline(&mut self, points: &'a [Point]) {
        self.entries.push(Entry {
            points,
            closed: false,
        });
    }

    /// Number of paths added.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no paths were added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compute `order` and `start_indices`.
    pub fn optimize(&mut self) {
        let count = self.entries.len();
        self.start_indices = self
            .entries
            .iter()
            .map(|e| nearest_vertex(e.points, self.start_point))
            .collect();
        self.order = Vec::with_capacity(count);

        let mut picked = vec![false; count];
        let mut position = self.start_point;
        let mut incoming_normal = Point::default();

        for _ in 0..count {
            let mut best: Option<usize> = None;
            let mut best_dist = f64::INFINITY;

            for (i, entry) in self.entries.iter().enumerate() {
                if picked[i] || entry.points.is_empty() {
                    continue;
                }
                if entry.enters_at_endpoints() {
                    // Prefer continuing in the direction we came from.
                    let first = entry.points[0];
                    let last = entry.points[entry.last_idx()];
                    for (start_idx, from, to) in [(0, first, last), (entry.last_idx(), last, first)] {
                        let turn = incoming_normal.dot((to - from).normal(1000)).abs() as f64;
                        let dist = dist2(from, position) + turn * 0.0001;
                        if dist < best_dist {
                            best = Some(i);
                            best_dist = dist;
                            self.start_indices[i] = start_idx;
                        }
                    }
                } else {
                    let dist = dist2(entry.points[self.start_indices[i]], position);
                    if dist < best_dist {
                        best = Some(i);
                        best_dist = dist;
                    }
                }
            }

            let Some(best) = best else { break };
            let entry = &self.entries[best];
            let start_idx = self.start_indices[best];
            let exit_idx = entry.exit_idx(start_idx);
            position = entry.points[exit_idx];
            incoming_normal = if entry.enters_at_endpoints() {
                (entry.points[exit_idx] - entry.points[start_idx])
                    .normal(1000)
                    .cross_z()
            } else {
                Point::default()
            };
            picked[best] = true;
            self.order.push(best);
        }

        // Empty paths are never visited but still belong to the order.
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.points.is_empty() {
                self.start_indices[i] = 0;
                self.order.push(i);
            }
        }

        // Start vertices were picked relative to the global start; redo
        // them relative to where the head actually arrives from.
        let mut position = self.start_point;
        for &i in &self.order {
            let entry = &self.entries[i];
            if entry.points.is_empty() {
                continue;
            }
            let start_idx = if entry.enters_at_endpoints() {
                let last = entry.last_idx();
                if dist2(entry.points[last], position) < dist2(entry.points[0], position) {
                    last
                } else {
                    0
                }
            } else {
                nearest_vertex(entry.points, position)
            };
            self.start_indices[i] = start_idx;
            position = entry.points[entry.exit_idx(start_idx)];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Polygon;

    fn square_at(x: f64, y: f64) -> Polygon {
        Polygon::from_mm(&[(x, y), (x + 2.0, y), (x + 2.0, y + 2.0), (x, y + 2.0)])
    }

    #[test]
    fn test_order_is_permutation() {
        let squares: Vec<Polygon> = (0..7)
            .map(|i| square_at(((i * 37) % 11) as f64 * 10.0, ((i * 13) % 5) as f64 * 10.0))
            .collect();

        let mut optimizer = PathOrderOptimizer::new(Point::from_mm(50.0, 50.0));
        for sq in &squares {
            optimizer.add_polygon(&sq.points);
        }
        optimizer.optimize();

        let mut sorted = optimizer.order.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..7).collect::<Vec<_>>());
        assert_eq!(optimizer.start_indices.len(), 7);
    }

    #[test]
    fn test_deterministic() {
        let squares = [square_at(30.0, 0.0), square_at(0.0, 0.0), square_at(10.0, 20.0)];
        let run = || {
            let mut optimizer = PathOrderOptimizer::new(Point::default());
            for sq in &squares {
                optimizer.add_polygon(&sq.points);
            }
            optimizer.optimize();
            (optimizer.order.clone(), optimizer.start_indices.clone())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_nearest_first() {
        let squares = [square_at(30.0, 0.0), square_at(0.0, 0.0), square_at(10.0, 0.0)];
        let mut optimizer = PathOrderOptimizer::new(Point::default());
        for sq in &squares {
            optimizer.add_polygon(&sq.points);
        }
        optimizer.optimize();

        assert_eq!(optimizer.order, vec![1, 2, 0]);
        assert_eq!(optimizer.start_indices[1], 0);
        // Left edge of each following square faces the previous one.
        assert!(matches!(optimizer.start_indices[2], 0 | 3));
    }

    #[test]
    fn test_lines_flip_to_nearer_end() {
        let a = [Point::from_mm(0.0, 0.0), Point::from_mm(10.0, 0.0)];
        let b = [Point::from_mm(10.0, 20.0), Point::from_mm(10.0, 1.0)];
        let mut optimizer = PathOrderOptimizer::new(Point::default());
        optimizer.add_polyline(&a);
        optimizer.add_polyline(&b);
        optimizer.optimize();

        assert_eq!(optimizer.order, vec![0, 1]);
        assert_eq!(optimizer.start_indices, vec![0, 1]);
    }

    #[test]
    fn test_open_polyline_enters_at_endpoint() {
        let zigzag = [
            Point::from_mm(10.0, 0.0),
            Point::from_mm(5.0, 5.0),
            Point::from_mm(0.0, 0.0),
        ];
        let mut optimizer = PathOrderOptimizer::new(Point::from_mm(1.0, 0.0));
        optimizer.add_polyline(&zigzag);
        optimizer.optimize();
        assert_eq!(optimizer.start_indices, vec![2]);
    }

    #[test]
    fn test_empty_paths_kept_in_order() {
        let sq = square_at(0.0, 0.0);
        let empty: [Point; 0] = [];
        let mut optimizer = PathOrderOptimizer::new(Point::default());
        optimizer.add_polygon(&empty);
        optimizer.add_polygon(&sq.points);
        optimizer.optimize();

        assert_eq!(optimizer.order, vec![1, 0]);
        assert_eq!(optimizer.start_indices, vec![0, 0]);
    }
}
