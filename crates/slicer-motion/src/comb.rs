//! Combing: routing travel moves inside the part boundary.
//!
//! A travel that would leave the boundary strings filament across open air.
//! [`Comb`] rotates the plane so the travel runs along +X (the "scanline"),
//! finds every boundary loop the scanline cuts, and detours around each one
//! by following its vertices a little way off the wall. The detour is then
//! pulled taut so only the via-points that are actually needed remain.
//!
//! Routing never errors. [`Comb::calc`] returns `None` when no clean route
//! exists and the caller retracts instead.

use tracing::trace;

use crate::geometry::{Coord, Point, PointMatrix, Polygon, Polygons};

/// Travels shorter than this are not worth routing.
const MIN_COMB_DISTANCE: Coord = 1500;

/// Clearance kept from the wall at entry, exit and walked vertices.
const BOUNDARY_OFFSET: Coord = 200;

/// Points further than this from every edge cannot be moved inside.
const MOVE_INSIDE_SEARCH_RADIUS: Coord = 2000;

/// Projections are kept this far from edge endpoints.
const EDGE_MARGIN: Coord = 10;

/// Inward offset used when snapping travel endpoints onto the boundary.
pub const DEFAULT_MOVE_INSIDE_DISTANCE: Coord = 100;

/// Extreme scanline crossings of one boundary loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanlineCrossings {
    min_x: Coord,
    min_idx: usize,
    max_x: Coord,
    max_idx: usize,
}

/// Travel router over a borrowed boundary.
#[derive(Debug, Clone)]
pub struct Comb<'a> {
    boundary: &'a Polygons,
    crossings: Vec<Option<ScanlineCrossings>>,
    matrix: PointMatrix,
    transformed_start: Point,
    transformed_end: Point,
}

impl<'a> Comb<'a> {
    /// Create a router for `boundary`.
    pub fn new(boundary: &'a Polygons) -> Self {
        Self {
            boundary,
            crossings: vec![None; boundary.len()],
            matrix: PointMatrix::aligned_with(Point::new(1, 0)),
            transformed_start: Point::default(),
            transformed_end: Point::default(),
        }
    }

    /// The boundary this router works in.
    pub fn boundary(&self) -> &'a Polygons {
        self.boundary
    }

    /// Whether `p` lies inside the boundary.
    pub fn inside(&self, p: Point) -> bool {
        self.boundary.inside(p)
    }

    /// Compute via-points for a travel from `start` to `end`.
    ///
    /// Returns the points to visit between the two, excluding `start` and
    /// `end` themselves unless they had to be moved inside the boundary, in
    /// which case the moved start comes first and the moved end last.
    pub fn calc(&mut self, start: Point, end: Point) -> Option<Vec<Point>> {
        if (end - start).shorter_than(MIN_COMB_DISTANCE) {
            return Some(Vec::new());
        }

        let mut start = start;
        let mut end = end;
        let mut route = Vec::new();

        if !self.inside(start) {
            start = self.move_inside(start, DEFAULT_MOVE_INSIDE_DISTANCE)?;
            route.push(start);
        }
        let mut snapped_end = None;
        if !self.inside(end) {
            end = self.move_inside(end, DEFAULT_MOVE_INSIDE_DISTANCE)?;
            snapped_end = Some(end);
        }

        self.set_scanline(start, end);
        if !self.scanline_collides() {
            route.extend(snapped_end);
            return Some(route);
        }

        self.calc_min_max();
        let basic = self.basic_comb_path(end);
        if !self.pull_taut(start, &basic, &mut route) {
            trace!(?start, ?end, "No collision-free comb route");
            return None;
        }
        route.extend(snapped_end);
        Some(route)
    }

    /// Move `p` onto the nearest boundary edge and `distance` past it, into
    /// the region. Gives up when no edge lies within 2 mm.
    pub fn move_inside(&self, p: Point, distance: Coord) -> Option<Point> {
        let max_dist2 = MOVE_INSIDE_SEARCH_RADIUS * MOVE_INSIDE_SEARCH_RADIUS;
        let mut best_dist2 = max_dist2;
        let mut best = p;

        for poly in self.boundary {
            let n = poly.len();
            if n < 2 {
                continue;
            }
            let mut p0 = poly[n - 2];
            let mut p1 = poly[n - 1];
            let mut beyond_previous = (p1 - p0).dot(p - p0) > (p1 - p0).length_squared();

            for &p2 in &poly.points {
                let ab = p2 - p1;
                let ab_length = ab.length() as Coord;
                if ab_length == 0 {
                    p0 = p1;
                    p1 = p2;
                    continue;
                }
                let ax_length = ab.dot(p - p1) / ab_length;

                if ax_length < 0 {
                    // Projects before this edge. If it also projected past
                    // the previous one, the corner itself is closest.
                    if beyond_previous {
                        let dist2 = (p1 - p).length_squared();
                        if dist2 < best_dist2 {
                            best_dist2 = dist2;
                            let bisector = ab.normal(distance * 4) + (p1 - p0).normal(distance * 4);
                            best = p1 + bisector.cross_z().normal(distance);
                        }
                    }
                    beyond_previous = false;
                } else if ax_length > ab_length {
                    beyond_previous = true;
                } else {
                    beyond_previous = false;
                    let along = if ab_length > 2 * EDGE_MARGIN {
                        ax_length.clamp(EDGE_MARGIN, ab_length - EDGE_MARGIN)
                    } else {
                        ab_length / 2
                    };
                    let x = p1 + ab * along / ab_length;
                    let dist2 = (x - p).length_squared();
                    if dist2 < best_dist2 {
                        best_dist2 = dist2;
                        best = x + ab.normal(distance).cross_z();
                    }
                }
                p0 = p1;
                p1 = p2;
            }
        }

        (best_dist2 < max_dist2).then_some(best)
    }

    fn set_scanline(&mut self, start: Point, end: Point) {
        self.matrix = PointMatrix::aligned_with(end - start);
        self.transformed_start = self.matrix.apply(start);
        self.transformed_end = self.matrix.apply(end);
    }

    /// Does the current scanline cut any boundary edge strictly between its
    /// endpoints?
    fn scanline_collides(&self) -> bool {
        let (sx, ex) = (self.transformed_start.x, self.transformed_end.x);
        self.boundary.iter().any(|poly| {
            scanline_crossings(poly, &self.matrix, self.transformed_start.y)
                .iter()
                .any(|&(_, x)| x > sx && x < ex)
        })
    }

    fn segment_collides(&self, start: Point, end: Point) -> bool {
        let matrix = PointMatrix::aligned_with(end - start);
        let ts = matrix.apply(start);
        let te = matrix.apply(end);
        self.boundary.iter().any(|poly| {
            scanline_crossings(poly, &matrix, ts.y)
                .iter()
                .any(|&(_, x)| x > ts.x && x < te.x)
        })
    }

    fn calc_min_max(&mut self) {
        let (sx, ex, sy) = (
            self.transformed_start.x,
            self.transformed_end.x,
            self.transformed_start.y,
        );
        for (slot, poly) in self.crossings.iter_mut().zip(self.boundary.iter()) {
            *slot = None;
            for (idx, x) in scanline_crossings(poly, &self.matrix, sy) {
                if x < sx || x > ex {
                    continue;
                }
                let c = slot.get_or_insert(ScanlineCrossings {
                    min_x: x,
                    min_idx: idx,
                    max_x: x,
                    max_idx: idx,
                });
                if x < c.min_x {
                    c.min_x = x;
                    c.min_idx = idx;
                }
                if x > c.max_x {
                    c.max_x = x;
                    c.max_idx = idx;
                }
            }
        }
    }

    /// Index of the loop whose first crossing lies nearest ahead of `x`.
    fn next_polygon_along_scanline(&self, x: Coord) -> Option<usize> {
        let mut best: Option<(usize, Coord)> = None;
        for (idx, c) in self.crossings.iter().enumerate() {
            let Some(c) = c else { continue };
            if c.min_x > x && best.map_or(true, |(_, bx)| c.min_x < bx) {
                best = Some((idx, c.min_x));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Unsimplified detour: around every loop on the scanline, then `end`.
    fn basic_comb_path(&self, end: Point) -> Vec<Point> {
        let sy = self.transformed_start.y;
        let mut points = Vec::new();
        let mut cursor = self.transformed_start.x;

        while let Some(poly_idx) = self.next_polygon_along_scanline(cursor) {
            let Some(c) = self.crossings[poly_idx] else { break };
            let poly = &self.boundary[poly_idx];
            let n = poly.len();

            points.push(self.matrix.unapply(Point::new(c.min_x - BOUNDARY_OFFSET, sy)));

            let forward = (c.max_idx + n - c.min_idx) % n;
            let backward = (c.min_idx + n - c.max_idx) % n;
            if forward <= backward {
                let mut idx = c.min_idx;
                while idx != c.max_idx {
                    points.push(offset_vertex(poly, idx, BOUNDARY_OFFSET));
                    idx = (idx + 1) % n;
                }
            } else {
                let mut idx = (c.min_idx + n - 1) % n;
                let stop = (c.max_idx + n - 1) % n;
                while idx != stop {
                    points.push(offset_vertex(poly, idx, BOUNDARY_OFFSET));
                    idx = (idx + n - 1) % n;
                }
            }

            points.push(self.matrix.unapply(Point::new(c.max_x + BOUNDARY_OFFSET, sy)));
            cursor = c.max_x;
        }

        points.push(end);
        points
    }

    /// Keep only the via-points needed to get from `start` to the last
    /// point without crossing the boundary. Fails when a needed via-point
    /// is itself unreachable.
    fn pull_taut(&self, start: Point, points: &[Point], route: &mut Vec<Point>) -> bool {
        let mut current = start;
        for n in 1..points.len() {
            if self.segment_collides(current, points[n]) {
                if self.segment_collides(current, points[n - 1]) {
                    return false;
                }
                current = points[n - 1];
                route.push(current);
            }
        }
        true
    }
}

/// Crossings of `poly` with the horizontal line `y = sy` in the frame of
/// `matrix`, as `(edge index, x)`. Edge `i` runs from vertex `i - 1` to `i`.
///
/// Vertices lying on the line only count when the loop actually passes
/// through: the nearest off-line vertices before and after them must sit
/// on opposite sides. A line that merely touches a corner does not cross.
fn scanline_crossings(poly: &Polygon, matrix: &PointMatrix, sy: Coord) -> Vec<(usize, Coord)> {
    let points: Vec<Point> = poly.points.iter().map(|&p| matrix.apply(p)).collect();
    let n = points.len();
    let side = |p: Point| (p.y - sy).signum();

    let mut crossings = Vec::new();
    let Some(anchor) = (0..n).find(|&i| side(points[i]) != 0) else {
        return crossings;
    };

    let mut prev = anchor;
    let mut prev_side = side(points[anchor]);
    let mut on_line: Option<usize> = None;
    for step in 1..=n {
        let idx = (anchor + step) % n;
        let s = side(points[idx]);
        if s == 0 {
            on_line.get_or_insert(idx);
            continue;
        }
        if s != prev_side {
            match on_line {
                Some(first) => crossings.push((first, points[first].x)),
                None => {
                    let (a, b) = (points[prev], points[idx]);
                    crossings.push((idx, a.x + (b.x - a.x) * (sy - a.y) / (b.y - a.y)));
                }
            }
        }
        on_line = None;
        prev = idx;
        prev_side = s;
    }
    crossings
}

/// Vertex `idx` of `poly` pushed `offset` along the mean of its two edge
/// normals, away from the material the loop encloses.
fn offset_vertex(poly: &Polygon, idx: usize, offset: Coord) -> Point {
    let n = poly.len();
    let p0 = poly[(idx + n - 1) % n];
    let p1 = poly[idx];
    let p2 = poly[(idx + 1) % n];

    let off0 = (p1 - p0).normal(1000).cross_z();
    let off1 = (p2 - p1).normal(1000).cross_z();
    p1 + (off0 + off1).normal(offset)
}
