//! Integer plane geometry for toolpaths.
//!
//! Coordinates are microns stored as `i64`, so comparisons against boundary
//! edges never drift. Floating point only appears where a result is rounded
//! straight back onto the grid.

use std::ops::{Add, AddAssign, Div, Index, Mul, Neg, Sub};

use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

/// Scalar coordinate in microns.
pub type Coord = i64;

/// Number of coordinate units in one millimeter.
pub const UNITS_PER_MM: f64 = 1000.0;

/// Convert millimeters to integer coordinate units.
#[inline]
pub fn mm_to_int(mm: f64) -> Coord {
    (mm * UNITS_PER_MM).round() as Coord
}

/// Convert integer coordinate units to millimeters.
#[inline]
pub fn int_to_mm(value: Coord) -> f64 {
    value as f64 / UNITS_PER_MM
}

/// A 2D point (or vector) in integer micron units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate (microns).
    pub x: Coord,
    /// Y coordinate (microns).
    pub y: Coord,
}

impl Point {
    /// Create a point from integer coordinates.
    #[inline]
    pub const fn new(x: Coord, y: Coord) -> Self {
        Self { x, y }
    }

    /// Create a point from millimeter coordinates.
    #[inline]
    pub fn from_mm(x: f64, y: f64) -> Self {
        Self::new(mm_to_int(x), mm_to_int(y))
    }

    /// Squared length of this point taken as a vector.
    #[inline]
    pub fn length_squared(&self) -> i64 {
        self.x * self.x + self.y * self.y
    }

    /// Length in coordinate units.
    #[inline]
    pub fn length(&self) -> f64 {
        (self.x as f64).hypot(self.y as f64)
    }

    /// Length in millimeters.
    #[inline]
    pub fn length_mm(&self) -> f64 {
        self.length() / UNITS_PER_MM
    }

    /// True when the vector is strictly shorter than `len`.
    #[inline]
    pub fn shorter_than(&self, len: Coord) -> bool {
        if self.x > len || self.x < -len || self.y > len || self.y < -len {
            return false;
        }
        self.length_squared() < len * len
    }

    /// Dot product.
    #[inline]
    pub fn dot(&self, other: Point) -> i64 {
        self.x * other.x + self.y * other.y
    }

    /// Rotate 90° counter-clockwise.
    ///
    /// Applied to an edge direction this yields the left-hand normal, which
    /// points into the region for CCW outlines and CW holes.
    #[inline]
    pub fn cross_z(&self) -> Point {
        Point::new(-self.y, self.x)
    }

    /// Rescale to length `len`. A zero vector becomes `(len, 0)`.
    pub fn normal(&self, len: Coord) -> Point {
        let current = self.length();
        if current < 1.0 {
            return Point::new(len, 0);
        }
        let scale = len as f64 / current;
        Point::new(
            (self.x as f64 * scale).round() as Coord,
            (self.y as f64 * scale).round() as Coord,
        )
    }

    /// Floating point view in coordinate units.
    #[inline]
    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.x as f64, self.y as f64)
    }

    /// Round a floating point vector back onto the grid.
    #[inline]
    pub fn from_vector(v: Vector2<f64>) -> Self {
        Self::new(v.x.round() as Coord, v.y.round() as Coord)
    }
}

impl Add for Point {
    type Output = Point;
    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign for Point {
    fn add_assign(&mut self, rhs: Point) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub for Point {
    type Output = Point;
    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl Neg for Point {
    type Output = Point;
    fn neg(self) -> Point {
        Point::new(-self.x, -self.y)
    }
}

impl Mul<Coord> for Point {
    type Output = Point;
    fn mul(self, rhs: Coord) -> Point {
        Point::new(self.x * rhs, self.y * rhs)
    }
}

impl Div<Coord> for Point {
    type Output = Point;
    fn div(self, rhs: Coord) -> Point {
        Point::new(self.x / rhs, self.y / rhs)
    }
}

/// Rotation that maps a given direction onto the positive X axis.
///
/// Used to turn "does this segment cross an edge" into a horizontal
/// scanline test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointMatrix {
    matrix: Matrix2<f64>,
}

impl PointMatrix {
    /// Rotation aligning `direction` with +X. A zero direction gives identity.
    pub fn aligned_with(direction: Point) -> Self {
        let len = direction.length();
        if len == 0.0 {
            return Self {
                matrix: Matrix2::identity(),
            };
        }
        let c = direction.x as f64 / len;
        let s = direction.y as f64 / len;
        Self {
            matrix: Matrix2::new(c, s, -s, c),
        }
    }

    /// Rotate `p` into the aligned frame.
    #[inline]
    pub fn apply(&self, p: Point) -> Point {
        Point::from_vector(self.matrix * p.to_vector())
    }

    /// Rotate `p` from the aligned frame back to the original frame.
    #[inline]
    pub fn unapply(&self, p: Point) -> Point {
        Point::from_vector(self.matrix.transpose() * p.to_vector())
    }
}

/// A closed loop of points.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygon {
    /// Vertices in order; the closing edge is implicit.
    pub points: Vec<Point>,
}

impl Polygon {
    /// Create a new polygon from points.
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Create a polygon from millimeter coordinates.
    pub fn from_mm(points: &[(f64, f64)]) -> Self {
        Self::new(points.iter().map(|&(x, y)| Point::from_mm(x, y)).collect())
    }

    /// Check if the polygon is empty.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Number of vertices.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Reverse the winding order.
    pub fn reverse(&mut self) {
        self.points.reverse();
    }

    /// Even-odd containment test for a single loop.
    ///
    /// Uses a half-open rule on Y so that a vertex lying exactly on the ray
    /// is counted once.
    pub fn inside(&self, p: Point) -> bool {
        let n = self.points.len();
        if n < 3 {
            return false;
        }

        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let pi = self.points[i];
            let pj = self.points[j];
            if (pi.y > p.y) != (pj.y > p.y) {
                let x = pi.x as f64
                    + (pj.x - pi.x) as f64 * (p.y - pi.y) as f64 / (pj.y - pi.y) as f64;
                if (p.x as f64) < x {
                    inside = !inside;
                }
            }
            j = i;
        }
        inside
    }
}

impl Index<usize> for Polygon {
    type Output = Point;
    fn index(&self, index: usize) -> &Point {
        &self.points[index]
    }
}

/// An ordered set of closed loops: outlines and their holes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Polygons {
    /// The loops. Outlines are expected CCW and holes CW.
    pub polygons: Vec<Polygon>,
}

impl Polygons {
    /// Create a set from loops.
    pub fn new(polygons: Vec<Polygon>) -> Self {
        Self { polygons }
    }

    /// Append a loop.
    pub fn push(&mut self, polygon: Polygon) {
        self.polygons.push(polygon);
    }

    /// Number of loops.
    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    /// True when there are no loops.
    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    /// Iterate over the loops.
    pub fn iter(&self) -> std::slice::Iter<'_, Polygon> {
        self.polygons.iter()
    }

    /// A point is inside when an odd number of loops contain it.
    pub fn inside(&self, p: Point) -> bool {
        self.polygons.iter().filter(|poly| poly.inside(p)).count() % 2 == 1
    }
}

impl Index<usize> for Polygons {
    type Output = Polygon;
    fn index(&self, index: usize) -> &Polygon {
        &self.polygons[index]
    }
}

impl FromIterator<Polygon> for Polygons {
    fn from_iter<I: IntoIterator<Item = Polygon>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Polygons {
    type Item = &'a Polygon;
    type IntoIter = std::slice::Iter<'a, Polygon>;
    fn into_iter(self) -> Self::IntoIter {
        self.polygons.iter()
    }
}

/// Center of the circle through three points, or `None` when they are
/// (nearly) collinear.
pub fn circle_center(a: Point, b: Point, c: Point) -> Option<Vector2<f64>> {
    let a = a.to_vector();
    let b = b.to_vector();
    let c = c.to_vector();

    let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
    if d.abs() < 1e-6 {
        return None;
    }

    let a2 = a.norm_squared();
    let b2 = b.norm_squared();
    let c2 = c.norm_squared();
    let ux = (a2 * (b.y - c.y) + b2 * (c.y - a.y) + c2 * (a.y - b.y)) / d;
    let uy = (a2 * (c.x - b.x) + b2 * (a.x - c.x) + c2 * (b.x - a.x)) / d;
    Some(Vector2::new(ux, uy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn square(size: f64) -> Polygon {
        Polygon::from_mm(&[(0.0, 0.0), (size, 0.0), (size, size), (0.0, size)])
    }

    #[test]
    fn test_unit_conversion() {
        assert_eq!(mm_to_int(1.5), 1500);
        assert_relative_eq!(int_to_mm(250), 0.25);
        assert_eq!(Point::from_mm(0.2, -3.0), Point::new(200, -3000));
    }

    #[test]
    fn test_shorter_than() {
        let v = Point::new(300, 400);
        assert!(v.shorter_than(501));
        assert!(!v.shorter_than(500));
        assert!(!Point::new(10_000, 0).shorter_than(50));
    }

    #[test]
    fn test_normal_and_cross_z() {
        let n = Point::new(0, 5000).normal(1000);
        assert_eq!(n, Point::new(0, 1000));
        assert_eq!(n.cross_z(), Point::new(-1000, 0));
        assert_eq!(Point::default().normal(7), Point::new(7, 0));
    }

    #[test]
    fn test_point_matrix_round_trip() {
        let m = PointMatrix::aligned_with(Point::new(3000, 4000));
        let p = Point::new(3000, 4000);
        let t = m.apply(p);
        assert_eq!(t, Point::new(5000, 0));
        assert_eq!(m.unapply(t), p);
    }

    #[test]
    fn test_inside_with_hole() {
        let mut hole = Polygon::from_mm(&[(3.0, 3.0), (7.0, 3.0), (7.0, 7.0), (3.0, 7.0)]);
        hole.reverse();
        let boundary = Polygons::new(vec![square(10.0), hole]);

        assert!(boundary.inside(Point::from_mm(1.0, 1.0)));
        assert!(!boundary.inside(Point::from_mm(5.0, 5.0)));
        assert!(!boundary.inside(Point::from_mm(11.0, 5.0)));
    }

    #[test]
    fn test_circle_center() {
        let c = circle_center(
            Point::new(1000, 0),
            Point::new(0, 1000),
            Point::new(-1000, 0),
        )
        .unwrap();
        assert_relative_eq!(c.x, 0.0, epsilon = 1e-9);
        assert_relative_eq!(c.y, 0.0, epsilon = 1e-9);

        assert!(circle_center(Point::new(0, 0), Point::new(1, 1), Point::new(2, 2)).is_none());
    }
}
