//! Planar geometry primitives and the spatial predicates relations rely on.
//!
//! Geometries serialize GeoJSON-style: `{"type": "LineString",
//! "coordinates": [[0.0, 0.0], [1.0, 0.0]]}`. All computations are
//! cartesian; no projection or geodesic handling is attempted.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// A 2D coordinate. Serialized as a `[x, y]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Coord {
    pub x: f64,
    pub y: f64,
}

impl Coord {
    pub fn new(x: f64, y: f64) -> Self {
        Coord { x, y }
    }

    fn distance_to(self, other: Coord) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<[f64; 2]> for Coord {
    fn from([x, y]: [f64; 2]) -> Self {
        Coord { x, y }
    }
}

impl From<Coord> for [f64; 2] {
    fn from(c: Coord) -> Self {
        [c.x, c.y]
    }
}

impl From<(f64, f64)> for Coord {
    fn from((x, y): (f64, f64)) -> Self {
        Coord { x, y }
    }
}

/// A feature geometry.
///
/// Polygons carry their exterior ring only. The ring may or may not repeat
/// its first coordinate at the end; both forms are treated as closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Geometry {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Coord>),
}

type Segment = (Coord, Coord);

impl Geometry {
    /// Builds a line string from `(x, y)` pairs.
    pub fn line<I: IntoIterator<Item = (f64, f64)>>(coords: I) -> Self {
        Geometry::LineString(coords.into_iter().map(Coord::from).collect())
    }

    /// Builds a polygon from `(x, y)` pairs of its exterior ring.
    pub fn polygon<I: IntoIterator<Item = (f64, f64)>>(coords: I) -> Self {
        Geometry::Polygon(coords.into_iter().map(Coord::from).collect())
    }

    pub fn point(x: f64, y: f64) -> Self {
        Geometry::Point(Coord::new(x, y))
    }

    /// Axis-aligned rectangle, convenient for tests and fixtures.
    pub fn rect(min: (f64, f64), max: (f64, f64)) -> Self {
        Geometry::polygon([
            (min.0, min.1),
            (max.0, min.1),
            (max.0, max.1),
            (min.0, max.1),
            (min.0, min.1),
        ])
    }

    /// Checks structural validity: non-empty lines, rings with at least
    /// three distinct vertices, finite coordinates.
    pub fn validate(&self) -> Result<(), CoreError> {
        let coords = self.coords();
        if coords.iter().any(|c| !c.x.is_finite() || !c.y.is_finite()) {
            return Err(CoreError::InvalidGeometry {
                reason: "non-finite coordinate".into(),
            });
        }
        match self {
            Geometry::Point(_) => Ok(()),
            Geometry::LineString(line) if line.len() < 2 => Err(CoreError::InvalidGeometry {
                reason: format!("line string needs at least 2 coordinates, got {}", line.len()),
            }),
            Geometry::Polygon(_) if self.ring().len() < 3 => Err(CoreError::InvalidGeometry {
                reason: "polygon ring needs at least 3 distinct vertices".into(),
            }),
            _ => Ok(()),
        }
    }

    /// Length of a line string, perimeter of a polygon, zero for a point.
    pub fn length(&self) -> f64 {
        self.segments()
            .iter()
            .map(|(a, b)| a.distance_to(*b))
            .sum()
    }

    /// Enclosed area of a polygon (shoelace formula), zero otherwise.
    pub fn area(&self) -> f64 {
        match self {
            Geometry::Polygon(_) => {
                let ring = self.ring();
                let n = ring.len();
                let twice: f64 = (0..n)
                    .map(|i| {
                        let a = ring[i];
                        let b = ring[(i + 1) % n];
                        a.x * b.y - b.x * a.y
                    })
                    .sum();
                twice.abs() / 2.0
            }
            _ => 0.0,
        }
    }

    /// True when the two geometries share at least one point, boundaries
    /// included.
    pub fn intersects(&self, other: &Geometry) -> bool {
        let mine = self.segments();
        let theirs = other.segments();
        let crossing = mine
            .iter()
            .any(|a| theirs.iter().any(|b| segments_intersect(*a, *b)));
        if crossing {
            return true;
        }
        // Full containment: no boundary crossing but one geometry lies
        // inside the other polygon.
        let inside = |poly: &Geometry, probe: &Geometry| {
            matches!(poly, Geometry::Polygon(_))
                && probe
                    .coords()
                    .first()
                    .is_some_and(|c| point_in_ring(*c, &poly.ring()))
        };
        inside(other, self) || inside(self, other)
    }

    /// Minimum planar distance between the geometries; zero when they
    /// intersect.
    pub fn distance(&self, other: &Geometry) -> f64 {
        if self.intersects(other) {
            return 0.0;
        }
        let mine = self.segments();
        let theirs = other.segments();
        mine.iter()
            .flat_map(|a| theirs.iter().map(move |b| segment_distance(*a, *b)))
            .fold(f64::INFINITY, f64::min)
    }

    fn coords(&self) -> Vec<Coord> {
        match self {
            Geometry::Point(c) => vec![*c],
            Geometry::LineString(cs) | Geometry::Polygon(cs) => cs.clone(),
        }
    }

    /// Polygon ring without the repeated closing coordinate.
    fn ring(&self) -> Vec<Coord> {
        let mut ring = self.coords();
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        ring
    }

    /// Boundary segments. Points (and one-coordinate lines) become a
    /// degenerate segment so every predicate can work on segments alone.
    fn segments(&self) -> Vec<Segment> {
        match self {
            Geometry::Point(c) => vec![(*c, *c)],
            Geometry::LineString(cs) => match cs.len() {
                0 => Vec::new(),
                1 => vec![(cs[0], cs[0])],
                _ => cs.windows(2).map(|w| (w[0], w[1])).collect(),
            },
            Geometry::Polygon(_) => {
                let ring = self.ring();
                let n = ring.len();
                (0..n).map(|i| (ring[i], ring[(i + 1) % n])).collect()
            }
        }
    }
}

fn orientation(p: Coord, q: Coord, r: Coord) -> i8 {
    let v = (q.y - p.y) * (r.x - q.x) - (q.x - p.x) * (r.y - q.y);
    if v == 0.0 {
        0
    } else if v > 0.0 {
        1
    } else {
        2
    }
}

/// `q` lies within the bounding box of segment `p`-`r` (callers guarantee
/// collinearity).
fn on_segment(p: Coord, q: Coord, r: Coord) -> bool {
    q.x <= p.x.max(r.x) && q.x >= p.x.min(r.x) && q.y <= p.y.max(r.y) && q.y >= p.y.min(r.y)
}

fn segments_intersect((p1, q1): Segment, (p2, q2): Segment) -> bool {
    let o1 = orientation(p1, q1, p2);
    let o2 = orientation(p1, q1, q2);
    let o3 = orientation(p2, q2, p1);
    let o4 = orientation(p2, q2, q1);

    if o1 != o2 && o3 != o4 {
        return true;
    }
    (o1 == 0 && on_segment(p1, p2, q1))
        || (o2 == 0 && on_segment(p1, q2, q1))
        || (o3 == 0 && on_segment(p2, p1, q2))
        || (o4 == 0 && on_segment(p2, q1, q2))
}

fn point_segment_distance(p: Coord, (a, b): Segment) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return p.distance_to(a);
    }
    let t = (((p.x - a.x) * dx + (p.y - a.y) * dy) / len_sq).clamp(0.0, 1.0);
    p.distance_to(Coord::new(a.x + t * dx, a.y + t * dy))
}

fn segment_distance(s1: Segment, s2: Segment) -> f64 {
    if segments_intersect(s1, s2) {
        return 0.0;
    }
    point_segment_distance(s1.0, s2)
        .min(point_segment_distance(s1.1, s2))
        .min(point_segment_distance(s2.0, s1))
        .min(point_segment_distance(s2.1, s1))
}

/// Even-odd ray casting. Boundary points are handled by the segment test
/// in [`Geometry::intersects`], not here.
fn point_in_ring(p: Coord, ring: &[Coord]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}
