//! Point-in-polygon and segment crossing tests in pixel space.

use camwatch_models::{Direction, Point};

/// Ray-casting point-in-polygon test.
///
/// Points exactly on an edge may land on either side; callers compare the
/// result across frames so a consistent answer is all that matters.
pub fn point_in_polygon(point: &Point, vertices: &[Point]) -> bool {
    if vertices.len() < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (vi, vj) = (&vertices[i], &vertices[j]);
        if (vi.y > point.y) != (vj.y > point.y) {
            let x_at_y = (vj.x - vi.x) * (point.y - vi.y) / (vj.y - vi.y) + vi.x;
            if point.x < x_at_y {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn ccw(a: &Point, b: &Point, c: &Point) -> bool {
    (c.y - a.y) * (b.x - a.x) > (b.y - a.y) * (c.x - a.x)
}

/// Whether segment `p1-p2` properly intersects segment `q1-q2`.
pub fn segments_intersect(p1: &Point, p2: &Point, q1: &Point, q2: &Point) -> bool {
    ccw(p1, q1, q2) != ccw(p2, q1, q2) && ccw(p1, p2, q1) != ccw(p1, p2, q2)
}

/// Direction of travel from `from` to `to`, judged by vertical displacement.
///
/// Downward motion (growing y) is `In`, upward is `Out`. Purely horizontal
/// motion has no direction.
pub fn vertical_direction(from: &Point, to: &Point) -> Option<Direction> {
    let dy = to.y - from.y;
    if dy > 0.0 {
        Some(Direction::In)
    } else if dy < 0.0 {
        Some(Direction::Out)
    } else {
        None
    }
}

/// Linearly interpolated points strictly between `start` and `end`, one per
/// `spacing` pixels of travel. Empty when the gap is under two steps.
pub fn interpolate(start: &Point, end: &Point, spacing: f64) -> Vec<Point> {
    if spacing <= 0.0 {
        return Vec::new();
    }
    let steps = (start.distance(end) / spacing).floor() as usize;
    if steps < 2 {
        return Vec::new();
    }

    // `steps` evenly spaced samples including both endpoints, endpoints dropped.
    let denom = (steps - 1) as f64;
    (1..steps - 1)
        .map(|i| {
            let t = i as f64 / denom;
            Point::new(
                start.x + (end.x - start.x) * t,
                start.y + (end.y - start.y) * t,
            )
        })
        .collect()
}
