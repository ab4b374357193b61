//! Piecewise curve evaluation for time-varying behaviors.
//!
//! A behavior curve is defined by control points on the unit square and
//! evaluated over caller-supplied axis bounds. Segments between two `curve`
//! points use monotone cubic (Fritsch-Carlson) interpolation; any segment
//! adjacent to a `break` point is linear. This mirrors the rendering of the
//! curve editor in the UI, which is a compatibility contract: the server
//! must produce exactly the values the user sees on screen.

use serde::{Deserialize, Serialize};

/// How a control point joins its neighboring segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointKind {
    /// Smooth monotone-cubic joint
    #[default]
    Curve,
    /// Linear joint, producing a visible corner
    Break,
}

/// A control point on the unit square.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BehaviorPoint {
    pub x: f64,
    pub y: f64,
    pub kind: PointKind,
}

impl BehaviorPoint {
    pub fn new(x: f64, y: f64, kind: PointKind) -> Self {
        Self { x, y, kind }
    }

    /// Smooth point shorthand.
    pub fn curve(x: f64, y: f64) -> Self {
        Self::new(x, y, PointKind::Curve)
    }

    /// Break point shorthand.
    pub fn brk(x: f64, y: f64) -> Self {
        Self::new(x, y, PointKind::Break)
    }
}

/// A compiled curve: axis bounds plus control points.
///
/// Construction is cheap; [`CurveFn::eval`] runs on every request. Input is
/// normalized into `[0, 1]`, clamped to the endpoints, and the interpolated
/// value is denormalized into the y bounds. With fewer than two points the
/// curve evaluates to `min_y` everywhere.
#[derive(Debug, Clone)]
pub struct CurveFn {
    min_x: f64,
    max_x: f64,
    min_y: f64,
    max_y: f64,
    points: Vec<BehaviorPoint>,
}

impl CurveFn {
    /// Compiles a curve from bounds and control points.
    ///
    /// The first and last points are snapped to `x = 0` and `x = 1` so every
    /// ingested curve spans the whole horizon.
    pub fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64, points: Vec<BehaviorPoint>) -> Self {
        let mut points = points;
        if let Some(first) = points.first_mut() {
            first.x = 0.0;
        }
        if points.len() > 1 {
            if let Some(last) = points.last_mut() {
                last.x = 1.0;
            }
        }
        Self {
            min_x,
            max_x,
            min_y,
            max_y,
            points,
        }
    }

    /// Constant curve pinned to `min_y`.
    pub fn constant(min_y: f64) -> Self {
        Self::new(0.0, 1.0, min_y, min_y, Vec::new())
    }

    fn norm_x(&self, x: f64) -> f64 {
        if self.max_x == self.min_x {
            0.0
        } else {
            (x - self.min_x) / (self.max_x - self.min_x)
        }
    }

    fn denorm_y(&self, y: f64) -> f64 {
        self.min_y + y * (self.max_y - self.min_y)
    }

    /// Evaluates the curve at `x` (same units as the x bounds).
    pub fn eval(&self, x: f64) -> f64 {
        if self.points.len() < 2 {
            return self.min_y;
        }

        let nx = self.norm_x(x);
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if nx <= first.x {
            return self.denorm_y(first.y);
        }
        if nx >= last.x {
            return self.denorm_y(last.y);
        }

        // Find the segment [prev, curr] with prev.x <= nx < curr.x
        let mut i = 1;
        while i < self.points.len() {
            if nx < self.points[i].x {
                break;
            }
            i += 1;
        }
        let prev = self.points[i - 1];
        let curr = self.points[i];
        let dx = curr.x - prev.x;
        if dx == 0.0 {
            return self.denorm_y(curr.y);
        }
        let t = (nx - prev.x) / dx;

        // Break points force linear interpolation on both adjacent segments
        if prev.kind == PointKind::Break || curr.kind == PointKind::Break {
            let y = prev.y + t * (curr.y - prev.y);
            return self.denorm_y(y);
        }

        // Monotone cubic: estimate tangents from one-sided neighbors, then
        // clamp to zero wherever the sign disagrees with the local secant
        let secant = (curr.y - prev.y) / dx;
        let mut m_prev = if i >= 2 {
            let before = self.points[i - 2];
            (curr.y - before.y) / (curr.x - before.x)
        } else {
            secant
        };
        let mut m_curr = if i + 1 < self.points.len() {
            let after = self.points[i + 1];
            (after.y - prev.y) / (after.x - prev.x)
        } else {
            secant
        };

        let delta = curr.y - prev.y;
        if delta == 0.0 || (m_prev != 0.0 && m_prev.signum() != delta.signum()) {
            m_prev = 0.0;
        }
        if delta == 0.0 || (m_curr != 0.0 && m_curr.signum() != delta.signum()) {
            m_curr = 0.0;
        }

        let y = cubic_hermite(prev.y, curr.y, m_prev * dx, m_curr * dx, t).clamp(0.0, 1.0);
        self.denorm_y(y)
    }
}

/// Cubic Hermite basis evaluation.
fn cubic_hermite(y0: f64, y1: f64, m0: f64, m1: f64, t: f64) -> f64 {
    let t2 = t * t;
    let t3 = t2 * t;
    (2.0 * t3 - 3.0 * t2 + 1.0) * y0
        + (t3 - 2.0 * t2 + t) * m0
        + (-2.0 * t3 + 3.0 * t2) * y1
        + (t3 - t2) * m1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_evaluate_to_endpoint_values() {
        let curve = CurveFn::new(
            0.0,
            1000.0,
            0.0,
            100.0,
            vec![BehaviorPoint::curve(0.0, 0.2), BehaviorPoint::curve(1.0, 0.8)],
        );
        assert!((curve.eval(0.0) - 20.0).abs() < 1e-9);
        assert!((curve.eval(1000.0) - 80.0).abs() < 1e-9);
        // Out-of-range inputs clamp to the endpoints
        assert!((curve.eval(-50.0) - 20.0).abs() < 1e-9);
        assert!((curve.eval(5000.0) - 80.0).abs() < 1e-9);
    }

    #[test]
    fn flat_segment_is_exactly_flat() {
        let curve = CurveFn::new(
            0.0,
            1000.0,
            0.0,
            1.0,
            vec![BehaviorPoint::curve(0.0, 0.5), BehaviorPoint::curve(1.0, 0.5)],
        );
        for i in 0..=100 {
            let x = i as f64 * 10.0;
            assert!(
                (curve.eval(x) - 0.5).abs() < 1e-12,
                "flat curve deviated at x={x}"
            );
        }
    }

    #[test]
    fn break_points_interpolate_linearly() {
        let curve = CurveFn::new(
            0.0,
            1000.0,
            0.0,
            1000.0,
            vec![BehaviorPoint::brk(0.0, 0.0), BehaviorPoint::brk(1.0, 1.0)],
        );
        assert!((curve.eval(500.0) - 500.0).abs() < 1e-9);
        assert!((curve.eval(250.0) - 250.0).abs() < 1e-9);
    }

    #[test]
    fn collinear_insert_does_not_change_values() {
        let two = CurveFn::new(
            0.0,
            1.0,
            0.0,
            1.0,
            vec![BehaviorPoint::curve(0.0, 0.0), BehaviorPoint::curve(1.0, 1.0)],
        );
        let three = CurveFn::new(
            0.0,
            1.0,
            0.0,
            1.0,
            vec![
                BehaviorPoint::curve(0.0, 0.0),
                BehaviorPoint::curve(0.5, 0.5),
                BehaviorPoint::curve(1.0, 1.0),
            ],
        );
        for i in 0..=100 {
            let x = i as f64 / 100.0;
            assert!(
                (two.eval(x) - three.eval(x)).abs() < 1e-9,
                "divergence at x={x}"
            );
        }
    }

    #[test]
    fn fewer_than_two_points_returns_min_y() {
        let empty = CurveFn::new(0.0, 10.0, 7.0, 42.0, Vec::new());
        assert_eq!(empty.eval(3.0), 7.0);

        let single = CurveFn::new(0.0, 10.0, 7.0, 42.0, vec![BehaviorPoint::curve(0.3, 0.9)]);
        assert_eq!(single.eval(3.0), 7.0);
    }

    #[test]
    fn endpoint_x_normalized_on_ingest() {
        let curve = CurveFn::new(
            0.0,
            100.0,
            0.0,
            1.0,
            vec![BehaviorPoint::curve(0.1, 0.0), BehaviorPoint::curve(0.9, 1.0)],
        );
        // First/last points snap to x=0 and x=1, so the curve spans the
        // full horizon instead of clamping early.
        assert!((curve.eval(0.0) - 0.0).abs() < 1e-12);
        assert!((curve.eval(100.0) - 1.0).abs() < 1e-12);
        assert!(curve.eval(50.0) > 0.0 && curve.eval(50.0) < 1.0);
    }

    #[test]
    fn monotone_input_stays_monotone() {
        let curve = CurveFn::new(
            0.0,
            1.0,
            0.0,
            1.0,
            vec![
                BehaviorPoint::curve(0.0, 0.0),
                BehaviorPoint::curve(0.3, 0.1),
                BehaviorPoint::curve(0.6, 0.9),
                BehaviorPoint::curve(1.0, 1.0),
            ],
        );
        let mut last = curve.eval(0.0);
        for i in 1..=200 {
            let y = curve.eval(i as f64 / 200.0);
            assert!(y + 1e-9 >= last, "monotone curve decreased at step {i}");
            last = y;
        }
    }
}
