//! Calibration curve math: linear interpolation over ordered points and
//! cardinal spline smoothing.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use log::trace;

/// Resample step of the smoothed curve, as a fraction of the x range.
const RESOLUTION: f64 = 1000.0;
const MAX_SEGMENT_SAMPLES: f64 = 2.0 * RESOLUTION;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub(crate) const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    fn cmp_xy(&self, other: &Self) -> Ordering {
        self.x
            .total_cmp(&other.x)
            .then_with(|| self.y.total_cmp(&other.y))
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

impl FromStr for Point {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (x, y) = s
            .split_once(',')
            .ok_or_else(|| anyhow!("expected `x,y`, got `{}`", s))?;
        let x: f64 = x.trim().parse().with_context(|| format!("bad x in `{}`", s))?;
        let y: f64 = y.trim().parse().with_context(|| format!("bad y in `{}`", s))?;
        if !x.is_finite() || !y.is_finite() {
            return Err(anyhow!("point `{}` is not finite", s));
        }
        Ok(Self { x, y })
    }
}

/// User taught (light intensity, brightness) pairs, clamped to the unit
/// square, sorted by x and free of duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct CalibrationPoints(Vec<Point>);

impl CalibrationPoints {
    pub(crate) fn new(points: impl IntoIterator<Item = Point>) -> Self {
        let mut points: Vec<Point> = points
            .into_iter()
            .map(|p| Point::new(p.x.clamp(0.0, 1.0), p.y.clamp(0.0, 1.0)))
            .collect();
        points.sort_by(Point::cmp_xy);
        points.dedup();
        Self(points)
    }

    pub(crate) fn as_slice(&self) -> &[Point] {
        &self.0
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SmoothedCurve {
    pub points: Vec<Point>,
    /// False when x does not strictly increase along the curve.
    pub valid: bool,
}

impl SmoothedCurve {
    pub(crate) fn interpolate(&self, x: f64) -> f64 {
        interpolate(&self.points, x)
    }
}

/// Piecewise linear lookup of `x` in points sorted by ascending x.
///
/// NaN for an empty set or a NaN input; a single point is a constant; outside
/// the covered range the nearest boundary y is returned.
pub(crate) fn interpolate(points: &[Point], x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    let (first, last) = match (points.first(), points.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => return f64::NAN,
    };
    if points.len() == 1 || x <= first.x {
        return first.y;
    }
    if x >= last.x {
        return last.y;
    }

    // Tightest bracket: last point with p1.x <= x, first point with p2.x > x.
    let upper = points.partition_point(|p| p.x <= x);
    let p1 = points[upper - 1];
    let p2 = points[upper];
    p1.y + (x - p1.x) * (p2.y - p1.y) / (p2.x - p1.x)
}

/// Fits a cardinal spline with the given tension through `points` and
/// resamples it at a step of `range_x / 1000`.
///
/// Two points or fewer are returned as is.
pub(crate) fn smooth(points: &[Point], tension: f64) -> SmoothedCurve {
    if points.len() <= 2 {
        return SmoothedCurve {
            points: points.to_vec(),
            valid: true,
        };
    }

    let (min_x, max_x) = points
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            (lo.min(p.x), hi.max(p.x))
        });
    let step = (max_x - min_x) / RESOLUTION;

    let n = points.len();
    let mut out = vec![points[0]];
    for i in 0..n - 1 {
        let p0 = points[i.saturating_sub(1)];
        let p1 = points[i];
        let p2 = points[i + 1];
        let p3 = points[(i + 2).min(n - 1)];
        segment(&mut out, p0, p1, p2, p3, tension, step);
    }

    let valid = is_function(&out);
    trace!(
        "Smoothed {} points into {} (tension {}, valid {})",
        n,
        out.len(),
        tension,
        valid
    );
    SmoothedCurve { points: out, valid }
}

/// Appends the samples of the curve from `p1` to `p2`, excluding `p1` and
/// ending exactly on `p2`.
fn segment(out: &mut Vec<Point>, p0: Point, p1: Point, p2: Point, p3: Point, tension: f64, step: f64) {
    let sx1 = tension * (p2.x - p0.x);
    let sy1 = tension * (p2.y - p0.y);
    let sx2 = tension * (p3.x - p1.x);
    let sy2 = tension * (p3.y - p1.y);

    let ax = sx1 + sx2 + 2.0 * p1.x - 2.0 * p2.x;
    let ay = sy1 + sy2 + 2.0 * p1.y - 2.0 * p2.y;
    let bx = -2.0 * sx1 - sx2 - 3.0 * p1.x + 3.0 * p2.x;
    let by = -2.0 * sy1 - sy2 - 3.0 * p1.y + 3.0 * p2.y;
    let (cx, cy) = (sx1, sy1);
    let (dx, dy) = (p1.x, p1.y);

    let span = (p2.x - p1.x).abs() + (p2.y - p1.y).abs();
    // a steep segment over a narrow x range would otherwise be unbounded
    let num = if step > 0.0 && step.is_finite() {
        (span / step).min(MAX_SEGMENT_SAMPLES) as usize
    } else {
        0
    };

    for k in 1..num {
        let t = k as f64 / num as f64;
        out.push(Point::new(
            ((ax * t + bx) * t + cx) * t + dx,
            ((ay * t + by) * t + cy) * t + dy,
        ));
    }
    out.push(p2);
}

fn is_function(points: &[Point]) -> bool {
    points.windows(2).all(|w| w[1].x - w[0].x > 0.0)
}
