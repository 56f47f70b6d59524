//! Scan plan vocabulary.
//!
//! A [`ScanPlan`] is the caller's request: per-axis ranges, the visiting
//! order and the mode. The [`crate::experiment::planner::ScanPlanner`] turns
//! it into a [`ScanPath`], the ordered list of [`ScanPoint`]s the engine
//! visits.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three spatial axes of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum SpatialAxis {
    X,
    Y,
    Z,
}

impl SpatialAxis {
    /// x, y, z
    pub const ALL: [SpatialAxis; 3] = [SpatialAxis::X, SpatialAxis::Y, SpatialAxis::Z];

    /// Index into coordinate triples.
    pub fn index(self) -> usize {
        match self {
            SpatialAxis::X => 0,
            SpatialAxis::Y => 1,
            SpatialAxis::Z => 2,
        }
    }

    /// Logical rig axis name.
    pub fn name(self) -> &'static str {
        match self {
            SpatialAxis::X => "x",
            SpatialAxis::Y => "y",
            SpatialAxis::Z => "z",
        }
    }
}

impl fmt::Display for SpatialAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Axis visiting order, named fastest to slowest.
///
/// `Xyz` sweeps x for every y, and y for every z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[allow(missing_docs)]
pub enum AxisOrder {
    #[default]
    Xyz,
    Xzy,
    Yzx,
    Yxz,
    Zxy,
    Zyx,
}

impl AxisOrder {
    /// All six orders, by index.
    pub const ALL: [AxisOrder; 6] = [
        AxisOrder::Xyz,
        AxisOrder::Xzy,
        AxisOrder::Yzx,
        AxisOrder::Yxz,
        AxisOrder::Zxy,
        AxisOrder::Zyx,
    ];

    /// `[fast, middle, slow]`
    pub fn axes(self) -> [SpatialAxis; 3] {
        use SpatialAxis::{X, Y, Z};
        match self {
            AxisOrder::Xyz => [X, Y, Z],
            AxisOrder::Xzy => [X, Z, Y],
            AxisOrder::Yzx => [Y, Z, X],
            AxisOrder::Yxz => [Y, X, Z],
            AxisOrder::Zxy => [Z, X, Y],
            AxisOrder::Zyx => [Z, Y, X],
        }
    }

    /// Inverse of [`AxisOrder::axes`].
    pub fn from_axes(axes: [SpatialAxis; 3]) -> Option<Self> {
        Self::ALL.into_iter().find(|o| o.axes() == axes)
    }

    /// Order from its numeric index (0 = xyz, 1 = xzy, 2 = yzx, 3 = yxz, 4 = zxy, 5 = zyx).
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Numeric index
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|o| *o == self).unwrap_or(0)
    }

    /// Continuously swept / innermost axis
    pub fn fast(self) -> SpatialAxis {
        self.axes()[0]
    }

    /// Outermost axis
    pub fn slow(self) -> SpatialAxis {
        self.axes()[2]
    }
}

impl fmt::Display for AxisOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for axis in self.axes() {
            f.write_str(axis.name())?;
        }
        Ok(())
    }
}

impl FromStr for AxisOrder {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|o| o.to_string() == lower)
            .ok_or_else(|| DaqError::InvalidPlan(format!("unknown axis order '{s}'")))
    }
}

/// Start, end and step along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    /// First coordinate
    pub start: f64,
    /// Last coordinate
    pub end: f64,
    /// Nominal spacing (sign ignored)
    pub step: f64,
}

impl AxisRange {
    /// Range from start to end in steps of `step`.
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self { start, end, step }
    }

    /// Single coordinate.
    pub fn fixed(value: f64) -> Self {
        Self::new(value, value, 1.0)
    }

    /// Whether the range is a single coordinate.
    pub fn is_fixed(&self) -> bool {
        self.start == self.end
    }

    /// Effective step: 1 for a fixed axis, otherwise `|step|`.
    pub fn effective_step(&self) -> f64 {
        if self.is_fixed() {
            1.0
        } else {
            self.step.abs()
        }
    }

    /// `1 + floor(|end - start| / step)`.
    ///
    /// # Errors
    /// `InvalidPlan` for non-finite values or a zero step on a non-fixed range.
    pub fn count(&self) -> AppResult<usize> {
        if !(self.start.is_finite() && self.end.is_finite() && self.step.is_finite()) {
            return Err(DaqError::InvalidPlan(format!(
                "non-finite range {} -> {} step {}",
                self.start, self.end, self.step
            )));
        }
        if self.is_fixed() {
            return Ok(1);
        }
        if self.step == 0.0 {
            return Err(DaqError::InvalidPlan(format!(
                "zero step for range {} -> {}",
                self.start, self.end
            )));
        }
        let intervals = ((self.end - self.start).abs() / self.step.abs()).floor();
        if intervals >= MAX_PATH_POINTS as f64 {
            return Err(DaqError::InvalidPlan(format!(
                "range {} -> {} step {} exceeds {MAX_PATH_POINTS} points",
                self.start, self.end, self.step
            )));
        }
        Ok(1 + intervals as usize)
    }

    /// Evenly spaced coordinates from `start` to `end` inclusive.
    ///
    /// With `step` not dividing the range the spacing is stretched so both
    /// ends are still reached.
    pub fn values(&self) -> AppResult<Vec<f64>> {
        let n = self.count()?;
        if n == 1 {
            return Ok(vec![self.start]);
        }
        let span = self.end - self.start;
        let last = (n - 1) as f64;
        Ok((0..n)
            .map(|i| {
                if i == n - 1 {
                    self.end
                } else {
                    self.start + span * (i as f64 / last)
                }
            })
            .collect())
    }

    /// Spacing of the coordinates produced by [`AxisRange::values`] (signed).
    pub fn spacing(&self) -> AppResult<f64> {
        let n = self.count()?;
        if n < 2 {
            return Ok(0.0);
        }
        Ok((self.end - self.start) / (n - 1) as f64)
    }
}

/// Upper bound on the points of one axis range or one whole path.
pub const MAX_PATH_POINTS: usize = 10_000_000;

/// Scan mode and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ScanMode {
    /// Full serpentine raster
    Raster,
    /// First and last slow-axis planes rastered, interior planes perimeter only
    Boundary,
    /// Uniform random points strictly inside the volume
    RandomSample {
        /// Number of points
        points: usize,
        /// RNG seed for reproducible point sets
        seed: Option<u64>,
    },
    /// Points on a circle in x/y, for every z of the z range
    Circular {
        /// Circle center x
        center_x: f64,
        /// Circle center y
        center_y: f64,
        /// Radius
        radius: f64,
        /// Angular steps per revolution
        steps: usize,
    },
    /// Raster whose fast axis is swept continuously and sampled on trigger pulses
    OnTheFly {
        /// Sweep speed of the fast axis in units/s
        scan_speed: f64,
    },
}

impl ScanMode {
    /// Short name for logs and file names.
    pub fn name(&self) -> &'static str {
        match self {
            ScanMode::Raster => "raster",
            ScanMode::Boundary => "boundary",
            ScanMode::RandomSample { .. } => "random",
            ScanMode::Circular { .. } => "circular",
            ScanMode::OnTheFly { .. } => "onthefly",
        }
    }
}

/// A scan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlan {
    /// x range
    pub x: AxisRange,
    /// y range
    pub y: AxisRange,
    /// z range
    pub z: AxisRange,
    /// Visiting order
    #[serde(default)]
    pub order: AxisOrder,
    /// Mode and parameters
    pub mode: ScanMode,
}

impl ScanPlan {
    /// Raster plan over the given ranges in xyz order.
    pub fn raster(x: AxisRange, y: AxisRange, z: AxisRange) -> Self {
        Self {
            x,
            y,
            z,
            order: AxisOrder::default(),
            mode: ScanMode::Raster,
        }
    }

    /// Replace the visiting order.
    pub fn with_order(mut self, order: AxisOrder) -> Self {
        self.order = order;
        self
    }

    /// Replace the mode.
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    /// Range of one axis.
    pub fn range(&self, axis: SpatialAxis) -> &AxisRange {
        match axis {
            SpatialAxis::X => &self.x,
            SpatialAxis::Y => &self.y,
            SpatialAxis::Z => &self.z,
        }
    }

    /// Whether records carry a theta column.
    pub fn has_theta(&self) -> bool {
        matches!(self.mode, ScanMode::Circular { .. })
    }
}

/// One nominal stop of the scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// Position in traversal order
    pub index: usize,
    /// Nominal x, y, z
    pub coords: [f64; 3],
    /// Angle on the circle for circular scans
    pub theta: Option<f64>,
    /// Axes in the order they are moved to reach this point
    pub move_order: [SpatialAxis; 3],
}

/// How the engine traverses a path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PathLayout {
    /// Stop, settle and sample at every point
    Discrete,
    /// Consecutive runs of `sweep_len` points form continuous sweeps of `fast_axis`
    Sweeps {
        /// Continuously driven axis
        fast_axis: SpatialAxis,
        /// Points per sweep
        sweep_len: usize,
        /// Nominal spacing along the sweep (positive)
        step: f64,
        /// Sweep speed in units/s
        scan_speed: f64,
    },
}

/// Ordered, finite list of points to visit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPath {
    /// Points in visiting order
    pub points: Vec<ScanPoint>,
    /// Traversal layout
    pub layout: PathLayout,
}

impl ScanPath {
    /// Number of points
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when there is nothing to visit
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Min and max of every coordinate over all points.
    pub fn extents(&self) -> [(f64, f64); 3] {
        let mut out = [(f64::INFINITY, f64::NEG_INFINITY); 3];
        for point in &self.points {
            for (slot, value) in out.iter_mut().zip(point.coords) {
                slot.0 = slot.0.min(value);
                slot.1 = slot.1.max(value);
            }
        }
        out
    }

    /// Sweeps of an on-the-fly path; the whole path as one chunk otherwise.
    pub fn sweeps(&self) -> std::slice::Chunks<'_, ScanPoint> {
        let size = match self.layout {
            PathLayout::Sweeps { sweep_len, .. } => sweep_len.max(1),
            PathLayout::Discrete => self.points.len().max(1),
        };
        self.points.chunks(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axis_range_count_and_values() {
        let r = AxisRange::new(0.0, 2.0, 1.0);
        assert_eq!(r.count().unwrap(), 3);
        assert_eq!(r.values().unwrap(), vec![0.0, 1.0, 2.0]);

        // step does not divide the range: endpoints still reached
        let r = AxisRange::new(0.0, 1.0, 0.3);
        assert_eq!(r.count().unwrap(), 4);
        let values = r.values().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[3], 1.0);

        // descending
        let r = AxisRange::new(4.0, 0.0, 2.0);
        assert_eq!(r.values().unwrap(), vec![4.0, 2.0, 0.0]);
        assert_eq!(r.spacing().unwrap(), -2.0);
    }

    #[test]
    fn test_fixed_axis_contributes_one_coordinate() {
        let r = AxisRange::new(5.0, 5.0, 0.0);
        assert_eq!(r.count().unwrap(), 1);
        assert_eq!(r.values().unwrap(), vec![5.0]);
        assert_eq!(r.effective_step(), 1.0);
    }

    #[test]
    fn test_zero_step_rejected() {
        let r = AxisRange::new(0.0, 1.0, 0.0);
        assert!(matches!(r.count(), Err(DaqError::InvalidPlan(_))));
        let r = AxisRange::new(0.0, f64::NAN, 1.0);
        assert!(r.values().is_err());
    }

    #[test]
    fn test_count_is_bounded() {
        let r = AxisRange::new(0.0, 1.0e9, 1e-9);
        assert!(matches!(r.count(), Err(DaqError::InvalidPlan(_))));
        let r = AxisRange::new(0.0, 1000.0, 0.25);
        assert_eq!(r.count().unwrap(), 4001);
    }

    #[test]
    fn test_axis_orders_are_a_bijection() {
        let mut seen = std::collections::HashSet::new();
        for (i, order) in AxisOrder::ALL.into_iter().enumerate() {
            let axes = order.axes();
            assert!(seen.insert(axes), "{order} duplicates another order");
            assert_eq!(AxisOrder::from_axes(axes), Some(order));
            assert_eq!(AxisOrder::from_index(i), Some(order));
            assert_eq!(order.index(), i);
            assert_eq!(order.to_string().parse::<AxisOrder>().unwrap(), order);
        }
        assert_eq!(AxisOrder::from_index(2).unwrap().axes(), [SpatialAxis::Y, SpatialAxis::Z, SpatialAxis::X]);
        assert!(AxisOrder::from_index(6).is_none());
        assert!("xxy".parse::<AxisOrder>().is_err());
    }

    #[test]
    fn test_plan_serialization() {
        let plan = ScanPlan::raster(
            AxisRange::new(0.0, 2.0, 1.0),
            AxisRange::new(0.0, 1.0, 1.0),
            AxisRange::fixed(5.0),
        )
        .with_mode(ScanMode::OnTheFly { scan_speed: 2.0 });
        let json = serde_json::to_string(&plan).unwrap();
        assert!(json.contains("\"mode\":\"on_the_fly\""));
        let back: ScanPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
