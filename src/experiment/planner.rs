//! Turns a [`ScanPlan`] into the ordered points of a [`ScanPath`].
//!
//! Point generation is pure: no hardware is touched here, so every mode can
//! be checked against its geometry before a single axis moves.

use super::plan::{
    AxisOrder, PathLayout, ScanMode, ScanPath, ScanPlan, ScanPoint, SpatialAxis, MAX_PATH_POINTS,
};
use crate::config::ScanSettings;
use crate::error::{AppResult, DaqError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use tracing::debug;

/// Coordinates before indices are assigned.
struct Draft {
    coords: [f64; 3],
    theta: Option<f64>,
    move_order: [SpatialAxis; 3],
}

/// Scan path generator.
#[derive(Debug, Clone, Copy)]
pub struct ScanPlanner {
    random_resolution: f64,
}

impl Default for ScanPlanner {
    fn default() -> Self {
        Self {
            random_resolution: 0.01,
        }
    }
}

impl ScanPlanner {
    /// Planner rounding random points to `random_resolution`.
    pub fn new(random_resolution: f64) -> Self {
        Self { random_resolution }
    }

    /// Planner configured from the scan settings.
    pub fn from_settings(settings: &ScanSettings) -> Self {
        Self::new(settings.random_resolution)
    }

    /// Generate the path for `plan`.
    ///
    /// # Errors
    /// `InvalidPlan` for malformed ranges or mode parameters.
    pub fn plan(&self, plan: &ScanPlan) -> AppResult<ScanPath> {
        let (drafts, layout) = match &plan.mode {
            ScanMode::Raster => (raster(plan)?, PathLayout::Discrete),
            ScanMode::Boundary => (boundary(plan)?, PathLayout::Discrete),
            ScanMode::RandomSample { points, seed } => (
                self.random_sample(plan, *points, *seed)?,
                PathLayout::Discrete,
            ),
            ScanMode::Circular {
                center_x,
                center_y,
                radius,
                steps,
            } => (
                circular(plan, [*center_x, *center_y], *radius, *steps)?,
                PathLayout::Discrete,
            ),
            ScanMode::OnTheFly { scan_speed } => on_the_fly(plan, *scan_speed)?,
        };

        let points: Vec<ScanPoint> = drafts
            .into_iter()
            .enumerate()
            .map(|(index, d)| ScanPoint {
                index,
                coords: d.coords,
                theta: d.theta,
                move_order: d.move_order,
            })
            .collect();
        debug!(mode = plan.mode.name(), order = %plan.order, points = points.len(), "Path planned");
        Ok(ScanPath { points, layout })
    }

    fn random_sample(&self, plan: &ScanPlan, count: usize, seed: Option<u64>) -> AppResult<Vec<Draft>> {
        if count == 0 {
            return Err(DaqError::InvalidPlan(
                "random sample needs at least one point".into(),
            ));
        }
        checked_total(&[count])?;
        if !(self.random_resolution.is_finite() && self.random_resolution > 0.0) {
            return Err(DaqError::InvalidPlan(format!(
                "random resolution {} must be positive",
                self.random_resolution
            )));
        }

        // Interior bounds, one step in from each face
        let mut bounds = [(0.0, 0.0); 3];
        for axis in SpatialAxis::ALL {
            let range = plan.range(axis);
            range.count()?;
            bounds[axis.index()] = if range.is_fixed() {
                (range.start, range.start)
            } else {
                let step = range.step.abs();
                let lo = range.start.min(range.end) + step;
                let hi = range.start.max(range.end) - step;
                if lo > hi {
                    return Err(DaqError::InvalidPlan(format!(
                        "{axis} range {} -> {} has no interior at step {step}",
                        range.start, range.end
                    )));
                }
                (lo, hi)
            };
        }

        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let resolution = self.random_resolution;
        let order = discrete_move_order(plan.order);
        let mut drafts: Vec<Draft> = (0..count)
            .map(|_| {
                let mut coords = [0.0; 3];
                for (slot, (lo, hi)) in coords.iter_mut().zip(bounds) {
                    *slot = if lo == hi {
                        lo
                    } else {
                        let v: f64 = rng.gen_range(lo..=hi);
                        ((v / resolution).round() * resolution).clamp(lo, hi)
                    };
                }
                Draft {
                    coords,
                    theta: None,
                    move_order: order,
                }
            })
            .collect();

        let slow = plan.order.slow().index();
        drafts.sort_by(|a, b| a.coords[slow].total_cmp(&b.coords[slow]));
        Ok(drafts)
    }
}

/// Slow axis first, fast axis last.
fn discrete_move_order(order: AxisOrder) -> [SpatialAxis; 3] {
    let [fast, mid, slow] = order.axes();
    [slow, mid, fast]
}

fn place(order: AxisOrder, fast: f64, mid: f64, slow: f64) -> [f64; 3] {
    let [fa, ma, sa] = order.axes();
    let mut coords = [0.0; 3];
    coords[fa.index()] = fast;
    coords[ma.index()] = mid;
    coords[sa.index()] = slow;
    coords
}

/// Product of `counts`, rejected past [`MAX_PATH_POINTS`].
fn checked_total(counts: &[usize]) -> AppResult<usize> {
    counts
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .filter(|&total| total <= MAX_PATH_POINTS)
        .ok_or_else(|| {
            DaqError::InvalidPlan(format!(
                "path with {counts:?} points per dimension exceeds {MAX_PATH_POINTS} points"
            ))
        })
}

fn axis_values(plan: &ScanPlan) -> AppResult<[Vec<f64>; 3]> {
    let [fast, mid, slow] = plan.order.axes();
    checked_total(&[
        plan.range(fast).count()?,
        plan.range(mid).count()?,
        plan.range(slow).count()?,
    ])?;
    Ok([
        plan.range(fast).values()?,
        plan.range(mid).values()?,
        plan.range(slow).values()?,
    ])
}

/// Serpentine raster: the fast list reverses after every sweep and the middle
/// list after every plane.
fn raster(plan: &ScanPlan) -> AppResult<Vec<Draft>> {
    let [mut fast, mut mid, slow] = axis_values(plan)?;
    let move_order = discrete_move_order(plan.order);
    let total = checked_total(&[fast.len(), mid.len(), slow.len()])?;
    let mut drafts = Vec::with_capacity(total);

    for &w in &slow {
        for &v in &mid {
            for &u in &fast {
                drafts.push(Draft {
                    coords: place(plan.order, u, v, w),
                    theta: None,
                    move_order,
                });
            }
            fast.reverse();
        }
        mid.reverse();
    }
    Ok(drafts)
}

/// First and last slow-axis planes rastered, interior planes walked around
/// their perimeter.
fn boundary(plan: &ScanPlan) -> AppResult<Vec<Draft>> {
    let [mut us, mut vs, ws] = axis_values(plan)?;
    if ws.len() < 2 {
        return raster(plan);
    }

    let move_order = discrete_move_order(plan.order);
    let mut drafts = Vec::new();
    let mut push = |u: f64, v: f64, w: f64| {
        drafts.push(Draft {
            coords: place(plan.order, u, v, w),
            theta: None,
            move_order,
        });
    };

    let raster_plane = |us: &mut Vec<f64>, vs: &mut Vec<f64>, w: f64, push: &mut dyn FnMut(f64, f64, f64)| {
        for &v in vs.iter() {
            for &u in us.iter() {
                push(u, v, w);
            }
            us.reverse();
        }
        vs.reverse();
    };

    let last = ws.len() - 1;
    for (k, &w) in ws.iter().enumerate() {
        let (nu, nv) = (us.len(), vs.len());
        if k == 0 || k == last || nu < 2 || nv < 2 {
            raster_plane(&mut us, &mut vs, w, &mut push);
            continue;
        }
        // Closed loop from the corner (us[0], vs[0]) back to itself
        for &u in &us[..nu - 1] {
            push(u, vs[0], w);
        }
        for &v in &vs[..nv - 1] {
            push(us[nu - 1], v, w);
        }
        for &u in us[1..].iter().rev() {
            push(u, vs[nv - 1], w);
        }
        for &v in vs[1..].iter().rev() {
            push(us[0], v, w);
        }
    }
    Ok(drafts)
}

/// Rings in x/y for every z; x and y are rounded to 3 decimals.
fn circular(plan: &ScanPlan, center: [f64; 2], radius: f64, steps: usize) -> AppResult<Vec<Draft>> {
    if steps == 0 {
        return Err(DaqError::InvalidPlan(
            "circular scan needs at least one angular step".into(),
        ));
    }
    if !(radius.is_finite() && radius >= 0.0) || !center.iter().all(|c| c.is_finite()) {
        return Err(DaqError::InvalidPlan(format!(
            "invalid circle center ({}, {}) radius {radius}",
            center[0], center[1]
        )));
    }

    let total = checked_total(&[plan.z.count()?, steps])?;
    let zs = plan.z.values()?;
    let round3 = |v: f64| (v * 1000.0).round() / 1000.0;
    let mut drafts = Vec::with_capacity(total);
    for &z in &zs {
        for j in 0..steps {
            let theta = 2.0 * PI * j as f64 / steps as f64;
            let x = round3(center[0] + radius * theta.cos());
            let y = round3(center[1] + radius * theta.sin());
            let x_first = (theta > 0.0 && theta < PI / 2.0) || (theta > PI && theta < 3.0 * PI / 2.0);
            let move_order = if x_first {
                [SpatialAxis::Z, SpatialAxis::X, SpatialAxis::Y]
            } else {
                [SpatialAxis::Z, SpatialAxis::Y, SpatialAxis::X]
            };
            drafts.push(Draft {
                coords: [x, y, z],
                theta: Some(theta),
                move_order,
            });
        }
    }
    Ok(drafts)
}

/// Raster whose fast lines become continuous sweeps.
fn on_the_fly(plan: &ScanPlan, scan_speed: f64) -> AppResult<(Vec<Draft>, PathLayout)> {
    if !(scan_speed.is_finite() && scan_speed > 0.0) {
        return Err(DaqError::InvalidPlan(format!(
            "scan speed {scan_speed} must be positive"
        )));
    }
    let fast_axis = plan.order.fast();
    let fast = plan.range(fast_axis);
    let sweep_len = fast.count()?;
    if sweep_len < 2 {
        return Err(DaqError::InvalidPlan(format!(
            "on-the-fly sweep along {fast_axis} needs at least two points"
        )));
    }
    let step = fast.spacing()?.abs();
    let layout = PathLayout::Sweeps {
        fast_axis,
        sweep_len,
        step,
        scan_speed,
    };
    Ok((raster(plan)?, layout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::AxisRange;

    fn plan(x: (f64, f64, f64), y: (f64, f64, f64), z: (f64, f64, f64)) -> ScanPlan {
        ScanPlan::raster(
            AxisRange::new(x.0, x.1, x.2),
            AxisRange::new(y.0, y.1, y.2),
            AxisRange::new(z.0, z.1, z.2),
        )
    }

    fn coords(path: &ScanPath) -> Vec<[f64; 3]> {
        path.points.iter().map(|p| p.coords).collect()
    }

    #[test]
    fn test_raster_serpentine() {
        let p = plan((0.0, 2.0, 1.0), (0.0, 1.0, 1.0), (5.0, 5.0, 1.0));
        let path = ScanPlanner::default().plan(&p).unwrap();
        assert_eq!(
            coords(&path),
            vec![
                [0.0, 0.0, 5.0],
                [1.0, 0.0, 5.0],
                [2.0, 0.0, 5.0],
                [2.0, 1.0, 5.0],
                [1.0, 1.0, 5.0],
                [0.0, 1.0, 5.0],
            ]
        );
        assert_eq!(path.layout, PathLayout::Discrete);
        assert_eq!(path.points[0].move_order, [SpatialAxis::Z, SpatialAxis::Y, SpatialAxis::X]);
        assert!(path.points.iter().enumerate().all(|(i, p)| p.index == i));
    }

    #[test]
    fn test_raster_respects_order() {
        let p = plan((0.0, 1.0, 1.0), (0.0, 1.0, 1.0), (0.0, 0.0, 1.0)).with_order(AxisOrder::Yxz);
        let path = ScanPlanner::default().plan(&p).unwrap();
        assert_eq!(
            coords(&path),
            vec![
                [0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
                [1.0, 0.0, 0.0],
            ]
        );
    }

    #[test]
    fn test_middle_axis_reverses_between_planes() {
        let p = plan((0.0, 1.0, 1.0), (0.0, 1.0, 1.0), (0.0, 1.0, 1.0));
        let pts = coords(&ScanPlanner::default().plan(&p).unwrap());
        assert_eq!(pts.len(), 8);
        // second plane starts where the first ended
        assert_eq!(pts[3], [0.0, 1.0, 0.0]);
        assert_eq!(pts[4], [0.0, 1.0, 1.0]);
        assert_eq!(pts[7], [0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_boundary_counts_and_perimeter() {
        let p = plan((0.0, 2.0, 1.0), (0.0, 2.0, 1.0), (0.0, 2.0, 1.0)).with_mode(ScanMode::Boundary);
        let pts = coords(&ScanPlanner::default().plan(&p).unwrap());
        // 9 + 8 + 9
        assert_eq!(pts.len(), 26);

        let interior: Vec<_> = pts.iter().filter(|c| c[2] == 1.0).collect();
        assert_eq!(interior.len(), 8);
        assert!(!interior.contains(&&[1.0, 1.0, 1.0]));
        // first plane ended at (2, 2), the perimeter starts there
        assert_eq!(pts[8], [2.0, 2.0, 0.0]);
        assert_eq!(pts[9], [2.0, 2.0, 1.0]);
        assert_eq!(pts[17], [2.0, 2.0, 2.0]);
        assert_eq!(pts[25], [0.0, 0.0, 2.0]);
    }

    #[test]
    fn test_boundary_single_plane_is_raster() {
        let p = plan((0.0, 2.0, 1.0), (0.0, 1.0, 1.0), (0.0, 0.0, 1.0));
        let raster = coords(&ScanPlanner::default().plan(&p).unwrap());
        let boundary = coords(
            &ScanPlanner::default()
                .plan(&p.clone().with_mode(ScanMode::Boundary))
                .unwrap(),
        );
        assert_eq!(raster, boundary);
    }

    #[test]
    fn test_random_sample_bounds_and_order() {
        let p = plan((0.0, 10.0, 1.0), (-5.0, 5.0, 1.0), (0.0, 4.0, 0.5)).with_mode(
            ScanMode::RandomSample {
                points: 200,
                seed: Some(7),
            },
        );
        let planner = ScanPlanner::new(0.01);
        let path = planner.plan(&p).unwrap();
        assert_eq!(path.len(), 200);
        for c in coords(&path) {
            assert!((1.0..=9.0).contains(&c[0]));
            assert!((-4.0..=4.0).contains(&c[1]));
            assert!((0.5..=3.5).contains(&c[2]));
            assert!(((c[0] * 100.0).round() - c[0] * 100.0).abs() < 1e-6);
        }
        assert!(path.points.windows(2).all(|w| w[0].coords[2] <= w[1].coords[2]));
        // same seed, same points
        assert_eq!(coords(&planner.plan(&p).unwrap()), coords(&path));
    }

    #[test]
    fn test_random_sample_fixed_axis_and_empty_interior() {
        let p = plan((0.0, 10.0, 1.0), (3.0, 3.0, 1.0), (0.0, 4.0, 1.0)).with_mode(
            ScanMode::RandomSample {
                points: 10,
                seed: Some(1),
            },
        );
        let path = ScanPlanner::default().plan(&p).unwrap();
        assert!(path.points.iter().all(|pt| pt.coords[1] == 3.0));

        let narrow = plan((0.0, 1.0, 1.0), (0.0, 1.0, 1.0), (0.0, 0.0, 1.0)).with_mode(
            ScanMode::RandomSample {
                points: 1,
                seed: None,
            },
        );
        assert!(matches!(
            ScanPlanner::default().plan(&narrow),
            Err(DaqError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_circular_ring() {
        let p = plan((0.0, 0.0, 1.0), (0.0, 0.0, 1.0), (0.0, 1.0, 1.0)).with_mode(ScanMode::Circular {
            center_x: 1.0,
            center_y: 2.0,
            radius: 3.0,
            steps: 4,
        });
        let path = ScanPlanner::default().plan(&p).unwrap();
        assert_eq!(path.len(), 8);
        assert_eq!(path.points[0].coords, [4.0, 2.0, 0.0]);
        assert_eq!(path.points[1].coords, [1.0, 5.0, 0.0]);
        assert_eq!(path.points[2].coords, [-2.0, 2.0, 0.0]);
        assert_eq!(path.points[3].coords, [1.0, -1.0, 0.0]);
        assert_eq!(path.points[4].coords[2], 1.0);
        assert_eq!(path.points[1].theta, Some(PI / 2.0));
        // theta on an axis moves y first
        assert_eq!(path.points[0].move_order, [SpatialAxis::Z, SpatialAxis::Y, SpatialAxis::X]);
    }

    #[test]
    fn test_circular_quadrant_move_order() {
        let p = plan((0.0, 0.0, 1.0), (0.0, 0.0, 1.0), (0.0, 0.0, 1.0)).with_mode(ScanMode::Circular {
            center_x: 0.0,
            center_y: 0.0,
            radius: 1.0,
            steps: 8,
        });
        let path = ScanPlanner::default().plan(&p).unwrap();
        let x_first: Vec<bool> = path
            .points
            .iter()
            .map(|pt| pt.move_order[1] == SpatialAxis::X)
            .collect();
        assert_eq!(x_first, vec![false, true, false, false, false, true, false, false]);
        assert!(ScanPlanner::default()
            .plan(&p.with_mode(ScanMode::Circular {
                center_x: 0.0,
                center_y: 0.0,
                radius: 1.0,
                steps: 0,
            }))
            .is_err());
    }

    #[test]
    fn test_oversized_path_is_rejected() {
        let fine = AxisRange::new(0.0, 2.0, 1e-6);
        let p = ScanPlan::raster(fine, fine, fine);
        for mode in [ScanMode::Raster, ScanMode::Boundary, ScanMode::OnTheFly { scan_speed: 1.0 }] {
            assert!(matches!(
                ScanPlanner::default().plan(&p.clone().with_mode(mode)),
                Err(DaqError::InvalidPlan(_))
            ));
        }

        let ring = plan((0.0, 0.0, 1.0), (0.0, 0.0, 1.0), (0.0, 1000.0, 1.0)).with_mode(ScanMode::Circular {
            center_x: 0.0,
            center_y: 0.0,
            radius: 1.0,
            steps: usize::MAX / 2,
        });
        assert!(ScanPlanner::default().plan(&ring).is_err());

        let many = plan((0.0, 10.0, 1.0), (0.0, 10.0, 1.0), (0.0, 10.0, 1.0)).with_mode(ScanMode::RandomSample {
            points: MAX_PATH_POINTS + 1,
            seed: Some(1),
        });
        assert!(ScanPlanner::default().plan(&many).is_err());
    }

    #[test]
    fn test_on_the_fly_layout() {
        let p = plan((0.0, 4.0, 1.0), (0.0, 1.0, 1.0), (0.0, 0.0, 1.0))
            .with_mode(ScanMode::OnTheFly { scan_speed: 2.0 });
        let path = ScanPlanner::default().plan(&p).unwrap();
        assert_eq!(path.len(), 10);
        assert_eq!(
            path.layout,
            PathLayout::Sweeps {
                fast_axis: SpatialAxis::X,
                sweep_len: 5,
                step: 1.0,
                scan_speed: 2.0
            }
        );
        let sweeps: Vec<_> = path.sweeps().collect();
        assert_eq!(sweeps.len(), 2);
        assert_eq!(sweeps[1][0].coords[0], 4.0);

        let single = plan((1.0, 1.0, 1.0), (0.0, 1.0, 1.0), (0.0, 0.0, 1.0))
            .with_mode(ScanMode::OnTheFly { scan_speed: 2.0 });
        assert!(ScanPlanner::default().plan(&single).is_err());
        let stopped = p.with_mode(ScanMode::OnTheFly { scan_speed: 0.0 });
        assert!(ScanPlanner::default().plan(&stopped).is_err());
    }
}
