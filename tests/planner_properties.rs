//! Path-shape properties of the scan planner across modes and axis orders.

use hallprobe_daq::error::DaqError;
use hallprobe_daq::experiment::plan::PathLayout;
use hallprobe_daq::experiment::{AxisOrder, AxisRange, ScanMode, ScanPath, ScanPlan, ScanPlanner};
use std::collections::BTreeSet;

fn grid(nx: usize, ny: usize, nz: usize) -> ScanPlan {
    let range = |n: usize| {
        if n == 1 {
            AxisRange::fixed(0.0)
        } else {
            AxisRange::new(0.0, (n - 1) as f64, 1.0)
        }
    };
    ScanPlan::raster(range(nx), range(ny), range(nz))
}

fn plan(plan: &ScanPlan) -> ScanPath {
    ScanPlanner::default().plan(plan).unwrap()
}

fn changed_axes(a: [f64; 3], b: [f64; 3]) -> usize {
    a.iter().zip(b).filter(|(p, q)| (*p - q).abs() > 1e-9).count()
}

fn point_set(path: &ScanPath) -> BTreeSet<[i64; 3]> {
    path.points
        .iter()
        .map(|p| p.coords.map(|c| (c * 1000.0).round() as i64))
        .collect()
}

#[test]
fn test_raster_point_count_matches_ranges() {
    let p = ScanPlan::raster(
        AxisRange::new(0.0, 10.0, 2.5),
        AxisRange::new(5.0, -5.0, 3.0),
        AxisRange::new(1.0, 1.7, 0.5),
    );
    // 1 + floor(10/2.5) = 5, 1 + floor(10/3) = 4, 1 + floor(0.7/0.5) = 2
    for order in AxisOrder::ALL {
        let path = plan(&p.clone().with_order(order));
        assert_eq!(path.len(), 5 * 4 * 2, "order {order}");
        assert_eq!(path.layout, PathLayout::Discrete);
    }
}

#[test]
fn test_raster_ends_are_exact() {
    let path = plan(&ScanPlan::raster(
        AxisRange::new(0.0, 1.0, 0.3),
        AxisRange::fixed(2.0),
        AxisRange::fixed(0.0),
    ));
    let xs: Vec<f64> = path.points.iter().map(|p| p.coords[0]).collect();
    assert_eq!(xs.len(), 4);
    assert_eq!(xs[0], 0.0);
    assert_eq!(xs[3], 1.0);
}

#[test]
fn test_raster_steps_change_one_axis_at_a_time() {
    for order in AxisOrder::ALL {
        let path = plan(&grid(4, 3, 3).with_order(order));
        for pair in path.points.windows(2) {
            assert_eq!(
                changed_axes(pair[0].coords, pair[1].coords),
                1,
                "order {order}: {:?} -> {:?}",
                pair[0].coords,
                pair[1].coords
            );
        }
    }
}

#[test]
fn test_raster_fast_axis_reverses_every_line() {
    let path = plan(&grid(4, 3, 1));
    for (line, chunk) in path.points.chunks(4).enumerate() {
        let xs: Vec<f64> = chunk.iter().map(|p| p.coords[0]).collect();
        let expected = if line % 2 == 0 {
            vec![0.0, 1.0, 2.0, 3.0]
        } else {
            vec![3.0, 2.0, 1.0, 0.0]
        };
        assert_eq!(xs, expected, "line {line}");
    }
}

#[test]
fn test_every_order_visits_the_same_points() {
    let reference = point_set(&plan(&grid(3, 4, 2)));
    assert_eq!(reference.len(), 24);
    for order in AxisOrder::ALL {
        assert_eq!(point_set(&plan(&grid(3, 4, 2).with_order(order))), reference);
    }
}

#[test]
fn test_indices_follow_path_order() {
    let path = plan(&grid(3, 3, 2).with_mode(ScanMode::Boundary));
    for (i, point) in path.points.iter().enumerate() {
        assert_eq!(point.index, i);
    }
}

#[test]
fn test_boundary_point_count() {
    for (nu, nv, nw) in [(3, 3, 3), (4, 3, 5), (5, 2, 4)] {
        let path = plan(&grid(nu, nv, nw).with_mode(ScanMode::Boundary));
        let perimeter = 2 * (nu - 1) + 2 * (nv - 1);
        assert_eq!(
            path.len(),
            2 * nu * nv + (nw - 2) * perimeter,
            "grid {nu}x{nv}x{nw}"
        );
    }
}

#[test]
fn test_boundary_interior_planes_stay_on_the_edge() {
    let path = plan(&grid(4, 4, 4).with_mode(ScanMode::Boundary));
    for point in path.points.iter().filter(|p| p.coords[2] == 1.0 || p.coords[2] == 2.0) {
        let [x, y, _] = point.coords;
        assert!(
            x == 0.0 || x == 3.0 || y == 0.0 || y == 3.0,
            "interior point {:?}",
            point.coords
        );
    }
}

#[test]
fn test_boundary_steps_change_one_axis_at_a_time() {
    let path = plan(&grid(4, 3, 4).with_mode(ScanMode::Boundary));
    for pair in path.points.windows(2) {
        assert_eq!(changed_axes(pair[0].coords, pair[1].coords), 1);
    }
}

#[test]
fn test_random_points_inside_interior_and_reproducible() {
    let p = ScanPlan::raster(
        AxisRange::new(0.0, 10.0, 1.0),
        AxisRange::new(-4.0, 4.0, 2.0),
        AxisRange::new(0.0, 6.0, 1.0),
    )
    .with_mode(ScanMode::RandomSample {
        points: 200,
        seed: Some(42),
    });

    let first = plan(&p);
    let second = plan(&p);
    assert_eq!(first.len(), 200);
    assert_eq!(first.points, second.points);

    for point in &first.points {
        let [x, y, z] = point.coords;
        assert!((1.0..=9.0).contains(&x), "x = {x}");
        assert!((-2.0..=2.0).contains(&y), "y = {y}");
        assert!((1.0..=5.0).contains(&z), "z = {z}");
        // rounded to the default 0.01 resolution
        assert!(((x * 100.0).round() - x * 100.0).abs() < 1e-6);
    }
    for pair in first.points.windows(2) {
        assert!(pair[0].coords[2] <= pair[1].coords[2]);
    }
}

#[test]
fn test_random_sorted_by_slow_axis_of_order() {
    let p = grid(8, 8, 8)
        .with_order(AxisOrder::Zyx)
        .with_mode(ScanMode::RandomSample {
            points: 50,
            seed: Some(7),
        });
    let path = plan(&p);
    for pair in path.points.windows(2) {
        assert!(pair[0].coords[0] <= pair[1].coords[0]);
    }
}

#[test]
fn test_random_without_points_is_invalid() {
    let p = grid(5, 5, 5).with_mode(ScanMode::RandomSample {
        points: 0,
        seed: None,
    });
    assert!(matches!(
        ScanPlanner::default().plan(&p),
        Err(DaqError::InvalidPlan(_))
    ));
}

#[test]
fn test_circular_points_on_ring() {
    let p = ScanPlan::raster(
        AxisRange::fixed(0.0),
        AxisRange::fixed(0.0),
        AxisRange::new(0.0, 2.0, 1.0),
    )
    .with_mode(ScanMode::Circular {
        center_x: 10.0,
        center_y: -5.0,
        radius: 7.5,
        steps: 36,
    });
    let path = plan(&p);
    assert_eq!(path.len(), 3 * 36);
    assert!(p.has_theta());
    for point in &path.points {
        let [x, y, _] = point.coords;
        let r = ((x - 10.0).powi(2) + (y + 5.0).powi(2)).sqrt();
        assert!((r - 7.5).abs() < 0.001, "radius {r} at {:?}", point.coords);
        assert!(point.theta.is_some());
    }
    let zs: Vec<f64> = path.points.iter().step_by(36).map(|p| p.coords[2]).collect();
    assert_eq!(zs, vec![0.0, 1.0, 2.0]);
}

#[test]
fn test_on_the_fly_sweeps_cover_fast_lines() {
    let p = grid(5, 3, 2).with_mode(ScanMode::OnTheFly { scan_speed: 2.0 });
    let path = plan(&p);
    assert_eq!(path.len(), 30);
    let sweeps: Vec<_> = path.sweeps().collect();
    assert_eq!(sweeps.len(), 6);
    for sweep in sweeps {
        assert_eq!(sweep.len(), 5);
        let ys: BTreeSet<i64> = sweep.iter().map(|p| p.coords[1] as i64).collect();
        assert_eq!(ys.len(), 1);
    }
}

#[test]
fn test_on_the_fly_rejects_single_point_lines() {
    let p = grid(1, 3, 1).with_mode(ScanMode::OnTheFly { scan_speed: 2.0 });
    assert!(matches!(
        ScanPlanner::default().plan(&p),
        Err(DaqError::InvalidPlan(_))
    ));
}

#[test]
fn test_oversized_raster_is_an_error_not_a_panic() {
    let fine = AxisRange::new(0.0, 2.0, 1e-6);
    let p = ScanPlan::raster(fine, fine, fine);
    assert!(matches!(
        ScanPlanner::default().plan(&p),
        Err(DaqError::InvalidPlan(_))
    ));
}
