//! Axis operations against the simulated PM-series controller.
//!
//! All tests run on a paused tokio clock, so simulated travel time and the
//! link's grace periods cost nothing.

use hallprobe_daq::config::Settings;
use hallprobe_daq::error::DaqError;
use hallprobe_daq::hardware::mock::{SimHandle, SimulatedController};
use hallprobe_daq::hardware::{ControllerVariant, MoveOptions, Rig};
use std::time::Duration;

fn rig_with(settings: Settings) -> (Rig, SimHandle) {
    let (sim, handle) = SimulatedController::new(&settings);
    (Rig::from_channel(Box::new(sim), &settings), handle)
}

fn rig() -> (Rig, SimHandle) {
    rig_with(Settings::default())
}

#[tokio::test(start_paused = true)]
async fn test_initial_limits_and_speed() {
    let (mut rig, _handle) = rig();
    let mut x = rig.axis("x").unwrap();

    let limits = x.limits().await.unwrap().unwrap();
    assert_eq!(limits.lower(), -1000.0);
    assert_eq!(limits.upper(), 1000.0);
    assert_eq!(x.speed().await.unwrap(), 6.0);
}

#[tokio::test(start_paused = true)]
async fn test_lookup_by_alias() {
    let (mut rig, _handle) = rig();
    assert_eq!(rig.axis("HP Y").unwrap().id(), 4);
    assert!(matches!(rig.axis("theta"), Err(DaqError::UnknownAxis(_))));
    assert_eq!(rig.axis_names(), vec!["x", "y", "z"]);
}

#[tokio::test(start_paused = true)]
async fn test_move_and_read_back() {
    let (mut rig, handle) = rig();
    let mut z = rig.axis("z").unwrap();
    z.move_to(12.5, MoveOptions::default()).await.unwrap();
    assert!((z.position(false).await.unwrap() - 12.5).abs() < 1e-9);

    z.move_to(-2.5, MoveOptions::relative()).await.unwrap();
    assert!((z.position(true).await.unwrap() - 10.0).abs() < 1e-9);
    assert_eq!(handle.count("ma"), 1);
    assert_eq!(handle.count("mr"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_move_outside_soft_limits_sends_nothing() {
    let (mut rig, handle) = rig();
    let mut x = rig.axis("x").unwrap();
    x.set_limits(Some((5.0, -5.0))).await.unwrap();

    let err = x.move_to(10.0, MoveOptions::default()).await.unwrap_err();
    match err {
        DaqError::OutOfBounds {
            axis, lower, upper, ..
        } => {
            assert_eq!(axis, "x");
            assert_eq!(lower, -5.0);
            assert_eq!(upper, 5.0);
        }
        other => panic!("expected OutOfBounds, got {other:?}"),
    }
    assert_eq!(handle.count("ma"), 0);

    // relative moves are checked against the absolute destination
    x.move_to(3.0, MoveOptions::default()).await.unwrap();
    assert!(x.move_to(3.0, MoveOptions::relative()).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disable_limits_widens_them_on_pm1000() {
    let (mut rig, handle) = rig();
    let mut x = rig.axis("x").unwrap();

    x.set_limits(None).await.unwrap();
    assert_eq!(handle.count("il"), 0);
    let limits = x.query_limits().await.unwrap().unwrap();
    assert!(limits.upper() > 3000.0);
    assert!(limits.lower() < -3000.0);

    x.move_to(1500.0, MoveOptions::no_wait()).await.unwrap();
    assert!(handle.is_moving(3));
}

#[tokio::test(start_paused = true)]
async fn test_disable_limits_inhibits_them_on_pm341() {
    let mut settings = Settings::default();
    settings.controller.variant = ControllerVariant::Pm341;
    let (mut rig, handle) = rig_with(settings);
    let mut y = rig.axis("y").unwrap();

    y.set_limits(None).await.unwrap();
    assert_eq!(handle.count("il"), 1);
    assert!(y.query_limits().await.unwrap().is_none());
    assert!(y.limits().await.unwrap().is_none());

    y.move_to(1500.0, MoveOptions::no_wait()).await.unwrap();
    assert!(handle.is_moving(4));

    y.set_limits(Some((-10.0, 10.0))).await.unwrap();
    assert_eq!(handle.count("al"), 1);
    let limits = y.query_limits().await.unwrap().unwrap();
    assert_eq!(limits.upper(), 10.0);
}

#[tokio::test(start_paused = true)]
async fn test_hard_limit_then_reset() {
    let (mut rig, handle) = rig();
    // switch 2 mm along x
    handle.set_hard_stop(3, Some(2.0 * 3200.0));

    let err = rig
        .axis("x")
        .unwrap()
        .move_to(5.0, MoveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::HardLimitHit { ref axis } if axis == "x"));
    assert!(err.requires_reset());

    assert!(rig.axis("x").unwrap().hard_limit().await.unwrap());
    rig.reset_all().await.unwrap();
    assert_eq!(handle.count("rs"), 3);

    let mut x = rig.axis("x").unwrap();
    assert!(!x.hard_limit().await.unwrap());
    x.move_to(1.0, MoveOptions::default()).await.unwrap();
    assert!((x.position(false).await.unwrap() - 1.0).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_axis_times_out() {
    let (mut rig, handle) = rig();
    handle.set_stalled(4, true);

    let err = rig
        .axis("y")
        .unwrap()
        .move_to(
            1.0,
            MoveOptions {
                timeout: Some(Duration::from_secs(2)),
                ..MoveOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::MotionTimeout { ref axis, .. } if axis == "y"));
}

#[tokio::test(start_paused = true)]
async fn test_position_retries_unparseable_reply() {
    let (mut rig, handle) = rig();
    let mut x = rig.axis("x").unwrap();

    handle.corrupt_next_replies(1);
    assert_eq!(x.position(false).await.unwrap(), 0.0);
    assert_eq!(handle.count("oa"), 2);

    handle.corrupt_next_replies(5);
    let err = x.position(false).await.unwrap_err();
    assert!(matches!(err, DaqError::Protocol { ref axis, .. } if axis == "x"));
}

#[tokio::test(start_paused = true)]
async fn test_unplugged_controller_reports_not_connected() {
    let (mut rig, handle) = rig();
    handle.disconnect();

    let err = rig.axis("x").unwrap().position(false).await.unwrap_err();
    assert!(matches!(err, DaqError::SerialPortNotConnected));
    assert!(rig.stop_all().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_define_position() {
    let (mut rig, handle) = rig();
    let mut z = rig.axis("z").unwrap();
    z.define_position(25.0).await.unwrap();

    assert_eq!(z.position(true).await.unwrap(), 25.0);
    assert_eq!(z.position(false).await.unwrap(), 25.0);
    assert_eq!(handle.position_steps(5), Some(25_000.0));
}

#[tokio::test(start_paused = true)]
async fn test_set_speed_bounds() {
    let (mut rig, _handle) = rig();
    let mut x = rig.axis("x").unwrap();

    assert!(matches!(
        x.set_speed(Some(7.0)).await,
        Err(DaqError::OutOfRange(_))
    ));
    assert!(matches!(
        x.set_speed(Some(0.0)).await,
        Err(DaqError::OutOfRange(_))
    ));

    x.set_speed(Some(2.5)).await.unwrap();
    assert_eq!(x.speed().await.unwrap(), 2.5);
    x.set_speed(None).await.unwrap();
    assert_eq!(x.speed().await.unwrap(), 6.0);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_configuration_round_trip() {
    let (mut rig, handle) = rig();
    let mut x = rig.axis("x").unwrap();

    x.initialise_trigger(0.5, 0.25, 20, 2).await.unwrap();
    let config = x.trigger_config().await.unwrap();
    assert_eq!(config.offset, 0.5);
    assert_eq!(config.modulus, 0.25);
    assert_eq!(config.on_time_ms, 20);
    assert_eq!(config.port, 2);

    handle.clear_log();
    assert!(matches!(
        x.initialise_trigger(0.0, 1.0, 20, 9).await,
        Err(DaqError::OutOfRange(_))
    ));
    assert!(handle.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_pulse() {
    let (mut rig, _handle) = rig();
    let mut x = rig.axis("x").unwrap();
    x.initialise_trigger(0.0, 1.0, 20, 1).await.unwrap();

    // stationary axis: no pulse
    let err = x
        .wait_for_pulse(Some(1), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::PulseTimeout { port: 1, .. }));

    x.move_to(3.0, MoveOptions::no_wait()).await.unwrap();
    x.wait_for_pulse(Some(1), Duration::from_secs(2)).await.unwrap();
    let position = x.position(false).await.unwrap();
    assert!((1.0..1.1).contains(&position), "position {position}");

    // the configured port is used when none is given
    tokio::time::sleep(Duration::from_secs(1)).await;
    x.wait_for_pulse(None, Duration::from_secs(2)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_halts_motion() {
    let (mut rig, handle) = rig();
    rig.axis("z")
        .unwrap()
        .move_to(500.0, MoveOptions::no_wait())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(handle.is_moving(5));

    rig.stop_all().await.unwrap();
    assert!(!handle.is_moving(5));
    assert_eq!(handle.count("st"), 3);

    let positions = rig.positions().await.unwrap();
    assert_eq!(positions.len(), 3);
    assert!(positions[2].1 > 0.0 && positions[2].1 < 500.0);
}
