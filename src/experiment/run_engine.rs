//! ScanEngine for executing scan plans on the rig.
//!
//! The engine owns nothing but a handle to the shared rig. `start` takes the
//! rig lock for the whole session, spawns the session task and returns a
//! [`ScanHandle`] carrying the event stream and the cancel switch.
//!
//! # Architecture
//!
//! ```text
//! ScanPlan → ScanPlanner → ScanPath → session task → Rig (moves, triggers)
//!                                          │       → FieldSampler
//!                                          │       → RecordSink
//!                                          └─────> ScanEvent stream
//! ```
//!
//! Every session ends with exactly one [`ScanEvent::Finished`], emitted after
//! the rig lock has been released.

use super::plan::{PathLayout, ScanPath, ScanPlan, ScanPoint, SpatialAxis};
use super::planner::ScanPlanner;
use super::state::{RunStatus, SessionState};
use crate::config::{ScanSettings, Settings};
use crate::data::storage::RecordSink;
use crate::error::{AppResult, DaqError, ErrorKind};
use crate::hardware::axis::MoveOptions;
use crate::hardware::capabilities::FieldSampler;
use crate::hardware::rig::{Rig, SharedRig};
use crate::measurement_types::MeasurementRecord;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Arrival tolerance for the start of an on-the-fly sweep.
const SWEEP_START_TOLERANCE: f64 = 0.005;

/// Event emitted by a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Session accepted
    Started {
        /// Session id
        run_id: Uuid,
        /// Mode name
        mode: &'static str,
    },
    /// One point measured
    Result {
        /// Index of the point in the path
        index: usize,
        /// Position, formatted
        position: String,
        /// Field, formatted
        field: String,
        /// The stored record
        record: MeasurementRecord,
    },
    /// Percent complete, 0-100
    Progress(u8),
    /// The error that is ending the session
    Error {
        /// Error tag
        kind: ErrorKind,
        /// Human-readable detail
        detail: String,
    },
    /// Terminal event, sent exactly once
    Finished {
        /// Final state
        state: SessionState,
    },
}

/// Percent complete after visiting point `index` of `total`.
pub fn progress_percent(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (100 * index / total).min(100) as u8
}

/// Shared cancel switch for a session.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation. The session stops at the next point boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Caller's side of a running session.
pub struct ScanHandle {
    run_id: Uuid,
    /// Session events, ending after [`ScanEvent::Finished`]
    pub events: mpsc::UnboundedReceiver<ScanEvent>,
    cancel: CancelToken,
    task: JoinHandle<SessionState>,
}

impl ScanHandle {
    /// Session id
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel switch usable from another task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Next event, `None` once the session has ended and the stream is drained.
    pub async fn next_event(&mut self) -> Option<ScanEvent> {
        self.events.recv().await
    }

    /// Wait for the session to end and return its final state.
    pub async fn wait(self) -> SessionState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                error!("Scan session task failed: {}", e);
                SessionState::Failed
            }
        }
    }

    /// Drain every event until the stream closes, then return them with the final state.
    pub async fn collect(mut self) -> (Vec<ScanEvent>, SessionState) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, self.wait().await)
    }
}

/// Boxed future borrowing the rig, for [`ScanEngine::with_rig`].
pub type RigFuture<'r, T> = Pin<Box<dyn Future<Output = AppResult<T>> + Send + 'r>>;

/// Scan session executor.
///
/// At most one session runs at a time. A session that ends on a hardware
/// fault latches a reset requirement: `start` refuses with
/// [`DaqError::ResetRequired`] until [`ScanEngine::reset_axes`] succeeds.
///
/// # Example
///
/// ```rust,ignore
/// let engine = ScanEngine::new(rig.into_shared(), Arc::new(probe), settings);
/// let mut handle = engine.start(plan, Box::new(MemoryRecordSink::new()))?;
/// while let Some(event) = handle.next_event().await {
///     println!("{event:?}");
/// }
/// ```
pub struct ScanEngine {
    rig: SharedRig,
    sampler: Arc<dyn FieldSampler>,
    settings: Arc<Settings>,
    status: Arc<watch::Sender<RunStatus>>,
    reset_required: Arc<AtomicBool>,
}

impl ScanEngine {
    /// Create an engine over a shared rig.
    pub fn new(rig: SharedRig, sampler: Arc<dyn FieldSampler>, settings: Settings) -> Self {
        let (status, _) = watch::channel(RunStatus::default());
        Self {
            rig,
            sampler,
            settings: Arc::new(settings),
            status: Arc::new(status),
            reset_required: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot of the current or last session.
    pub fn status(&self) -> RunStatus {
        self.status.borrow().clone()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.status.subscribe()
    }

    /// Whether a fault is latched.
    pub fn reset_required(&self) -> bool {
        self.reset_required.load(Ordering::SeqCst)
    }

    /// Settings the engine runs with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn lock_rig(&self) -> AppResult<OwnedMutexGuard<Rig>> {
        self.rig
            .clone()
            .try_lock_owned()
            .map_err(|_| DaqError::SessionBusy)
    }

    /// Run a manual operation under the exclusive rig lock.
    ///
    /// ```rust,ignore
    /// let positions = engine.with_rig(|rig| Box::pin(rig.positions())).await?;
    /// ```
    ///
    /// # Errors
    /// `SessionBusy` while a session or another manual operation holds the rig.
    pub async fn with_rig<T, F>(&self, op: F) -> AppResult<T>
    where
        F: for<'r> FnOnce(&'r mut Rig) -> RigFuture<'r, T>,
    {
        let mut rig = self.lock_rig()?;
        op(&mut *rig).await
    }

    /// Reset every axis and clear a latched fault.
    pub async fn reset_axes(&self) -> AppResult<()> {
        let mut rig = self.lock_rig()?;
        rig.reset_all().await?;
        self.reset_required.store(false, Ordering::SeqCst);
        info!("Axes reset, fault cleared");
        Ok(())
    }

    /// Start a session for `plan`, writing records to `sink`.
    ///
    /// # Errors
    /// - `ResetRequired` after a fault, until [`ScanEngine::reset_axes`]
    /// - `SessionBusy` while the rig is held elsewhere
    pub fn start(&self, plan: ScanPlan, sink: Box<dyn RecordSink>) -> AppResult<ScanHandle> {
        if self.reset_required() {
            return Err(DaqError::ResetRequired);
        }
        let rig = self.lock_rig()?;
        if !self.status.borrow().state.can_begin() {
            // previous session still publishing its end
            return Err(DaqError::SessionBusy);
        }

        let run_id = Uuid::new_v4();
        let (events_tx, events) = mpsc::unbounded_channel();
        let cancel = CancelToken::default();

        self.status.send_replace(RunStatus {
            state: SessionState::Validating,
            run_id: Some(run_id),
            last_state: None,
            measured: 0,
            planned: 0,
            last_error: None,
        });

        let guard = SessionGuard {
            events: events_tx.clone(),
            status: self.status.clone(),
            state: SessionState::Failed,
        };
        let session = Session {
            rig,
            sampler: self.sampler.clone(),
            scan: self.settings.scan.clone(),
            cancel: cancel.clone(),
            events: events_tx,
            status: self.status.clone(),
            reset_required: self.reset_required.clone(),
            run_id,
        };

        let task = tokio::spawn(
            async move {
                let mut guard = guard;
                let mut session = session;
                let state = session.run(plan, sink).await;
                guard.state = state;
                // release the rig before the guard reports Finished
                drop(session);
                state
            }
            .instrument(info_span!("scan_session", run_id = %run_id)),
        );

        Ok(ScanHandle {
            run_id,
            events,
            cancel,
            task,
        })
    }
}

/// Publishes the terminal state exactly once, even if the session task unwinds,
/// then returns the status to Idle.
struct SessionGuard {
    events: mpsc::UnboundedSender<ScanEvent>,
    status: Arc<watch::Sender<RunStatus>>,
    state: SessionState,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let state = self.state;
        self.status.send_modify(|s| {
            s.state = state;
            s.last_state = Some(state);
        });
        let _ = self.events.send(ScanEvent::Finished { state });
        self.status.send_modify(|s| s.state = SessionState::Idle);
    }
}

enum Outcome {
    Completed,
    Cancelled,
}

struct Session {
    rig: OwnedMutexGuard<Rig>,
    sampler: Arc<dyn FieldSampler>,
    scan: ScanSettings,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<ScanEvent>,
    status: Arc<watch::Sender<RunStatus>>,
    reset_required: Arc<AtomicBool>,
    run_id: Uuid,
}

impl Session {
    fn emit(&self, event: ScanEvent) {
        // a dropped receiver must not stop the scan
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState) {
        debug!(run_id = %self.run_id, %state, "Session state");
        self.status.send_modify(|s| s.state = state);
    }

    async fn run(&mut self, plan: ScanPlan, mut sink: Box<dyn RecordSink>) -> SessionState {
        info!(run_id = %self.run_id, mode = plan.mode.name(), order = %plan.order, "Scan session started");
        self.emit(ScanEvent::Started {
            run_id: self.run_id,
            mode: plan.mode.name(),
        });

        let path = match self.prepare(&plan).await {
            Ok(path) => path,
            Err(e) => return self.fail(e, false).await,
        };
        if let Err(e) = sink.begin(plan.has_theta()).await {
            return self.fail(e, false).await;
        }

        self.set_state(SessionState::Running);
        let outcome = match path.layout {
            PathLayout::Discrete => self.run_discrete(&path, sink.as_mut()).await,
            PathLayout::Sweeps {
                fast_axis,
                step,
                scan_speed,
                ..
            } => {
                self.run_sweeps(&path, fast_axis, step, scan_speed, sink.as_mut())
                    .await
            }
        };

        let state = match outcome {
            Ok(Outcome::Completed) => {
                self.emit(ScanEvent::Progress(100));
                info!(run_id = %self.run_id, points = path.len(), "Scan session completed");
                SessionState::Completed
            }
            Ok(Outcome::Cancelled) => {
                self.set_state(SessionState::Cancelling);
                if let Err(e) = self.rig.stop_all().await {
                    warn!(run_id = %self.run_id, error = %e, "Stop after cancel failed");
                }
                info!(run_id = %self.run_id, "Scan session cancelled");
                SessionState::Cancelled
            }
            Err(e) => self.fail(e, true).await,
        };

        if let Err(e) = sink.finish().await {
            warn!(run_id = %self.run_id, error = %e, "Failed to close record sink");
        }
        state
    }

    async fn fail(&mut self, err: DaqError, axes_may_move: bool) -> SessionState {
        error!(run_id = %self.run_id, kind = %err.kind(), error = %err, "Scan session failed");
        if axes_may_move {
            if let Err(e) = self.rig.stop_all().await {
                warn!(run_id = %self.run_id, error = %e, "Stop after failure failed");
            }
        }
        if err.requires_reset() {
            self.reset_required.store(true, Ordering::SeqCst);
        }
        let detail = err.to_string();
        self.status
            .send_modify(|s| s.last_error = Some(detail.clone()));
        self.emit(ScanEvent::Error {
            kind: err.kind(),
            detail,
        });
        SessionState::Failed
    }

    /// Plan the path and check its bounding box against every axis' soft limits.
    async fn prepare(&mut self, plan: &ScanPlan) -> AppResult<ScanPath> {
        let path = ScanPlanner::from_settings(&self.scan).plan(plan)?;
        let planned = path.len();
        self.status.send_modify(|s| s.planned = planned);
        if path.is_empty() {
            return Ok(path);
        }

        let mut extents = path.extents();
        if let PathLayout::Sweeps { fast_axis, .. } = path.layout {
            let span = &mut extents[fast_axis.index()];
            span.0 -= self.scan.overshoot;
            span.1 += self.scan.overshoot;
        }

        for axis in SpatialAxis::ALL {
            let (min, max) = extents[axis.index()];
            let mut handle = self.rig.axis(axis.name())?;
            if let Some(limits) = handle.query_limits().await? {
                if min < limits.lower() || max > limits.upper() {
                    return Err(DaqError::OutOfBounds {
                        axis: handle.name().to_string(),
                        min,
                        max,
                        lower: limits.lower(),
                        upper: limits.upper(),
                    });
                }
            }
        }
        debug!(run_id = %self.run_id, points = planned, "Pre-flight passed");
        Ok(path)
    }

    /// Move the axes of `point` in its move order, skipping unchanged coordinates.
    async fn approach(
        &mut self,
        point: &ScanPoint,
        skip: Option<SpatialAxis>,
        last: &mut [Option<f64>; 3],
    ) -> AppResult<()> {
        for axis in point.move_order {
            if Some(axis) == skip {
                continue;
            }
            let target = point.coords[axis.index()];
            if last[axis.index()] == Some(target) {
                continue;
            }
            self.rig
                .axis(axis.name())?
                .move_to(target, MoveOptions::default())
                .await?;
            last[axis.index()] = Some(target);
        }
        Ok(())
    }

    async fn measure(
        &mut self,
        index: usize,
        total: usize,
        position: [f64; 3],
        theta: Option<f64>,
        sink: &mut dyn RecordSink,
    ) -> AppResult<()> {
        let field = self
            .sampler
            .sample(self.scan.averages)
            .await
            .map_err(|e| DaqError::Sensor(format!("{e:#}")))?;
        let record = MeasurementRecord::now(position, theta, field);
        sink.append(&record).await?;
        self.status.send_modify(|s| s.measured += 1);

        self.emit(ScanEvent::Result {
            index,
            position: record.position_text(),
            field: record.field_text(),
            record,
        });
        self.emit(ScanEvent::Progress(progress_percent(index, total)));
        Ok(())
    }

    async fn run_discrete(&mut self, path: &ScanPath, sink: &mut dyn RecordSink) -> AppResult<Outcome> {
        let total = path.len();
        let mut last = [None; 3];
        for point in &path.points {
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            self.approach(point, None, &mut last).await?;
            sleep(self.scan.settle).await;
            let position = self.rig.xyz().await?;
            self.measure(point.index, total, position, point.theta, sink)
                .await?;
        }
        Ok(Outcome::Completed)
    }

    async fn run_sweeps(
        &mut self,
        path: &ScanPath,
        fast_axis: SpatialAxis,
        step: f64,
        scan_speed: f64,
        sink: &mut dyn RecordSink,
    ) -> AppResult<Outcome> {
        let name = fast_axis.name();
        let port = self.scan.trigger_port;
        let origin = path
            .points
            .first()
            .map_or(0.0, |p| p.coords[fast_axis.index()]);
        self.rig
            .axis(name)?
            .initialise_trigger(origin, step, self.scan.trigger_on_time_ms, port)
            .await?;

        let mut last = [None; 3];
        for sweep in path.sweeps() {
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
            let Some(first) = sweep.first() else {
                continue;
            };

            self.approach(first, Some(fast_axis), &mut last).await?;
            let start = first.coords[fast_axis.index()];
            self.rig
                .axis(name)?
                .move_to(
                    start,
                    MoveOptions {
                        tolerance: SWEEP_START_TOLERANCE,
                        ..MoveOptions::default()
                    },
                )
                .await?;
            sleep(self.scan.sweep_settle).await;
            let position = self.rig.xyz().await?;
            self.measure(first.index, path.len(), position, None, sink)
                .await?;

            let speed0 = self.rig.axis(name)?.speed().await?;
            self.rig.axis(name)?.set_speed(Some(scan_speed)).await?;
            let result = self.sweep(sweep, fast_axis, step, scan_speed, path.len(), sink).await;
            if let Err(e) = self.rig.axis(name)?.set_speed(Some(speed0)).await {
                warn!(axis = name, speed = speed0, error = %e, "Failed to restore axis speed");
            }
            if let Outcome::Cancelled = result? {
                return Ok(Outcome::Cancelled);
            }
        }
        Ok(Outcome::Completed)
    }

    /// One continuous sweep: sample at every trigger pulse after the first point.
    async fn sweep(
        &mut self,
        points: &[ScanPoint],
        fast_axis: SpatialAxis,
        step: f64,
        scan_speed: f64,
        total: usize,
        sink: &mut dyn RecordSink,
    ) -> AppResult<Outcome> {
        let (Some(first), Some(end)) = (points.first(), points.last()) else {
            return Ok(Outcome::Completed);
        };
        let name = fast_axis.name();
        let fi = fast_axis.index();
        let port = self.scan.trigger_port;
        let start = first.coords[fi];
        let stop = end.coords[fi];
        let direction = (stop - start).signum();
        let pulse_timeout = Duration::from_secs_f64(10.0 * step / scan_speed);

        debug!(axis = name, start, stop, scan_speed, "Sweep");
        self.rig
            .axis(name)?
            .move_to(stop + direction * self.scan.overshoot, MoveOptions::no_wait())
            .await?;
        sleep(self.scan.trigger_lead_in).await;

        for point in &points[1..] {
            let nominal = point.coords[fi];
            let mut axis = self.rig.axis(name)?;
            let position = axis.position(false).await?;
            if (nominal - position) * direction < 0.0 {
                return Err(DaqError::MissedTrigger {
                    axis: name.to_string(),
                    nominal,
                    position,
                });
            }
            axis.wait_for_pulse(Some(port), pulse_timeout).await?;
            self.measure(point.index, total, point.coords, None, sink)
                .await?;
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }
        Ok(Outcome::Completed)
    }
}
