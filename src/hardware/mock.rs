//! Mock Hardware Implementations
//!
//! Provides simulated hardware for testing and `--simulate` runs without the
//! physical rig. All mocks use async-safe operations (tokio::time, not
//! std::thread::sleep), so tests can run on a paused clock.
//!
//! # Available Mocks
//!
//! - `SimulatedController` - PM-series motor controller behind a [`SerialChannel`]
//! - `ScriptedChannel` - canned replies for framing tests
//! - `MockFieldSampler` - constant field with call accounting
//! - `BlankFieldSampler` - all-zero field, for runs without a probe
//!
//! # Simulated controller behaviour
//!
//! - Axes move at their programmed slew speed (no acceleration ramp)
//! - Soft limits reject moves with `! SOFT LIMIT`
//! - The pulse generator reports a pulse on `OW` when a trigger position
//!   `offset + k * modulus` was crossed since the previous `OW` or move start

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::FieldSampler;
use crate::hardware::protocol::ControllerVariant;
use crate::hardware::transport::{find_subsequence, SerialChannel};
use crate::measurement_types::FieldSample;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

// =============================================================================
// SimulatedController - PM-series controller emulation
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    start: Instant,
    speed: f64,
}

#[derive(Debug)]
struct SimAxis {
    id: u8,
    /// Position in steps when idle, or at the start of `motion`
    position: f64,
    motion: Option<Motion>,
    /// Slew speed, steps/s
    speed: f64,
    lower: i64,
    upper: i64,
    limits_enabled: bool,
    hard_stop: Option<f64>,
    at_hard_limit: bool,
    stalled: bool,
    pulse_offset: i64,
    pulse_modulus: i64,
    pulse_on_time: i64,
    pulse_port: i64,
    last_port_check: f64,
}

impl SimAxis {
    /// Advance motion to `now`, stopping at a hard stop if one lies in the way.
    fn settle(&mut self, now: Instant) -> f64 {
        if let Some(m) = self.motion {
            if self.stalled {
                return self.position;
            }
            let distance = m.to - m.from;
            let travelled = (m.speed * now.duration_since(m.start).as_secs_f64()).min(distance.abs());
            let position = m.from + travelled.copysign(distance);

            if let Some(stop) = self.hard_stop {
                let crossed = (stop - m.from) * distance.signum() > 0.0
                    && (position - stop) * distance.signum() >= 0.0;
                if crossed {
                    self.position = stop;
                    self.motion = None;
                    self.at_hard_limit = true;
                    return stop;
                }
            }

            if travelled >= distance.abs() {
                self.position = m.to;
                self.motion = None;
                return m.to;
            }
            return position;
        }
        self.position
    }

    /// Trigger position crossed in `(last_port_check, now]` along the direction of travel.
    fn pulse_latched(&mut self, now_position: f64) -> bool {
        let last = self.last_port_check;
        self.last_port_check = now_position;
        if self.pulse_modulus <= 0 {
            return false;
        }
        let offset = self.pulse_offset as f64;
        let modulus = self.pulse_modulus as f64;
        let (a, b) = ((last - offset) / modulus, (now_position - offset) / modulus);
        if now_position > last {
            b.floor() > a.floor()
        } else if now_position < last {
            b.ceil() < a.ceil()
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct SimState {
    variant: ControllerVariant,
    axes: Vec<SimAxis>,
    log: Vec<String>,
    corrupt_replies: u32,
    disconnected: bool,
}

impl SimState {
    fn axis_mut(&mut self, id: u8) -> Option<&mut SimAxis> {
        self.axes.iter_mut().find(|a| a.id == id)
    }

    fn handle(&mut self, line: &str, now: Instant) -> Vec<String> {
        self.log.push(line.to_string());
        let mut out = Vec::new();
        if self.variant.echoes() {
            out.push(line.to_string());
        }

        let Some((id, command, parameter)) = split_command(line) else {
            return out;
        };
        let prefix = self.variant.reply_prefix(id);
        let variant = self.variant;
        let Some(axis) = self.axis_mut(id) else {
            return out;
        };
        let ok = format!("{prefix}OK");
        let position = axis.settle(now);

        let replies: Vec<String> = match command.as_str() {
            "OC" | "OA" => match variant {
                ControllerVariant::Pm304 => {
                    let tag = if command == "OC" { "CP=" } else { "AP=" };
                    vec![format!("{tag}{}", position.round() as i64)]
                }
                _ => vec![format!("{prefix}{}", position.round() as i64)],
            },
            "MA" | "MR" => {
                let steps = parameter.unwrap_or(0) as f64;
                let target = if command == "MR" { position + steps } else { steps };
                if axis.at_hard_limit {
                    vec![format!("{prefix}! HARD LIMIT")]
                } else if axis.limits_enabled
                    && (target < axis.lower as f64 || target > axis.upper as f64)
                {
                    vec![format!("{prefix}! SOFT LIMIT")]
                } else {
                    axis.position = position;
                    axis.last_port_check = position;
                    axis.motion = Some(Motion {
                        from: position,
                        to: target,
                        start: now,
                        speed: axis.speed,
                    });
                    vec![ok]
                }
            }
            "ST" => {
                axis.position = position;
                axis.motion = None;
                vec![ok]
            }
            "RS" => {
                axis.position = position;
                axis.motion = None;
                axis.at_hard_limit = false;
                vec![ok]
            }
            "CP" | "AP" => {
                axis.position = parameter.unwrap_or(0) as f64;
                axis.motion = None;
                vec![ok]
            }
            "LL" => {
                axis.lower = parameter.unwrap_or(0);
                vec![ok]
            }
            "UL" => {
                axis.upper = parameter.unwrap_or(0);
                vec![ok]
            }
            "AL" => {
                axis.limits_enabled = true;
                vec![ok]
            }
            "IL" => {
                axis.limits_enabled = false;
                vec![ok]
            }
            "SV" => match parameter {
                Some(v) if v > 0 => {
                    axis.speed = v as f64;
                    vec![ok]
                }
                _ => vec![format!("{prefix}! RANGE")],
            },
            "QA" => vec![
                format!("{prefix}Simulated {variant} axis {id}"),
                format!(
                    "Slew speed = {}        Acceleration = 1000",
                    axis.speed.round() as i64
                ),
                format!("Lower limit = {}    Upper limit = {}", axis.lower, axis.upper),
                format!(
                    "Soft limits = {}    Command pos = {}",
                    if axis.limits_enabled { "Enabled" } else { "Disabled" },
                    position.round() as i64
                ),
            ],
            "__QA" => vec![
                format!("{prefix}Hidden parameters"),
                format!(
                    "Encoder pulse output modulus = {}    Encoder pulse output offset = {}",
                    axis.pulse_modulus, axis.pulse_offset
                ),
                format!(
                    "Encoder pulse output port number = {}    Encoder pulse output min on time = {}",
                    axis.pulse_port, axis.pulse_on_time
                ),
            ],
            "OS" => vec![format!(
                "{prefix}00{}00000",
                if axis.at_hard_limit { '1' } else { '0' }
            )],
            "OW" => {
                let mut bits = ['0'; 8];
                if axis.pulse_latched(position) {
                    if let Ok(port) = usize::try_from(axis.pulse_port) {
                        if (1..=8).contains(&port) {
                            bits[8 - port] = '1';
                        }
                    }
                }
                vec![format!("{prefix}{}", bits.iter().collect::<String>())]
            }
            "__EMOM" => {
                axis.pulse_modulus = parameter.unwrap_or(0);
                vec![ok]
            }
            "__EMOO" => {
                axis.pulse_offset = parameter.unwrap_or(0);
                vec![ok]
            }
            "__EMOT" => {
                axis.pulse_on_time = parameter.unwrap_or(0);
                vec![ok]
            }
            "__EMOP" => {
                axis.pulse_port = parameter.unwrap_or(0);
                vec![ok]
            }
            _ => vec![format!("{prefix}! UNKNOWN COMMAND")],
        };

        if self.corrupt_replies > 0 {
            self.corrupt_replies -= 1;
            out.push(format!("{prefix}??"));
        } else {
            out.extend(replies);
        }
        out
    }
}

/// Split `3MA-200` into (3, "MA", Some(-200)).
fn split_command(line: &str) -> Option<(u8, String, Option<i64>)> {
    let digits = line.find(|c: char| !c.is_ascii_digit())?;
    let id: u8 = line[..digits].parse().ok()?;
    let rest = &line[digits..];
    let split = rest
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
        .unwrap_or(rest.len());
    let command = rest[..split].to_uppercase();
    let parameter = rest[split..].trim().parse().ok();
    Some((id, command, parameter))
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-process motor controller speaking the PM-series protocol.
pub struct SimulatedController {
    state: Arc<Mutex<SimState>>,
    input: Vec<u8>,
}

/// Inspection and fault-injection handle for a [`SimulatedController`].
#[derive(Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    /// Controller with one simulated axis per configured axis.
    ///
    /// Axes start at 0 with soft limits of ±1000 units and slew at max speed.
    pub fn new(settings: &Settings) -> (Self, SimHandle) {
        let axes = settings
            .axes
            .iter()
            .map(|a| {
                let span = (1000.0 * a.scale).abs().round() as i64;
                SimAxis {
                    id: a.id,
                    position: 0.0,
                    motion: None,
                    speed: (a.max_speed * a.scale).abs(),
                    lower: -span,
                    upper: span,
                    limits_enabled: true,
                    hard_stop: None,
                    at_hard_limit: false,
                    stalled: false,
                    pulse_offset: 0,
                    pulse_modulus: 0,
                    pulse_on_time: 0,
                    pulse_port: 0,
                    last_port_check: 0.0,
                }
            })
            .collect();
        let state = Arc::new(Mutex::new(SimState {
            variant: settings.controller.variant,
            axes,
            log: Vec::new(),
            corrupt_replies: 0,
            disconnected: false,
        }));
        (
            Self {
                state: state.clone(),
                input: Vec::new(),
            },
            SimHandle { state },
        )
    }
}

#[async_trait]
impl SerialChannel for SimulatedController {
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        let text = String::from_utf8_lossy(data);
        let now = Instant::now();
        let mut state = lock(&self.state);
        if state.disconnected {
            return Err(DaqError::SerialPortNotConnected);
        }
        let terminator = state.variant.terminator();
        for line in text.split(terminator).filter(|l| !l.is_empty()) {
            for reply in state.handle(line, now) {
                self.input.extend_from_slice(reply.as_bytes());
                self.input.extend_from_slice(terminator.as_bytes());
            }
        }
        Ok(())
    }

    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        if let Some(pos) = find_subsequence(&self.input, terminator) {
            return Ok(self.input.drain(..pos + terminator.len()).collect());
        }
        if self.input.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(std::mem::take(&mut self.input))
    }

    async fn bytes_pending(&mut self) -> AppResult<usize> {
        Ok(self.input.len())
    }

    fn describe(&self) -> String {
        "simulated controller".to_string()
    }
}

impl SimHandle {
    fn with_axis<T>(&self, id: u8, f: impl FnOnce(&mut SimAxis) -> T) -> Option<T> {
        let mut state = lock(&self.state);
        state.axis_mut(id).map(f)
    }

    /// Every command line received, in order.
    pub fn command_log(&self) -> Vec<String> {
        lock(&self.state).log.clone()
    }

    /// Number of received commands with the given mnemonic (case-insensitive).
    pub fn count(&self, mnemonic: &str) -> usize {
        let wanted = mnemonic.to_uppercase();
        lock(&self.state)
            .log
            .iter()
            .filter_map(|line| split_command(line))
            .filter(|(_, command, _)| *command == wanted)
            .count()
    }

    /// Forget the command log.
    pub fn clear_log(&self) {
        lock(&self.state).log.clear();
    }

    /// Current position of axis `id` in steps.
    pub fn position_steps(&self, id: u8) -> Option<f64> {
        let now = Instant::now();
        self.with_axis(id, |a| a.settle(now))
    }

    /// Whether axis `id` is moving.
    pub fn is_moving(&self, id: u8) -> bool {
        let now = Instant::now();
        self.with_axis(id, |a| {
            a.settle(now);
            a.motion.is_some()
        })
        .unwrap_or(false)
    }

    /// Overwrite the soft-limit registers of axis `id` (steps).
    pub fn set_soft_limits(&self, id: u8, lower: i64, upper: i64) {
        self.with_axis(id, |a| {
            a.lower = lower;
            a.upper = upper;
        });
    }

    /// Place a limit switch at `steps` on axis `id`, or remove it.
    pub fn set_hard_stop(&self, id: u8, steps: Option<f64>) {
        self.with_axis(id, |a| a.hard_stop = steps);
    }

    /// Freeze motion on axis `id` without raising any flag.
    pub fn set_stalled(&self, id: u8, stalled: bool) {
        self.with_axis(id, |a| a.stalled = stalled);
    }

    /// Overwrite the slew speed register of axis `id` (steps/s).
    pub fn set_slew_speed(&self, id: u8, steps_per_second: f64) {
        self.with_axis(id, |a| a.speed = steps_per_second);
    }

    /// Replace the next `n` replies with an unparseable line.
    pub fn corrupt_next_replies(&self, n: u32) {
        lock(&self.state).corrupt_replies = n;
    }

    /// Unplug the cable: every later write fails.
    pub fn disconnect(&self) {
        lock(&self.state).disconnected = true;
    }
}

// =============================================================================
// ScriptedChannel - canned replies
// =============================================================================

/// Shared record of everything written to a [`ScriptedChannel`].
#[derive(Clone, Default)]
pub struct ScriptLog(Arc<Mutex<Vec<String>>>);

impl ScriptLog {
    /// Written frames, terminators included.
    pub fn written(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|log| log.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Channel that answers each write with the next scripted reply.
///
/// `late` chunks become readable only once the input has been fully drained,
/// imitating bytes that arrive during the link's retry grace period.
#[derive(Default)]
pub struct ScriptedChannel {
    replies: VecDeque<Vec<u8>>,
    late: VecDeque<Vec<u8>>,
    input: Vec<u8>,
    log: ScriptLog,
}

impl ScriptedChannel {
    /// Empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the reply to the next write.
    pub fn reply(mut self, text: &str) -> Self {
        self.replies.push_back(text.as_bytes().to_vec());
        self
    }

    /// Queue bytes that arrive after the current input has been read.
    pub fn late(mut self, text: &str) -> Self {
        self.late.push_back(text.as_bytes().to_vec());
        self
    }

    /// Handle on the write log.
    pub fn log(&self) -> ScriptLog {
        self.log.clone()
    }
}

#[async_trait]
impl SerialChannel for ScriptedChannel {
    async fn write_all(&mut self, data: &[u8]) -> AppResult<()> {
        if let Ok(mut log) = self.log.0.lock() {
            log.push(String::from_utf8_lossy(data).into_owned());
        }
        if let Some(reply) = self.replies.pop_front() {
            self.input.extend(reply);
        }
        Ok(())
    }

    async fn read_until(&mut self, terminator: &[u8], timeout: Duration) -> AppResult<Vec<u8>> {
        loop {
            if let Some(pos) = find_subsequence(&self.input, terminator) {
                return Ok(self.input.drain(..pos + terminator.len()).collect());
            }
            if !self.input.is_empty() {
                return Ok(std::mem::take(&mut self.input));
            }
            match self.late.pop_front() {
                Some(chunk) => self.input.extend(chunk),
                None => {
                    tokio::time::sleep(timeout).await;
                    return Ok(Vec::new());
                }
            }
        }
    }

    async fn bytes_pending(&mut self) -> AppResult<usize> {
        Ok(self.input.len())
    }

    fn describe(&self) -> String {
        "scripted channel".to_string()
    }
}

// =============================================================================
// Field samplers
// =============================================================================

/// Field sensor returning a constant field.
pub struct MockFieldSampler {
    field: [f64; 3],
    delay: Duration,
    fail_after: Option<u64>,
    samples: AtomicU64,
    last_averages: AtomicU32,
}

impl MockFieldSampler {
    /// Sensor that always reads `field` (mT).
    pub fn new(field: [f64; 3]) -> Self {
        Self {
            field,
            delay: Duration::ZERO,
            fail_after: None,
            samples: AtomicU64::new(0),
            last_averages: AtomicU32::new(0),
        }
    }

    /// Each sample takes `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every sample after the first `n`.
    pub fn failing_after(mut self, n: u64) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Samples taken so far.
    pub fn sample_count(&self) -> u64 {
        self.samples.load(Ordering::SeqCst)
    }

    /// Average count of the most recent call.
    pub fn last_averages(&self) -> u32 {
        self.last_averages.load(Ordering::SeqCst)
    }
}

impl Default for MockFieldSampler {
    fn default() -> Self {
        Self::new([0.0, 0.0, 1.0])
    }
}

#[async_trait]
impl FieldSampler for MockFieldSampler {
    async fn sample(&self, averages: u32) -> Result<FieldSample> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.last_averages.store(averages, Ordering::SeqCst);
        let taken = self.samples.fetch_add(1, Ordering::SeqCst);
        if matches!(self.fail_after, Some(n) if taken >= n) {
            bail!("mock probe disconnected after {taken} samples");
        }
        Ok(FieldSample {
            b: self.field,
            b_std: [0.001; 3],
            temperature: 22.0,
            temperature_std: 0.05,
        })
    }

    fn describe(&self) -> String {
        "mock field sensor".to_string()
    }
}

/// Sensor stand-in that reads zero everywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlankFieldSampler;

#[async_trait]
impl FieldSampler for BlankFieldSampler {
    async fn sample(&self, _averages: u32) -> Result<FieldSample> {
        Ok(FieldSample::default())
    }

    fn describe(&self) -> String {
        "blank (no sensor)".to_string()
    }
}
