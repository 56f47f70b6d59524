//! Typed per-axis operations on top of the [`Link`].
//!
//! An [`Axis`] is a short-lived view borrowed from the [`crate::hardware::rig::Rig`]:
//! it pairs the shared link with one axis' static configuration and cached
//! soft limits. Positions are never cached; every read goes to the controller.
//!
//! Distances are in physical units (mm for linear axes, degrees for rotary
//! axes) and converted to steps with the axis scale factor.

use crate::config::{AxisSettings, MotionSettings};
use crate::error::{AppResult, DaqError};
use crate::hardware::link::Link;
use crate::hardware::protocol::{mnemonic, Parameter, QueryReport, UNBOUNDED_LIMIT_STEPS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Kind of motion an axis performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AxisKind {
    /// Translation, units of mm
    #[default]
    Linear,
    /// Rotation, units of degrees
    Rotary,
}

impl AxisKind {
    /// Unit label
    pub fn units(self) -> &'static str {
        match self {
            AxisKind::Linear => "mm",
            AxisKind::Rotary => "deg",
        }
    }
}

/// Soft-limit pair in physical units. Always `lower <= upper`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    lower: f64,
    upper: f64,
}

impl SoftLimits {
    /// Build from two bounds in any order.
    pub fn new(a: f64, b: f64) -> Self {
        Self {
            lower: a.min(b),
            upper: a.max(b),
        }
    }

    /// Lower bound
    pub fn lower(&self) -> f64 {
        self.lower
    }

    /// Upper bound
    pub fn upper(&self) -> f64 {
        self.upper
    }

    /// Whether `value` lies inside the limits (inclusive).
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

impl fmt::Display for SoftLimits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}..{:.3}", self.lower, self.upper)
    }
}

/// Trigger pulse generator settings read back from the controller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriggerConfig {
    /// Position of the first pulse
    pub offset: f64,
    /// Distance between pulses
    pub modulus: f64,
    /// Minimum pulse on-time in ms
    pub on_time_ms: i64,
    /// Write port carrying the pulse (0 = unassigned)
    pub port: u8,
}

/// Options for [`Axis::move_to`].
#[derive(Debug, Clone, Copy)]
pub struct MoveOptions {
    /// Target is relative to the current commanded position
    pub relative: bool,
    /// Block until the axis arrives
    pub wait: bool,
    /// Arrival tolerance in physical units
    pub tolerance: f64,
    /// Explicit wait timeout; derived from distance and max speed when `None`
    pub timeout: Option<Duration>,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            relative: false,
            wait: true,
            tolerance: 0.01,
            timeout: None,
        }
    }
}

impl MoveOptions {
    /// Absolute move that returns as soon as the controller accepts it.
    pub fn no_wait() -> Self {
        Self {
            wait: false,
            ..Self::default()
        }
    }

    /// Relative move, waiting for arrival.
    pub fn relative() -> Self {
        Self {
            relative: true,
            ..Self::default()
        }
    }
}

/// Per-axis state held by the rig: configuration plus cached soft limits.
#[derive(Debug, Clone)]
pub struct AxisState {
    config: AxisSettings,
    /// `None` until queried; `Some(None)` when limits are disabled.
    limits: Option<Option<SoftLimits>>,
}

impl AxisState {
    /// Wrap an axis definition.
    pub fn new(config: AxisSettings) -> Self {
        Self {
            config,
            limits: None,
        }
    }

    /// Axis definition
    pub fn config(&self) -> &AxisSettings {
        &self.config
    }

    /// Whether `name` is this axis' name or one of its aliases (case-insensitive).
    pub fn answers_to(&self, name: &str) -> bool {
        self.config.name.eq_ignore_ascii_case(name)
            || self.config.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }
}

/// Borrowed view of one axis.
pub struct Axis<'a> {
    link: &'a mut Link,
    state: &'a mut AxisState,
    motion: &'a MotionSettings,
}

impl<'a> Axis<'a> {
    pub(crate) fn new(
        link: &'a mut Link,
        state: &'a mut AxisState,
        motion: &'a MotionSettings,
    ) -> Self {
        Self {
            link,
            state,
            motion,
        }
    }

    /// Logical name
    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    /// Controller axis number
    pub fn id(&self) -> u8 {
        self.state.config.id
    }

    /// Steps per unit
    pub fn scale(&self) -> f64 {
        self.state.config.scale
    }

    /// Maximum slew speed in units/s
    pub fn max_speed(&self) -> f64 {
        self.state.config.max_speed
    }

    /// One exchange on the link, with protocol errors attributed to this axis by name.
    async fn talk(
        &mut self,
        command: &str,
        parameter: impl Into<Parameter>,
        check_ok: bool,
    ) -> AppResult<Vec<String>> {
        let id = self.id();
        self.link
            .send(id, command, parameter, check_ok)
            .await
            .map_err(|err| match err {
                DaqError::Protocol {
                    detail, response, ..
                } => DaqError::Protocol {
                    axis: self.state.config.name.clone(),
                    detail,
                    response,
                },
                other => other,
            })
    }

    /// First reply line or a protocol error naming the command.
    async fn reply(&mut self, command: &str) -> AppResult<String> {
        let lines = self.talk(command, Parameter::None, false).await?;
        lines.into_iter().next().ok_or_else(|| {
            DaqError::protocol(self.name(), format!("no reply to {}", command.to_uppercase()), vec![])
        })
    }

    fn protocol_error(&self, detail: impl Into<String>, response: Vec<String>) -> DaqError {
        DaqError::protocol(self.name(), detail, response)
    }

    /// Read the commanded (`true`) or actual (`false`) position.
    ///
    /// Unparseable or missing replies are retried up to the configured bound.
    pub async fn position(&mut self, commanded: bool) -> AppResult<f64> {
        let variant = self.link.variant();
        let command = variant.position_command(commanded);
        let attempts = self.motion.position_retries.max(1);
        let mut last = Vec::new();

        for attempt in 1..=attempts {
            let lines = self.talk(command, Parameter::None, false).await?;
            if let Some(steps) = lines
                .first()
                .and_then(|reply| variant.parse_position(self.id(), commanded, reply))
            {
                return Ok(steps as f64 / self.scale());
            }
            debug!(axis = %self.name(), attempt, reply = ?lines, "Unparseable position reply");
            last = lines;
        }

        Err(self.protocol_error(
            format!("no valid position reply after {attempts} attempts"),
            last,
        ))
    }

    /// Move to `target` (or by `target` when relative).
    ///
    /// The absolute target is checked against the soft limits before anything
    /// is sent. When waiting, the actual position is polled until it is within
    /// `tolerance` of the target.
    ///
    /// # Errors
    /// - `OutOfBounds` if the target lies outside the soft limits
    /// - `HardLimitHit` if the wait times out with the axis on a limit switch
    /// - `MotionTimeout` if the wait times out otherwise
    pub async fn move_to(&mut self, target: f64, options: MoveOptions) -> AppResult<()> {
        let current = self.position(true).await?;
        let destination = if options.relative {
            current + target
        } else {
            target
        };

        if let Some(limits) = self.limits().await? {
            if !limits.contains(destination) {
                return Err(DaqError::OutOfBounds {
                    axis: self.name().to_string(),
                    min: destination,
                    max: destination,
                    lower: limits.lower(),
                    upper: limits.upper(),
                });
            }
        }

        let command = self.link.variant().move_command(options.relative);
        debug!(axis = %self.name(), target = destination, "Move");
        self.talk(command, target * self.scale(), true).await?;

        if options.wait {
            let timeout = options.timeout.unwrap_or_else(|| {
                Duration::from_secs_f64((destination - current).abs() / self.max_speed())
                    + self.motion.move_grace
            });
            self.wait_until(destination, options.tolerance, timeout).await?;
        }
        Ok(())
    }

    async fn wait_until(&mut self, target: f64, tolerance: f64, timeout: Duration) -> AppResult<()> {
        let start = Instant::now();
        loop {
            tokio::time::sleep(self.motion.poll_interval).await;
            let position = self.position(false).await?;
            if (position - target).abs() <= tolerance {
                return Ok(());
            }
            if start.elapsed() > timeout {
                if self.hard_limit().await? {
                    return Err(DaqError::HardLimitHit {
                        axis: self.name().to_string(),
                    });
                }
                warn!(axis = %self.name(), target, position, "Timed out waiting for move");
                return Err(DaqError::MotionTimeout {
                    axis: self.name().to_string(),
                    target,
                    timeout,
                });
            }
        }
    }

    /// Halt immediately. No confirmation is awaited.
    pub async fn stop(&mut self) -> AppResult<()> {
        self.talk(mnemonic::STOP, Parameter::None, false).await?;
        Ok(())
    }

    /// Clear a fault or abort condition.
    pub async fn reset(&mut self) -> AppResult<()> {
        info!(axis = %self.name(), "Reset");
        self.talk(mnemonic::RESET, Parameter::None, false).await?;
        Ok(())
    }

    /// Redefine the current position as `value` (both commanded and actual registers).
    pub async fn define_position(&mut self, value: f64) -> AppResult<()> {
        let steps = value * self.scale();
        self.talk(mnemonic::COMMAND_POSITION, steps, true).await?;
        self.talk(mnemonic::ACTUAL_POSITION, steps, true).await?;
        Ok(())
    }

    /// Query-all report, retried a bounded number of times while it parses empty.
    pub async fn query_all(&mut self, hidden: bool) -> AppResult<QueryReport> {
        let command = if hidden {
            mnemonic::QUERY_ALL_HIDDEN
        } else {
            mnemonic::QUERY_ALL
        };
        let attempts = self.motion.position_retries.max(1);
        let mut last = Vec::new();
        for _ in 0..attempts {
            let lines = self.talk(command, Parameter::None, false).await?;
            let report = QueryReport::parse(&lines);
            if !report.is_empty() {
                return Ok(report);
            }
            last = lines;
        }
        Err(self.protocol_error("empty query-all report", last))
    }

    fn report_int(&self, report: &QueryReport, name: &str) -> AppResult<i64> {
        report
            .int(name)
            .ok_or_else(|| self.protocol_error(format!("query-all report lacks '{name}'"), vec![]))
    }

    /// Soft limits, or `None` when they are disabled.
    ///
    /// Served from the cache after the first query or set.
    pub async fn limits(&mut self) -> AppResult<Option<SoftLimits>> {
        if let Some(cached) = self.state.limits {
            return Ok(cached);
        }
        let limits = self.query_limits().await?;
        self.state.limits = Some(limits);
        Ok(limits)
    }

    /// Soft limits read fresh from the controller.
    pub async fn query_limits(&mut self) -> AppResult<Option<SoftLimits>> {
        let variant = self.link.variant();
        if !variant.has_query_all() {
            return Ok(None);
        }
        let report = self.query_all(false).await?;
        if variant.can_inhibit_limits() && report.flag("soft limits") == Some(false) {
            return Ok(None);
        }
        let lower = self.report_int(&report, "lower soft limit")? as f64 / self.scale();
        let upper = self.report_int(&report, "upper soft limit")? as f64 / self.scale();
        let limits = SoftLimits::new(lower, upper);
        self.state.limits = Some(Some(limits));
        Ok(Some(limits))
    }

    /// Set the soft limits, or disable them with `None`.
    ///
    /// Variants that cannot inhibit limits get them widened to the register range.
    pub async fn set_limits(&mut self, limits: Option<(f64, f64)>) -> AppResult<()> {
        let variant = self.link.variant();
        let (lower, upper) = match limits {
            Some((a, b)) => {
                let l = SoftLimits::new(a, b);
                (l.lower() * self.scale(), l.upper() * self.scale())
            }
            None if variant.can_inhibit_limits() => {
                self.talk(mnemonic::INHIBIT_LIMITS, Parameter::None, true).await?;
                self.state.limits = Some(None);
                info!(axis = %self.name(), "Soft limits inhibited");
                return Ok(());
            }
            None => (
                -UNBOUNDED_LIMIT_STEPS as f64,
                UNBOUNDED_LIMIT_STEPS as f64,
            ),
        };

        if variant.can_inhibit_limits() {
            self.talk(mnemonic::ALLOW_LIMITS, Parameter::None, true).await?;
        }
        self.talk(mnemonic::LOWER_LIMIT, lower, true).await?;
        self.talk(mnemonic::UPPER_LIMIT, upper, true).await?;

        // steps -> units; a negative scale flips the pair, SoftLimits reorders it
        let limits = SoftLimits::new(lower / self.scale(), upper / self.scale());
        self.state.limits = Some(Some(limits));
        info!(axis = %self.name(), %limits, "Soft limits set");
        Ok(())
    }

    /// True when the axis is physically on a limit switch.
    pub async fn hard_limit(&mut self) -> AppResult<bool> {
        let reply = self.reply(mnemonic::OUTPUT_STATUS).await?;
        let index = self.link.variant().hard_limit_index(self.id());
        match reply.as_bytes().get(index) {
            Some(b'0') => Ok(false),
            Some(b'1') => Ok(true),
            _ => Err(self.protocol_error("unexpected status register reply", vec![reply])),
        }
    }

    async fn scl_value(&mut self, command: &str) -> AppResult<f64> {
        let reply = self.reply(command).await?;
        reply
            .split_once('=')
            .and_then(|(_, v)| v.trim().parse::<f64>().ok())
            .ok_or_else(|| self.protocol_error(format!("unparseable {command} reply"), vec![reply]))
    }

    /// Slew speed in units/s.
    pub async fn speed(&mut self) -> AppResult<f64> {
        if !self.link.variant().has_query_all() {
            let velocity = self.scl_value(mnemonic::VELOCITY).await?;
            let resolution = self.scl_value(mnemonic::ENCODER_RESOLUTION).await?;
            return Ok((velocity * resolution / self.scale()).abs());
        }
        let report = self.query_all(false).await?;
        Ok(self.report_int(&report, "slew speed")? as f64 / self.scale())
    }

    /// Set the slew speed; `None` selects the maximum speed.
    ///
    /// # Errors
    /// `OutOfRange` when the speed is not positive or exceeds the axis maximum.
    pub async fn set_speed(&mut self, speed: Option<f64>) -> AppResult<()> {
        let speed = speed.unwrap_or_else(|| self.max_speed());
        if speed <= 0.0 || speed > self.max_speed() {
            return Err(DaqError::OutOfRange(format!(
                "requested speed {speed} on axis {} must be in (0, {}]",
                self.name(),
                self.max_speed()
            )));
        }
        debug!(axis = %self.name(), speed, "Set slew speed");
        self.talk(mnemonic::SLEW_VELOCITY, (speed * self.scale()).abs(), true)
            .await?;
        Ok(())
    }

    /// Program the pulse generator: a pulse every `step` units from `start`.
    ///
    /// # Errors
    /// `OutOfRange` when `port` is not in 1..=8. Nothing is sent in that case.
    pub async fn initialise_trigger(
        &mut self,
        start: f64,
        step: f64,
        on_time_ms: u32,
        port: u8,
    ) -> AppResult<()> {
        check_port(port)?;
        let scale = self.scale();
        self.talk(mnemonic::PULSE_OFFSET, start * scale, true).await?;
        self.talk(mnemonic::PULSE_MODULUS, (step * scale).abs(), true)
            .await?;
        self.talk(mnemonic::PULSE_ON_TIME, on_time_ms, true).await?;
        self.talk(mnemonic::PULSE_PORT, port, true).await?;
        info!(axis = %self.name(), start, step, port, "Trigger initialised");
        Ok(())
    }

    /// Pulse generator settings from the hidden query-all report.
    pub async fn trigger_config(&mut self) -> AppResult<TriggerConfig> {
        let report = self.query_all(true).await?;
        let scale = self.scale();
        let port = self.report_int(&report, "encoder pulse output port number")?;
        Ok(TriggerConfig {
            offset: self.report_int(&report, "encoder pulse output offset")? as f64 / scale,
            modulus: self.report_int(&report, "encoder pulse output modulus")? as f64 / scale,
            on_time_ms: self.report_int(&report, "encoder pulse output min on time")?,
            port: u8::try_from(port).unwrap_or(0),
        })
    }

    /// Whether write port `port` (1-8) is currently asserted.
    pub async fn write_port_state(&mut self, port: u8) -> AppResult<bool> {
        check_port(port)?;
        let reply = self.reply(mnemonic::OUTPUT_WRITE_PORT).await?;
        let bytes = reply.as_bytes();
        match bytes.len().checked_sub(usize::from(port)).map(|i| bytes[i]) {
            Some(b'1') => Ok(true),
            Some(b'0') => Ok(false),
            _ => Err(self.protocol_error("unexpected write port reply", vec![reply])),
        }
    }

    /// Poll the write port until it is asserted.
    ///
    /// `None` uses the port the pulse generator is configured for.
    ///
    /// # Errors
    /// `PulseTimeout` when no pulse is seen within `timeout`.
    pub async fn wait_for_pulse(&mut self, port: Option<u8>, timeout: Duration) -> AppResult<()> {
        let port = match port {
            Some(p) => p,
            None => self.trigger_config().await?.port,
        };
        check_port(port)?;

        let start = Instant::now();
        while !self.write_port_state(port).await? {
            if start.elapsed() > timeout {
                return Err(DaqError::PulseTimeout {
                    axis: self.name().to_string(),
                    port,
                    timeout,
                });
            }
            tokio::time::sleep(self.motion.pulse_poll_interval).await;
        }
        Ok(())
    }
}

fn check_port(port: u8) -> AppResult<()> {
    if (1..=8).contains(&port) {
        Ok(())
    } else {
        Err(DaqError::OutOfRange(format!(
            "write port {port} must be between 1 and 8"
        )))
    }
}
