//! The scan rig: every axis on one controller link.
//!
//! The rig owns the [`Link`] and hands out borrowed [`Axis`] views by logical
//! name. Holding `&mut Rig` is holding the hardware; the scan engine wraps it
//! in a [`SharedRig`] and keeps the lock for a whole session.

use crate::config::{AxisSettings, MotionSettings, Settings};
use crate::error::{AppResult, DaqError};
use crate::hardware::axis::{Axis, AxisState, MoveOptions};
use crate::hardware::link::Link;
use crate::hardware::transport::{open_serial, SerialChannel};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Rig shared between the engine and manual callers.
pub type SharedRig = Arc<Mutex<Rig>>;

/// Aggregate of the controller link and its axes.
pub struct Rig {
    link: Link,
    axes: Vec<AxisState>,
    motion: MotionSettings,
}

impl Rig {
    /// Assemble a rig from an open link.
    pub fn new(link: Link, axes: Vec<AxisSettings>, motion: MotionSettings) -> Self {
        Self {
            link,
            axes: axes.into_iter().map(AxisState::new).collect(),
            motion,
        }
    }

    /// Build a rig on an arbitrary channel using the loaded settings.
    pub fn from_channel(channel: Box<dyn SerialChannel>, settings: &Settings) -> Self {
        let link = Link::from_settings(channel, &settings.controller);
        Self::new(link, settings.axes.clone(), settings.motion.clone())
    }

    /// Open the configured serial port and build the rig.
    pub fn open(settings: &Settings) -> AppResult<Self> {
        let controller = &settings.controller;
        let channel = open_serial(&controller.port, controller.serial_params())?;
        info!(
            port = %controller.port,
            variant = %controller.variant,
            axes = settings.axes.len(),
            "Rig opened"
        );
        Ok(Self::from_channel(channel, settings))
    }

    /// Wrap for sharing with a [`crate::experiment::run_engine::ScanEngine`].
    pub fn into_shared(self) -> SharedRig {
        Arc::new(Mutex::new(self))
    }

    /// Logical names of all axes, in configuration order.
    pub fn axis_names(&self) -> Vec<String> {
        self.axes.iter().map(|a| a.config().name.clone()).collect()
    }

    fn index_of(&self, name: &str) -> AppResult<usize> {
        self.axes
            .iter()
            .position(|a| a.answers_to(name))
            .ok_or_else(|| DaqError::UnknownAxis(name.to_string()))
    }

    /// Axis by name or alias (case-insensitive).
    pub fn axis(&mut self, name: &str) -> AppResult<Axis<'_>> {
        let index = self.index_of(name)?;
        Ok(self.axis_at(index))
    }

    fn axis_at(&mut self, index: usize) -> Axis<'_> {
        Axis::new(&mut self.link, &mut self.axes[index], &self.motion)
    }

    /// Actual position of every axis, in configuration order.
    pub async fn positions(&mut self) -> AppResult<Vec<(String, f64)>> {
        let mut out = Vec::with_capacity(self.axes.len());
        for index in 0..self.axes.len() {
            let mut axis = self.axis_at(index);
            let position = axis.position(false).await?;
            out.push((axis.name().to_string(), position));
        }
        Ok(out)
    }

    /// Actual positions of x, y and z.
    pub async fn xyz(&mut self) -> AppResult<[f64; 3]> {
        let mut out = [0.0; 3];
        for (slot, name) in out.iter_mut().zip(["x", "y", "z"]) {
            *slot = self.axis(name)?.position(false).await?;
        }
        Ok(out)
    }

    /// Stop every axis.
    ///
    /// Every axis is attempted even if an earlier one fails; the first error is returned.
    pub async fn stop_all(&mut self) -> AppResult<()> {
        let mut first_error = None;
        for index in 0..self.axes.len() {
            let mut axis = self.axis_at(index);
            if let Err(e) = axis.stop().await {
                warn!(axis = %axis.name(), error = %e, "Stop failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Reset every axis after a fault.
    pub async fn reset_all(&mut self) -> AppResult<()> {
        for index in 0..self.axes.len() {
            self.axis_at(index).reset().await?;
        }
        Ok(())
    }

    /// Move x, y and z to `target`, one axis after another, waiting for each.
    pub async fn move_all(&mut self, target: [f64; 3]) -> AppResult<()> {
        for (name, value) in ["x", "y", "z"].into_iter().zip(target) {
            self.axis(name)?.move_to(value, MoveOptions::default()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::SimulatedController;

    fn rig() -> Rig {
        let settings = Settings::default();
        let (sim, _) = SimulatedController::new(&settings);
        Rig::from_channel(Box::new(sim), &settings)
    }

    #[test]
    fn test_lookup_by_alias() {
        let mut rig = rig();
        assert_eq!(rig.axis("HP Y").unwrap().name(), "y");
        assert!(matches!(rig.axis("theta"), Err(DaqError::UnknownAxis(_))));
        assert_eq!(rig.axis_names(), vec!["x", "y", "z"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_all_and_positions() {
        let mut rig = rig();
        rig.move_all([1.0, -2.0, 3.5]).await.unwrap();
        let positions = rig.positions().await.unwrap();
        assert_eq!(positions.len(), 3);
        assert!((positions[0].1 - 1.0).abs() < 0.01);
        assert!((positions[1].1 + 2.0).abs() < 0.01);
        let xyz = rig.xyz().await.unwrap();
        assert!((xyz[2] - 3.5).abs() < 0.01);
    }
}
