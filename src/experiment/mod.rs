//! Scan planning and execution.

pub mod plan;
pub mod planner;
pub mod run_engine;
pub mod state;

pub use plan::{AxisOrder, AxisRange, ScanMode, ScanPath, ScanPlan, ScanPoint, SpatialAxis};
pub use planner::ScanPlanner;
pub use run_engine::{CancelToken, ScanEngine, ScanEvent, ScanHandle};
pub use state::{RunStatus, SessionState, SessionSummary};
