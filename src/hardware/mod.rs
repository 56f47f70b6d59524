//! Hardware layer: serial transport, controller protocol, axes and the rig.
//!
//! - `transport`: byte channel to the controller (`tokio-serial` or simulated)
//! - `protocol`: command encoding and reply parsing per controller variant
//! - `link`: framed request/reply exchange with echo check and status retry
//! - `axis` / `rig`: typed per-axis operations and their aggregate
//! - `capabilities`: what the engine needs from the field sensor
//! - `mock`: simulated controller and sensors

pub mod axis;
pub mod capabilities;
pub mod link;
pub mod mock;
pub mod protocol;
pub mod rig;
pub mod transport;

pub use axis::{Axis, AxisKind, MoveOptions, SoftLimits, TriggerConfig};
pub use capabilities::FieldSampler;
pub use link::Link;
pub use protocol::ControllerVariant;
pub use rig::{Rig, SharedRig};
