//! Room coordination: per-room state, admission, relay fan-out, and the
//! process-wide registry.

pub mod registry;
pub mod room;

pub use registry::{RegistryStats, RoomRegistry};
pub use room::{JoinSnapshot, Room, RoomFrame};
