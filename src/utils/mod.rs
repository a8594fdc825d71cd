//! Small helpers shared across modules.

pub mod serde_duration;
