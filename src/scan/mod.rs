//! Acquisition planning and the scan state machine.

pub mod geometry;
pub mod plan;
pub mod power;
pub mod registration;
pub mod rig;
pub mod sequencer;
pub mod waveform;
pub mod wells;
