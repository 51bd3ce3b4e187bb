//! Core library for the lsm_daq light-sheet acquisition engine.
//!
//! The crate synchronizes a camera, a galvo pair, a tunable lens, a multi-line laser,
//! a filter wheel and a motorized stage to acquire tiled 3D volumes into a
//! multi-resolution pyramid with a companion registration document.
//!
//! - [`config`]: figment-backed configuration
//! - [`scan`]: geometry, waveforms, laser compensation and the [`scan::sequencer`]
//! - [`data`]: frame ring, pyramid store and its backends
//! - [`instrument`]: capability traits and serial drivers
//! - [`hardware`]: simulated devices

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod hardware;
pub mod instrument;
pub mod logging;
pub mod scan;
