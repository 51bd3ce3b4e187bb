//! Capability traits for the microscope's hardware.
//!
//! Each trait covers one device role. Implementations own their transport (vendor SDK,
//! serial link, simulation) and report failures as `anyhow::Error`; the sequencer
//! attaches the device and operation before surfacing them as
//! [`DaqError::Device`](crate::error::DaqError::Device).
//!
//! All methods take `&self` so handles can be boxed as `dyn Trait` and owned by the
//! [`Rig`](crate::scan::rig::Rig). Drivers use interior mutability for their links.

pub mod asi;
pub mod fw102c;
pub mod serial;
pub mod skyra;

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ndarray::{Array2, ArrayView2};
use tokio::time::{sleep, Instant};

use crate::config::{AcquireMode, TriggerMode};
use crate::scan::waveform::WaveformBuffer;

// =============================================================================
// Stage
// =============================================================================

/// Stage axis. X is the scan axis, Y lateral, Z depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Scan axis.
    X,
    /// Lateral axis.
    Y,
    /// Depth axis.
    Z,
}

impl Axis {
    /// All axes in controller order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Controller letter.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

/// Whether any motor is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorStatus {
    /// Every motor stopped.
    Idle,
    /// At least one motor moving.
    Busy,
}

/// One-time stage setup.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSettings {
    /// Backlash compensation travel (mm); 0 disables it.
    pub backlash_mm: f64,
    /// Default velocity on every axis (mm/s).
    pub velocity_mm_s: f64,
    /// Acceleration ramp time (ms).
    pub acceleration_ms: f64,
    /// Serpentine (true) or raster (false) scan pattern.
    pub serpentine: bool,
}

/// A constant-velocity sweep of the scan axis at a fixed slow-axis position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanSweep {
    /// Scan-axis start (mm).
    pub start_mm: f64,
    /// Scan-axis end (mm).
    pub end_mm: f64,
    /// Slow-axis (Y) position held during the sweep (mm).
    pub slow_axis_mm: f64,
}

/// Motorized three-axis stage.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Backlash, velocity, acceleration, scan pattern and sync output.
    async fn initialize(&self, settings: &StageSettings) -> Result<()>;

    /// Current position of X, Y and Z (mm).
    async fn position(&self) -> Result<[f64; 3]>;

    /// Move `axis` to `position_mm`; with `wait` the call returns once motors are idle.
    async fn go_absolute(&self, axis: Axis, position_mm: f64, wait: bool) -> Result<()>;

    /// Whether any motor is running.
    async fn motor_status(&self) -> Result<MotorStatus>;

    /// Set the velocity of `axis` (mm/s).
    async fn set_velocity(&self, axis: Axis, mm_per_s: f64) -> Result<()>;

    /// Program the next sweep.
    async fn configure_scan_sweep(&self, sweep: &ScanSweep) -> Result<()>;

    /// Start the programmed sweep; with `wait` the call returns once it finished.
    async fn start_scan(&self, wait: bool) -> Result<()>;

    /// Poll [`motor_status`](Self::motor_status) every `poll` until idle.
    async fn wait_until_idle(&self, poll: Duration, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.motor_status().await? == MotorStatus::Idle {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("motors still busy after {:?}", timeout);
            }
            sleep(poll).await;
        }
    }

    /// Release the controller.
    async fn shutdown(&self) -> Result<()>;
}

// =============================================================================
// Analog output
// =============================================================================

/// Finite, hardware-triggered generation of one waveform period.
#[derive(Debug, Clone, PartialEq)]
pub struct FiniteGeneration {
    /// Samples generated per channel on each trigger.
    pub samples_per_channel: usize,
    /// Digital edge starting the generation.
    pub trigger_source: String,
    /// Re-arm after every period so each camera trigger replays the buffer.
    pub retriggerable: bool,
}

/// Multi-channel analog-output board.
#[async_trait]
pub trait AnalogOutput: Send + Sync {
    /// Create `channel_count` voltage channels clocked at `sample_rate_hz`.
    async fn configure_channels(
        &self,
        channel_count: usize,
        sample_rate_hz: f64,
        mode: &FiniteGeneration,
    ) -> Result<()>;

    /// Load one period for every channel.
    async fn write(&self, buffer: &WaveformBuffer) -> Result<()>;

    /// Arm the generation.
    async fn start(&self) -> Result<()>;

    /// Stop the generation.
    async fn stop(&self) -> Result<()>;

    /// Drive every channel to 0 V.
    async fn write_zeros(&self) -> Result<()>;

    /// Release the board.
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Laser, filter wheel, lens
// =============================================================================

/// Multi-line laser source addressed by logical channel.
#[async_trait]
pub trait Laser: Send + Sync {
    /// Put `channel` into digital modulation with analog modulation off.
    async fn prepare_channel(&self, channel: u8) -> Result<()>;

    /// Emission on.
    async fn enable(&self, channel: u8) -> Result<()>;

    /// Emission off.
    async fn disable(&self, channel: u8) -> Result<()>;

    /// Level used while the modulation input is high, in the device's drive unit.
    async fn set_high_drive_level(&self, channel: u8, value: f64) -> Result<()>;

    /// Level used while the modulation input is low, in the device's drive unit.
    async fn set_low_drive_level(&self, channel: u8, value: f64) -> Result<()>;
}

/// Motorized emission filter wheel.
#[async_trait]
pub trait FilterWheel: Send + Sync {
    /// Rotate to `slot` (1-based).
    async fn set_position(&self, slot: u8) -> Result<()>;
}

/// Control source of the tunable lens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensMode {
    /// Focal power follows the analog input.
    Analog,
}

/// Electrically tunable lens.
#[async_trait]
pub trait TunableLens: Send + Sync {
    /// Open the control link.
    async fn connect(&self) -> Result<()>;

    /// Select what drives the focal power.
    async fn set_mode(&self, mode: LensMode) -> Result<()>;

    /// Disconnect; a soft close ramps the lens down first.
    async fn close(&self, soft: bool) -> Result<()>;
}

// =============================================================================
// Camera
// =============================================================================

/// Sensor readout window, 1-based inclusive corners like the camera SDK expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorWindow {
    /// First column.
    pub x0: usize,
    /// First row.
    pub y0: usize,
    /// Last column.
    pub x1: usize,
    /// Last row.
    pub y1: usize,
}

impl SensorWindow {
    /// Full sensor width; `frame_height + 2 * row_margin` rows centred on the sensor.
    pub fn centred(
        sensor_width: usize,
        sensor_height: usize,
        frame_height: usize,
        row_margin: usize,
    ) -> Self {
        let y0 = (sensor_height / 2 + 1)
            .saturating_sub(row_margin + frame_height / 2)
            .max(1);
        Self {
            x0: 1,
            y0,
            x1: sensor_width,
            y1: y0 + frame_height + 2 * row_margin - 1,
        }
    }

    /// Raster width in pixels.
    pub fn width(&self) -> usize {
        self.x1 + 1 - self.x0
    }

    /// Raster height in pixels.
    pub fn height(&self) -> usize {
        self.y1 + 1 - self.y0
    }
}

/// Camera setup for an acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    /// Exposure (ms).
    pub exposure_ms: f64,
    /// Readout window.
    pub window: SensorWindow,
    /// Trigger mode.
    pub trigger_mode: TriggerMode,
    /// Acquire mode.
    pub acquire_mode: AcquireMode,
}

/// Outcome of waiting for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// The frame is in the buffer.
    Ready,
    /// The timeout passed first.
    TimedOut,
}

/// One raster as returned by the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterFrame {
    /// Counts as `[row][column]`.
    pub pixels: Array2<u16>,
}

impl RasterFrame {
    /// Wrap a raster.
    pub fn new(pixels: Array2<u16>) -> Self {
        Self { pixels }
    }

    /// Borrowed pixels.
    pub fn view(&self) -> ArrayView2<'_, u16> {
        self.pixels.view()
    }

    /// Columns.
    pub fn width(&self) -> usize {
        self.pixels.ncols()
    }

    /// Rows.
    pub fn height(&self) -> usize {
        self.pixels.nrows()
    }
}

/// Scientific camera recording into its own frame buffer.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Apply exposure, window and trigger settings.
    async fn configure(&self, settings: &CameraSettings) -> Result<()>;

    /// Begin recording `frames` frames, one per trigger.
    async fn start_acquisition(&self, frames: usize) -> Result<()>;

    /// Wait until frame `index` (0-based) has been recorded.
    async fn wait_for_frame(&self, index: usize, timeout: Duration) -> Result<FrameStatus>;

    /// Copy of a recorded frame.
    async fn frame(&self, index: usize) -> Result<RasterFrame>;

    /// Stop recording.
    async fn stop(&self) -> Result<()>;

    /// Release the camera.
    async fn close(&self) -> Result<()>;
}
