//! Scan configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (see `config/scan.example.toml`)
//! 2. environment variables prefixed with `LSM_`, using `__` between nested keys
//!
//! ```text
//! LSM_CAMERA__EXPOSURE_MS=20.0
//! LSM_EXPERIMENT__OUTPUT_DIR=/scratch/run42
//! LSM_STORAGE__RESOLUTION_LEVELS=3
//! ```
//!
//! Everything is validated once in [`ScanConfig::validate`]; the rest of the crate
//! assumes channel indices are in range and drive parameters are sane.
//!
//! # Example
//!
//! ```no_run
//! use lsm_daq::config::ScanConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ScanConfig::load("config/scan.example.toml")?;
//!     println!("{} wavelengths", config.channels.len());
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::error_recovery::RetryPolicy;
use crate::scan::geometry::{RegionOfInterest, DEFAULT_CHUNK};
use crate::scan::power::PowerCurve;
use crate::scan::wells::WellSelection;

/// Top-level acquisition configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// What to image and where to put it.
    pub experiment: ExperimentConfig,
    /// Camera readout and timing.
    pub camera: CameraConfig,
    /// Analog-output board.
    pub daq: DaqConfig,
    /// Motorized stage.
    pub stage: StageConfig,
    /// Laser source.
    #[serde(default)]
    pub laser: LaserConfig,
    /// Emission filter wheel.
    #[serde(default)]
    pub filter_wheel: DeviceLink,
    /// Electrically tunable lens.
    #[serde(default)]
    pub lens: DeviceLink,
    /// Pyramid layout and codec.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Wavelengths in acquisition order.
    pub channels: Vec<WavelengthChannel>,
}

/// Region, sampling and output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Run name, used for log lines and the output directory.
    pub name: String,
    /// Directory receiving the pyramid and registration files.
    pub output_dir: PathBuf,
    /// Stage region to cover (mm).
    pub roi: RegionOfInterest,
    /// Frame spacing along the scan axis (um).
    pub x_sampling_um: f64,
    /// Lateral tile overlap (px).
    #[serde(default)]
    pub overlap_y_px: f64,
    /// Depth tile overlap (px).
    #[serde(default)]
    pub overlap_z_px: f64,
    /// Light-sheet angle (degrees).
    #[serde(default = "default_theta")]
    pub theta_deg: f64,
    /// Optional multi-well acquisition; `roi` is then the ROI of well 1.
    #[serde(default)]
    pub wells: Option<WellSelection>,
}

/// Camera trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Free-running sequence, paced by the acquire input.
    AutoSequence,
    /// Software trigger per frame.
    Software,
    /// External edge per frame.
    External,
}

/// Camera acquire gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireMode {
    /// Always acquiring.
    Auto,
    /// Gated by the external acquire input.
    External,
}

/// Camera settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Stored frame width (px), along Y.
    pub frame_width: usize,
    /// Stored frame height (px), the tilted depth direction.
    pub frame_height: usize,
    /// Pixel sampling at the sample (um).
    pub pixel_size_um: f64,
    /// Exposure (ms).
    pub exposure_ms: f64,
    /// Line time of the rolling shutter (us).
    #[serde(default = "default_line_time")]
    pub line_time_us: f64,
    /// Full sensor width (px).
    #[serde(default = "default_sensor_size")]
    pub sensor_width: usize,
    /// Full sensor height (px).
    #[serde(default = "default_sensor_size")]
    pub sensor_height: usize,
    /// Extra rows read above and below the stored frame.
    #[serde(default = "default_row_margin")]
    pub row_margin: usize,
    /// Trigger source.
    #[serde(default = "default_trigger")]
    pub trigger_mode: TriggerMode,
    /// Acquire gating.
    #[serde(default = "default_acquire")]
    pub acquire_mode: AcquireMode,
    /// How long to wait for a single frame.
    #[serde(default = "default_frame_timeout", with = "humantime_serde")]
    pub frame_timeout: Duration,
    /// Retry policy for frame stalls.
    #[serde(default)]
    pub stall_retry: RetryPolicy,
}

/// Laser modulation while a tile is exposing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IlluminationMode {
    /// Laser held on for the whole period.
    Continuous,
    /// Laser on only while every row is exposing.
    Strobed,
}

/// Fixed analog-output channel assignments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMap {
    /// Scanning mirror.
    pub x_galvo: usize,
    /// Sheet-positioning mirror.
    pub y_galvo: usize,
    /// Tunable lens control voltage.
    pub etl: usize,
    /// Device-active level.
    pub device_active: usize,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            x_galvo: 0,
            y_galvo: 1,
            etl: 6,
            device_active: 7,
        }
    }
}

/// Additional constant-level output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnableChannel {
    /// Analog-output channel.
    pub channel: usize,
    /// Level (V).
    pub level: f64,
}

/// Safe voltage ranges per channel class, `[low, high]` in volts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageLimits {
    /// Mirror channels.
    #[serde(default = "default_galvo_limits")]
    pub galvo: [f64; 2],
    /// Tunable lens channel.
    #[serde(default = "default_unipolar_limits")]
    pub lens: [f64; 2],
    /// Device-active and enable channels.
    #[serde(default = "default_unipolar_limits")]
    pub enable: [f64; 2],
    /// Laser modulation channels.
    #[serde(default = "default_unipolar_limits")]
    pub laser: [f64; 2],
}

impl Default for VoltageLimits {
    fn default() -> Self {
        Self {
            galvo: default_galvo_limits(),
            lens: default_unipolar_limits(),
            enable: default_unipolar_limits(),
            laser: default_unipolar_limits(),
        }
    }
}

/// Analog-output board settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Board name as the vendor driver knows it.
    #[serde(default = "default_daq_device")]
    pub device: String,
    /// Terminal receiving the camera trigger.
    #[serde(default = "default_trigger_source")]
    pub trigger_source: String,
    /// Sample rate (Hz).
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    /// Output channels written per sample.
    #[serde(default = "default_channel_count")]
    pub channel_count: usize,
    /// Galvo response delay (us).
    #[serde(default = "default_galvo_delay")]
    pub galvo_delay_us: f64,
    /// Settling margin at both ends of the mirror ramp (us).
    #[serde(default = "default_settle_buffer")]
    pub settle_buffer_us: f64,
    /// Margin trimmed from both ends of the strobe window (us).
    #[serde(default = "default_strobe_guard")]
    pub strobe_guard_us: f64,
    /// Laser modulation scheme.
    #[serde(default = "default_illumination")]
    pub illumination: IlluminationMode,
    /// Laser modulation on-level (V).
    #[serde(default = "default_laser_on_level")]
    pub laser_on_level: f64,
    /// Device-active level (V).
    #[serde(default = "default_device_active_level")]
    pub device_active_level: f64,
    /// Fixed channel assignments.
    #[serde(default)]
    pub channels: ChannelMap,
    /// Further constant outputs.
    #[serde(default)]
    pub extra_enables: Vec<EnableChannel>,
    /// Safety limits checked on every synthesized buffer.
    #[serde(default)]
    pub limits: VoltageLimits,
}

/// Stage controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageModel {
    /// ASI Tiger controller.
    Tiger,
    /// ASI MS-2000 controller.
    Ms2000,
}

/// Serial connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLink {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    #[serde(default)]
    pub port: Option<String>,
    /// Baud rate.
    #[serde(default = "default_baud")]
    pub baud_rate: u32,
    /// Read timeout per response.
    #[serde(default = "default_serial_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DeviceLink {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: default_baud(),
            timeout: default_serial_timeout(),
        }
    }
}

/// Per-axis velocities for positioning moves (mm/s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveVelocities {
    /// Scan axis.
    pub x: f64,
    /// Lateral axis.
    pub y: f64,
    /// Depth axis.
    pub z: f64,
}

impl Default for MoveVelocities {
    fn default() -> Self {
        Self {
            x: 1.0,
            y: 1.0,
            z: 0.1,
        }
    }
}

/// Stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Controller family.
    pub model: StageModel,
    /// Serial link.
    #[serde(default)]
    pub link: DeviceLink,
    /// Velocities for positioning moves.
    #[serde(default)]
    pub move_velocity: MoveVelocities,
    /// Acceleration ramp time (ms).
    #[serde(default = "default_acceleration")]
    pub acceleration_ms: f64,
    /// Interval between motor-status polls.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Longest acceptable wait for the motors to go idle.
    #[serde(default = "default_move_timeout", with = "humantime_serde")]
    pub move_timeout: Duration,
}

/// Physical quantity the laser's drive level is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveQuantity {
    /// Optical power (mW).
    Power,
    /// Diode current (mA).
    Current,
}

/// Laser source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Quantity used by every channel's drive values.
    #[serde(default = "default_drive_quantity")]
    pub drive: DriveQuantity,
    /// Serial link.
    #[serde(default)]
    pub link: DeviceLink,
}

impl Default for LaserConfig {
    fn default() -> Self {
        Self {
            drive: default_drive_quantity(),
            link: DeviceLink::default(),
        }
    }
}

/// Parameters of the quantizing codec shared by all channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Codec mode flag passed through to the filter.
    #[serde(default = "default_codec_mode")]
    pub mode: u32,
    /// Camera conversion gain (DN per photoelectron).
    #[serde(default = "default_codec_gain")]
    pub gain: f64,
    /// Dark offset (DN).
    #[serde(default)]
    pub background: u32,
    /// Read noise (photoelectrons).
    #[serde(default = "default_read_noise")]
    pub read_noise: f64,
    /// Environment variable naming the runtime that ships the filter plugin.
    #[serde(default)]
    pub environment_variable: Option<String>,
    /// Required value of `environment_variable`.
    #[serde(default)]
    pub required_environment: Option<String>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            mode: default_codec_mode(),
            gain: default_codec_gain(),
            background: 0,
            read_noise: default_read_noise(),
            environment_variable: None,
            required_environment: None,
        }
    }
}

/// Pyramid layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Resolution levels, each halving every axis.
    #[serde(default = "default_levels")]
    pub resolution_levels: usize,
    /// Chunk target along (frames, rows, columns).
    #[serde(default = "default_chunk")]
    pub chunk: [usize; 3],
    /// Pyramid file name inside the output directory.
    #[serde(default = "default_data_file")]
    pub data_file: String,
    /// Registration document name inside the output directory.
    #[serde(default = "default_registration_file")]
    pub registration_file: String,
    /// Quantizing codec.
    #[serde(default)]
    pub codec: CodecConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            resolution_levels: default_levels(),
            chunk: default_chunk(),
            data_file: default_data_file(),
            registration_file: default_registration_file(),
            codec: CodecConfig::default(),
        }
    }
}

/// Mirror drive in the min/max/peak-to-peak form used at the rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalvoDrive {
    /// Lower calibration bound (V).
    pub min: f64,
    /// Upper calibration bound (V).
    pub max: f64,
    /// Sweep amplitude, peak to peak (V).
    pub peak_to_peak: f64,
}

impl GalvoDrive {
    /// Centre voltage.
    pub fn offset(&self) -> f64 {
        (self.max + self.min) / 2.0
    }

    /// Half the peak-to-peak sweep.
    pub fn amplitude(&self) -> f64 {
        self.peak_to_peak / 2.0
    }
}

/// One illumination wavelength and everything that depends on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WavelengthChannel {
    /// Label, conventionally the wavelength in nm.
    pub name: String,
    /// Analog-output channel modulating this laser line.
    pub daq_channel: usize,
    /// Logical channel on the laser controller.
    pub laser_channel: u8,
    /// Filter wheel slot (1-6).
    pub filter_slot: u8,
    /// Drive at the surface, in the laser's drive quantity.
    pub nominal_drive: f64,
    /// Upper bound of the drive quantity.
    pub max_drive: f64,
    /// Lower bound of the drive quantity.
    #[serde(default)]
    pub min_drive: f64,
    /// Attenuation length (mm).
    pub attenuation_mm: f64,
    /// Scanning mirror drive.
    pub x_galvo: GalvoDrive,
    /// Sheet-positioning mirror drive.
    pub y_galvo: GalvoDrive,
    /// Tunable lens voltage.
    pub etl_volts: f64,
    /// Quantization step in units of noise; `None` stores losslessly.
    #[serde(default)]
    pub quant_sigma: Option<f64>,
    /// Measured power curve, used when driving in power.
    #[serde(default)]
    pub power_curve: Option<PowerCurve>,
    /// Diode current ceiling (mA) for setpoints derived from the power curve.
    #[serde(default)]
    pub max_current_ma: Option<f64>,
}

fn default_theta() -> f64 {
    45.0
}
fn default_line_time() -> f64 {
    9.76
}
fn default_sensor_size() -> usize {
    2048
}
fn default_row_margin() -> usize {
    2
}
fn default_trigger() -> TriggerMode {
    TriggerMode::AutoSequence
}
fn default_acquire() -> AcquireMode {
    AcquireMode::External
}
fn default_frame_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_galvo_limits() -> [f64; 2] {
    [-5.0, 5.0]
}
fn default_unipolar_limits() -> [f64; 2] {
    [0.0, 5.0]
}
fn default_daq_device() -> String {
    "Dev1".into()
}
fn default_trigger_source() -> String {
    "/Dev1/PFI0".into()
}
fn default_sample_rate() -> f64 {
    4.0e5
}
fn default_channel_count() -> usize {
    32
}
fn default_galvo_delay() -> f64 {
    365.0
}
fn default_settle_buffer() -> f64 {
    50.0
}
fn default_strobe_guard() -> f64 {
    125.0
}
fn default_illumination() -> IlluminationMode {
    IlluminationMode::Strobed
}
fn default_laser_on_level() -> f64 {
    5.0
}
fn default_device_active_level() -> f64 {
    3.0
}
fn default_baud() -> u32 {
    115_200
}
fn default_serial_timeout() -> Duration {
    Duration::from_secs(1)
}
fn default_acceleration() -> f64 {
    100.0
}
fn default_poll_interval() -> Duration {
    Duration::from_millis(50)
}
fn default_move_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_drive_quantity() -> DriveQuantity {
    DriveQuantity::Current
}
fn default_codec_mode() -> u32 {
    1
}
fn default_codec_gain() -> f64 {
    2.1845
}
fn default_read_noise() -> f64 {
    1.5
}
fn default_levels() -> usize {
    4
}
fn default_chunk() -> [usize; 3] {
    DEFAULT_CHUNK
}
fn default_data_file() -> String {
    "data.h5".into()
}
fn default_registration_file() -> String {
    "data.xml".into()
}

impl ScanConfig {
    /// Load from a TOML file with `LSM_` environment overrides, then validate.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let config: ScanConfig = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LSM_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string without environment overrides, then validate.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let config: ScanConfig = Figment::from(Toml::string(toml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Pyramid file path.
    pub fn data_path(&self) -> PathBuf {
        self.experiment.output_dir.join(&self.storage.data_file)
    }

    /// Registration document path.
    pub fn registration_path(&self) -> PathBuf {
        self.experiment
            .output_dir
            .join(&self.storage.registration_file)
    }

    /// Look up a wavelength by label.
    pub fn channel(&self, name: &str) -> Option<&WavelengthChannel> {
        self.channels.iter().find(|c| c.name == name)
    }

    /// One acquisition per selected well, each with its ROI moved onto the well and
    /// its own output sub-directory. Without a well selection this is just `self`.
    pub fn well_runs(&self) -> Vec<(Option<u32>, ScanConfig)> {
        let Some(wells) = &self.experiment.wells else {
            return vec![(None, self.clone())];
        };
        wells
            .numbers
            .iter()
            .map(|&number| {
                let mut config = self.clone();
                config.experiment.roi = wells.roi_for(number, &self.experiment.roi);
                config.experiment.output_dir = self
                    .experiment
                    .output_dir
                    .join(WellSelection::directory_name(number));
                config.experiment.wells = None;
                (Some(number), config)
            })
            .collect()
    }

    /// Check everything that does not need hardware.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |msg: String| Err(DaqError::Configuration(msg));

        if self.channels.is_empty() {
            return fail("at least one wavelength channel is required".into());
        }
        let positive = [
            ("experiment.x_sampling_um", self.experiment.x_sampling_um),
            ("camera.pixel_size_um", self.camera.pixel_size_um),
            ("camera.exposure_ms", self.camera.exposure_ms),
            ("camera.line_time_us", self.camera.line_time_us),
            ("daq.sample_rate_hz", self.daq.sample_rate_hz),
            ("stage.move_velocity.x", self.stage.move_velocity.x),
            ("stage.move_velocity.y", self.stage.move_velocity.y),
            ("stage.move_velocity.z", self.stage.move_velocity.z),
        ];
        for (key, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return fail(format!("{} must be positive, got {}", key, value));
            }
        }
        if self.camera.frame_width == 0 || self.camera.frame_height == 0 {
            return fail("camera frame dimensions must be non-zero".into());
        }
        if self.camera.frame_width > self.camera.sensor_width
            || self.camera.frame_height + 2 * self.camera.row_margin > self.camera.sensor_height
        {
            return fail(format!(
                "camera frame {}x{} (+{} margin rows) does not fit the {}x{} sensor",
                self.camera.frame_width,
                self.camera.frame_height,
                self.camera.row_margin,
                self.camera.sensor_width,
                self.camera.sensor_height
            ));
        }
        if !(0.0..90.0).contains(&self.experiment.theta_deg) {
            return fail(format!(
                "experiment.theta_deg must be in [0, 90), got {}",
                self.experiment.theta_deg
            ));
        }
        if !(1..=8).contains(&self.storage.resolution_levels) {
            return fail(format!(
                "storage.resolution_levels must be between 1 and 8, got {}",
                self.storage.resolution_levels
            ));
        }
        if self.storage.chunk.iter().any(|&c| c == 0) {
            return fail("storage.chunk entries must be non-zero".into());
        }

        let map = &self.daq.channels;
        let mut used = HashSet::new();
        let fixed = [
            ("x_galvo", map.x_galvo),
            ("y_galvo", map.y_galvo),
            ("etl", map.etl),
            ("device_active", map.device_active),
        ];
        let lasers = self
            .channels
            .iter()
            .map(|c| (c.name.as_str(), c.daq_channel));
        let enables = self.daq.extra_enables.iter().map(|e| ("enable", e.channel));
        for (name, index) in fixed.into_iter().chain(lasers).chain(enables) {
            if index >= self.daq.channel_count {
                return fail(format!(
                    "analog channel {} for {} is outside the {} configured channels",
                    index, name, self.daq.channel_count
                ));
            }
            if !used.insert(index) {
                return fail(format!("analog channel {} is assigned twice ({})", index, name));
            }
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if !names.insert(channel.name.as_str()) {
                return fail(format!("wavelength '{}' is listed twice", channel.name));
            }
            if !(1..=6).contains(&channel.filter_slot) {
                return fail(format!(
                    "wavelength '{}': filter slot {} is not in 1-6",
                    channel.name, channel.filter_slot
                ));
            }
            if channel.nominal_drive <= 0.0 || channel.attenuation_mm <= 0.0 {
                return fail(format!(
                    "wavelength '{}': nominal drive and attenuation must be positive",
                    channel.name
                ));
            }
            if channel.min_drive < 0.0 || channel.max_drive <= channel.min_drive {
                return fail(format!(
                    "wavelength '{}': drive limits [{}, {}] are not a range",
                    channel.name, channel.min_drive, channel.max_drive
                ));
            }
            for (axis, galvo) in [("x", &channel.x_galvo), ("y", &channel.y_galvo)] {
                if galvo.min > galvo.max || galvo.peak_to_peak < 0.0 {
                    return fail(format!(
                        "wavelength '{}': {} galvo min/max/peak_to_peak are inconsistent",
                        channel.name, axis
                    ));
                }
            }
            if self.laser.drive == DriveQuantity::Power {
                if channel.power_curve.is_none() {
                    return fail(format!(
                        "wavelength '{}': laser.drive = \"power\" needs a power_curve to convert power to current",
                        channel.name
                    ));
                }
                match channel.max_current_ma {
                    Some(ceiling) if ceiling > 0.0 => {}
                    _ => {
                        return fail(format!(
                            "wavelength '{}': laser.drive = \"power\" needs a positive max_current_ma",
                            channel.name
                        ))
                    }
                }
            }
            if let Some(sigma) = channel.quant_sigma {
                if sigma.is_nan() || sigma <= 0.0 {
                    return fail(format!(
                        "wavelength '{}': quant_sigma must be positive",
                        channel.name
                    ));
                }
            }
        }

        if let Some(wells) = &self.experiment.wells {
            wells.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::scan::geometry::AxisRange;

    pub(crate) fn sample_channel(name: &str, daq_channel: usize) -> WavelengthChannel {
        WavelengthChannel {
            name: name.to_string(),
            daq_channel,
            laser_channel: 1,
            filter_slot: 2,
            nominal_drive: 40.0,
            max_drive: 96.0,
            min_drive: 0.0,
            attenuation_mm: 1000.0,
            x_galvo: GalvoDrive {
                min: -5.15,
                max: 5.0,
                peak_to_peak: 1.2,
            },
            y_galvo: GalvoDrive {
                min: -2.0,
                max: 2.425,
                peak_to_peak: 0.024,
            },
            etl_volts: 2.45,
            quant_sigma: None,
            power_curve: None,
            max_current_ma: None,
        }
    }

    pub(crate) fn sample_config() -> ScanConfig {
        let mut second = sample_channel("561", 11);
        second.laser_channel = 3;
        second.filter_slot = 4;
        ScanConfig {
            experiment: ExperimentConfig {
                name: "unit".into(),
                output_dir: PathBuf::from("/tmp/lsm_daq_unit"),
                roi: RegionOfInterest {
                    x: AxisRange::new(0.0, 0.1),
                    y: AxisRange::new(0.0, 1.0),
                    z: AxisRange::new(0.0, 0.1),
                },
                x_sampling_um: 0.3846,
                overlap_y_px: 30.0,
                overlap_z_px: 30.0,
                theta_deg: 45.0,
                wells: None,
            },
            camera: CameraConfig {
                frame_width: 2048,
                frame_height: 256,
                pixel_size_um: 0.3846,
                exposure_ms: 10.0,
                line_time_us: 9.76,
                sensor_width: 2048,
                sensor_height: 2048,
                row_margin: 2,
                trigger_mode: TriggerMode::AutoSequence,
                acquire_mode: AcquireMode::External,
                frame_timeout: Duration::from_secs(2),
                stall_retry: RetryPolicy::default(),
            },
            daq: DaqConfig {
                device: default_daq_device(),
                trigger_source: default_trigger_source(),
                sample_rate_hz: 4.0e5,
                channel_count: 32,
                galvo_delay_us: 365.0,
                settle_buffer_us: 50.0,
                strobe_guard_us: 125.0,
                illumination: IlluminationMode::Strobed,
                laser_on_level: 5.0,
                device_active_level: 3.0,
                channels: ChannelMap::default(),
                extra_enables: Vec::new(),
                limits: VoltageLimits::default(),
            },
            stage: StageConfig {
                model: StageModel::Tiger,
                link: DeviceLink::default(),
                move_velocity: MoveVelocities::default(),
                acceleration_ms: 100.0,
                poll_interval: Duration::from_millis(1),
                move_timeout: Duration::from_secs(5),
            },
            laser: LaserConfig::default(),
            filter_wheel: DeviceLink::default(),
            lens: DeviceLink::default(),
            storage: StorageConfig::default(),
            channels: vec![sample_channel("488", 9), second],
        }
    }

    const MINIMAL: &str = r#"
        [experiment]
        name = "brain"
        output_dir = "/data/brain"
        x_sampling_um = 0.3846
        overlap_y_px = 30
        overlap_z_px = 30
        roi = { x = { min = 0.0, max = 1.0 }, y = { min = 0.0, max = 0.5 }, z = { min = 0.0, max = 0.1 } }

        [camera]
        frame_width = 2048
        frame_height = 256
        pixel_size_um = 0.3846
        exposure_ms = 10.0
        frame_timeout = "500ms"

        [daq]

        [stage]
        model = "ms2000"

        [[channels]]
        name = "488"
        daq_channel = 9
        laser_channel = 1
        filter_slot = 2
        nominal_drive = 40.0
        max_drive = 96.0
        attenuation_mm = 1000.0
        etl_volts = 2.45
        quant_sigma = 1.0
        x_galvo = { min = -5.15, max = 5.0, peak_to_peak = 1.2 }
        y_galvo = { min = -2.0, max = 2.425, peak_to_peak = 0.024 }
    "#;

    #[test]
    fn minimal_file_fills_defaults() {
        let config = ScanConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.stage.model, StageModel::Ms2000);
        assert_eq!(config.daq.sample_rate_hz, 4.0e5);
        assert_eq!(config.daq.channels, ChannelMap::default());
        assert_eq!(config.camera.frame_timeout, Duration::from_millis(500));
        assert_eq!(config.storage.resolution_levels, 4);
        assert_eq!(config.storage.chunk, [256, 16, 256]);
        assert_eq!(config.laser.drive, DriveQuantity::Current);
        assert_eq!(config.channels[0].quant_sigma, Some(1.0));
        assert_eq!(config.data_path(), PathBuf::from("/data/brain/data.h5"));
    }

    #[test]
    fn sample_config_is_valid() {
        sample_config().validate().unwrap();
    }

    #[test]
    fn duplicate_analog_channel_is_rejected() {
        let mut config = sample_config();
        config.channels[1].daq_channel = config.daq.channels.etl;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("assigned twice"));
    }

    #[test]
    fn channel_outside_board_is_rejected() {
        let mut config = sample_config();
        config.channels[0].daq_channel = 40;
        assert!(config.validate().is_err());
    }

    #[test]
    fn filter_slot_must_exist() {
        let mut config = sample_config();
        config.channels[0].filter_slot = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn power_drive_needs_curve_and_current_ceiling() {
        let mut config = sample_config();
        config.laser.drive = DriveQuantity::Power;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("needs a power_curve"));

        for channel in &mut config.channels {
            channel.power_curve =
                Some(PowerCurve::new(vec![0.0, 100.0], vec![0.0, 500.0], 1.0, 0.0).unwrap());
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_current_ma"));

        for channel in &mut config.channels {
            channel.max_current_ma = Some(500.0);
        }
        config.validate().unwrap();
    }

    #[test]
    fn wells_split_into_separate_runs() {
        let mut config = sample_config();
        assert_eq!(config.well_runs().len(), 1);

        config.experiment.wells = Some(WellSelection {
            numbers: vec![1, 5],
            pitch_mm: 8.0,
            columns: 3,
            capacity: 12,
        });
        let runs = config.well_runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, Some(1));
        assert_eq!(runs[0].1.experiment.roi, config.experiment.roi);
        let (number, fifth) = &runs[1];
        assert_eq!(*number, Some(5));
        assert_eq!(
            fifth.experiment.output_dir,
            PathBuf::from("/tmp/lsm_daq_unit/well_05")
        );
        assert!((fifth.experiment.roi.x.min - 8.0).abs() < 1e-12);
        assert!((fifth.experiment.roi.y.min + 8.0).abs() < 1e-12);
        assert!(fifth.experiment.wells.is_none());
    }

    #[test]
    fn power_curve_is_validated_while_parsing() {
        let broken = format!(
            "{}\npower_curve = {{ power_mw = [0.0, 5.0, 4.0], current_ma = [0.0, 1.0, 2.0] }}\n",
            MINIMAL.trim_end()
        );
        assert!(ScanConfig::from_toml_str(&broken).is_err());

        let good = format!(
            "{}\npower_curve = {{ power_mw = [0.0, 5.0, 40.0], current_ma = [10.0, 100.0, 900.0] }}\n",
            MINIMAL.trim_end()
        );
        let config = ScanConfig::from_toml_str(&good).unwrap();
        let curve = config.channels[0].power_curve.as_ref().unwrap();
        assert_eq!(curve.max_power(), 40.0);
    }
}
