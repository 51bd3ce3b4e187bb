//! The acquisition state machine.
//!
//! ```text
//! Idle -> GeometryComputed -> HardwareArmed
//!      -> { Positioning -> WaveformArmed -> Exposing -> Draining }*
//!      -> HardwareDisarmed -> Done
//! ```
//!
//! `Aborted` is reachable from every active state. Everything that can be checked
//! without hardware (geometry, laser limits, waveforms, codec environment, the
//! registration document and the pyramid layout) is done before the first device is
//! opened. Devices are then armed through a [`Rig`], the nested tile loop runs, and the
//! rig is released in reverse order whether the loop finished or not.
//!
//! Only this module decides between retrying and aborting: frame stalls are retried
//! per the camera's [`RetryPolicy`](crate::error_recovery::RetryPolicy), every other
//! failure ends the run with [`DaqError::ScanAborted`] carrying the loop position.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ndarray::Axis as FrameAxis;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ScanConfig, WavelengthChannel};
use crate::data::codec::CodecEnvironmentGuard;
use crate::data::pyramid::{PyramidBackend, PyramidSpec, PyramidStore};
use crate::data::ring_buffer::{FrameCrop, FrameRing, PreviewFrame};
use crate::error::{AppResult, DaqError, DeviceKind, DeviceResultExt, ScanPosition};
use crate::error_recovery::{retry_transient, Attempt, Recoverable};
use crate::instrument::{Axis, Camera, FrameStatus, RasterFrame, ScanSweep};
use crate::scan::geometry::{GeometryInput, VolumeGeometry};
use crate::scan::plan::{TilePlan, TileStep};
use crate::scan::power::PowerCompensator;
use crate::scan::registration::RegistrationLayout;
use crate::scan::rig::{ArmSettings, DeviceFactory, Rig};
use crate::scan::waveform::{WaveformBuffer, WaveformSynthesizer};

/// Name of the run summary written next to the pyramid.
pub const REPORT_FILE: &str = "scan_report.json";

/// Where the acquisition is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Nothing derived yet.
    Idle,
    /// Geometry, plan and waveforms are ready.
    GeometryComputed,
    /// Every device opened and set up.
    HardwareArmed,
    /// Stage moving to the next tile.
    Positioning,
    /// Waveform written and generation started.
    WaveformArmed,
    /// Stage scanning while the camera records.
    Exposing,
    /// Camera frames moving into the pyramid.
    Draining,
    /// Every device released.
    HardwareDisarmed,
    /// All tiles acquired.
    Done,
    /// Stopped by cancellation or an error.
    Aborted,
}

// =============================================================================
// Cancellation
// =============================================================================

/// Requests cancellation of a running acquisition.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Ask the sequencer to stop at the next check.
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }
}

/// Observed by the sequencer at every tile boundary and every drained frame.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: Option<watch::Receiver<bool>>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self { receiver: None }
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.receiver.as_ref().is_some_and(|r| *r.borrow())
    }
}

/// A connected handle/token pair.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (sender, receiver) = watch::channel(false);
    (
        CancelHandle {
            sender: Arc::new(sender),
        },
        CancelToken {
            receiver: Some(receiver),
        },
    )
}

// =============================================================================
// Pre-flight
// =============================================================================

/// Laser drive range of one wavelength over the acquired depth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveRange {
    /// Wavelength name.
    pub wavelength: String,
    /// Drive at the surface.
    pub surface: f64,
    /// Drive one plane past the deepest acquired plane.
    pub deepest: f64,
    /// Device-safe limit the deepest drive was checked against.
    pub limit: f64,
}

/// Everything derived from the configuration before any device is touched.
#[derive(Debug, Clone)]
pub struct PreparedScan {
    /// Volume geometry.
    pub geometry: VolumeGeometry,
    /// Tile visiting order.
    pub plan: TilePlan,
    /// Drive range per wavelength, in configuration order.
    pub drives: Vec<DriveRange>,
    /// One waveform period per wavelength, in configuration order.
    pub waveforms: Vec<WaveformBuffer>,
    /// Samples per channel in one period.
    pub samples_per_period: usize,
    /// Output pyramid layout.
    pub pyramid: PyramidSpec,
    /// Registration document layout.
    pub registration: RegistrationLayout,
}

impl PreparedScan {
    /// Run every check that needs no hardware.
    pub fn prepare(config: &ScanConfig) -> AppResult<Self> {
        config.validate()?;
        let geometry = VolumeGeometry::compute(&GeometryInput::from_config(config))?;
        let plan = TilePlan::new(&geometry, config.channels.len());

        let compensator = PowerCompensator::new(config.laser.drive);
        let mut drives = Vec::with_capacity(config.channels.len());
        for channel in &config.channels {
            let deepest = compensator.preflight(channel, geometry.z_tiles, geometry.z_width)?;
            drives.push(DriveRange {
                wavelength: channel.name.clone(),
                surface: channel.nominal_drive,
                deepest,
                limit: compensator.limit(channel),
            });
        }

        let synthesizer = WaveformSynthesizer::from_config(config);
        let samples_per_period = synthesizer.samples_per_period()?;
        let waveforms = config
            .channels
            .iter()
            .map(|channel| synthesizer.synthesize(channel))
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            pyramid: PyramidSpec::from_config(config, &geometry),
            registration: RegistrationLayout::new(config, &geometry),
            geometry,
            plan,
            drives,
            waveforms,
            samples_per_period,
        })
    }

    /// Sweep time of every tile, without stage moves between tiles.
    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs_f64(self.geometry.sweep_duration_s() * self.plan.len() as f64)
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Operator choices for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Continue when the codec runtime environment does not match.
    pub allow_codec_env_mismatch: bool,
}

/// Summary of a finished acquisition, written as `scan_report.json`.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    /// Unique id of this run.
    pub run_id: Uuid,
    /// Acquisition name.
    pub name: String,
    /// Wall-clock start.
    pub started_at: DateTime<Utc>,
    /// Wall-clock end.
    pub finished_at: DateTime<Utc>,
    /// Seconds between start and end.
    pub elapsed_s: f64,
    /// Volume geometry.
    pub geometry: VolumeGeometry,
    /// Tiles fully written.
    pub tiles_completed: usize,
    /// Tiles in the plan.
    pub tiles_total: usize,
    /// Frames written to level 0.
    pub frames_written: usize,
    /// Pyramid file.
    pub data_file: PathBuf,
    /// Registration document.
    pub registration_file: PathBuf,
}

/// Waits for one frame; a timeout is the transient condition.
struct FrameWait<'a> {
    camera: &'a dyn Camera,
    frame: usize,
    timeout: Duration,
}

#[async_trait]
impl Recoverable for FrameWait<'_> {
    type Output = RasterFrame;

    async fn attempt(&mut self) -> Result<Attempt<RasterFrame>, DaqError> {
        match self
            .camera
            .wait_for_frame(self.frame, self.timeout)
            .await
            .device_err(DeviceKind::Camera, "wait_for_frame")?
        {
            FrameStatus::TimedOut => Ok(Attempt::Transient),
            FrameStatus::Ready => {
                let raster = self
                    .camera
                    .frame(self.frame)
                    .await
                    .device_err(DeviceKind::Camera, "frame")?;
                Ok(Attempt::Done(raster))
            }
        }
    }

    fn describe(&self) -> String {
        format!("wait for frame {}", self.frame)
    }
}

/// Keep the first error, log the ones after it.
fn keep_first(first: &mut Option<DaqError>, result: AppResult<()>) {
    if let Err(err) = result {
        match first {
            None => *first = Some(err),
            Some(_) => warn!("Further error while disarming tile: {}", err),
        }
    }
}

/// Drives one acquisition from pre-flight to release.
pub struct ScanSequencer<B> {
    config: ScanConfig,
    prepared: PreparedScan,
    store: PyramidStore<B>,
    ring: FrameRing,
    options: RunOptions,
    cancel: CancelToken,
    compensator: PowerCompensator,
    state: ScanState,
    transitions: Vec<ScanState>,
    tiles_completed: usize,
    frames_written: usize,
    current_frame: Option<usize>,
}

impl<B: PyramidBackend> ScanSequencer<B> {
    /// Run the pre-flight for `config`; nothing is opened or written yet.
    pub fn new(
        config: ScanConfig,
        backend: B,
        options: RunOptions,
        cancel: CancelToken,
    ) -> AppResult<Self> {
        let prepared = PreparedScan::prepare(&config)?;
        let window = ArmSettings::from_config(&config, prepared.samples_per_period)
            .camera
            .window;
        let geometry = &prepared.geometry;
        let ring = FrameRing::new(
            geometry
                .block_size
                .next_multiple_of(prepared.pyramid.frame_alignment()),
            geometry.frame_height,
            geometry.frame_width,
            FrameCrop::centred(window.width(), geometry.frame_width, config.camera.row_margin),
        );
        info!(
            "Scan '{}': {} tiles of {} frames ({} x {} planes x {} wavelengths), ~{:.0?} of sweeping",
            config.experiment.name,
            prepared.plan.len(),
            geometry.frames_per_tile,
            geometry.y_tiles,
            geometry.z_tiles,
            config.channels.len(),
            prepared.estimated_duration()
        );
        Ok(Self {
            compensator: PowerCompensator::new(config.laser.drive),
            config,
            prepared,
            store: PyramidStore::new(backend),
            ring,
            options,
            cancel,
            state: ScanState::GeometryComputed,
            transitions: vec![ScanState::Idle, ScanState::GeometryComputed],
            tiles_completed: 0,
            frames_written: 0,
            current_frame: None,
        })
    }

    /// Receive every `nth_frame` drained frame for live display.
    pub fn add_preview_tap(&mut self, nth_frame: usize) -> mpsc::Receiver<PreviewFrame> {
        self.ring.add_tap("preview", nth_frame)
    }

    /// Current state.
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[ScanState] {
        &self.transitions
    }

    /// The checks and layouts computed at construction.
    pub fn prepared(&self) -> &PreparedScan {
        &self.prepared
    }

    /// The pyramid store being written.
    pub fn store(&self) -> &PyramidStore<B> {
        &self.store
    }

    fn transition(&mut self, next: ScanState) {
        if self.state != next {
            debug!("Scan state {:?} -> {:?}", self.state, next);
        }
        self.state = next;
        self.transitions.push(next);
    }

    fn position_of(&self, step: &TileStep) -> ScanPosition {
        ScanPosition {
            depth_plane: step.depth_plane,
            lateral_tile: step.lateral_tile,
            wavelength: self.config.channels[step.wavelength].name.clone(),
            tile_index: step.tile_index,
            frame: self.current_frame,
        }
    }

    /// Run the acquisition with devices from `factory`.
    pub async fn run(&mut self, factory: &dyn DeviceFactory) -> AppResult<ScanReport> {
        let started_at = Utc::now();
        let clock = Instant::now();

        if let Err(err) = self.prepare_output() {
            error!("Output preparation failed: {}", err);
            self.transition(ScanState::Aborted);
            return Err(err);
        }

        let arm = ArmSettings::from_config(&self.config, self.prepared.samples_per_period);
        let mut rig = match Rig::arm(factory, &self.config, &arm).await {
            Ok(rig) => rig,
            Err(err) => {
                self.transition(ScanState::Aborted);
                return Err(err);
            }
        };
        self.transition(ScanState::HardwareArmed);

        let outcome = self.acquire(&rig).await;
        if let Err(err) = &outcome {
            error!("Acquisition aborted: {}", err);
        }

        let released = rig.release().await;
        self.transition(ScanState::HardwareDisarmed);
        let flushed = self.store.flush();

        let result = outcome.and(released).and(flushed);
        if let Err(err) = result {
            self.transition(ScanState::Aborted);
            return Err(err);
        }

        let report = ScanReport {
            run_id: Uuid::new_v4(),
            name: self.config.experiment.name.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_s: clock.elapsed().as_secs_f64(),
            geometry: self.prepared.geometry.clone(),
            tiles_completed: self.tiles_completed,
            tiles_total: self.prepared.plan.len(),
            frames_written: self.frames_written,
            data_file: self.config.data_path(),
            registration_file: self.config.registration_path(),
        };
        self.write_report(&report)?;
        self.transition(ScanState::Done);
        info!(
            "Scan '{}' finished: {} tiles, {} frames in {:.1} s",
            report.name, report.tiles_completed, report.frames_written, report.elapsed_s
        );
        Ok(report)
    }

    /// Output directory, codec guard, registration document and pyramid layout.
    fn prepare_output(&mut self) -> AppResult<()> {
        std::fs::create_dir_all(&self.config.experiment.output_dir)?;
        let guard = CodecEnvironmentGuard::new(
            &self.config.storage.codec,
            self.options.allow_codec_env_mismatch,
        );
        self.store.initialize(&self.prepared.pyramid, &guard)?;
        self.prepared
            .registration
            .write_to(&self.config.registration_path())?;
        Ok(())
    }

    fn write_report(&self, report: &ScanReport) -> AppResult<()> {
        let path = self.config.experiment.output_dir.join(REPORT_FILE);
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| DaqError::Storage(format!("cannot serialize run report: {}", e)))?;
        std::fs::write(&path, json)?;
        debug!("Run report written to {}", path.display());
        Ok(())
    }

    /// The nested tile loop.
    async fn acquire(&mut self, rig: &Rig) -> AppResult<()> {
        let plan = self.prepared.plan;
        for step in plan.steps() {
            if self.cancel.is_cancelled() {
                return Err(DaqError::ScanAborted {
                    position: self.position_of(&step),
                    source: Box::new(DaqError::Cancelled),
                });
            }
            let started = Instant::now();
            self.current_frame = None;
            if let Err(err) = self.acquire_tile(rig, &step).await {
                return Err(DaqError::ScanAborted {
                    position: self.position_of(&step),
                    source: Box::new(err),
                });
            }
            self.tiles_completed += 1;

            let took = started.elapsed();
            let remaining = plan.remaining_after(&step);
            let eta = took.mul_f64(remaining as f64);
            info!(
                "Tile {}/{} (plane {}, tile {}, {} nm) took {:.1} s; {} left, ETA {:.0?}",
                step.ordinal + 1,
                plan.len(),
                step.depth_plane,
                step.lateral_tile,
                self.config.channels[step.wavelength].name,
                took.as_secs_f64(),
                remaining,
                eta
            );
        }
        Ok(())
    }

    async fn acquire_tile(&mut self, rig: &Rig, step: &TileStep) -> AppResult<()> {
        let channel = self.config.channels[step.wavelength].clone();
        let geometry = &self.prepared.geometry;
        let depth = geometry.depth_position(step.depth_plane);
        let lateral = geometry.lateral_position(step.lateral_tile);
        let (sweep_start, sweep_end) = geometry.scan_sweep();
        let scan_speed = geometry.scan_speed_mm_s;
        let z_width = geometry.z_width;
        let velocities = self.config.stage.move_velocity.clone();

        self.transition(ScanState::Positioning);
        let stage = rig.stage()?;
        for (axis, velocity, target) in [
            (Axis::Z, velocities.z, depth),
            (Axis::Y, velocities.y, lateral),
            (Axis::X, velocities.x, sweep_start),
        ] {
            stage
                .set_velocity(axis, velocity)
                .await
                .device_err(DeviceKind::Stage, "set_velocity")?;
            stage
                .go_absolute(axis, target, false)
                .await
                .device_err(DeviceKind::Stage, "go_absolute")?;
        }
        rig.filter_wheel()?
            .set_position(channel.filter_slot)
            .await
            .device_err(DeviceKind::FilterWheel, "set_position")?;

        let drive = self
            .compensator
            .drive_for_plane(&channel, step.depth_plane, z_width)?;
        debug!(
            "{} nm at plane {}: drive {:.3} (device value {:.3})",
            channel.name, step.depth_plane, drive.requested, drive.device_value
        );
        rig.laser()?
            .set_high_drive_level(channel.laser_channel, drive.device_value)
            .await
            .device_err(DeviceKind::Laser, "set_high_drive_level")?;

        self.transition(ScanState::WaveformArmed);
        rig.analog()?
            .write(&self.prepared.waveforms[step.wavelength])
            .await
            .device_err(DeviceKind::AnalogOutput, "write")?;
        stage
            .configure_scan_sweep(&ScanSweep {
                start_mm: sweep_start,
                end_mm: sweep_end,
                slow_axis_mm: lateral,
            })
            .await
            .device_err(DeviceKind::Stage, "configure_scan_sweep")?;
        stage
            .wait_until_idle(self.config.stage.poll_interval, self.config.stage.move_timeout)
            .await
            .device_err(DeviceKind::Stage, "wait_until_idle")?;
        for axis in Axis::ALL {
            stage
                .set_velocity(axis, scan_speed)
                .await
                .device_err(DeviceKind::Stage, "set_velocity")?;
        }

        let exposure = self.expose_and_drain(rig, step, &channel).await;
        let disarm = Self::disarm_tile(rig, channel.laser_channel).await;
        match exposure {
            Err(err) => {
                if let Err(cleanup) = disarm {
                    warn!("Cleanup after failed tile also failed: {}", cleanup);
                }
                Err(err)
            }
            Ok(()) => disarm,
        }
    }

    async fn expose_and_drain(
        &mut self,
        rig: &Rig,
        step: &TileStep,
        channel: &WavelengthChannel,
    ) -> AppResult<()> {
        let frames = self.prepared.geometry.frames_per_tile;
        let camera = rig.camera()?;

        self.transition(ScanState::Exposing);
        rig.analog()?
            .start()
            .await
            .device_err(DeviceKind::AnalogOutput, "start")?;
        camera
            .start_acquisition(frames)
            .await
            .device_err(DeviceKind::Camera, "start_acquisition")?;
        rig.stage()?
            .start_scan(false)
            .await
            .device_err(DeviceKind::Stage, "start_scan")?;
        rig.laser()?
            .enable(channel.laser_channel)
            .await
            .device_err(DeviceKind::Laser, "enable")?;

        self.transition(ScanState::Draining);
        self.ring.begin_tile(step.tile_index);
        let policy = self.config.camera.stall_retry.clone();
        for frame in 0..frames {
            self.current_frame = Some(frame);
            if self.cancel.is_cancelled() {
                return Err(DaqError::Cancelled);
            }
            let mut wait = FrameWait {
                camera,
                frame,
                timeout: self.config.camera.frame_timeout,
            };
            let raster = retry_transient(&mut wait, &policy)
                .await?
                .ok_or(DaqError::FrameStall {
                    frame,
                    attempts: policy.max_attempts.max(1),
                })?;
            let full = self.ring.push(raster.view())?;
            if full || frame + 1 == frames {
                self.flush_ring(step.tile_index)?;
            }
        }
        self.current_frame = None;
        Ok(())
    }

    /// Hand the pending frames of the ring to the store.
    fn flush_ring(&mut self, tile: usize) -> AppResult<()> {
        let (start, block) = self.ring.pending();
        let count = block.len_of(FrameAxis(0));
        self.store.write(tile, block, start, start + count)?;
        self.ring.mark_flushed();
        self.frames_written += count;
        debug!("Tile {}: frames {}..{} stored", tile, start, start + count);
        Ok(())
    }

    /// Stop generation, zero the outputs, turn the laser off and stop the camera.
    /// Every step runs even when an earlier one fails.
    async fn disarm_tile(rig: &Rig, laser_channel: u8) -> AppResult<()> {
        let mut first = None;
        match rig.analog() {
            Ok(analog) => {
                keep_first(
                    &mut first,
                    analog.stop().await.device_err(DeviceKind::AnalogOutput, "stop"),
                );
                keep_first(
                    &mut first,
                    analog
                        .write_zeros()
                        .await
                        .device_err(DeviceKind::AnalogOutput, "write_zeros"),
                );
            }
            Err(err) => keep_first(&mut first, Err(err)),
        }
        match rig.laser() {
            Ok(laser) => keep_first(
                &mut first,
                laser
                    .disable(laser_channel)
                    .await
                    .device_err(DeviceKind::Laser, "disable"),
            ),
            Err(err) => keep_first(&mut first, Err(err)),
        }
        match rig.camera() {
            Ok(camera) => keep_first(
                &mut first,
                camera.stop().await.device_err(DeviceKind::Camera, "stop"),
            ),
            Err(err) => keep_first(&mut first, Err(err)),
        }
        first.map_or(Ok(()), Err)
    }
}
