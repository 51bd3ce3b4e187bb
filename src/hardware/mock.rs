//! Simulated hardware for dry runs and tests.
//!
//! Every simulated device writes what it was asked to do into a shared
//! [`EventJournal`], so tests can assert on the exact order of hardware calls across
//! devices. A [`FaultPlan`] injects failures: a device that refuses to open, an
//! operation that fails, or a camera that stalls on a given frame.
//!
//! All mock devices are async-safe: waits yield to the runtime instead of blocking
//! the thread.
//!
//! # Available Mocks
//!
//! - `MockStage` - three-axis stage that reports busy for a few polls after each move
//! - `MockAnalogOutput` - analog-output board that refuses to start without a waveform
//! - `MockLaser`, `MockFilterWheel`, `MockLens` - command recorders
//! - `MockCamera` - camera producing a deterministic pixel pattern

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use ndarray::Array2;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::ScanConfig;
use crate::error::DeviceKind;
use crate::instrument::{
    AnalogOutput, Axis, Camera, CameraSettings, FilterWheel, FiniteGeneration, FrameStatus,
    Laser, LensMode, MotorStatus, RasterFrame, ScanSweep, SensorWindow, Stage, StageSettings,
    TunableLens,
};
use crate::scan::rig::DeviceFactory;
use crate::scan::waveform::WaveformBuffer;

/// Status polls a stage reports busy after a move or sweep starts.
const BUSY_POLLS: usize = 2;

/// One observable action of a simulated device.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A factory opened the device.
    Opened(DeviceKind),
    /// The device handle was dropped.
    Released(DeviceKind),

    /// Stage initialised with these settings.
    StageInitialized(StageSettings),
    /// Absolute move commanded.
    StageMoved {
        /// Axis moved.
        axis: Axis,
        /// Target (mm).
        position_mm: f64,
    },
    /// Axis speed changed.
    VelocitySet {
        /// Axis changed.
        axis: Axis,
        /// New speed (mm/s).
        mm_per_s: f64,
    },
    /// Sweep limits loaded.
    SweepConfigured(ScanSweep),
    /// Sweep started.
    ScanStarted,
    /// Stage shut down.
    StageShutdown,

    /// Analog task created.
    AnalogConfigured {
        /// Output channels.
        channels: usize,
        /// Samples per generation.
        samples: usize,
    },
    /// Waveform buffer loaded.
    WaveformWritten {
        /// Channels in the buffer.
        channels: usize,
        /// Samples per channel.
        samples: usize,
    },
    /// Generation started.
    AnalogStarted,
    /// Generation stopped.
    AnalogStopped,
    /// Outputs parked at zero volts.
    ZerosWritten,
    /// Analog task closed.
    AnalogClosed,

    /// Laser line switched to modulation.
    LaserPrepared(u8),
    /// High drive level set.
    HighLevelSet {
        /// Laser line.
        channel: u8,
        /// Setpoint sent.
        value: f64,
    },
    /// Low drive level set.
    LowLevelSet {
        /// Laser line.
        channel: u8,
        /// Setpoint sent.
        value: f64,
    },
    /// Laser line enabled.
    LaserEnabled(u8),
    /// Laser line disabled.
    LaserDisabled(u8),

    /// Filter wheel moved to this slot.
    FilterMoved(u8),

    /// Lens connected.
    LensConnected,
    /// Lens control source set.
    LensModeSet(LensMode),
    /// Lens closed.
    LensClosed {
        /// Ramped down before closing.
        soft: bool,
    },

    /// Camera configured with this sensor window.
    CameraConfigured(SensorWindow),
    /// Sequence acquisition started.
    AcquisitionStarted {
        /// Frames requested.
        frames: usize,
    },
    /// A wait on this frame timed out.
    FrameStalled(usize),
    /// Acquisition stopped.
    CameraStopped,
    /// Camera closed.
    CameraClosed,
}

/// Shared, ordered record of device events.
#[derive(Debug, Clone, Default)]
pub struct EventJournal {
    events: Arc<Mutex<Vec<DeviceEvent>>>,
}

impl EventJournal {
    /// Empty journal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `event`.
    pub fn record(&self, event: DeviceEvent) {
        debug!("sim: {:?}", event);
        self.events.lock().push(event);
    }

    /// Snapshot of every event so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// True if `event` was recorded.
    pub fn contains(&self, event: &DeviceEvent) -> bool {
        self.events.lock().iter().any(|e| e == event)
    }

    /// Index of the first event matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&DeviceEvent) -> bool) -> Option<usize> {
        self.events.lock().iter().position(predicate)
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    /// Devices in the order they were opened.
    pub fn opened(&self) -> Vec<DeviceKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Opened(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    /// Devices in the order they were released.
    pub fn released(&self) -> Vec<DeviceKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Released(kind) => Some(*kind),
                _ => None,
            })
            .collect()
    }
}

/// Camera stall injected at one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallFault {
    /// Frame index that times out.
    pub frame: usize,
    /// How many waits on that frame time out before it arrives.
    pub times: u32,
}

/// Failures to inject into a simulated rig.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaultPlan {
    /// Device that refuses to open.
    pub fail_open: Option<DeviceKind>,
    /// Device operation that fails every time it is called.
    pub fail_operation: Option<(DeviceKind, &'static str)>,
    /// Camera stall.
    pub camera_stall: Option<StallFault>,
}

#[derive(Debug, Clone)]
struct Simulation {
    journal: EventJournal,
    faults: Arc<FaultPlan>,
}

impl Simulation {
    fn check(&self, device: DeviceKind, operation: &'static str) -> Result<()> {
        if self.faults.fail_operation == Some((device, operation)) {
            bail!("simulated {} fault during {}", device, operation);
        }
        Ok(())
    }

    fn record(&self, event: DeviceEvent) {
        self.journal.record(event);
    }
}

// =============================================================================
// MockStage
// =============================================================================

/// Simulated three-axis stage.
pub struct MockStage {
    sim: Simulation,
    position: RwLock<[f64; 3]>,
    busy_polls: Mutex<usize>,
}

impl MockStage {
    fn new(sim: Simulation) -> Self {
        Self {
            sim,
            position: RwLock::new([0.0; 3]),
            busy_polls: Mutex::new(0),
        }
    }
}

impl Drop for MockStage {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::Stage));
    }
}

#[async_trait]
impl Stage for MockStage {
    async fn initialize(&self, settings: &StageSettings) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "initialize")?;
        self.sim.record(DeviceEvent::StageInitialized(settings.clone()));
        Ok(())
    }

    async fn position(&self) -> Result<[f64; 3]> {
        Ok(*self.position.read().await)
    }

    async fn go_absolute(&self, axis: Axis, position_mm: f64, wait: bool) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "go_absolute")?;
        let index = match axis {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        };
        self.position.write().await[index] = position_mm;
        *self.busy_polls.lock() = BUSY_POLLS;
        self.sim.record(DeviceEvent::StageMoved { axis, position_mm });
        if wait {
            self.wait_until_idle(Duration::from_millis(1), Duration::from_secs(1))
                .await?;
        }
        Ok(())
    }

    async fn motor_status(&self) -> Result<MotorStatus> {
        self.sim.check(DeviceKind::Stage, "motor_status")?;
        let mut busy = self.busy_polls.lock();
        if *busy > 0 {
            *busy -= 1;
            Ok(MotorStatus::Busy)
        } else {
            Ok(MotorStatus::Idle)
        }
    }

    async fn set_velocity(&self, axis: Axis, mm_per_s: f64) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "set_velocity")?;
        self.sim.record(DeviceEvent::VelocitySet { axis, mm_per_s });
        Ok(())
    }

    async fn configure_scan_sweep(&self, sweep: &ScanSweep) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "configure_scan_sweep")?;
        self.sim.record(DeviceEvent::SweepConfigured(*sweep));
        Ok(())
    }

    async fn start_scan(&self, wait: bool) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "start_scan")?;
        *self.busy_polls.lock() = BUSY_POLLS;
        self.sim.record(DeviceEvent::ScanStarted);
        if wait {
            self.wait_until_idle(Duration::from_millis(1), Duration::from_secs(1))
                .await?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.sim.check(DeviceKind::Stage, "shutdown")?;
        self.sim.record(DeviceEvent::StageShutdown);
        Ok(())
    }
}

// =============================================================================
// MockAnalogOutput
// =============================================================================

#[derive(Debug, Default)]
struct AnalogState {
    configured: Option<(usize, FiniteGeneration)>,
    loaded: bool,
    running: bool,
}

/// Simulated analog-output board.
pub struct MockAnalogOutput {
    sim: Simulation,
    state: Mutex<AnalogState>,
}

impl Drop for MockAnalogOutput {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::AnalogOutput));
    }
}

#[async_trait]
impl AnalogOutput for MockAnalogOutput {
    async fn configure_channels(
        &self,
        channel_count: usize,
        _sample_rate_hz: f64,
        mode: &FiniteGeneration,
    ) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "configure_channels")?;
        self.state.lock().configured = Some((channel_count, mode.clone()));
        self.sim.record(DeviceEvent::AnalogConfigured {
            channels: channel_count,
            samples: mode.samples_per_channel,
        });
        Ok(())
    }

    async fn write(&self, buffer: &WaveformBuffer) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "write")?;
        let mut state = self.state.lock();
        let Some((channels, mode)) = &state.configured else {
            bail!("analog output written before it was configured");
        };
        if buffer.channel_count() != *channels || buffer.samples() != mode.samples_per_channel {
            bail!(
                "waveform is {}x{}, task expects {}x{}",
                buffer.channel_count(),
                buffer.samples(),
                channels,
                mode.samples_per_channel
            );
        }
        state.loaded = true;
        self.sim.record(DeviceEvent::WaveformWritten {
            channels: buffer.channel_count(),
            samples: buffer.samples(),
        });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "start")?;
        let mut state = self.state.lock();
        if !state.loaded {
            bail!("analog output started without a waveform");
        }
        state.running = true;
        self.sim.record(DeviceEvent::AnalogStarted);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "stop")?;
        self.state.lock().running = false;
        self.sim.record(DeviceEvent::AnalogStopped);
        Ok(())
    }

    async fn write_zeros(&self) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "write_zeros")?;
        self.state.lock().loaded = false;
        self.sim.record(DeviceEvent::ZerosWritten);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sim.check(DeviceKind::AnalogOutput, "close")?;
        self.sim.record(DeviceEvent::AnalogClosed);
        Ok(())
    }
}

// =============================================================================
// MockLaser, MockFilterWheel, MockLens
// =============================================================================

/// Simulated multi-line laser.
pub struct MockLaser {
    sim: Simulation,
}

impl Drop for MockLaser {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::Laser));
    }
}

#[async_trait]
impl Laser for MockLaser {
    async fn prepare_channel(&self, channel: u8) -> Result<()> {
        self.sim.check(DeviceKind::Laser, "prepare_channel")?;
        self.sim.record(DeviceEvent::LaserPrepared(channel));
        Ok(())
    }

    async fn enable(&self, channel: u8) -> Result<()> {
        self.sim.check(DeviceKind::Laser, "enable")?;
        self.sim.record(DeviceEvent::LaserEnabled(channel));
        Ok(())
    }

    async fn disable(&self, channel: u8) -> Result<()> {
        self.sim.check(DeviceKind::Laser, "disable")?;
        self.sim.record(DeviceEvent::LaserDisabled(channel));
        Ok(())
    }

    async fn set_high_drive_level(&self, channel: u8, value: f64) -> Result<()> {
        self.sim.check(DeviceKind::Laser, "set_high_drive_level")?;
        self.sim.record(DeviceEvent::HighLevelSet { channel, value });
        Ok(())
    }

    async fn set_low_drive_level(&self, channel: u8, value: f64) -> Result<()> {
        self.sim.check(DeviceKind::Laser, "set_low_drive_level")?;
        self.sim.record(DeviceEvent::LowLevelSet { channel, value });
        Ok(())
    }
}

/// Simulated filter wheel.
pub struct MockFilterWheel {
    sim: Simulation,
}

impl Drop for MockFilterWheel {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::FilterWheel));
    }
}

#[async_trait]
impl FilterWheel for MockFilterWheel {
    async fn set_position(&self, slot: u8) -> Result<()> {
        self.sim.check(DeviceKind::FilterWheel, "set_position")?;
        self.sim.record(DeviceEvent::FilterMoved(slot));
        Ok(())
    }
}

/// Simulated tunable lens.
pub struct MockLens {
    sim: Simulation,
}

impl Drop for MockLens {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::TunableLens));
    }
}

#[async_trait]
impl TunableLens for MockLens {
    async fn connect(&self) -> Result<()> {
        self.sim.check(DeviceKind::TunableLens, "connect")?;
        self.sim.record(DeviceEvent::LensConnected);
        Ok(())
    }

    async fn set_mode(&self, mode: LensMode) -> Result<()> {
        self.sim.check(DeviceKind::TunableLens, "set_mode")?;
        self.sim.record(DeviceEvent::LensModeSet(mode));
        Ok(())
    }

    async fn close(&self, soft: bool) -> Result<()> {
        self.sim.check(DeviceKind::TunableLens, "close")?;
        self.sim.record(DeviceEvent::LensClosed { soft });
        Ok(())
    }
}

// =============================================================================
// MockCamera
// =============================================================================

#[derive(Debug, Default)]
struct CameraState {
    window: Option<SensorWindow>,
    /// Acquisitions started so far; the current one is `acquisitions - 1`.
    acquisitions: usize,
    frames: usize,
    recording: bool,
    stalls_left: u32,
}

/// Simulated camera. Frame `f` of acquisition `a` has pixel `(r, c)` equal to
/// [`MockCamera::pattern`]`(a, f, r, c)` in raster coordinates.
pub struct MockCamera {
    sim: Simulation,
    state: Mutex<CameraState>,
}

impl MockCamera {
    fn new(sim: Simulation) -> Self {
        let stalls_left = sim.faults.camera_stall.map_or(0, |s| s.times);
        Self {
            sim,
            state: Mutex::new(CameraState {
                stalls_left,
                ..CameraState::default()
            }),
        }
    }

    /// Pixel value of the simulated scene.
    pub fn pattern(acquisition: usize, frame: usize, row: usize, col: usize) -> u16 {
        ((acquisition * 509 + frame * 31 + row * 7 + col) % 4093) as u16
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.sim.record(DeviceEvent::Released(DeviceKind::Camera));
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn configure(&self, settings: &CameraSettings) -> Result<()> {
        self.sim.check(DeviceKind::Camera, "configure")?;
        self.state.lock().window = Some(settings.window);
        self.sim.record(DeviceEvent::CameraConfigured(settings.window));
        Ok(())
    }

    async fn start_acquisition(&self, frames: usize) -> Result<()> {
        self.sim.check(DeviceKind::Camera, "start_acquisition")?;
        let mut state = self.state.lock();
        if state.window.is_none() {
            bail!("camera started before it was configured");
        }
        state.acquisitions += 1;
        state.frames = frames;
        state.recording = true;
        self.sim.record(DeviceEvent::AcquisitionStarted { frames });
        Ok(())
    }

    async fn wait_for_frame(&self, index: usize, _timeout: Duration) -> Result<FrameStatus> {
        self.sim.check(DeviceKind::Camera, "wait_for_frame")?;
        let stalled = {
            let mut state = self.state.lock();
            if !state.recording || index >= state.frames {
                bail!("frame {} was never requested", index);
            }
            let stall_here = self.sim.faults.camera_stall.map(|s| s.frame) == Some(index);
            if stall_here && state.stalls_left > 0 {
                state.stalls_left -= 1;
                true
            } else {
                false
            }
        };
        if stalled {
            self.sim.record(DeviceEvent::FrameStalled(index));
            return Ok(FrameStatus::TimedOut);
        }
        // Let other tasks run the way a real frame wait would.
        tokio::task::yield_now().await;
        Ok(FrameStatus::Ready)
    }

    async fn frame(&self, index: usize) -> Result<RasterFrame> {
        self.sim.check(DeviceKind::Camera, "frame")?;
        let state = self.state.lock();
        let Some(window) = state.window else {
            bail!("camera is not configured");
        };
        if index >= state.frames {
            bail!("frame {} is beyond the {} recorded", index, state.frames);
        }
        let acquisition = state.acquisitions.saturating_sub(1);
        let pixels = Array2::from_shape_fn((window.height(), window.width()), |(r, c)| {
            Self::pattern(acquisition, index, r, c)
        });
        Ok(RasterFrame::new(pixels))
    }

    async fn stop(&self) -> Result<()> {
        self.sim.check(DeviceKind::Camera, "stop")?;
        self.state.lock().recording = false;
        self.sim.record(DeviceEvent::CameraStopped);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.sim.check(DeviceKind::Camera, "close")?;
        self.sim.record(DeviceEvent::CameraClosed);
        Ok(())
    }
}

// =============================================================================
// SimulatedFactory
// =============================================================================

/// Opens simulated devices sharing one journal and fault plan.
#[derive(Debug, Clone)]
pub struct SimulatedFactory {
    sim: Simulation,
}

impl SimulatedFactory {
    /// Factory whose devices fail as `faults` describes.
    pub fn new(faults: FaultPlan) -> Self {
        Self {
            sim: Simulation {
                journal: EventJournal::new(),
                faults: Arc::new(faults),
            },
        }
    }

    /// Journal shared by every device this factory opens.
    pub fn journal(&self) -> EventJournal {
        self.sim.journal.clone()
    }

    fn open(&self, device: DeviceKind) -> Result<Simulation> {
        if self.sim.faults.fail_open == Some(device) {
            bail!("simulated {} refused to open", device);
        }
        self.sim.record(DeviceEvent::Opened(device));
        Ok(self.sim.clone())
    }
}

impl Default for SimulatedFactory {
    fn default() -> Self {
        Self::new(FaultPlan::default())
    }
}

#[async_trait]
impl DeviceFactory for SimulatedFactory {
    async fn open_stage(&self, _config: &ScanConfig) -> Result<Box<dyn Stage>> {
        Ok(Box::new(MockStage::new(self.open(DeviceKind::Stage)?)))
    }

    async fn open_analog_output(&self, _config: &ScanConfig) -> Result<Box<dyn AnalogOutput>> {
        Ok(Box::new(MockAnalogOutput {
            sim: self.open(DeviceKind::AnalogOutput)?,
            state: Mutex::new(AnalogState::default()),
        }))
    }

    async fn open_laser(&self, _config: &ScanConfig) -> Result<Box<dyn Laser>> {
        Ok(Box::new(MockLaser {
            sim: self.open(DeviceKind::Laser)?,
        }))
    }

    async fn open_filter_wheel(&self, _config: &ScanConfig) -> Result<Box<dyn FilterWheel>> {
        Ok(Box::new(MockFilterWheel {
            sim: self.open(DeviceKind::FilterWheel)?,
        }))
    }

    async fn open_lens(&self, _config: &ScanConfig) -> Result<Box<dyn TunableLens>> {
        Ok(Box::new(MockLens {
            sim: self.open(DeviceKind::TunableLens)?,
        }))
    }

    async fn open_camera(&self, _config: &ScanConfig) -> Result<Box<dyn Camera>> {
        Ok(Box::new(MockCamera::new(self.open(DeviceKind::Camera)?)))
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::config::{AcquireMode, TriggerMode};

    fn settings(height: usize) -> CameraSettings {
        CameraSettings {
            exposure_ms: 10.0,
            window: SensorWindow::centred(16, 64, height, 2),
            trigger_mode: TriggerMode::AutoSequence,
            acquire_mode: AcquireMode::External,
        }
    }

    #[tokio::test]
    async fn test_mock_stage_reports_busy_after_move() {
        let factory = SimulatedFactory::default();
        let stage = factory.open_stage(&sample_config()).await.unwrap();
        stage.go_absolute(Axis::Y, 1.5, false).await.unwrap();
        assert_eq!(stage.motor_status().await.unwrap(), MotorStatus::Busy);
        stage
            .wait_until_idle(Duration::from_millis(1), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(stage.position().await.unwrap(), [0.0, 1.5, 0.0]);
    }

    #[tokio::test]
    async fn test_mock_camera_pattern() {
        let factory = SimulatedFactory::default();
        let camera = factory.open_camera(&sample_config()).await.unwrap();
        camera.configure(&settings(8)).await.unwrap();
        camera.start_acquisition(3).await.unwrap();
        assert_eq!(
            camera.wait_for_frame(2, Duration::from_millis(5)).await.unwrap(),
            FrameStatus::Ready
        );
        let frame = camera.frame(2).await.unwrap();
        assert_eq!((frame.height(), frame.width()), (12, 16));
        assert_eq!(frame.pixels[[4, 5]], MockCamera::pattern(0, 2, 4, 5));
        assert!(camera.frame(3).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_camera_stall_counts_down() {
        let factory = SimulatedFactory::new(FaultPlan {
            camera_stall: Some(StallFault { frame: 1, times: 1 }),
            ..FaultPlan::default()
        });
        let journal = factory.journal();
        let camera = factory.open_camera(&sample_config()).await.unwrap();
        camera.configure(&settings(4)).await.unwrap();
        camera.start_acquisition(2).await.unwrap();
        let timeout = Duration::from_millis(5);
        assert_eq!(camera.wait_for_frame(1, timeout).await.unwrap(), FrameStatus::TimedOut);
        assert_eq!(camera.wait_for_frame(1, timeout).await.unwrap(), FrameStatus::Ready);
        assert!(journal.contains(&DeviceEvent::FrameStalled(1)));
    }

    #[tokio::test]
    async fn test_mock_analog_output_requires_waveform() {
        let factory = SimulatedFactory::default();
        let analog = factory.open_analog_output(&sample_config()).await.unwrap();
        assert!(analog.start().await.is_err());
    }

    #[tokio::test]
    async fn test_injected_operation_fault() {
        let factory = SimulatedFactory::new(FaultPlan {
            fail_operation: Some((DeviceKind::FilterWheel, "set_position")),
            ..FaultPlan::default()
        });
        let wheel = factory.open_filter_wheel(&sample_config()).await.unwrap();
        let err = wheel.set_position(2).await.unwrap_err();
        assert!(err.to_string().contains("filter wheel"));
    }

    #[tokio::test]
    async fn test_drop_records_release() {
        let factory = SimulatedFactory::default();
        let journal = factory.journal();
        let laser = factory.open_laser(&sample_config()).await.unwrap();
        drop(laser);
        assert_eq!(journal.released(), vec![DeviceKind::Laser]);
    }
}
