//! Ownership of the opened devices for one acquisition.
//!
//! A [`DeviceFactory`] opens each device role; [`Rig::arm`] opens and sets them up in
//! a fixed order (stage, analog output, laser, filter wheel, lens, camera) and
//! [`Rig::release`] tears them down in the reverse order. Every handle is released
//! exactly once, including when arming fails halfway.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::ScanConfig;
use crate::error::{AppResult, DaqError, DeviceKind, DeviceResultExt};
use crate::instrument::{
    AnalogOutput, Camera, CameraSettings, FilterWheel, FiniteGeneration, Laser, LensMode,
    SensorWindow, Stage, StageSettings, TunableLens,
};

/// Opens device handles. Implementations decide which transport backs each role.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// Open the XYZ stage.
    async fn open_stage(&self, config: &ScanConfig) -> Result<Box<dyn Stage>>;
    /// Open the analog output task.
    async fn open_analog_output(&self, config: &ScanConfig) -> Result<Box<dyn AnalogOutput>>;
    /// Open the laser.
    async fn open_laser(&self, config: &ScanConfig) -> Result<Box<dyn Laser>>;
    /// Open the filter wheel.
    async fn open_filter_wheel(&self, config: &ScanConfig) -> Result<Box<dyn FilterWheel>>;
    /// Open the tunable lens.
    async fn open_lens(&self, config: &ScanConfig) -> Result<Box<dyn TunableLens>>;
    /// Open the camera.
    async fn open_camera(&self, config: &ScanConfig) -> Result<Box<dyn Camera>>;
}

/// Setup applied while arming.
#[derive(Debug, Clone, PartialEq)]
pub struct ArmSettings {
    /// Stage motion settings.
    pub stage: StageSettings,
    /// Analog output channels.
    pub channel_count: usize,
    /// Analog output sample rate.
    pub sample_rate_hz: f64,
    /// One retriggerable period per camera trigger.
    pub generation: FiniteGeneration,
    /// Logical laser channels put into modulation mode, in configuration order.
    pub laser_channels: Vec<u8>,
    /// Camera settings.
    pub camera: CameraSettings,
}

impl ArmSettings {
    /// Settings for `config` with one waveform period of `samples_per_period`.
    pub fn from_config(config: &ScanConfig, samples_per_period: usize) -> Self {
        let mut laser_channels: Vec<u8> = Vec::new();
        for channel in &config.channels {
            if !laser_channels.contains(&channel.laser_channel) {
                laser_channels.push(channel.laser_channel);
            }
        }
        let camera = &config.camera;
        Self {
            stage: StageSettings {
                backlash_mm: 0.0,
                velocity_mm_s: 1.0,
                acceleration_ms: config.stage.acceleration_ms,
                serpentine: true,
            },
            channel_count: config.daq.channel_count,
            sample_rate_hz: config.daq.sample_rate_hz,
            generation: FiniteGeneration {
                samples_per_channel: samples_per_period,
                trigger_source: config.daq.trigger_source.clone(),
                retriggerable: true,
            },
            laser_channels,
            camera: CameraSettings {
                exposure_ms: camera.exposure_ms,
                window: SensorWindow::centred(
                    camera.sensor_width,
                    camera.sensor_height,
                    camera.frame_height,
                    camera.row_margin,
                ),
                trigger_mode: camera.trigger_mode,
                acquire_mode: camera.acquire_mode,
            },
        }
    }
}

fn not_open(device: DeviceKind) -> DaqError {
    DaqError::device(device, "access", anyhow::anyhow!("device is not open"))
}

/// The opened devices of one acquisition.
#[derive(Default)]
pub struct Rig {
    stage: Option<Box<dyn Stage>>,
    analog: Option<Box<dyn AnalogOutput>>,
    laser: Option<Box<dyn Laser>>,
    filter_wheel: Option<Box<dyn FilterWheel>>,
    lens: Option<Box<dyn TunableLens>>,
    camera: Option<Box<dyn Camera>>,
    idle_poll: Duration,
    idle_timeout: Duration,
}

impl std::fmt::Debug for Rig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rig")
            .field("stage", &self.stage.is_some())
            .field("analog", &self.analog.is_some())
            .field("laser", &self.laser.is_some())
            .field("filter_wheel", &self.filter_wheel.is_some())
            .field("lens", &self.lens.is_some())
            .field("camera", &self.camera.is_some())
            .finish()
    }
}

impl Rig {
    /// Open and set up every device. On failure the devices opened so far are released
    /// before the error is returned.
    pub async fn arm(
        factory: &dyn DeviceFactory,
        config: &ScanConfig,
        settings: &ArmSettings,
    ) -> AppResult<Rig> {
        let mut rig = Rig {
            idle_poll: config.stage.poll_interval,
            idle_timeout: config.stage.move_timeout,
            ..Rig::default()
        };
        match rig.arm_devices(factory, config, settings).await {
            Ok(()) => {
                info!("Hardware armed");
                Ok(rig)
            }
            Err(err) => {
                error!("Arming failed: {}", err);
                if let Err(release) = rig.release().await {
                    error!("Release after failed arming also failed: {}", release);
                }
                Err(err)
            }
        }
    }

    async fn arm_devices(
        &mut self,
        factory: &dyn DeviceFactory,
        config: &ScanConfig,
        settings: &ArmSettings,
    ) -> AppResult<()> {
        let stage = factory
            .open_stage(config)
            .await
            .device_err(DeviceKind::Stage, "open")?;
        let stage = self.stage.insert(stage);
        stage
            .initialize(&settings.stage)
            .await
            .device_err(DeviceKind::Stage, "initialize")?;

        let analog = factory
            .open_analog_output(config)
            .await
            .device_err(DeviceKind::AnalogOutput, "open")?;
        let analog = self.analog.insert(analog);
        analog
            .configure_channels(
                settings.channel_count,
                settings.sample_rate_hz,
                &settings.generation,
            )
            .await
            .device_err(DeviceKind::AnalogOutput, "configure_channels")?;

        let laser = factory
            .open_laser(config)
            .await
            .device_err(DeviceKind::Laser, "open")?;
        let laser = self.laser.insert(laser);
        for &channel in &settings.laser_channels {
            laser
                .prepare_channel(channel)
                .await
                .device_err(DeviceKind::Laser, "prepare_channel")?;
            laser
                .set_low_drive_level(channel, 0.0)
                .await
                .device_err(DeviceKind::Laser, "set_low_drive_level")?;
        }

        let wheel = factory
            .open_filter_wheel(config)
            .await
            .device_err(DeviceKind::FilterWheel, "open")?;
        self.filter_wheel = Some(wheel);

        let lens = factory
            .open_lens(config)
            .await
            .device_err(DeviceKind::TunableLens, "open")?;
        let lens = self.lens.insert(lens);
        lens.connect()
            .await
            .device_err(DeviceKind::TunableLens, "connect")?;
        lens.set_mode(LensMode::Analog)
            .await
            .device_err(DeviceKind::TunableLens, "set_mode")?;

        let camera = factory
            .open_camera(config)
            .await
            .device_err(DeviceKind::Camera, "open")?;
        let camera = self.camera.insert(camera);
        camera
            .configure(&settings.camera)
            .await
            .device_err(DeviceKind::Camera, "configure")?;
        Ok(())
    }

    /// The open stage.
    pub fn stage(&self) -> AppResult<&dyn Stage> {
        self.stage.as_deref().ok_or_else(|| not_open(DeviceKind::Stage))
    }

    /// The open analog output.
    pub fn analog(&self) -> AppResult<&dyn AnalogOutput> {
        self.analog
            .as_deref()
            .ok_or_else(|| not_open(DeviceKind::AnalogOutput))
    }

    /// The open laser.
    pub fn laser(&self) -> AppResult<&dyn Laser> {
        self.laser.as_deref().ok_or_else(|| not_open(DeviceKind::Laser))
    }

    /// The open filter wheel.
    pub fn filter_wheel(&self) -> AppResult<&dyn FilterWheel> {
        self.filter_wheel
            .as_deref()
            .ok_or_else(|| not_open(DeviceKind::FilterWheel))
    }

    /// The open camera.
    pub fn camera(&self) -> AppResult<&dyn Camera> {
        self.camera.as_deref().ok_or_else(|| not_open(DeviceKind::Camera))
    }

    /// Wait for the stage to settle, then release every open device in reverse open
    /// order. All devices are attempted; failures are collected.
    pub async fn release(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();

        if let Some(stage) = &self.stage {
            if let Err(e) = stage
                .wait_until_idle(self.idle_poll, self.idle_timeout)
                .await
            {
                errors.push(DaqError::device(DeviceKind::Stage, "wait_until_idle", e));
            }
        }
        if let Some(camera) = self.camera.take() {
            if let Err(e) = camera.close().await {
                errors.push(DaqError::device(DeviceKind::Camera, "close", e));
            }
            debug!("Camera released");
        }
        if let Some(lens) = self.lens.take() {
            if let Err(e) = lens.close(true).await {
                errors.push(DaqError::device(DeviceKind::TunableLens, "close", e));
            }
            debug!("Tunable lens released");
        }
        if self.filter_wheel.take().is_some() {
            debug!("Filter wheel released");
        }
        if self.laser.take().is_some() {
            debug!("Laser released");
        }
        if let Some(analog) = self.analog.take() {
            if let Err(e) = analog.close().await {
                errors.push(DaqError::device(DeviceKind::AnalogOutput, "close", e));
            }
            debug!("Analog output released");
        }
        if let Some(stage) = self.stage.take() {
            if let Err(e) = stage.shutdown().await {
                errors.push(DaqError::device(DeviceKind::Stage, "shutdown", e));
            }
            debug!("Stage released");
        }

        if errors.is_empty() {
            info!("All devices released");
            Ok(())
        } else {
            for err in &errors {
                error!("Release error: {}", err);
            }
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}

/// Devices reachable from this build: serial instruments when `instrument_serial` is
/// enabled. The camera, analog-output board and tunable lens need vendor SDK bindings
/// that are not part of this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareFactory;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl DeviceFactory for HardwareFactory {
    async fn open_stage(&self, config: &ScanConfig) -> Result<Box<dyn Stage>> {
        use crate::instrument::asi::AsiStage;
        use crate::instrument::serial::{Framing, SerialPortLink};

        let link = SerialPortLink::open(&config.stage.link, Framing::CR_LF)?;
        Ok(Box::new(AsiStage::new(
            config.stage.model,
            Box::new(link),
            config.stage.poll_interval,
            config.stage.move_timeout,
        )))
    }

    async fn open_analog_output(&self, _config: &ScanConfig) -> Result<Box<dyn AnalogOutput>> {
        anyhow::bail!("no analog-output driver is available in this build; run with --simulate")
    }

    async fn open_laser(&self, config: &ScanConfig) -> Result<Box<dyn Laser>> {
        use crate::instrument::serial::{Framing, SerialPortLink};
        use crate::instrument::skyra::SkyraLaser;

        let link = SerialPortLink::open(&config.laser.link, Framing::CR_LF)?;
        Ok(Box::new(SkyraLaser::new(Box::new(link))))
    }

    async fn open_filter_wheel(&self, config: &ScanConfig) -> Result<Box<dyn FilterWheel>> {
        use crate::instrument::fw102c::Fw102c;
        use crate::instrument::serial::{Framing, SerialPortLink};

        let link = SerialPortLink::open(&config.filter_wheel, Framing::PROMPT)?;
        Ok(Box::new(Fw102c::new(Box::new(link))))
    }

    async fn open_lens(&self, _config: &ScanConfig) -> Result<Box<dyn TunableLens>> {
        anyhow::bail!("no tunable-lens driver is available in this build; run with --simulate")
    }

    async fn open_camera(&self, _config: &ScanConfig) -> Result<Box<dyn Camera>> {
        anyhow::bail!("no camera driver is available in this build; run with --simulate")
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl DeviceFactory for HardwareFactory {
    async fn open_stage(&self, _config: &ScanConfig) -> Result<Box<dyn Stage>> {
        anyhow::bail!("serial instruments are disabled; build with --features instrument_serial")
    }

    async fn open_analog_output(&self, _config: &ScanConfig) -> Result<Box<dyn AnalogOutput>> {
        anyhow::bail!("no analog-output driver is available in this build; run with --simulate")
    }

    async fn open_laser(&self, _config: &ScanConfig) -> Result<Box<dyn Laser>> {
        anyhow::bail!("serial instruments are disabled; build with --features instrument_serial")
    }

    async fn open_filter_wheel(&self, _config: &ScanConfig) -> Result<Box<dyn FilterWheel>> {
        anyhow::bail!("serial instruments are disabled; build with --features instrument_serial")
    }

    async fn open_lens(&self, _config: &ScanConfig) -> Result<Box<dyn TunableLens>> {
        anyhow::bail!("no tunable-lens driver is available in this build; run with --simulate")
    }

    async fn open_camera(&self, _config: &ScanConfig) -> Result<Box<dyn Camera>> {
        anyhow::bail!("no camera driver is available in this build; run with --simulate")
    }
}
