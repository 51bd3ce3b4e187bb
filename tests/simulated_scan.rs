//! End-to-end acquisitions against the simulated rig.

use std::path::Path;

use lsm_daq::config::{DriveQuantity, ScanConfig};
use lsm_daq::data::memory::MemoryPyramid;
use lsm_daq::error::{DaqError, DeviceKind};
use lsm_daq::hardware::mock::{DeviceEvent, FaultPlan, MockCamera, SimulatedFactory, StallFault};
use lsm_daq::scan::plan::TilePlan;
use lsm_daq::scan::power::PowerCurve;
use lsm_daq::scan::sequencer::{
    cancellation, CancelToken, RunOptions, ScanSequencer, ScanState, REPORT_FILE,
};

/// 20 frames per tile, 2 lateral x 2 depth tiles, two wavelengths.
fn config_toml(output_dir: &Path) -> String {
    format!(
        r#"
        [experiment]
        name = "simulated"
        output_dir = "{}"
        x_sampling_um = 1.0
        roi = {{ x = {{ min = 0.0, max = 0.02 }}, y = {{ min = 0.0, max = 0.012 }}, z = {{ min = 0.0, max = 0.005 }} }}

        [camera]
        frame_width = 16
        frame_height = 8
        pixel_size_um = 0.5
        exposure_ms = 1.0
        line_time_us = 40.0
        sensor_width = 24
        sensor_height = 32
        frame_timeout = "5ms"
        stall_retry = {{ max_attempts = 2, backoff_delay = "1ms" }}

        [daq]

        [stage]
        model = "tiger"
        poll_interval = "1ms"
        move_timeout = "1s"

        [storage]
        resolution_levels = 2

        [[channels]]
        name = "488"
        daq_channel = 9
        laser_channel = 1
        filter_slot = 2
        nominal_drive = 40.0
        max_drive = 96.0
        attenuation_mm = 1000.0
        etl_volts = 2.45
        x_galvo = {{ min = -5.15, max = 5.0, peak_to_peak = 1.2 }}
        y_galvo = {{ min = -2.0, max = 2.425, peak_to_peak = 0.024 }}

        [[channels]]
        name = "561"
        daq_channel = 11
        laser_channel = 3
        filter_slot = 4
        nominal_drive = 30.0
        max_drive = 96.0
        attenuation_mm = 1000.0
        etl_volts = 2.5
        x_galvo = {{ min = -5.0, max = 5.0, peak_to_peak = 1.0 }}
        y_galvo = {{ min = -2.0, max = 2.4, peak_to_peak = 0.02 }}
        "#,
        output_dir.display()
    )
}

fn load(output_dir: &Path) -> ScanConfig {
    ScanConfig::from_toml_str(&config_toml(output_dir)).expect("test configuration parses")
}

fn sequencer(config: ScanConfig, backend: MemoryPyramid) -> ScanSequencer<MemoryPyramid> {
    ScanSequencer::new(config, backend, RunOptions::default(), CancelToken::never())
        .expect("pre-flight passes")
}

#[tokio::test]
async fn test_full_acquisition_stores_cropped_frames() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryPyramid::new();
    let factory = SimulatedFactory::default();
    let mut scan = sequencer(load(dir.path()), backend.clone());

    let report = scan.run(&factory).await.unwrap();
    assert_eq!(report.tiles_total, 8);
    assert_eq!(report.tiles_completed, 8);
    assert_eq!(report.frames_written, 8 * 20);
    assert_eq!(scan.state(), ScanState::Done);
    assert!(dir.path().join("data.xml").exists());
    assert!(dir.path().join(REPORT_FILE).exists());
    assert_eq!(backend.setup_count(), 8);
    assert_eq!(backend.flush_count(), 1);

    // Raster is the full 24-column sensor width with two margin rows; the stored
    // frame is the centred 16 columns below the margin.
    let (row_offset, col_offset) = (2, 4);
    for step in TilePlan::from_counts(2, 2, 2).steps() {
        let level0 = backend.level(step.tile_index, 0).expect("tile was created");
        assert_eq!(level0.dim(), (20, 8, 16));
        for frame in [0, 7, 19] {
            for (row, col) in [(0, 0), (3, 9), (7, 15)] {
                let expected =
                    MockCamera::pattern(step.ordinal, frame, row + row_offset, col + col_offset);
                assert_eq!(level0[[frame, row, col]] as u16, expected);
            }
        }
        let level1 = backend.level(step.tile_index, 1).expect("coarse level exists");
        assert_eq!(level1.dim(), (10, 4, 8));
    }
}

#[tokio::test]
async fn test_waveform_is_loaded_before_the_sweep_and_zeroed_after() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::default();
    let journal = factory.journal();
    sequencer(load(dir.path()), MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap();

    let written = journal
        .position(|e| matches!(e, DeviceEvent::WaveformWritten { .. }))
        .unwrap();
    let filter = journal.position(|e| *e == DeviceEvent::FilterMoved(2)).unwrap();
    let sweep = journal.position(|e| *e == DeviceEvent::ScanStarted).unwrap();
    let laser_on = journal.position(|e| *e == DeviceEvent::LaserEnabled(1)).unwrap();
    let stopped = journal.position(|e| *e == DeviceEvent::AnalogStopped).unwrap();
    let zeros = journal.position(|e| *e == DeviceEvent::ZerosWritten).unwrap();
    let laser_off = journal.position(|e| *e == DeviceEvent::LaserDisabled(1)).unwrap();
    let camera_stop = journal.position(|e| *e == DeviceEvent::CameraStopped).unwrap();
    assert!(filter < written);
    assert!(written < sweep);
    assert!(sweep < laser_on);
    assert!(laser_on < stopped);
    assert!(stopped < zeros);
    assert!(zeros < laser_off);
    assert!(laser_off < camera_stop);

    assert_eq!(journal.count(|e| matches!(e, DeviceEvent::WaveformWritten { .. })), 8);
    assert_eq!(journal.count(|e| *e == DeviceEvent::ZerosWritten), 8);
    assert_eq!(
        journal.count(|e| matches!(e, DeviceEvent::AcquisitionStarted { frames: 20 })),
        8
    );
    // Laser drive grows with depth for the same wavelength.
    let drives: Vec<f64> = journal
        .events()
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::HighLevelSet { channel: 1, value } => Some(*value),
            _ => None,
        })
        .collect();
    assert_eq!(drives.len(), 4);
    assert_eq!(drives[0], 40.0);
    assert!(drives[2] > drives[0]);
}

#[tokio::test]
async fn test_devices_are_released_in_reverse_order() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::default();
    let journal = factory.journal();
    sequencer(load(dir.path()), MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap();
    let mut opened = journal.opened();
    opened.reverse();
    assert_eq!(journal.released(), opened);
    assert!(journal.contains(&DeviceEvent::LensClosed { soft: true }));
    assert!(journal.contains(&DeviceEvent::StageShutdown));
}

#[tokio::test]
async fn test_open_failure_releases_what_was_opened() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::new(FaultPlan {
        fail_open: Some(DeviceKind::Camera),
        ..FaultPlan::default()
    });
    let journal = factory.journal();
    let mut scan = sequencer(load(dir.path()), MemoryPyramid::new());
    let err = scan.run(&factory).await.unwrap_err();
    assert!(matches!(
        err,
        DaqError::Device {
            device: DeviceKind::Camera,
            operation: "open",
            ..
        }
    ));
    assert_eq!(
        journal.released(),
        vec![
            DeviceKind::TunableLens,
            DeviceKind::FilterWheel,
            DeviceKind::Laser,
            DeviceKind::AnalogOutput,
            DeviceKind::Stage,
        ]
    );
    assert_eq!(scan.state(), ScanState::Aborted);
}

#[tokio::test]
async fn test_failure_during_exposure_still_disarms_the_tile() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::new(FaultPlan {
        fail_operation: Some((DeviceKind::Stage, "start_scan")),
        ..FaultPlan::default()
    });
    let journal = factory.journal();
    let err = sequencer(load(dir.path()), MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap_err();
    assert!(matches!(
        err.root(),
        DaqError::Device {
            device: DeviceKind::Stage,
            operation: "start_scan",
            ..
        }
    ));
    assert!(!journal.contains(&DeviceEvent::LaserEnabled(1)));
    assert!(journal.contains(&DeviceEvent::AnalogStopped));
    assert!(journal.contains(&DeviceEvent::ZerosWritten));
    assert!(journal.contains(&DeviceEvent::LaserDisabled(1)));
    assert!(journal.contains(&DeviceEvent::CameraStopped));
    assert_eq!(journal.released().len(), 6);
}

#[tokio::test]
async fn test_single_stall_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::new(FaultPlan {
        camera_stall: Some(StallFault { frame: 3, times: 1 }),
        ..FaultPlan::default()
    });
    let journal = factory.journal();
    let report = sequencer(load(dir.path()), MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap();
    assert_eq!(report.frames_written, 160);
    assert_eq!(journal.count(|e| *e == DeviceEvent::FrameStalled(3)), 1);
}

#[tokio::test]
async fn test_repeated_stall_aborts_with_position() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::new(FaultPlan {
        camera_stall: Some(StallFault { frame: 3, times: 2 }),
        ..FaultPlan::default()
    });
    let journal = factory.journal();
    let mut scan = sequencer(load(dir.path()), MemoryPyramid::new());
    let err = scan.run(&factory).await.unwrap_err();
    match &err {
        DaqError::ScanAborted { position, source } => {
            assert_eq!(position.depth_plane, 0);
            assert_eq!(position.lateral_tile, 0);
            assert_eq!(position.wavelength, "488");
            assert_eq!(position.tile_index, 0);
            assert_eq!(position.frame, Some(3));
            assert!(matches!(
                **source,
                DaqError::FrameStall {
                    frame: 3,
                    attempts: 2
                }
            ));
        }
        other => panic!("expected ScanAborted, got {other:?}"),
    }
    // Frames 0..3 did not fill a four-frame block, so nothing reached the store.
    assert_eq!(scan.store().frames_written(0), 0);
    assert!(journal.contains(&DeviceEvent::ZerosWritten));
    assert_eq!(journal.released().len(), 6);
}

#[tokio::test]
async fn test_cancellation_stops_mid_tile_and_shuts_down() {
    let dir = tempfile::tempdir().unwrap();
    let factory = SimulatedFactory::default();
    let journal = factory.journal();
    let (handle, token) = cancellation();
    let mut scan = ScanSequencer::new(
        load(dir.path()),
        MemoryPyramid::new(),
        RunOptions::default(),
        token,
    )
    .unwrap();
    let mut previews = scan.add_preview_tap(1);
    tokio::spawn(async move {
        if previews.recv().await.is_some() {
            handle.cancel();
        }
    });

    let err = scan.run(&factory).await.unwrap_err();
    assert!(matches!(err.root(), DaqError::Cancelled));
    match &err {
        DaqError::ScanAborted { position, .. } => {
            assert_eq!(position.tile_index, 0);
            assert!(position.frame.is_some());
        }
        other => panic!("expected ScanAborted, got {other:?}"),
    }
    assert_eq!(journal.count(|e| matches!(e, DeviceEvent::AcquisitionStarted { .. })), 1);
    assert!(journal.contains(&DeviceEvent::LaserDisabled(1)));
    assert_eq!(journal.released().len(), 6);
    assert_eq!(scan.state(), ScanState::Aborted);
}

#[tokio::test]
async fn test_codec_environment_mismatch_opens_no_device() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = load(dir.path());
    config.channels[0].quant_sigma = Some(1.0);
    config.storage.codec.environment_variable = Some("LSM_DAQ_TEST_CODEC_RUNTIME".into());
    config.storage.codec.required_environment = Some("never-set".into());

    let factory = SimulatedFactory::default();
    let journal = factory.journal();
    let err = sequencer(config.clone(), MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::CodecEnvironmentMismatch { .. }));
    assert!(journal.opened().is_empty());

    let overridden = RunOptions {
        allow_codec_env_mismatch: true,
    };
    let mut scan =
        ScanSequencer::new(config, MemoryPyramid::new(), overridden, CancelToken::never()).unwrap();
    let report = scan.run(&SimulatedFactory::default()).await.unwrap();
    assert_eq!(report.tiles_completed, 8);
}

#[test]
fn test_excessive_laser_drive_is_rejected_before_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = load(dir.path());
    config.channels[1].nominal_drive = 95.0;
    config.channels[1].attenuation_mm = 0.01;
    let err = ScanSequencer::new(
        config,
        MemoryPyramid::new(),
        RunOptions::default(),
        CancelToken::never(),
    )
    .err()
    .expect("pre-flight must fail");
    match err {
        DaqError::LaserDriveOutOfRange { wavelength, .. } => assert_eq!(wavelength, "561"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_power_drive_reaches_the_laser_as_current() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = load(dir.path());
    config.laser.drive = DriveQuantity::Power;
    assert!(matches!(
        ScanSequencer::new(
            config.clone(),
            MemoryPyramid::new(),
            RunOptions::default(),
            CancelToken::never()
        ),
        Err(DaqError::Configuration(_))
    ));

    for channel in &mut config.channels {
        channel.power_curve =
            Some(PowerCurve::new(vec![0.0, 80.0], vec![0.0, 400.0], 1.0, 0.0).unwrap());
        channel.max_current_ma = Some(450.0);
    }
    let factory = SimulatedFactory::default();
    let journal = factory.journal();
    sequencer(config, MemoryPyramid::new())
        .run(&factory)
        .await
        .unwrap();
    let surface: Vec<f64> = journal
        .events()
        .iter()
        .filter_map(|e| match e {
            DeviceEvent::HighLevelSet { value, .. } => Some(*value),
            _ => None,
        })
        .take(2)
        .collect();
    // 40 mW and 30 mW at the surface, five milliamps per milliwatt.
    assert_eq!(surface, vec![200.0, 150.0]);
}

#[test]
fn test_example_configuration_is_valid() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/scan.example.toml");
    let config = ScanConfig::load(&path).unwrap();
    assert!(!config.channels.is_empty());
    assert!(config.experiment.wells.is_some());
}
