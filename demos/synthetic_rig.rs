//! Synthetic Stereo Rig Demo
//!
//! Runs the whole pipeline against in-memory cameras:
//! - connects two synthetic cameras
//! - collects chessboard correspondences from stereo frames
//! - calibrates the rig and saves the result as JSON
//! - localizes a marker moving in front of the rig
//!
//! Usage:
//! ```bash
//! cargo run --example synthetic_rig -- --samples 15 --output output/calibration_result.json
//! ```

use clap::Parser;
use flexi_logger::{colored_detailed_format, detailed_format, Duplicate, FileSpec, Logger};
use log::{debug, info, warn};
use nalgebra::Vector3;
use std::path::PathBuf;
use std::sync::Arc;
use stereo_rig_tools::calibration::{
    AcceptOutcome, CalibrationOrchestrator, CalibrationSolvers, Camera, CorrespondenceCollector,
    JsonFileStore,
};
use stereo_rig_tools::device::CameraSessionManager;
use stereo_rig_tools::events::{EventBus, RigEvent};
use stereo_rig_tools::localization::MarkerLocalizationEngine;
use stereo_rig_tools::synthetic::{
    FakeBackend, FakeDeviceSpec, ScriptedBoardDetector, ScriptedMarkerDetector, SyntheticRig,
};
use stereo_rig_tools::RigConfig;

/// Stereo calibration and marker localization on a synthetic rig
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Optional rig configuration YAML file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Number of calibration pairs to collect
    #[arg(short = 'n', long, default_value = "15")]
    samples: usize,

    /// Where to save the calibration result
    #[arg(short = 'o', long, default_value = "output/calibration_result.json")]
    output: PathBuf,

    /// Directory for archived calibration pairs
    #[arg(short = 'a', long)]
    archive: Option<PathBuf>,

    /// Depth of the localized marker, in board units
    #[arg(short = 'd', long, default_value = "800")]
    marker_depth: f64,
}

const LEFT: u32 = 0;
const RIGHT: u32 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Logger::try_with_str("info")?
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .suppress_timestamp()
                .suffix("log"),
        )
        .duplicate_to_stdout(Duplicate::All)
        .format_for_files(detailed_format)
        .format_for_stdout(colored_detailed_format)
        .set_palette("196;208;76;39;178".to_string())
        .start()?;

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => RigConfig::load_from_yaml(path)?,
        None => RigConfig::default(),
    };
    config.calibration.result_path = cli.output.clone();
    if cli.archive.is_some() {
        config.archive.directory = cli.archive.clone();
    }

    let rig = SyntheticRig {
        pattern: config.pattern,
        ..SyntheticRig::default()
    };

    // Event listener
    let events = EventBus::default();
    let mut receiver = events.subscribe();
    let listener = tokio::spawn(async move {
        while let Ok(event) = receiver.recv().await {
            match event {
                RigEvent::CameraStatus(status) => info!(
                    "Camera {} status: connected={} error={:?}",
                    status.camera_id, status.connected, status.error
                ),
                RigEvent::CalibrationCompleted(result) => {
                    info!("Calibration event: rms {:.6}", result.rms())
                }
                RigEvent::MarkerLocalized(marker) => debug!(
                    "Marker {} at {:.2} ({:?})",
                    marker.marker_id, marker.distance, marker.confidence
                ),
                RigEvent::FrameReceived(_) => {}
            }
        }
    });

    // Step 1: cameras
    info!("Step 1: connecting cameras");
    let backend = FakeBackend::new();
    backend.add_device(LEFT, FakeDeviceSpec::ready_after(1));
    backend.add_device(RIGHT, FakeDeviceSpec::ready_after(2));
    let sessions =
        CameraSessionManager::new(Arc::new(backend.clone()), config.session.clone(), events.clone());

    for camera in sessions.detect_cameras().await {
        info!("Found {} ({:?})", camera.name, camera.resolution);
    }
    sessions.connect(LEFT).await?;
    sessions.connect(RIGHT).await?;

    // Step 2: correspondences
    info!("Step 2: collecting {} calibration pairs", cli.samples);
    let detector = Arc::new(ScriptedBoardDetector::new());
    let mut collector = CorrespondenceCollector::new(config.pattern, detector.clone());
    if let Some(directory) = &config.archive.directory {
        collector = collector.with_archive(directory, config.archive.session.clone());
    }

    // One pair where the right camera misses the board
    if let Some(first) = rig.samples(1).first() {
        detector.push(Some(first.left_points().to_vec()), None);
        let frame = sessions
            .capture_stereo(LEFT, RIGHT)
            .ok_or("no stereo frame")?;
        if let AcceptOutcome::NotDetected { right_found, .. } = collector.accept_stereo(&frame)? {
            info!("Partial detection ignored (right found: {right_found})");
        }
    }

    for sample in rig.samples(cli.samples) {
        detector.push_sample(&sample);
        let frame = sessions
            .capture_stereo(LEFT, RIGHT)
            .ok_or("no stereo frame")?;
        collector.accept_stereo(&frame)?;
    }
    let corners_path = cli.output.with_file_name("corners.csv");
    if let Some(parent) = corners_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    collector.export_csv(&corners_path)?;
    info!(
        "Collected {} pairs, corners written to {}",
        collector.len(),
        corners_path.display()
    );

    // Step 3: calibration
    info!("Step 3: calibrating");
    let orchestrator = CalibrationOrchestrator::new(
        config.calibration.clone(),
        CalibrationSolvers::with_prior_intrinsics(rig.left.clone(), rig.right.clone()),
        Arc::new(JsonFileStore::new(&config.calibration.result_path)),
        events.clone(),
    );
    if orchestrator.restore().is_some() {
        info!("A previous calibration was found and will be replaced");
    }

    let image_size = collector.image_size().unwrap_or(rig.image_size());
    let outcome = orchestrator
        .calibrate_in_background(collector.samples().to_vec(), image_size)
        .await?;
    for warning in &outcome.warnings {
        warn!("Quality warning: {warning:?}");
    }
    if let Some(err) = &outcome.persist_error {
        warn!("Result not saved: {err}");
    }
    let result = &outcome.result;
    info!(
        "Quality {} | rms {:.6} | baseline {:.2} | |R - R_true| {:.2e}",
        outcome.quality,
        result.rms(),
        result.baseline(),
        (result.rotation() - rig.rotation).norm()
    );
    for camera in [Camera::Left, Camera::Right] {
        let path = cli.output.with_file_name(format!("{camera}.yaml"));
        result.export_camera_yaml(camera, &path)?;
        info!("Exported {camera} camera to {}", path.display());
    }

    // Step 4: localization
    info!("Step 4: localizing marker 7");
    let markers = Arc::new(ScriptedMarkerDetector::new());
    let mut engine = MarkerLocalizationEngine::new(
        config.localization.clone(),
        orchestrator.handle(),
        markers.clone(),
        events.clone(),
    );
    for step in 0..8 {
        let offset = f64::from(step) * 5.0;
        let point = Vector3::new(30.0 + offset, -10.0, cli.marker_depth + offset);
        let (left, right) = rig.marker_observations(7, &point, 15.0)?;
        markers.push(vec![left], vec![right]);

        let frame = sessions
            .capture_stereo(LEFT, RIGHT)
            .ok_or("no stereo frame")?;
        for marker in engine.process_stereo(&frame)? {
            info!(
                "Marker {}: distance {:.2} (raw {:.2}, truth {:.2}) reprojection {:.4} px {:?}",
                marker.marker_id,
                marker.distance,
                marker.raw_distance,
                point.norm(),
                marker.reprojection_error,
                marker.confidence
            );
        }
    }

    sessions.disconnect_all();
    info!(
        "Done: {} devices opened, {} released",
        backend.opened(),
        backend.released()
    );

    drop(sessions);
    drop(orchestrator);
    drop(engine);
    drop(events);
    let _ = listener.await;
    Ok(())
}
