use approx::assert_relative_eq;
use image::{DynamicImage, GrayImage};
use nalgebra::{Matrix3, Vector3, Vector4};
use std::sync::Arc;
use std::time::Duration;
use stereo_rig_tools::calibration::{
    AcceptOutcome, CalibrationOrchestrator, CalibrationSolvers, Camera, CorrespondenceCollector,
    JsonFileStore, MemoryStore,
};
use stereo_rig_tools::config::{RigConfig, SessionConfig};
use stereo_rig_tools::device::{CameraSessionManager, ConnectionState};
use stereo_rig_tools::events::EventBus;
use stereo_rig_tools::geometry::{projection_matrix, resolve_homogeneous, triangulate_dlt};
use stereo_rig_tools::localization::{
    Confidence, LocalizationError, MarkerLocalizationEngine, MarkerTrack,
};
use stereo_rig_tools::synthetic::{
    FakeBackend, FakeDeviceSpec, ScriptedBoardDetector, ScriptedMarkerDetector, SyntheticRig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        settle_delay_ms: 5,
        ready_poll_interval_ms: 5,
        ..SessionConfig::default()
    }
}

fn stereo_sessions(backend: &FakeBackend, events: &EventBus) -> CameraSessionManager {
    backend.add_device(0, FakeDeviceSpec::ready_after(1));
    backend.add_device(1, FakeDeviceSpec::ready_after(0));
    CameraSessionManager::new(Arc::new(backend.clone()), fast_session(), events.clone())
}

#[tokio::test]
async fn test_connect_present_device_and_read_frames() {
    init_logging();
    let backend = FakeBackend::new();
    backend.add_device(3, FakeDeviceSpec::ready_after(2));
    let sessions = CameraSessionManager::new(
        Arc::new(backend.clone()),
        SessionConfig::default(),
        EventBus::default(),
    );

    let started = std::time::Instant::now();
    let handle = sessions.connect(3).await.unwrap();
    assert_eq!(handle.state, ConnectionState::Connected);
    assert!(started.elapsed() < Duration::from_secs(10));

    let first = sessions.get_current_frame(3).unwrap();
    let second = sessions.get_current_frame(3).unwrap();
    assert!(second.timestamp > first.timestamp);
    assert!(!first.is_empty());

    // Disconnecting twice is harmless
    assert!(sessions.disconnect(3));
    assert!(!sessions.disconnect(3));
    assert!(!sessions.disconnect(42));
    assert_eq!(backend.released(), 1);
}

#[tokio::test]
async fn test_collect_calibrate_and_localize() {
    init_logging();
    let rig = SyntheticRig::default();
    let backend = FakeBackend::new();
    let events = EventBus::default();
    let sessions = stereo_sessions(&backend, &events);
    sessions.connect(0).await.unwrap();
    sessions.connect(1).await.unwrap();

    // Collection: one partial detection, then ten full ones
    let detector = Arc::new(ScriptedBoardDetector::new());
    let mut collector = CorrespondenceCollector::new(rig.pattern, detector.clone());
    let samples = rig.samples(10);

    detector.push(None, Some(samples[0].right_points().to_vec()));
    let frame = sessions.capture_stereo(0, 1).unwrap();
    assert_eq!(
        collector.accept_stereo(&frame).unwrap(),
        AcceptOutcome::NotDetected {
            left_found: false,
            right_found: true
        }
    );
    assert!(collector.is_empty());

    for sample in &samples {
        detector.push_sample(sample);
        let frame = sessions.capture_stereo(0, 1).unwrap();
        assert!(collector.accept_stereo(&frame).unwrap().is_accepted());
    }
    assert_eq!(collector.len(), 10);

    // Calibration
    let dir = tempfile::tempdir().unwrap();
    let result_path = dir.path().join("calibration_result.json");
    let orchestrator = CalibrationOrchestrator::new(
        RigConfig::default().calibration,
        CalibrationSolvers::with_prior_intrinsics(rig.left.clone(), rig.right.clone()),
        Arc::new(JsonFileStore::new(&result_path)),
        events.clone(),
    );
    let image_size = collector.image_size().unwrap();
    let outcome = orchestrator
        .calibrate_in_background(collector.samples().to_vec(), image_size)
        .await
        .unwrap();
    let result = outcome.result.clone();

    assert_eq!(result.sample_count(), 10);
    assert_eq!(result.image_size(), image_size);
    assert_eq!(result.camera_matrix(Camera::Left).shape(), (3, 3));
    assert_eq!(result.distortion(Camera::Right).len(), 5);
    assert_eq!(result.essential().shape(), (3, 3));
    assert_eq!(result.fundamental().shape(), (3, 3));
    assert_relative_eq!(*result.rotation(), rig.rotation, epsilon = 1e-7);
    assert_relative_eq!(*result.translation(), rig.translation, epsilon = 1e-5);
    assert!(result.rms() < 1e-6);
    assert!(outcome.persist_error.is_none());
    assert!(result_path.exists());

    // Localization through the shared calibration handle
    let markers = Arc::new(ScriptedMarkerDetector::new());
    let mut engine = MarkerLocalizationEngine::new(
        RigConfig::default().localization,
        orchestrator.handle(),
        markers.clone(),
        events.clone(),
    );
    let point = Vector3::new(25.0, -15.0, 750.0);
    let (left, right) = rig.marker_observations(11, &point, 12.0).unwrap();
    markers.push(vec![left], vec![right]);

    let frame = sessions.capture_stereo(0, 1).unwrap();
    let localized = engine.process_stereo(&frame).unwrap();
    assert_eq!(localized.len(), 1);
    assert_relative_eq!(localized[0].position, point, epsilon = 1e-4);
    assert_eq!(localized[0].confidence, Confidence::High);

    sessions.disconnect_all();
    assert_eq!(backend.released(), 2);
}

#[test]
fn test_low_confidence_marker_is_still_reported() {
    init_logging();
    let rig = SyntheticRig::default();
    let orchestrator = CalibrationOrchestrator::new(
        RigConfig::default().calibration,
        CalibrationSolvers::with_prior_intrinsics(rig.left.clone(), rig.right.clone()),
        Arc::new(MemoryStore::new()),
        EventBus::default(),
    );
    orchestrator
        .calibrate(&rig.samples(12), rig.image_size())
        .unwrap();

    let mut engine = MarkerLocalizationEngine::new(
        RigConfig::default().localization,
        orchestrator.handle(),
        Arc::new(ScriptedMarkerDetector::new()),
        EventBus::default(),
    );
    let (left, mut right) = rig
        .marker_observations(4, &Vector3::new(-20.0, 30.0, 900.0), 10.0)
        .unwrap();
    for corner in right.corners.iter_mut() {
        corner.y -= 25.0;
    }

    let active = orchestrator.active().unwrap();
    let localized = engine.localize(&active, &[left], &[right]).unwrap();
    assert_eq!(localized.len(), 1);
    assert_eq!(localized[0].confidence, Confidence::Low);
    assert!(localized[0].reprojection_error > 3.0);
}

#[test]
fn test_negative_scale_gives_same_point() {
    let rotation = Matrix3::identity();
    let translation = Vector3::new(-100.0, 0.0, 0.0);
    let p1 = projection_matrix(&Matrix3::identity(), &Vector3::zeros());
    let p2 = projection_matrix(&rotation, &translation);

    let point = Vector3::new(10.0, 20.0, 500.0);
    let x1 = point.xy() / point.z;
    let moved = rotation * point + translation;
    let x2 = moved.xy() / moved.z;

    let homogeneous = triangulate_dlt(&p1, &p2, &x1, &x2).unwrap();
    let positive = if homogeneous.w > 0.0 { homogeneous } else { -homogeneous };
    let negative: Vector4<f64> = -positive;

    let a = resolve_homogeneous(&positive, 1e-12).unwrap();
    let b = resolve_homogeneous(&negative, 1e-12).unwrap();
    assert_eq!(a, b);
    assert_relative_eq!(a, point, epsilon = 1e-6);
    assert_eq!(a.norm(), b.norm());
}

#[test]
fn test_outlier_distance_does_not_enter_history() {
    let mut track = MarkerTrack::new(5, 0.2);
    for d in [100.0, 101.0, 99.0, 100.0, 98.0] {
        track.push(d);
    }

    let rejected = track.push(500.0);
    assert!(!rejected.accepted);
    assert_relative_eq!(rejected.smoothed, 99.6, epsilon = 1e-12);
    assert_eq!(track.len(), 5);

    let accepted = track.push(105.0);
    assert!(accepted.accepted);
    assert_eq!(track.len(), 5);
    assert_relative_eq!(accepted.smoothed, 100.6, epsilon = 1e-12);
}

#[tokio::test]
async fn test_engine_follows_swapped_calibration() {
    init_logging();
    let first_rig = SyntheticRig::default();
    let second_rig = SyntheticRig {
        translation: Vector3::new(-150.0, 2.0, -1.0),
        ..SyntheticRig::default()
    };

    let orchestrator = CalibrationOrchestrator::new(
        RigConfig::default().calibration,
        CalibrationSolvers::with_prior_intrinsics(first_rig.left.clone(), first_rig.right.clone()),
        Arc::new(MemoryStore::new()),
        EventBus::default(),
    );
    let markers = Arc::new(ScriptedMarkerDetector::new());
    let mut engine = MarkerLocalizationEngine::new(
        RigConfig::default().localization,
        orchestrator.handle(),
        markers.clone(),
        EventBus::default(),
    );
    let image = DynamicImage::ImageLuma8(GrayImage::new(640, 480));
    let point = Vector3::new(15.0, 10.0, 700.0);

    // No calibration yet
    assert!(matches!(
        engine.process_pair(&image, &image),
        Err(LocalizationError::NotCalibrated)
    ));

    orchestrator
        .calibrate(&first_rig.samples(10), first_rig.image_size())
        .unwrap();
    let first = orchestrator.active().unwrap();
    let (left, right) = first_rig.marker_observations(1, &point, 10.0).unwrap();
    markers.push(vec![left], vec![right]);
    let localized = engine.process_pair(&image, &image).unwrap();
    assert_relative_eq!(localized[0].position, point, epsilon = 1e-4);

    orchestrator
        .calibrate_in_background(second_rig.samples(10), second_rig.image_size())
        .await
        .unwrap();
    let (left, right) = second_rig.marker_observations(2, &point, 10.0).unwrap();
    markers.push(vec![left], vec![right]);
    let localized = engine.process_pair(&image, &image).unwrap();
    assert_relative_eq!(localized[0].position, point, epsilon = 1e-4);
    assert_relative_eq!(
        localized[0].raw_distance,
        (point.norm() + (second_rig.rotation * point + second_rig.translation).norm()) / 2.0,
        epsilon = 1e-4
    );

    // A snapshot taken before the swap keeps the old extrinsics
    let second = orchestrator.active().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_relative_eq!(*first.translation(), first_rig.translation, epsilon = 1e-5);
    assert_relative_eq!(*second.translation(), second_rig.translation, epsilon = 1e-5);
}
