//! Accumulates stereo chessboard observations for calibration.

use super::sample::CorrespondenceSample;
use crate::camera::Resolution;
use crate::device::StereoFrame;
use crate::solver::{BoardDetector, BoardPattern, CornerRefiner, NoRefinement};
use image::{DynamicImage, GenericImageView};
use log::{debug, info, warn};
use nalgebra::Vector2;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum CollectorError {
    #[error("Frame size {actual} differs from the session frame size {expected}")]
    ResolutionMismatch {
        expected: Resolution,
        actual: Resolution,
    },
    #[error("Left frame is {left} but right frame is {right}")]
    FrameSizeMismatch { left: Resolution, right: Resolution },
    #[error("CSV export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to a frame pair offered to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// A sample was added at `index`.
    Accepted { index: usize },
    /// The board was missing from at least one frame; nothing was added.
    NotDetected { left_found: bool, right_found: bool },
}

impl AcceptOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptOutcome::Accepted { .. })
    }
}

/// Raw-pair archive: `<root>/cam1/<session>/<index>.png` and the same under `cam2`.
#[derive(Debug, Clone)]
struct SampleArchive {
    root: PathBuf,
    session: String,
}

impl SampleArchive {
    fn paths(&self, index: usize) -> [PathBuf; 2] {
        ["cam1", "cam2"].map(|camera| {
            self.root
                .join(camera)
                .join(&self.session)
                .join(format!("{index}.png"))
        })
    }

    fn store(
        &self,
        index: usize,
        left: &DynamicImage,
        right: &DynamicImage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let [left_path, right_path] = self.paths(index);
        for (image, path) in [(left, left_path), (right, right_path)] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            image.save(&path)?;
        }
        Ok(())
    }
}

fn frame_size(image: &DynamicImage) -> Resolution {
    let (width, height) = image.dimensions();
    Resolution::new(width, height)
}

pub struct CorrespondenceCollector {
    pattern: BoardPattern,
    detector: Arc<dyn BoardDetector>,
    refiner: Arc<dyn CornerRefiner>,
    archive: Option<SampleArchive>,
    samples: Vec<CorrespondenceSample>,
    image_size: Option<Resolution>,
}

impl CorrespondenceCollector {
    pub fn new(pattern: BoardPattern, detector: Arc<dyn BoardDetector>) -> Self {
        CorrespondenceCollector {
            pattern,
            detector,
            refiner: Arc::new(NoRefinement),
            archive: None,
            samples: Vec::new(),
            image_size: None,
        }
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn CornerRefiner>) -> Self {
        self.refiner = refiner;
        self
    }

    /// Archive every accepted pair as PNG files under `root`.
    pub fn with_archive(mut self, root: impl Into<PathBuf>, session: impl Into<String>) -> Self {
        self.archive = Some(SampleArchive {
            root: root.into(),
            session: session.into(),
        });
        self
    }

    pub fn pattern(&self) -> &BoardPattern {
        &self.pattern
    }

    pub fn samples(&self) -> &[CorrespondenceSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Frame size shared by all samples, fixed by the first accepted pair.
    pub fn image_size(&self) -> Option<Resolution> {
        self.image_size
    }

    /// Drops all samples and forgets the session frame size.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.image_size = None;
    }

    fn detect(&self, image: &DynamicImage) -> Option<Vec<Vector2<f64>>> {
        if crate::device::image_is_empty(image) {
            return None;
        }
        let corners = self.detector.detect(image, &self.pattern)?;
        if corners.len() != self.pattern.corner_count() {
            debug!(
                "Detector returned {} corners, expected {}",
                corners.len(),
                self.pattern.corner_count()
            );
            return None;
        }
        Some(corners)
    }

    /// Offers one synchronized frame pair.
    ///
    /// A sample is added only when the board is found in both frames. Frames
    /// of a different size than earlier samples, or a pair whose frames differ
    /// in size, are errors.
    pub fn accept(
        &mut self,
        left: &DynamicImage,
        right: &DynamicImage,
    ) -> Result<AcceptOutcome, CollectorError> {
        let left_size = frame_size(left);
        let right_size = frame_size(right);
        if !left_size.is_empty() && !right_size.is_empty() {
            if left_size != right_size {
                return Err(CollectorError::FrameSizeMismatch {
                    left: left_size,
                    right: right_size,
                });
            }
            if let Some(expected) = self.image_size {
                if expected != left_size {
                    return Err(CollectorError::ResolutionMismatch {
                        expected,
                        actual: left_size,
                    });
                }
            }
        }

        let left_corners = self.detect(left);
        let right_corners = self.detect(right);
        let (left_corners, right_corners) = match (left_corners, right_corners) {
            (Some(l), Some(r)) => (l, r),
            (l, r) => {
                debug!(
                    "Board not detected (left: {}, right: {})",
                    l.is_some(),
                    r.is_some()
                );
                return Ok(AcceptOutcome::NotDetected {
                    left_found: l.is_some(),
                    right_found: r.is_some(),
                });
            }
        };

        let left_corners = self.refiner.refine(left, left_corners);
        let right_corners = self.refiner.refine(right, right_corners);

        let index = self.samples.len();
        if let Some(archive) = &self.archive {
            if let Err(err) = archive.store(index, left, right) {
                warn!("Failed to archive calibration pair {index}: {err}");
            }
        }

        self.samples.push(CorrespondenceSample::new(
            self.pattern.object_points(),
            left_corners,
            right_corners,
        ));
        self.image_size.get_or_insert(left_size);
        info!("Accepted calibration pair {} ({} total)", index, self.samples.len());

        Ok(AcceptOutcome::Accepted { index })
    }

    /// Offers a stereo frame; invalid frames count as not detected.
    pub fn accept_stereo(&mut self, frame: &StereoFrame) -> Result<AcceptOutcome, CollectorError> {
        self.accept(&frame.left.image, &frame.right.image)
    }

    /// Writes every collected corner as one CSV row.
    pub fn export_csv(&self, path: &Path) -> Result<(), CollectorError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "sample", "point", "object_x", "object_y", "object_z", "left_u", "left_v", "right_u",
            "right_v",
        ])?;
        for (index, sample) in self.samples.iter().enumerate() {
            let rows = sample
                .object_points()
                .iter()
                .zip(sample.left_points())
                .zip(sample.right_points());
            for (point, ((object, left), right)) in rows.enumerate() {
                writer.write_record([
                    index.to_string(),
                    point.to_string(),
                    object.x.to_string(),
                    object.y.to_string(),
                    object.z.to_string(),
                    left.x.to_string(),
                    left.y.to_string(),
                    right.x.to_string(),
                    right.y.to_string(),
                ])?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::{ScriptedBoardDetector, SyntheticRig};
    use tempfile::tempdir;

    fn frame(width: u32, height: u32) -> DynamicImage {
        DynamicImage::new_luma8(width, height)
    }

    #[test]
    fn test_partial_detection_adds_nothing() {
        let rig = SyntheticRig::default();
        let sample = &rig.samples(1)[0];
        let detector = ScriptedBoardDetector::new();
        detector.push(Some(sample.left_points().to_vec()), None);

        let mut collector = CorrespondenceCollector::new(rig.pattern, Arc::new(detector));
        let outcome = collector.accept(&frame(640, 480), &frame(640, 480)).unwrap();

        assert_eq!(
            outcome,
            AcceptOutcome::NotDetected {
                left_found: true,
                right_found: false
            }
        );
        assert!(collector.is_empty());
        assert_eq!(collector.image_size(), None);
    }

    #[test]
    fn test_accepts_full_detection() {
        let rig = SyntheticRig::default();
        let sample = &rig.samples(1)[0];
        let detector = ScriptedBoardDetector::new();
        detector.push(
            Some(sample.left_points().to_vec()),
            Some(sample.right_points().to_vec()),
        );

        let mut collector = CorrespondenceCollector::new(rig.pattern, Arc::new(detector));
        let outcome = collector.accept(&frame(640, 480), &frame(640, 480)).unwrap();

        assert_eq!(outcome, AcceptOutcome::Accepted { index: 0 });
        assert_eq!(collector.samples()[0], *sample);
        assert_eq!(collector.image_size(), Some(Resolution::new(640, 480)));
    }

    #[test]
    fn test_wrong_corner_count_is_not_detected() {
        let rig = SyntheticRig::default();
        let sample = &rig.samples(1)[0];
        let detector = ScriptedBoardDetector::new();
        detector.push(
            Some(sample.left_points()[..10].to_vec()),
            Some(sample.right_points().to_vec()),
        );

        let mut collector = CorrespondenceCollector::new(rig.pattern, Arc::new(detector));
        let outcome = collector.accept(&frame(640, 480), &frame(640, 480)).unwrap();
        assert!(!outcome.is_accepted());
    }

    #[test]
    fn test_size_checks() {
        let rig = SyntheticRig::default();
        let sample = &rig.samples(1)[0];
        let detector = Arc::new(ScriptedBoardDetector::new());
        detector.push(
            Some(sample.left_points().to_vec()),
            Some(sample.right_points().to_vec()),
        );
        let mut collector = CorrespondenceCollector::new(rig.pattern, detector);

        assert!(matches!(
            collector.accept(&frame(640, 480), &frame(320, 240)),
            Err(CollectorError::FrameSizeMismatch { .. })
        ));

        collector.accept(&frame(640, 480), &frame(640, 480)).unwrap();
        assert!(matches!(
            collector.accept(&frame(320, 240), &frame(320, 240)),
            Err(CollectorError::ResolutionMismatch { .. })
        ));

        // Empty frames are a miss, not a size error
        let outcome = collector.accept(&frame(0, 0), &frame(640, 480)).unwrap();
        assert!(!outcome.is_accepted());

        collector.clear();
        assert!(collector.is_empty());
        assert_eq!(collector.image_size(), None);
    }

    #[test]
    fn test_archive_and_csv_export() {
        let rig = SyntheticRig::default();
        let samples = rig.samples(2);
        let detector = ScriptedBoardDetector::new();
        for sample in &samples {
            detector.push(
                Some(sample.left_points().to_vec()),
                Some(sample.right_points().to_vec()),
            );
        }
        let dir = tempdir().unwrap();
        let mut collector = CorrespondenceCollector::new(rig.pattern, Arc::new(detector))
            .with_archive(dir.path(), "run1");

        for _ in 0..2 {
            collector.accept(&frame(64, 48), &frame(64, 48)).unwrap();
        }
        assert!(dir.path().join("cam1/run1/0.png").exists());
        assert!(dir.path().join("cam2/run1/1.png").exists());

        let csv_path = dir.path().join("corners.csv");
        collector.export_csv(&csv_path).unwrap();
        let mut reader = csv::Reader::from_path(&csv_path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2 * rig.pattern.corner_count());
        assert_eq!(&rows[0][0], "0");
        assert_eq!(&rows[rows.len() - 1][0], "1");
    }
}
