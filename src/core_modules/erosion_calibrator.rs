// THEORY:
// The `ErosionCalibrator` is the learning layer of the engine. It answers one
// question per category without a single hand-tuned size threshold: "how many
// pixels does one object of this category cover in the classifier's masks?"
//
// Key architectural principles & algorithm steps:
// 1.  **Ground Truth as Reference**: The user marked object locations with single
//     points. A blob that contains exactly one of those points is "pure": it is the
//     footprint of exactly one object. Blobs with no point are ignored (missed
//     objects), blobs with several points are ignored (merged objects).
// 2.  **Erosion Sweep**: Merged objects are resolved by eroding the mask again and
//     again. At each depth the mask is relabeled and pure blobs are collected, so
//     every depth gets its own sample of one-object sizes. The sweep for a depth
//     range ends at the first depth where the whole training set yields no pure
//     blob at all.
// 3.  **Private Work, Single Merge**: Each training image is swept by one worker into
//     a private per-depth result. The per-depth samples are merged on one thread
//     after the pool drains; no map is shared while workers run.
// 4.  **Data Sufficiency, Not Crashes**: A category with too few depth-0 pure blobs
//     fails calibration with a typed error. The caller excludes it and carries on
//     with the other categories.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::core_modules::binary_mask::{BinaryMask, Point};
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::cancellation::CancelFlag;
use crate::core_modules::distribution::{self, UnivariateDistribution};
use crate::error::{CalibrationError, Diagnostic, DiagnosticKind, LabelError};
use crate::parallel_pipeline::WorkerPool;

/// Known object locations for one image and one category.
pub type TrainingPointSet = Vec<Point>;

/// A training image: its classified masks and its training points, per category.
#[derive(Debug, Clone, Default)]
pub struct TrainingImage {
    pub name: String,
    pub masks: BTreeMap<String, BinaryMask>,
    pub points: BTreeMap<String, TrainingPointSet>,
}

/// Per-category size model, indexed by erosion depth.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CalibratedModel {
    pub category: String,
    /// `depths[e]` describes pure blobs after `e` erosions. Never empty.
    depths: Vec<UnivariateDistribution>,
}

impl CalibratedModel {
    /// Wraps per-depth distributions. Returns `None` when there is no depth 0.
    pub fn from_depths(category: impl Into<String>, depths: Vec<UnivariateDistribution>) -> Option<Self> {
        if depths.is_empty() {
            return None;
        }
        Some(Self {
            category: category.into(),
            depths,
        })
    }

    /// The depth-0 distribution used by the classifier.
    pub fn base(&self) -> &UnivariateDistribution {
        &self.depths[0]
    }

    pub fn depth(&self, depth: usize) -> Option<&UnivariateDistribution> {
        self.depths.get(depth)
    }

    /// The deepest erosion depth that produced at least one pure blob.
    pub fn max_depth(&self) -> usize {
        self.depths.len() - 1
    }

    pub fn depths(&self) -> &[UnivariateDistribution] {
        &self.depths
    }
}

/// What one worker learned from one training image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageSweep {
    /// `pure_sizes[e]` lists the sizes of pure blobs after `e` erosions.
    pub pure_sizes: Vec<Vec<usize>>,
    pub cancelled: bool,
}

/// Sweeps one training image through increasing erosion depths.
///
/// Stops when the mask is empty or `max_depth` has been processed.
pub fn sweep_image(
    mask: &BinaryMask,
    points: &[Point],
    max_depth: usize,
    cancel: &CancelFlag,
) -> Result<ImageSweep, LabelError> {
    let mut sweep = ImageSweep::default();
    let mut current = mask.clone();

    for depth in 0..=max_depth {
        if current.is_empty() {
            break;
        }
        let labeling = blob_detector::label(&current, cancel)?;
        if labeling.cancelled {
            sweep.cancelled = true;
            break;
        }

        // --- Count training points per blob ---
        let owner = blob_detector::label_map(current.width(), current.height(), &labeling.blobs)?;
        let mut hits = vec![0usize; labeling.blobs.len()];
        for point in points {
            if point.x >= current.width() || point.y >= current.height() {
                continue;
            }
            if let Some(blob_index) = owner[current.index(point.x, point.y)] {
                hits[blob_index] += 1;
            }
        }

        let pure: Vec<usize> = labeling
            .blobs
            .iter()
            .zip(&hits)
            .filter(|(_, count)| **count == 1)
            .map(|(blob, _)| blob.size())
            .collect();
        debug!(depth, blobs = labeling.blobs.len(), pure = pure.len(), "erosion depth swept");
        sweep.pure_sizes.push(pure);

        current = current.erode();
    }

    Ok(sweep)
}

/// Merges per-image sweeps and fits one distribution per valid depth.
pub fn build_model(
    category: &str,
    sweeps: &[ImageSweep],
    min_viable_samples: usize,
) -> Result<CalibratedModel, CalibrationError> {
    if sweeps.is_empty() {
        return Err(CalibrationError::NoTrainingData);
    }

    // --- Single-threaded merge ---
    let deepest = sweeps.iter().map(|s| s.pure_sizes.len()).max().unwrap_or(0);
    let mut samples: Vec<Vec<usize>> = Vec::with_capacity(deepest);
    for depth in 0..deepest {
        let merged: Vec<usize> = sweeps
            .iter()
            .filter_map(|s| s.pure_sizes.get(depth))
            .flatten()
            .copied()
            .collect();
        if merged.is_empty() {
            break;
        }
        samples.push(merged);
    }

    let found = samples.first().map_or(0, Vec::len);
    if found < min_viable_samples {
        return Err(CalibrationError::InsufficientSamples {
            found,
            required: min_viable_samples,
        });
    }

    let depths = samples
        .iter()
        .map(|sample| distribution::fit(sample))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| CalibrationError::NoTrainingData)?;

    CalibratedModel::from_depths(category, depths).ok_or(CalibrationError::NoTrainingData)
}

/// Calibrates one category on the current thread.
pub fn calibrate(
    category: &str,
    images: &[TrainingImage],
    config: &PipelineConfig,
    cancel: &CancelFlag,
) -> Result<CalibratedModel, CalibrationError> {
    let mut sweeps = Vec::new();
    for image in images {
        let (Some(mask), Some(points)) = (image.masks.get(category), image.points.get(category))
        else {
            continue;
        };
        let sweep = sweep_image(mask, points, config.max_erosion_depth, cancel)?;
        if sweep.cancelled {
            return Err(CalibrationError::Cancelled);
        }
        sweeps.push(sweep);
    }
    build_model(category, &sweeps, config.min_viable_samples)
}

/// The result of calibrating a set of categories.
#[derive(Debug, Default)]
pub struct CalibrationReport {
    pub models: BTreeMap<String, Arc<CalibratedModel>>,
    pub failures: BTreeMap<String, CalibrationError>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Calibrates every category concurrently, one unit per (category, training image).
///
/// Categories that fail are listed in `failures`; the others are usable even if
/// some of their training images had to be skipped.
pub async fn calibrate_all(
    images: Arc<Vec<TrainingImage>>,
    categories: &[String],
    config: &PipelineConfig,
    pool: &WorkerPool,
) -> CalibrationReport {
    info!(categories = categories.len(), images = images.len(), "calibration started");
    let mut report = CalibrationReport::default();

    // --- 1. Build units, skipping missing inputs ---
    let mut units: Vec<(String, usize)> = Vec::new();
    for category in categories {
        for (index, image) in images.iter().enumerate() {
            match (image.masks.contains_key(category), image.points.contains_key(category)) {
                (true, true) => units.push((category.clone(), index)),
                (has_mask, _) => {
                    let missing = if has_mask { "training points" } else { "mask" };
                    warn!(image = %image.name, %category, "skipping training image without {missing}");
                    report.diagnostics.push(
                        Diagnostic::new(DiagnosticKind::MissingInput, format!("no {missing}"))
                            .for_image(&image.name)
                            .for_category(category),
                    );
                }
            }
        }
    }

    // --- 2. Sweep every unit in the pool ---
    let max_depth = config.max_erosion_depth;
    let cancel = pool.cancel_flag().clone();
    let job_images = Arc::clone(&images);
    let outcome = pool
        .run(units.clone(), move |(category, index)| {
            let image = &job_images[index];
            match (image.masks.get(&category), image.points.get(&category)) {
                (Some(mask), Some(points)) => sweep_image(mask, points, max_depth, &cancel),
                _ => Ok(ImageSweep::default()),
            }
        })
        .await;

    // --- 3. Merge per category ---
    let mut sweeps: BTreeMap<&str, Vec<ImageSweep>> =
        categories.iter().map(|c| (c.as_str(), Vec::new())).collect();
    for (slot, ((category, index), result)) in units.iter().zip(outcome.results).enumerate() {
        let image_name = &images[*index].name;
        match result {
            Some(Ok(sweep)) => {
                if !sweep.cancelled {
                    if let Some(list) = sweeps.get_mut(category.as_str()) {
                        list.push(sweep);
                    }
                }
            }
            Some(Err(err)) => {
                warn!(image = %image_name, %category, "labeling abandoned: {err}");
                report.diagnostics.push(
                    Diagnostic::new(DiagnosticKind::from(&err), err.to_string())
                        .for_image(image_name)
                        .for_category(category),
                );
            }
            None if outcome.panicked.contains(&slot) => {
                report.diagnostics.push(
                    Diagnostic::new(DiagnosticKind::WorkerPanic, "training image sweep panicked")
                        .for_image(image_name)
                        .for_category(category),
                );
            }
            None => {}
        }
    }

    for (category, category_sweeps) in sweeps {
        let result = if outcome.cancelled {
            Err(CalibrationError::Cancelled)
        } else {
            build_model(category, &category_sweeps, config.min_viable_samples)
        };
        match result {
            Ok(model) => {
                let base = model.base();
                info!(
                    %category,
                    depths = model.max_depth() + 1,
                    samples = base.count,
                    bottom = base.bottom,
                    top = base.top,
                    median = base.median,
                    "category calibrated"
                );
                report.models.insert(category.to_string(), Arc::new(model));
            }
            Err(err) => {
                warn!(%category, "calibration failed: {err}");
                if let CalibrationError::InsufficientSamples { .. } = err {
                    report.diagnostics.push(
                        Diagnostic::new(DiagnosticKind::InsufficientData, err.to_string())
                            .for_category(category),
                    );
                }
                report.failures.insert(category.to_string(), err);
            }
        }
    }

    info!(
        calibrated = report.models.len(),
        failed = report.failures.len(),
        "calibration finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::centroid_classifier::{BlobVerdict, verdict};
    use crate::core_modules::utils::synthetic;

    fn config() -> PipelineConfig {
        PipelineConfig {
            threads: 2,
            ..PipelineConfig::default()
        }
    }

    /// Two 5x5 squares joined by a three-pixel bridge on their middle row.
    fn bridged_pair() -> (BinaryMask, Vec<Point>) {
        let mut mask = BinaryMask::new(20, 10);
        synthetic::paint_rect(&mut mask, 2, 2, 5, 5);
        synthetic::paint_rect(&mut mask, 10, 2, 5, 5);
        synthetic::paint_rect(&mut mask, 7, 4, 3, 1);
        (mask, vec![Point::new(4, 4), Point::new(12, 4)])
    }

    #[test]
    fn merged_pair_is_pure_only_after_erosion() {
        let (mask, points) = bridged_pair();
        let sweep = sweep_image(&mask, &points, 10, &CancelFlag::new()).unwrap();

        assert!(sweep.pure_sizes[0].is_empty(), "merged blob holds two points");
        assert_eq!(sweep.pure_sizes[1], vec![10, 10]);
        assert!(!sweep.cancelled);
    }

    #[test]
    fn blobs_without_points_are_not_pure() {
        let mut mask = BinaryMask::new(12, 12);
        synthetic::paint_rect(&mut mask, 1, 1, 3, 3);
        synthetic::paint_rect(&mut mask, 7, 7, 3, 3);
        let sweep = sweep_image(&mask, &[Point::new(2, 2)], 0, &CancelFlag::new()).unwrap();
        assert_eq!(sweep.pure_sizes, vec![vec![9]]);
    }

    #[test]
    fn sweep_stops_at_max_depth_or_empty_mask() {
        let mut mask = BinaryMask::new(30, 30);
        synthetic::paint_rect(&mut mask, 5, 5, 9, 9);
        let points = [Point::new(9, 9)];

        let capped = sweep_image(&mask, &points, 1, &CancelFlag::new()).unwrap();
        assert_eq!(capped.pure_sizes.len(), 2);

        // 9x9 erodes to 7x7, 5x5, 3x3, 1x1, then nothing.
        let full = sweep_image(&mask, &points, 64, &CancelFlag::new()).unwrap();
        let sizes: Vec<usize> = full.pure_sizes.iter().map(|s| s[0]).collect();
        assert_eq!(sizes, vec![81, 49, 25, 9, 1]);
    }

    #[test]
    fn clean_training_set_passes_every_object() {
        let images = synthetic::isolated_training_set(10, "nucleus");
        let model = calibrate("nucleus", &images, &config(), &CancelFlag::new()).unwrap();

        let base = model.base();
        let all_sizes: Vec<usize> = synthetic::ISOLATED_SIDES.iter().map(|(w, h)| w * h).collect();
        let smallest = *all_sizes.iter().min().unwrap();
        let largest = *all_sizes.iter().max().unwrap();
        // The lower cutoff is inclusive, so landing exactly on the smallest
        // object still keeps it.
        assert_eq!(base.bottom, smallest);
        assert!(base.top >= largest);
        for size in all_sizes {
            assert_eq!(verdict(size, base), BlobVerdict::Pass, "size {size}");
        }
        assert!(model.max_depth() >= 1);
    }

    #[test]
    fn too_few_pure_blobs_fails_the_category() {
        let images = synthetic::isolated_training_set(1, "nucleus");
        let err = calibrate("nucleus", &images, &config(), &CancelFlag::new()).unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientSamples { required: 8, .. }
        ));
    }

    #[test]
    fn merge_truncates_at_first_empty_depth() {
        let sweeps = vec![
            ImageSweep {
                pure_sizes: vec![vec![10; 8], vec![], vec![3]],
                cancelled: false,
            },
            ImageSweep {
                pure_sizes: vec![vec![12]],
                cancelled: false,
            },
        ];
        let model = build_model("cell", &sweeps, 8).unwrap();
        assert_eq!(model.max_depth(), 0);
        assert_eq!(model.base().count, 9);
    }

    #[test]
    fn no_sweeps_means_no_training_data() {
        assert_eq!(
            build_model("cell", &[], 8),
            Err(CalibrationError::NoTrainingData)
        );
    }

    #[tokio::test]
    async fn calibrate_all_reports_failures_per_category() {
        let mut images = synthetic::isolated_training_set(10, "nucleus");
        // "debris" only has one training image with points, far below the minimum.
        let mut lone = BinaryMask::new(16, 16);
        synthetic::paint_rect(&mut lone, 4, 4, 3, 3);
        images[0].masks.insert("debris".into(), lone);
        images[0].points.insert("debris".into(), vec![Point::new(5, 5)]);
        // A mask without points is skipped with a diagnostic.
        images[1].masks.insert("debris".into(), BinaryMask::new(16, 16));

        let pool = WorkerPool::new(3, CancelFlag::new());
        let categories = vec!["nucleus".to_string(), "debris".to_string()];
        let report = calibrate_all(Arc::new(images), &categories, &config(), &pool).await;

        assert!(report.models.contains_key("nucleus"));
        assert!(matches!(
            report.failures.get("debris"),
            Some(CalibrationError::InsufficientSamples { found: 1, .. })
        ));
        assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::MissingInput
            && d.image.as_deref() == Some("train_01")
            && d.category.as_deref() == Some("debris")));
        assert!(report.diagnostics.iter().any(|d| d.kind == DiagnosticKind::InsufficientData));
    }

    #[tokio::test]
    async fn calibrate_all_matches_sequential_calibration() {
        let images = synthetic::isolated_training_set(10, "nucleus");
        let sequential = calibrate("nucleus", &images, &config(), &CancelFlag::new()).unwrap();

        let pool = WorkerPool::new(4, CancelFlag::new());
        let report = calibrate_all(Arc::new(images), &["nucleus".to_string()], &config(), &pool).await;
        assert_eq!(report.models["nucleus"].as_ref(), &sequential);
    }

    #[tokio::test]
    async fn cancelled_calibration_fails_every_category() {
        let images = synthetic::isolated_training_set(10, "nucleus");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let pool = WorkerPool::new(2, cancel);
        let report = calibrate_all(Arc::new(images), &["nucleus".to_string()], &config(), &pool).await;
        assert!(report.models.is_empty());
        assert_eq!(report.failures.get("nucleus"), Some(&CalibrationError::Cancelled));
    }
}
