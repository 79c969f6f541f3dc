// THEORY:
// The `pipeline` module is the top-level API of the post-processing phase. It takes
// a batch of classified images plus the calibrated models and turns every image into
// a set of object centroids, independently and concurrently.
//
// Key architectural principles & per-image steps:
// 1.  **Classify**: Every category that has a calibrated model is run through the
//     `CentroidClassifier`. A missing mask or an abandoned labeling only costs that
//     image x category a diagnostic.
// 2.  **Exclude**: Cross-category `ExclusionRule`s are applied to the image's
//     centroid masks once all categories are classified.
// 3.  **Persist**: Centroids go to the `ResultStore` right away. Per-category counts
//     are added to the run's running totals under a lock.
// 4.  **Visualize (sampled)**: About `debug_sample_target` randomly chosen images per
//     run get a side-by-side "both" image. A missing original only skips that image.
// 5.  **Cooperative Stop**: Once the cancel flag is raised no new image is started.
//     Images in flight finish, but the running totals are discarded instead of
//     being finalized. An image whose labeling was cut short is marked partial:
//     it is neither persisted nor counted nor handed to reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::core_modules::binary_mask::{BinaryMask, Point};
use crate::core_modules::cancellation::CancelFlag;
use crate::core_modules::centroid_classifier::CentroidClassifier;
use crate::core_modules::erosion_calibrator::CalibratedModel;
use crate::core_modules::exclusion;
use crate::core_modules::reconciler::BatchCentroids;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::{Diagnostic, DiagnosticKind};
use crate::parallel_pipeline::WorkerPool;
use crate::store::ResultStore;

/// Supplies original pixel data for the debug image.
pub trait ImageSource: Send + Sync {
    /// Returns `None` when the image is not available.
    fn load_rgba(&self, image: &str) -> Option<RgbaImage>;
}

/// One classified image: a mask per category.
#[derive(Debug, Clone, Default)]
pub struct ImageInput {
    pub name: String,
    pub masks: BTreeMap<String, BinaryMask>,
}

impl ImageInput {
    pub fn new(name: impl Into<String>, masks: BTreeMap<String, BinaryMask>) -> Self {
        Self {
            name: name.into(),
            masks,
        }
    }
}

/// What post-processing produced for one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageResult {
    pub name: String,
    /// Final centroids per category, after exclusion.
    pub centroids: BTreeMap<String, Vec<Point>>,
    /// Number of centroids per category.
    pub counts: BTreeMap<String, u64>,
    /// True if a debug image was written for this image.
    pub debug_image: bool,
    /// True if cancellation cut a category's labeling short. Partial images are
    /// not persisted and carry no final counts.
    pub partial: bool,
}

/// The result of a post-processing run.
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// Completed images, in submission order.
    pub images: Vec<ImageResult>,
    /// Per-category totals over all images; `None` when the run was cancelled.
    pub totals: Option<BTreeMap<String, u64>>,
    pub cancelled: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl RunOutcome {
    /// Centroids of every completed, non-partial image, ready for reconciliation.
    pub fn predictions(&self) -> BatchCentroids {
        self.images
            .iter()
            .filter(|image| !image.partial)
            .map(|image| (image.name.clone(), image.centroids.clone()))
            .collect()
    }
}

/// Picks about `target` of `total` images for visualization.
pub fn pick_debug_subset(total: usize, target: usize, seed: Option<u64>) -> BTreeSet<usize> {
    if total == 0 || target == 0 {
        return BTreeSet::new();
    }
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    rand::seq::index::sample(&mut rng, total, target.min(total))
        .into_iter()
        .collect()
}

/// Runs classification, exclusion and persistence over a batch of images.
#[derive(Debug, Clone)]
pub struct PostProcessor {
    config: PipelineConfig,
    models: BTreeMap<String, Arc<CalibratedModel>>,
    classifier: CentroidClassifier,
}

impl PostProcessor {
    /// Only categories present in `models` are processed; failed categories are
    /// expected to have been left out by the caller.
    pub fn new(config: PipelineConfig, models: BTreeMap<String, Arc<CalibratedModel>>) -> Self {
        let classifier = CentroidClassifier::new(config.splitter.build());
        Self {
            config,
            models,
            classifier,
        }
    }

    /// Classifies and excludes one image. Never touches the store.
    pub fn process_image(&self, input: &ImageInput, cancel: &CancelFlag) -> (ImageResult, Vec<Diagnostic>) {
        let mut diagnostics = Vec::new();
        let mut partial = false;

        // --- 1. Classify each calibrated category ---
        let mut centroid_masks: BTreeMap<String, BinaryMask> = BTreeMap::new();
        for (category, model) in &self.models {
            let Some(mask) = input.masks.get(category) else {
                warn!(image = %input.name, %category, "no mask for category, skipping");
                diagnostics.push(
                    Diagnostic::new(DiagnosticKind::MissingInput, "no classified mask")
                        .for_image(&input.name)
                        .for_category(category),
                );
                continue;
            };
            match self.classifier.classify(mask, model, cancel) {
                Ok(classification) if classification.cancelled => {
                    debug!(image = %input.name, %category, "labeling cancelled, image is partial");
                    diagnostics.push(
                        Diagnostic::new(DiagnosticKind::Cancelled, "labeling cut short by cancellation")
                            .for_image(&input.name)
                            .for_category(category),
                    );
                    partial = true;
                    break;
                }
                Ok(classification) => {
                    debug!(
                        image = %input.name,
                        %category,
                        passed = classification.passed,
                        discarded = classification.discarded,
                        split = classification.split,
                        "mask classified"
                    );
                    centroid_masks.insert(category.clone(), classification.centroids);
                }
                Err(err) => {
                    warn!(image = %input.name, %category, "labeling abandoned: {err}");
                    diagnostics.push(
                        Diagnostic::new(DiagnosticKind::from(&err), err.to_string())
                            .for_image(&input.name)
                            .for_category(category),
                    );
                }
            }
        }

        if partial {
            let result = ImageResult {
                name: input.name.clone(),
                partial,
                ..ImageResult::default()
            };
            return (result, diagnostics);
        }

        // --- 2. Cross-category exclusion ---
        let cleared = exclusion::apply(&mut centroid_masks, &self.config.exclusion_rules);
        if cleared.iter().any(|c| *c > 0) {
            debug!(image = %input.name, ?cleared, "exclusion rules applied");
        }

        let mut result = ImageResult {
            name: input.name.clone(),
            ..ImageResult::default()
        };
        for (category, mask) in centroid_masks {
            let points = mask.positives();
            result.counts.insert(category.clone(), points.len() as u64);
            result.centroids.insert(category, points);
        }
        (result, diagnostics)
    }

    fn persist(
        &self,
        result: &mut ImageResult,
        visualize: bool,
        store: &dyn ResultStore,
        image_source: Option<&dyn ImageSource>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        for (category, points) in &result.centroids {
            if let Err(err) = store.write_centroids(&result.name, category, points) {
                warn!(image = %result.name, %category, "failed to store centroids: {err}");
                diagnostics.push(
                    Diagnostic::new(DiagnosticKind::Persistence, err.to_string())
                        .for_image(&result.name)
                        .for_category(category),
                );
            }
        }

        if !visualize {
            return;
        }
        let Some(original) = image_source.and_then(|source| source.load_rgba(&result.name)) else {
            warn!(image = %result.name, "original image unavailable, debug image skipped");
            diagnostics.push(
                Diagnostic::new(DiagnosticKind::Visualization, "original image unavailable")
                    .for_image(&result.name),
            );
            return;
        };
        let both = image_helper::compose_both(&original, &result.centroids);
        match store.write_debug_image(&result.name, &both) {
            Ok(()) => result.debug_image = true,
            Err(err) => {
                warn!(image = %result.name, "failed to store debug image: {err}");
                diagnostics.push(
                    Diagnostic::new(DiagnosticKind::Persistence, err.to_string()).for_image(&result.name),
                );
            }
        }
    }

    /// Processes every image on `pool` and finalizes the totals unless cancelled.
    pub async fn run(
        &self,
        images: Vec<ImageInput>,
        store: Arc<dyn ResultStore>,
        image_source: Option<Arc<dyn ImageSource>>,
        pool: &WorkerPool,
    ) -> RunOutcome {
        let names: Vec<String> = images.iter().map(|image| image.name.clone()).collect();
        let debug_subset = match image_source {
            Some(_) => pick_debug_subset(images.len(), self.config.debug_sample_target, self.config.debug_seed),
            None => BTreeSet::new(),
        };
        info!(
            images = images.len(),
            categories = self.models.len(),
            debug_images = debug_subset.len(),
            "post-processing started"
        );

        let totals: Arc<Mutex<BTreeMap<String, u64>>> = Arc::new(Mutex::new(BTreeMap::new()));
        let units: Vec<(ImageInput, bool)> = images
            .into_iter()
            .enumerate()
            .map(|(index, image)| (image, debug_subset.contains(&index)))
            .collect();

        let processor = self.clone();
        let cancel = pool.cancel_flag().clone();
        let job_store = Arc::clone(&store);
        let job_totals = Arc::clone(&totals);
        let outcome = pool
            .run(units, move |(input, visualize)| {
                let (mut result, mut diagnostics) = processor.process_image(&input, &cancel);
                if result.partial {
                    return (result, diagnostics);
                }
                processor.persist(
                    &mut result,
                    visualize,
                    job_store.as_ref(),
                    image_source.as_deref(),
                    &mut diagnostics,
                );
                let mut running = job_totals.lock();
                for (category, count) in &result.counts {
                    *running.entry(category.clone()).or_default() += count;
                }
                (result, diagnostics)
            })
            .await;

        // --- Collect ---
        let mut run = RunOutcome {
            cancelled: outcome.cancelled,
            ..RunOutcome::default()
        };
        for (slot, result) in outcome.results.into_iter().enumerate() {
            match result {
                Some((image, diagnostics)) => {
                    run.images.push(image);
                    run.diagnostics.extend(diagnostics);
                }
                None if outcome.panicked.contains(&slot) => {
                    run.diagnostics.push(
                        Diagnostic::new(DiagnosticKind::WorkerPanic, "image processing panicked")
                            .for_image(&names[slot]),
                    );
                }
                None => {}
            }
        }

        // --- Finalize totals ---
        if run.cancelled {
            info!(completed = run.images.len(), "post-processing cancelled, totals discarded");
            return run;
        }
        let mut final_totals = totals.lock().clone();
        for category in self.models.keys() {
            final_totals.entry(category.clone()).or_default();
        }
        if let Err(err) = store.write_totals(&final_totals) {
            warn!("failed to store totals: {err}");
            run.diagnostics
                .push(Diagnostic::new(DiagnosticKind::Persistence, err.to_string()));
        }
        for (category, total) in &final_totals {
            info!(%category, total, "category total");
        }
        info!(
            images = run.images.len(),
            diagnostics = run.diagnostics.len(),
            "post-processing finished"
        );
        run.totals = Some(final_totals);
        run
    }
}
