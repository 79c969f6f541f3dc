// Example runner for the `phenotype_vision` library: calibrates on a synthetic
// training set, post-processes a synthetic batch and reconciles the result against
// the batch's ground truth.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use anyhow::{Context, bail};
use image::RgbaImage;
use tracing::{info, warn};

use phenotype_vision::config::PipelineConfig;
use phenotype_vision::core_modules::binary_mask::BinaryMask;
use phenotype_vision::core_modules::cancellation::CancelFlag;
use phenotype_vision::core_modules::erosion_calibrator::calibrate_all;
use phenotype_vision::core_modules::reconciler::{self, BatchCentroids};
use phenotype_vision::core_modules::utils::image_helper::image_helper;
use phenotype_vision::core_modules::utils::synthetic::{self, SceneOptions};
use phenotype_vision::logging;
use phenotype_vision::parallel_pipeline::WorkerPool;
use phenotype_vision::pipeline::{ImageInput, ImageSource, PostProcessor};
use phenotype_vision::store::{DirectoryStore, MemoryStore, ResultStore};

const CATEGORIES: [&str; 2] = ["live", "dead"];
const TRAINING_IMAGES: usize = 12;
const BATCH_IMAGES: usize = 30;
const DEFAULT_MATCH_RADIUS: f64 = 4.0;

/// Stands in for the image cache by rendering the classified masks.
struct RenderedMasks {
    masks: BTreeMap<String, BTreeMap<String, BinaryMask>>,
}

impl ImageSource for RenderedMasks {
    fn load_rgba(&self, image: &str) -> Option<RgbaImage> {
        image_helper::render_masks(self.masks.get(image)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("info")?;

    // --- 1. Argument Parsing & Config ---
    let args: Vec<String> = env::args().collect();
    let mut config = match args.get(1) {
        Some(path) => PipelineConfig::from_path(path).with_context(|| format!("loading {path}"))?,
        None => PipelineConfig::default(),
    };
    let categories: Vec<String> = CATEGORIES.iter().map(|c| c.to_string()).collect();
    for category in &categories {
        config
            .match_radii
            .entry(category.clone())
            .or_insert(DEFAULT_MATCH_RADIUS);
    }
    config.validate()?;

    let store: Arc<dyn ResultStore> = match args.get(2) {
        Some(dir) => Arc::new(DirectoryStore::new(dir)),
        None => Arc::new(MemoryStore::new()),
    };

    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            on_signal.cancel();
        }
    });
    let pool = WorkerPool::new(config.threads, cancel);

    // --- 2. Synthetic Data ---
    let options = SceneOptions::default();
    let training: Vec<_> = synthetic::random_batch("train", TRAINING_IMAGES, &categories, &options, 1)
        .iter()
        .map(|scene| scene.to_training_image())
        .collect();
    let batch = synthetic::random_batch("img", BATCH_IMAGES, &categories, &options, 2);

    // --- 3. Calibration ---
    let report = calibrate_all(Arc::new(training), &categories, &config, &pool).await;
    for (category, err) in &report.failures {
        warn!(%category, "category excluded: {err}");
    }
    if report.models.is_empty() {
        bail!("no category could be calibrated");
    }

    // --- 4. Post-processing ---
    let inputs: Vec<ImageInput> = batch
        .iter()
        .map(|scene| ImageInput::new(scene.name.clone(), scene.masks.clone()))
        .collect();
    let image_source: Arc<dyn ImageSource> = Arc::new(RenderedMasks {
        masks: batch
            .iter()
            .map(|scene| (scene.name.clone(), scene.masks.clone()))
            .collect(),
    });
    let processor = PostProcessor::new(config.clone(), report.models);
    let run = processor
        .run(inputs, store, Some(image_source), &pool)
        .await;
    for diagnostic in &run.diagnostics {
        warn!("{diagnostic}");
    }
    if run.cancelled {
        info!(completed = run.images.len(), "run cancelled");
        return Ok(());
    }

    // --- 5. Reconciliation ---
    let truth: BatchCentroids = batch
        .iter()
        .map(|scene| (scene.name.clone(), scene.truth.clone()))
        .collect();
    let reconciliation = reconciler::reconcile(
        Arc::new(run.predictions()),
        Arc::new(truth),
        &config.match_radii,
        &pool,
    )
    .await;

    let missed: usize = reconciliation.false_negatives.values().map(Vec::len).sum();
    println!("{}", reconciliation.tabulation.to_table());
    println!(
        "{} false negatives across {} images",
        missed,
        reconciliation.false_negatives.len()
    );
    Ok(())
}
