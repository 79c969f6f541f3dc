// THEORY:
// The orchestrator never touches the filesystem directly. Everything it produces
// flows through the `ResultStore` capability: centroid lists per image and
// category, the batch totals, and the optional debug image. Each write is
// independent; a failed write is the store's problem to report and the run's
// problem to record, never a reason to stop the batch.
//
// `MemoryStore` keeps results in memory for tests and embedding.
// `DirectoryStore` lays results out under a root directory:
//
//   <root>/<image>/<category>.txt   one "x y" pair per line
//   <root>/totals.tsv               "category<TAB>count" per line
//   <root>/<image>_both.png         debug image

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use parking_lot::Mutex;
use tracing::debug;

use crate::core_modules::binary_mask::Point;
use crate::core_modules::utils::image_helper::image_helper;
use crate::error::StoreError;

/// Sink for post-processing results. Implementations must tolerate concurrent calls.
pub trait ResultStore: Send + Sync {
    fn write_centroids(&self, image: &str, category: &str, centroids: &[Point]) -> Result<(), StoreError>;

    fn write_totals(&self, totals: &BTreeMap<String, u64>) -> Result<(), StoreError>;

    fn write_debug_image(&self, image: &str, both: &RgbaImage) -> Result<(), StoreError>;
}

/// One `x y` line per centroid.
pub fn format_centroids(centroids: &[Point]) -> String {
    let mut out = String::with_capacity(centroids.len() * 8);
    for point in centroids {
        let _ = writeln!(out, "{} {}", point.x, point.y);
    }
    out
}

/// One `category<TAB>count` line per category, in name order.
pub fn format_totals(totals: &BTreeMap<String, u64>) -> String {
    let mut out = String::new();
    for (category, count) in totals {
        let _ = writeln!(out, "{category}\t{count}");
    }
    out
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    centroids: Mutex<BTreeMap<(String, String), Vec<Point>>>,
    totals: Mutex<Option<BTreeMap<String, u64>>>,
    debug_images: Mutex<BTreeMap<String, RgbaImage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn centroids(&self, image: &str, category: &str) -> Option<Vec<Point>> {
        self.centroids
            .lock()
            .get(&(image.to_string(), category.to_string()))
            .cloned()
    }

    pub fn centroid_count(&self) -> usize {
        self.centroids.lock().len()
    }

    pub fn totals(&self) -> Option<BTreeMap<String, u64>> {
        self.totals.lock().clone()
    }

    pub fn debug_image_names(&self) -> Vec<String> {
        self.debug_images.lock().keys().cloned().collect()
    }

    pub fn debug_image(&self, image: &str) -> Option<RgbaImage> {
        self.debug_images.lock().get(image).cloned()
    }
}

impl ResultStore for MemoryStore {
    fn write_centroids(&self, image: &str, category: &str, centroids: &[Point]) -> Result<(), StoreError> {
        self.centroids
            .lock()
            .insert((image.to_string(), category.to_string()), centroids.to_vec());
        Ok(())
    }

    fn write_totals(&self, totals: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        *self.totals.lock() = Some(totals.clone());
        Ok(())
    }

    fn write_debug_image(&self, image: &str, both: &RgbaImage) -> Result<(), StoreError> {
        self.debug_images.lock().insert(image.to_string(), both.clone());
        Ok(())
    }
}

/// Writes results as plain files under `root`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn write_text(&self, path: PathBuf, contents: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        fs::write(&path, contents).map_err(|source| StoreError::Io { path: path.clone(), source })?;
        debug!(path = %path.display(), "result written");
        Ok(())
    }
}

impl ResultStore for DirectoryStore {
    fn write_centroids(&self, image: &str, category: &str, centroids: &[Point]) -> Result<(), StoreError> {
        let path = self.root.join(image).join(format!("{category}.txt"));
        self.write_text(path, &format_centroids(centroids))
    }

    fn write_totals(&self, totals: &BTreeMap<String, u64>) -> Result<(), StoreError> {
        self.write_text(self.root.join("totals.tsv"), &format_totals(totals))
    }

    fn write_debug_image(&self, image: &str, both: &RgbaImage) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;
        let path = self.root.join(format!("{image}_both.png"));
        image_helper::save(&path, both).map_err(|source| StoreError::Image { path, source })
    }
}
