// THEORY:
// A blob larger than the calibrated top cutoff is several objects the classifier
// painted as one. How to take it apart is a policy decision, so it sits behind the
// `BlobSplitter` capability: the classifier hands over the blob and the depth-0
// median ("one object is about this many pixels") and receives one coordinate per
// estimated sub-object.
//
// Two strategies ship with the engine and are selected through `SplitterKind`:
// 1.  **Erosion**: re-segment the blob by eroding it in isolation. Merged objects
//     usually touch through a neck that disappears long before their cores do. The
//     depth with the most separate cores wins. When erosion cannot separate as many
//     cores as the size estimate asks for, the cores seed a k-means pass that
//     places the rest.
// 2.  **K-Means**: partition the blob's pixels into `k` compact clusters, where `k`
//     is the size-based object count. Works for objects merged so tightly that no
//     neck exists.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core_modules::binary_mask::Point;
use crate::core_modules::blob::Blob;
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::cancellation::CancelFlag;

pub const DEFAULT_KMEANS_ITERATIONS: usize = 20;

/// Decomposes a merged blob into object locations.
pub trait BlobSplitter: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Returns one coordinate per estimated sub-object of `blob`.
    fn estimate_and_place(&self, blob: &Blob, size_estimate: f64, category: &str) -> Vec<Point>;
}

/// How many objects of `size_estimate` pixels fit in a blob of `blob_size`, at least one.
pub fn expected_count(blob_size: usize, size_estimate: f64) -> usize {
    if !size_estimate.is_finite() || size_estimate <= 0.0 {
        return 1;
    }
    ((blob_size as f64 / size_estimate).round() as usize).max(1)
}

/// Tagged selection of a splitting strategy, as it appears in the config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SplitterKind {
    #[default]
    Erosion,
    KMeans {
        #[serde(default = "default_kmeans_iterations")]
        iterations: usize,
    },
}

fn default_kmeans_iterations() -> usize {
    DEFAULT_KMEANS_ITERATIONS
}

impl SplitterKind {
    pub fn build(&self) -> Arc<dyn BlobSplitter> {
        match *self {
            SplitterKind::Erosion => Arc::new(ErosionSplitter),
            SplitterKind::KMeans { iterations } => Arc::new(KMeansSplitter { iterations }),
        }
    }
}

/// Splits by eroding the blob until it falls apart into separate cores.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErosionSplitter;

impl BlobSplitter for ErosionSplitter {
    fn name(&self) -> &'static str {
        "erosion"
    }

    fn estimate_and_place(&self, blob: &Blob, size_estimate: f64, _category: &str) -> Vec<Point> {
        let expected = expected_count(blob.size(), size_estimate).min(blob.size());
        let mut best = vec![blob.centroid()];
        if expected <= 1 {
            return best;
        }

        let (mut local, offset) = blob.to_local_mask();
        let cancel = CancelFlag::new();
        loop {
            local = local.erode();
            if local.is_empty() {
                break;
            }
            let Ok(cores) = blob_detector::label(&local, &cancel) else {
                break;
            };
            if cores.blobs.len() > best.len() {
                best = cores
                    .blobs
                    .iter()
                    .map(|core| {
                        let c = core.centroid();
                        Point::new(c.x + offset.x, c.y + offset.y)
                    })
                    .collect();
            }
            if best.len() >= expected {
                return best;
            }
        }

        // --- Too few cores: place the missing objects around them ---
        let pixels = blob_pixels(blob);
        let seeds: Vec<(f64, f64)> = best.iter().map(|p| (p.x as f64, p.y as f64)).collect();
        let centers = spread_seeds(&pixels, seeds, expected);
        lloyd(blob, &pixels, centers, DEFAULT_KMEANS_ITERATIONS)
    }
}

/// Splits by running Lloyd's k-means over the blob's pixels.
#[derive(Debug, Clone, Copy)]
pub struct KMeansSplitter {
    pub iterations: usize,
}

impl Default for KMeansSplitter {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_KMEANS_ITERATIONS,
        }
    }
}

impl BlobSplitter for KMeansSplitter {
    fn name(&self) -> &'static str {
        "k_means"
    }

    fn estimate_and_place(&self, blob: &Blob, size_estimate: f64, _category: &str) -> Vec<Point> {
        let k = expected_count(blob.size(), size_estimate).min(blob.size());
        if k <= 1 {
            return vec![blob.centroid()];
        }

        let pixels = blob_pixels(blob);
        let first = pixels[nearest_center(&pixels, blob.mean())];
        let centers = spread_seeds(&pixels, vec![first], k);
        lloyd(blob, &pixels, centers, self.iterations)
    }
}

fn blob_pixels(blob: &Blob) -> Vec<(f64, f64)> {
    blob.pixels.iter().map(|p| (p.x as f64, p.y as f64)).collect()
}

/// Lloyd iterations from the given centers, each final center snapped to the
/// nearest blob pixel.
fn lloyd(blob: &Blob, pixels: &[(f64, f64)], mut centers: Vec<(f64, f64)>, iterations: usize) -> Vec<Point> {
    let k = centers.len();
    let mut assignment = vec![usize::MAX; pixels.len()];

    for _ in 0..iterations.max(1) {
        // --- Assign ---
        let mut changed = false;
        for (i, pixel) in pixels.iter().enumerate() {
            let nearest = nearest_center(&centers, *pixel);
            if assignment[i] != nearest {
                assignment[i] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        // --- Update; an emptied cluster keeps its previous center ---
        let mut sums = vec![(0.0, 0.0, 0usize); k];
        for (pixel, &cluster) in pixels.iter().zip(&assignment) {
            let sum = &mut sums[cluster];
            sum.0 += pixel.0;
            sum.1 += pixel.1;
            sum.2 += 1;
        }
        for (center, (sx, sy, n)) in centers.iter_mut().zip(sums) {
            if n > 0 {
                *center = (sx / n as f64, sy / n as f64);
            }
        }
    }

    centers
        .iter()
        .map(|center| snap_to_blob(blob, *center))
        .collect()
}

fn dist_sq(a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)
}

fn nearest_center(centers: &[(f64, f64)], pixel: (f64, f64)) -> usize {
    let mut best = 0;
    let mut best_dist = f64::INFINITY;
    for (i, center) in centers.iter().enumerate() {
        let d = dist_sq(*center, pixel);
        if d < best_dist {
            best_dist = d;
            best = i;
        }
    }
    best
}

/// Deterministic farthest-point seeding: starting from `centers`, repeatedly take
/// the pixel farthest from every chosen seed until there are `k`.
fn spread_seeds(pixels: &[(f64, f64)], mut centers: Vec<(f64, f64)>, k: usize) -> Vec<(f64, f64)> {
    let mut min_dist: Vec<f64> = pixels
        .iter()
        .map(|p| centers.iter().map(|c| dist_sq(*p, *c)).fold(f64::INFINITY, f64::min))
        .collect();

    while centers.len() < k {
        let mut far = 0;
        for (i, d) in min_dist.iter().enumerate() {
            if *d > min_dist[far] {
                far = i;
            }
        }
        let next = pixels[far];
        centers.push(next);
        for (d, p) in min_dist.iter_mut().zip(pixels) {
            *d = d.min(dist_sq(*p, next));
        }
    }
    centers
}

fn snap_to_blob(blob: &Blob, center: (f64, f64)) -> Point {
    blob.pixels
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = dist_sq((a.x as f64, a.y as f64), center);
            let db = dist_sq((b.x as f64, b.y as f64), center);
            da.total_cmp(&db)
        })
        .unwrap_or_else(|| blob.centroid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::binary_mask::BinaryMask;
    use crate::core_modules::utils::synthetic;

    fn bridged_pair_blob() -> Blob {
        let mut mask = BinaryMask::new(20, 10);
        synthetic::paint_rect(&mut mask, 2, 2, 5, 5);
        synthetic::paint_rect(&mut mask, 10, 2, 5, 5);
        synthetic::paint_rect(&mut mask, 7, 4, 3, 1);
        Blob::new(mask.positives())
    }

    fn touching_pair_blob() -> Blob {
        // Two 6x6 squares sharing an edge: no neck to erode through.
        let mut mask = BinaryMask::new(20, 10);
        synthetic::paint_rect(&mut mask, 1, 1, 12, 6);
        Blob::new(mask.positives())
    }

    #[test]
    fn expected_count_rounds_and_floors_at_one() {
        assert_eq!(expected_count(53, 25.0), 2);
        assert_eq!(expected_count(10, 25.0), 1);
        assert_eq!(expected_count(88, 25.0), 4);
        assert_eq!(expected_count(10, 0.0), 1);
    }

    #[test]
    fn erosion_splitter_finds_both_cores() {
        let blob = bridged_pair_blob();
        let mut centers = ErosionSplitter.estimate_and_place(&blob, 25.0, "nucleus");
        centers.sort();
        assert_eq!(centers.len(), 2);
        assert!(centers[0].distance(&Point::new(4, 4)) <= 1.5, "{centers:?}");
        assert!(centers[1].distance(&Point::new(12, 4)) <= 1.5, "{centers:?}");
    }

    #[test]
    fn erosion_splitter_places_every_expected_object_without_neck() {
        let blob = touching_pair_blob();
        let mut centers = ErosionSplitter.estimate_and_place(&blob, 36.0, "nucleus");
        centers.sort();
        assert_eq!(centers.len(), expected_count(blob.size(), 36.0));
        assert!(centers.iter().all(|c| blob.contains(c)));
        assert!(centers[0].x < 7 && centers[1].x >= 7, "{centers:?}");

        let mut mask = BinaryMask::new(24, 10);
        synthetic::paint_rect(&mut mask, 1, 1, 18, 6);
        let triple = Blob::new(mask.positives());
        let mut centers = ErosionSplitter.estimate_and_place(&triple, 36.0, "nucleus");
        centers.sort();
        centers.dedup();
        assert_eq!(centers.len(), 3, "{centers:?}");
        assert!(centers.iter().all(|c| triple.contains(c)));
    }

    #[test]
    fn k_means_splits_a_neckless_pair() {
        let blob = touching_pair_blob();
        let mut centers = KMeansSplitter::default().estimate_and_place(&blob, 36.0, "nucleus");
        centers.sort();
        assert_eq!(centers.len(), 2);
        assert!(centers.iter().all(|c| blob.contains(c)));
        assert!(centers[0].x < 7 && centers[1].x >= 7, "{centers:?}");
    }

    #[test]
    fn k_means_is_deterministic() {
        let blob = bridged_pair_blob();
        let splitter = KMeansSplitter { iterations: 10 };
        assert_eq!(
            splitter.estimate_and_place(&blob, 25.0, "x"),
            splitter.estimate_and_place(&blob, 25.0, "x")
        );
    }

    #[test]
    fn kind_builds_named_strategies() {
        assert_eq!(SplitterKind::Erosion.build().name(), "erosion");
        assert_eq!(SplitterKind::KMeans { iterations: 3 }.build().name(), "k_means");
    }
}
