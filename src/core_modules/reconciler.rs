// THEORY:
// The `ErrorReconciler` closes the loop: it compares the engine's final centroids
// with held-out ground truth and estimates how many real objects were missed.
//
// This module solves a small "data association problem", much like a tracker
// matching detections between frames.
//
// Key architectural principles:
// 1.  **Radius-Bounded Matching**: A ground-truth point can only be explained by a
//     predicted centroid within the category's maximum match radius.
// 2.  **Consumption**: A predicted centroid explains at most one ground-truth point.
//     Without this rule two neighbouring objects would both be "found" by a single
//     detection.
// 3.  **Nearest First**: Candidate pairs are ranked by distance and taken greedily,
//     so every ground-truth point gets its nearest still-unconsumed centroid and the
//     listing order of the ground truth has no influence on the outcome.
// 4.  **Locked Tabulation**: Images are reconciled concurrently. Their tallies are
//     folded into the single run-scoped `Tabulation` under a mutex.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core_modules::binary_mask::Point;
use crate::error::{Diagnostic, DiagnosticKind};
use crate::parallel_pipeline::WorkerPool;

/// Centroids or ground-truth points of one image, per category.
pub type CentroidsByCategory = BTreeMap<String, Vec<Point>>;
/// Per-image point sets of a whole batch, keyed by image name.
pub type BatchCentroids = BTreeMap<String, CentroidsByCategory>;

/// Right/wrong counts of one category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub right: u64,
    pub wrong: u64,
}

impl Tally {
    pub fn total(&self) -> u64 {
        self.right + self.wrong
    }

    /// `wrong / (right + wrong) * 100`, or `None` when nothing was counted.
    pub fn error_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            total => Some(self.wrong as f64 / total as f64 * 100.0),
        }
    }
}

/// Per-category tallies of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Tabulation {
    tallies: BTreeMap<String, Tally>,
}

impl Tabulation {
    pub fn record(&mut self, category: &str, right: u64, wrong: u64) {
        let tally = self.tallies.entry(category.to_string()).or_default();
        tally.right += right;
        tally.wrong += wrong;
    }

    pub fn tally(&self, category: &str) -> Option<Tally> {
        self.tallies.get(category).copied()
    }

    pub fn error_rate(&self, category: &str) -> Option<f64> {
        self.tally(category).and_then(|t| t.error_rate())
    }

    pub fn tallies(&self) -> &BTreeMap<String, Tally> {
        &self.tallies
    }

    /// Tab-separated summary: category, right, wrong, error rate (or `n/a`).
    pub fn to_table(&self) -> String {
        let mut table = String::from("category\tright\twrong\terror_rate\n");
        for (category, tally) in &self.tallies {
            let rate = match tally.error_rate() {
                Some(rate) => format!("{rate:.2}"),
                None => "n/a".to_string(),
            };
            let _ = writeln!(table, "{category}\t{}\t{}\t{rate}", tally.right, tally.wrong);
        }
        table
    }
}

/// The result of matching one point set against another.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchOutcome {
    /// `(truth index, predicted index)` for every accepted match.
    pub matches: Vec<(usize, usize)>,
    /// Ground-truth points left without a centroid.
    pub false_negatives: Vec<Point>,
}

impl MatchOutcome {
    pub fn right(&self) -> usize {
        self.matches.len()
    }

    pub fn wrong(&self) -> usize {
        self.false_negatives.len()
    }
}

/// Matches ground truth to predictions, consuming each prediction at most once.
pub fn match_points(truth: &[Point], predicted: &[Point], radius: f64) -> MatchOutcome {
    // --- 1. Candidate pairs within radius ---
    let radius_sq = radius * radius;
    let mut candidates: Vec<(u64, usize, usize)> = Vec::new();
    for (t, truth_point) in truth.iter().enumerate() {
        for (p, predicted_point) in predicted.iter().enumerate() {
            let d = truth_point.distance_sq(predicted_point);
            if d as f64 <= radius_sq {
                candidates.push((d, t, p));
            }
        }
    }
    candidates.sort_unstable();

    // --- 2. Nearest first, with consumption ---
    let mut truth_matched = vec![false; truth.len()];
    let mut consumed = vec![false; predicted.len()];
    let mut outcome = MatchOutcome::default();
    for (_, t, p) in candidates {
        if truth_matched[t] || consumed[p] {
            continue;
        }
        truth_matched[t] = true;
        consumed[p] = true;
        outcome.matches.push((t, p));
    }
    outcome.matches.sort_unstable();

    outcome.false_negatives = truth
        .iter()
        .zip(&truth_matched)
        .filter(|(_, matched)| !**matched)
        .map(|(point, _)| *point)
        .collect();
    outcome
}

/// The output of a reconciliation run.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub tabulation: Tabulation,
    /// Missed ground-truth points per image, as `(category, point)`.
    pub false_negatives: BTreeMap<String, Vec<(String, Point)>>,
    pub diagnostics: Vec<Diagnostic>,
    pub cancelled: bool,
}

struct ImageReconciliation {
    image: String,
    false_negatives: Vec<(String, Point)>,
    diagnostics: Vec<Diagnostic>,
}

fn reconcile_image(
    image: &str,
    predicted: &CentroidsByCategory,
    truth: &CentroidsByCategory,
    radii: &BTreeMap<String, f64>,
    tabulation: &Mutex<Tabulation>,
) -> ImageReconciliation {
    let mut result = ImageReconciliation {
        image: image.to_string(),
        false_negatives: Vec::new(),
        diagnostics: Vec::new(),
    };

    for (category, truth_points) in truth {
        let Some(radius) = radii.get(category) else {
            result.diagnostics.push(
                Diagnostic::new(DiagnosticKind::MissingInput, "no match radius for category")
                    .for_image(image)
                    .for_category(category),
            );
            continue;
        };
        let Some(predicted_points) = predicted.get(category) else {
            result.diagnostics.push(
                Diagnostic::new(DiagnosticKind::MissingInput, "no predicted centroids for category")
                    .for_image(image)
                    .for_category(category),
            );
            continue;
        };

        let outcome = match_points(truth_points, predicted_points, *radius);
        debug!(image, %category, right = outcome.right(), wrong = outcome.wrong(), "image reconciled");
        tabulation
            .lock()
            .record(category, outcome.right() as u64, outcome.wrong() as u64);
        result.false_negatives.extend(
            outcome
                .false_negatives
                .into_iter()
                .map(|point| (category.clone(), point)),
        );
    }
    result
}

/// Reconciles every image that has both ground truth and predictions.
pub async fn reconcile(
    predicted: Arc<BatchCentroids>,
    truth: Arc<BatchCentroids>,
    radii: &BTreeMap<String, f64>,
    pool: &WorkerPool,
) -> Reconciliation {
    info!(images = truth.len(), "reconciliation started");
    let mut reconciliation = Reconciliation::default();

    let mut units = Vec::new();
    for image in truth.keys() {
        if predicted.contains_key(image) {
            units.push(image.clone());
        } else {
            warn!(%image, "no predictions for ground-truth image, skipping");
            reconciliation.diagnostics.push(
                Diagnostic::new(DiagnosticKind::MissingInput, "no predictions for image").for_image(image),
            );
        }
    }

    let tabulation = Arc::new(Mutex::new(Tabulation::default()));
    let job_tabulation = Arc::clone(&tabulation);
    let job_radii = Arc::new(radii.clone());
    let (job_predicted, job_truth) = (Arc::clone(&predicted), Arc::clone(&truth));
    let outcome = pool
        .run(units.clone(), move |image| {
            let empty = CentroidsByCategory::new();
            let predicted = job_predicted.get(&image).unwrap_or(&empty);
            let truth = job_truth.get(&image).unwrap_or(&empty);
            reconcile_image(&image, predicted, truth, &job_radii, &job_tabulation)
        })
        .await;

    for (slot, result) in outcome.results.into_iter().enumerate() {
        match result {
            Some(image_result) => {
                if !image_result.false_negatives.is_empty() {
                    reconciliation
                        .false_negatives
                        .insert(image_result.image, image_result.false_negatives);
                }
                reconciliation.diagnostics.extend(image_result.diagnostics);
            }
            None if outcome.panicked.contains(&slot) => {
                reconciliation.diagnostics.push(
                    Diagnostic::new(DiagnosticKind::WorkerPanic, "reconciliation panicked")
                        .for_image(&units[slot]),
                );
            }
            None => {}
        }
    }

    reconciliation.cancelled = outcome.cancelled;
    reconciliation.tabulation = tabulation.lock().clone();
    for (category, tally) in reconciliation.tabulation.tallies() {
        match tally.error_rate() {
            Some(rate) => info!(%category, right = tally.right, wrong = tally.wrong, "false-negative rate {rate:.2}%"),
            None => info!(%category, "false-negative rate not computable"),
        }
    }
    reconciliation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::cancellation::CancelFlag;

    fn batch(entries: &[(&str, &str, Vec<Point>)]) -> BatchCentroids {
        let mut batch = BatchCentroids::new();
        for (image, category, points) in entries {
            batch
                .entry(image.to_string())
                .or_default()
                .insert(category.to_string(), points.clone());
        }
        batch
    }

    #[test]
    fn nearest_truth_point_wins_regardless_of_order() {
        let predicted = [Point::new(0, 0)];
        for truth in [
            [Point::new(0, 0), Point::new(1, 1)],
            [Point::new(1, 1), Point::new(0, 0)],
        ] {
            let outcome = match_points(&truth, &predicted, 3.0);
            assert_eq!(outcome.right(), 1);
            assert_eq!(outcome.wrong(), 1);
            assert_eq!(outcome.false_negatives, vec![Point::new(1, 1)]);
        }
    }

    #[test]
    fn no_centroid_is_consumed_twice() {
        let truth: Vec<Point> = (0..6).map(|i| Point::new(10 + i, 10)).collect();
        let predicted = [Point::new(12, 11), Point::new(13, 11)];
        let outcome = match_points(&truth, &predicted, 5.0);

        assert_eq!(outcome.right(), 2);
        let mut used: Vec<usize> = outcome.matches.iter().map(|(_, p)| *p).collect();
        used.sort_unstable();
        used.dedup();
        assert_eq!(used.len(), outcome.right());
        assert!(outcome.right() <= truth.len());
    }

    #[test]
    fn points_outside_radius_are_false_negatives() {
        let outcome = match_points(&[Point::new(0, 0)], &[Point::new(4, 0)], 3.0);
        assert_eq!(outcome.right(), 0);
        assert_eq!(outcome.false_negatives, vec![Point::new(0, 0)]);

        let exact = match_points(&[Point::new(0, 0)], &[Point::new(3, 0)], 3.0);
        assert_eq!(exact.right(), 1);
    }

    #[test]
    fn error_rate_is_undefined_without_counts() {
        assert_eq!(Tally::default().error_rate(), None);
        let tally = Tally { right: 3, wrong: 1 };
        assert_eq!(tally.error_rate(), Some(25.0));
    }

    #[test]
    fn table_marks_non_computable_rates() {
        let mut tabulation = Tabulation::default();
        tabulation.record("live", 9, 1);
        tabulation.record("dead", 0, 0);
        assert_eq!(
            tabulation.to_table(),
            "category\tright\twrong\terror_rate\ndead\t0\t0\tn/a\nlive\t9\t1\t10.00\n"
        );
    }

    #[tokio::test]
    async fn batch_reconciliation_tabulates_and_collects_misses() {
        let predicted = batch(&[
            ("img_a", "live", vec![Point::new(0, 0)]),
            ("img_b", "live", vec![Point::new(10, 10), Point::new(20, 20)]),
        ]);
        let truth = batch(&[
            ("img_a", "live", vec![Point::new(0, 0), Point::new(1, 1)]),
            ("img_b", "live", vec![Point::new(11, 10), Point::new(20, 21)]),
            ("img_b", "dead", vec![Point::new(5, 5)]),
            ("img_c", "live", vec![Point::new(5, 5)]),
        ]);
        let radii = BTreeMap::from([("live".to_string(), 3.0), ("dead".to_string(), 3.0)]);

        let pool = WorkerPool::new(2, CancelFlag::new());
        let result = reconcile(Arc::new(predicted), Arc::new(truth), &radii, &pool).await;

        assert_eq!(result.tabulation.tally("live"), Some(Tally { right: 3, wrong: 1 }));
        assert_eq!(result.tabulation.error_rate("live"), Some(25.0));
        assert_eq!(result.tabulation.tally("dead"), None);
        assert_eq!(
            result.false_negatives.get("img_a"),
            Some(&vec![("live".to_string(), Point::new(1, 1))])
        );
        assert!(!result.false_negatives.contains_key("img_b"));

        let missing: Vec<_> = result
            .diagnostics
            .iter()
            .map(|d| (d.image.as_deref(), d.category.as_deref()))
            .collect();
        assert!(missing.contains(&(Some("img_c"), None)));
        assert!(missing.contains(&(Some("img_b"), Some("dead"))));
        assert!(!result.cancelled);
    }
}
