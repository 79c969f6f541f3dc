// THEORY:
// The `CentroidClassifier` applies a calibrated model to a freshly classified mask.
// Every blob receives one of three verdicts based on its pixel count alone:
//
//   size <  bottom           -> Discard (classifier noise)
//   bottom <= size <= top    -> Pass    (exactly one object, centroid at its mean)
//   size >  top              -> Split   (several merged objects)
//
// Both cutoffs are inclusive on the Pass side. Split blobs are handed to the
// injected `BlobSplitter` together with the depth-0 median as the expected size of
// one object. The output is a mask with one positive pixel per object found; two
// objects landing on the same pixel collapse into one.

use std::sync::Arc;

use crate::core_modules::binary_mask::{BinaryMask, Point};
use crate::core_modules::blob_detector::blob_detector;
use crate::core_modules::blob_splitter::BlobSplitter;
use crate::core_modules::cancellation::CancelFlag;
use crate::core_modules::distribution::UnivariateDistribution;
use crate::core_modules::erosion_calibrator::CalibratedModel;
use crate::error::LabelError;

/// The decision taken for a single blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobVerdict {
    Discard,
    Pass,
    Split,
}

/// Classifies a blob size against a size distribution.
pub fn verdict(size: usize, distribution: &UnivariateDistribution) -> BlobVerdict {
    if size < distribution.bottom {
        BlobVerdict::Discard
    } else if size <= distribution.top {
        BlobVerdict::Pass
    } else {
        BlobVerdict::Split
    }
}

/// The centroids found in one mask, with per-verdict blob counts.
#[derive(Debug, Clone)]
pub struct Classification {
    /// One positive pixel per centroid.
    pub centroids: BinaryMask,
    pub passed: usize,
    pub discarded: usize,
    pub split: usize,
    /// True if labeling stopped early; the centroids cover completed blobs only.
    pub cancelled: bool,
}

impl Classification {
    pub fn points(&self) -> Vec<Point> {
        self.centroids.positives()
    }
}

/// Turns a classified mask into centroids using one category's model.
#[derive(Debug, Clone)]
pub struct CentroidClassifier {
    splitter: Arc<dyn BlobSplitter>,
}

impl CentroidClassifier {
    pub fn new(splitter: Arc<dyn BlobSplitter>) -> Self {
        Self { splitter }
    }

    pub fn classify(
        &self,
        mask: &BinaryMask,
        model: &CalibratedModel,
        cancel: &CancelFlag,
    ) -> Result<Classification, LabelError> {
        let labeling = blob_detector::label(mask, cancel)?;
        let base = model.base();
        let mut classification = Classification {
            centroids: BinaryMask::new(mask.width(), mask.height()),
            passed: 0,
            discarded: 0,
            split: 0,
            cancelled: labeling.cancelled,
        };

        for blob in &labeling.blobs {
            match verdict(blob.size(), base) {
                BlobVerdict::Discard => classification.discarded += 1,
                BlobVerdict::Pass => {
                    let c = blob.centroid();
                    classification.centroids.set(c.x, c.y, true);
                    classification.passed += 1;
                }
                BlobVerdict::Split => {
                    let placed =
                        self.splitter
                            .estimate_and_place(blob, base.median, &model.category);
                    for c in placed {
                        classification.centroids.set(c.x, c.y, true);
                    }
                    classification.split += 1;
                }
            }
        }

        Ok(classification)
    }
}
