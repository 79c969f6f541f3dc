pub mod binary_mask;
pub mod blob;
pub mod blob_detector;
pub mod blob_splitter;
pub mod cancellation;
pub mod centroid_classifier;
pub mod distribution;
pub mod erosion_calibrator;
pub mod exclusion;
pub mod reconciler;
pub mod utils;
