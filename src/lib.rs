// THEORY:
// This file is the main entry point for the `phenotype_vision` library crate.
// It exports the three batch-level stages of the engine as a clean, high-level
// interface:
//
// 1.  **Calibration** (`core_modules::erosion_calibrator`): learns, per object
//     category, which blob sizes mean "noise", "one object" and "several merged
//     objects" from user-supplied training points.
// 2.  **Post-processing** (`pipeline`): turns every classified mask of a batch into
//     a set of centroids, applies cross-category exclusion rules and persists the
//     results.
// 3.  **Reconciliation** (`core_modules::reconciler`): matches the final centroids
//     against held-out ground truth to estimate a false-negative rate.
//
// The stages are separated by strict phase barriers; the worker pool that drives
// each of them lives in `parallel_pipeline`. Algorithmic layers are kept in
// `core_modules` and know nothing about scheduling or persistence.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod logging;
pub mod parallel_pipeline;
pub mod pipeline;
pub mod store;
