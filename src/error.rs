//! Error types and run diagnostics.
//!
//! Typed errors are returned by the individual stages. Batch-level entry points
//! never fail on a single image or category: they convert the error into a
//! [`Diagnostic`] and keep going.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while extracting connected components from a mask.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("Traversal worklist could not grow to {requested} entries")]
    ResourceExhausted { requested: usize },
}

/// Errors raised when fitting a size distribution.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DistributionError {
    #[error("Cannot fit a distribution to an empty sample")]
    EmptySample,
}

/// Reasons a category could not be calibrated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("No training image carries both a mask and training points")]
    NoTrainingData,

    #[error("Only {found} pure blobs at depth 0, at least {required} are required")]
    InsufficientSamples { found: usize, required: usize },

    #[error("Calibration was cancelled")]
    Cancelled,

    #[error(transparent)]
    Label(#[from] LabelError),
}

/// Errors raised while loading or validating a [`crate::config::PipelineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by a [`crate::store::ResultStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode debug image '{path}': {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// The class of a localized failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
    /// A mask, point set, prediction set or match radius was absent.
    MissingInput,
    /// Labeling was abandoned because the traversal could not allocate.
    ResourceExhausted,
    /// Too few training samples to calibrate a category.
    InsufficientData,
    /// A result could not be written to the store.
    Persistence,
    /// The debug image for an image could not be produced.
    Visualization,
    /// A unit of work panicked inside the worker pool.
    WorkerPanic,
    /// Work was cut short by the cancel flag and its partial result dropped.
    Cancelled,
}

/// A localized failure, scoped to the smallest unit it affected.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub image: Option<String>,
    pub category: Option<String>,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            image: None,
            category: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn for_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}]", self.kind)?;
        if let Some(image) = &self.image {
            write!(f, " image={image}")?;
        }
        if let Some(category) = &self.category {
            write!(f, " category={category}")?;
        }
        write!(f, ": {}", self.message)
    }
}

impl From<&LabelError> for DiagnosticKind {
    fn from(err: &LabelError) -> Self {
        match err {
            LabelError::ResourceExhausted { .. } => DiagnosticKind::ResourceExhausted,
        }
    }
}
