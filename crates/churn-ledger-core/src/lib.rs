//! Feature reconciliation, scoring and access gating for churn predictions.
//!
//! The pieces compose leaf-first:
//! - [`SchemaDescriptor`] declares the ordered feature layout a trained model expects.
//! - [`Reconciler`] maps a [`RawRecord`] onto a [`FeatureVector`] in that layout.
//! - [`score`] runs a [`Scorer`] (usually a [`ModelArtifact`]) over the vector.
//! - [`AccessGate`] mints the [`AccessGrant`] destructive store operations require.

use time::{OffsetDateTime, UtcOffset};

mod gate;
mod reconcile;
mod schema;
mod scorer;

pub use gate::{AccessGate, AccessGrant};
pub use reconcile::{
    CategoricalEncoding, FeatureVector, OrdinalTable, RawRecord, RawValue, Reconciler,
    UnknownFieldPolicy,
};
pub use schema::{SchemaDescriptor, TELCO_DEFAULT_FEATURES};
pub use scorer::{
    score, ChurnLabel, ForestNode, ForestTree, ModelArtifact, ModelKind, Prediction, Scorer,
    TrainedModel, ARTIFACT_VERSION,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ChurnError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("unknown category {value:?} for field {field}")]
    UnknownCategory { field: String, value: String },
    #[error("scoring error: {0}")]
    Scoring(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ChurnError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ChurnError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ChurnError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
