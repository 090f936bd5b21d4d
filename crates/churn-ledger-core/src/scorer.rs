use serde::{Deserialize, Serialize};

use crate::{ChurnError, FeatureVector, SchemaDescriptor};

pub const ARTIFACT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChurnLabel {
    Churn,
    NoChurn,
}

impl ChurnLabel {
    /// Display form written to the prediction history.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Churn => "Churn",
            Self::NoChurn => "No Churn",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Prediction {
    pub label: ChurnLabel,
    pub probability: Option<f64>,
}

/// A trained model with a declared input layout.
pub trait Scorer {
    fn schema(&self) -> &SchemaDescriptor;

    /// # Errors
    /// Returns an error when the model cannot evaluate `vector`.
    fn predict(&self, vector: &FeatureVector) -> Result<ChurnLabel, ChurnError>;

    /// Positive-class probability, `None` when the model is not probabilistic.
    ///
    /// # Errors
    /// Returns an error when the model cannot evaluate `vector`.
    fn predict_proba(&self, _vector: &FeatureVector) -> Result<Option<f64>, ChurnError> {
        Ok(None)
    }
}

/// Runs `scorer` once over `vector`.
///
/// # Errors
/// Returns [`ChurnError::Scoring`] for shape mismatches, failures inside the
/// model, and probabilities outside `[0, 1]`. Nothing is retried.
pub fn score<S: Scorer + ?Sized>(scorer: &S, vector: &FeatureVector) -> Result<Prediction, ChurnError> {
    let schema = scorer.schema();
    if vector.len() != schema.len() {
        return Err(ChurnError::Scoring(format!(
            "vector has {} values but model expects {}",
            vector.len(),
            schema.len()
        )));
    }
    if vector.schema_version() != schema.schema_version() {
        return Err(ChurnError::Scoring(format!(
            "vector built for schema v{} but model expects v{}",
            vector.schema_version(),
            schema.schema_version()
        )));
    }

    let label = scorer.predict(vector).map_err(into_scoring)?;
    let probability = scorer.predict_proba(vector).map_err(into_scoring)?;
    if let Some(value) = probability {
        if !(0.0..=1.0).contains(&value) {
            return Err(ChurnError::Scoring(format!(
                "model returned probability {value} outside [0, 1]"
            )));
        }
    }

    Ok(Prediction { label, probability })
}

fn into_scoring(err: ChurnError) -> ChurnError {
    match err {
        ChurnError::Scoring(_) => err,
        other => ChurnError::Scoring(other.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ForestNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        probability: f64,
    },
}

/// Nodes are stored root-first; children always sit after their parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForestTree {
    pub nodes: Vec<ForestNode>,
}

impl ForestTree {
    fn validate(&self, tree_index: usize) -> Result<(), ChurnError> {
        if self.nodes.is_empty() {
            return Err(ChurnError::Configuration(format!(
                "tree {tree_index} has no nodes"
            )));
        }

        for (index, node) in self.nodes.iter().enumerate() {
            match node {
                ForestNode::Split {
                    threshold,
                    left,
                    right,
                    ..
                } => {
                    if !threshold.is_finite() {
                        return Err(ChurnError::Configuration(format!(
                            "tree {tree_index} node {index} has a non-finite threshold"
                        )));
                    }
                    for child in [*left, *right] {
                        if child <= index || child >= self.nodes.len() {
                            return Err(ChurnError::Configuration(format!(
                                "tree {tree_index} node {index} points at invalid child {child}"
                            )));
                        }
                    }
                }
                ForestNode::Leaf { probability } => {
                    if !(0.0..=1.0).contains(probability) {
                        return Err(ChurnError::Configuration(format!(
                            "tree {tree_index} node {index} leaf probability MUST be in [0.0, 1.0]"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                ForestNode::Split { feature, .. } => Some(*feature),
                ForestNode::Leaf { .. } => None,
            })
            .max()
    }

    fn evaluate(&self, values: &[f64]) -> Result<f64, ChurnError> {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(ForestNode::Leaf { probability }) => return Ok(*probability),
                Some(ForestNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let value = values.get(*feature).ok_or_else(|| {
                        ChurnError::Scoring(format!("split references missing feature {feature}"))
                    })?;
                    index = if *value <= *threshold { *left } else { *right };
                }
                None => {
                    return Err(ChurnError::Scoring(format!(
                        "tree walk reached missing node {index}"
                    )))
                }
            }
        }
    }
}

fn default_threshold() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum ModelKind {
    Logistic {
        intercept: f64,
        coefficients: Vec<f64>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
    /// Decision function only; no probability output.
    Linear {
        intercept: f64,
        coefficients: Vec<f64>,
    },
    Forest {
        trees: Vec<ForestTree>,
        #[serde(default = "default_threshold")]
        threshold: f64,
    },
}

fn default_schema_version() -> u32 {
    1
}

/// Serialized trained model as produced by the training pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelArtifact {
    pub artifact_version: u32,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(flatten)]
    pub model: ModelKind,
}

impl ModelArtifact {
    /// Decodes and validates an artifact from JSON.
    ///
    /// # Errors
    /// Returns [`ChurnError::Configuration`] when decoding fails or the model
    /// parameters are malformed.
    pub fn from_json_str(raw: &str) -> Result<Self, ChurnError> {
        let artifact: Self = serde_json::from_str(raw)
            .map_err(|err| ChurnError::Configuration(format!("invalid model artifact: {err}")))?;
        artifact.validate()?;
        Ok(artifact)
    }

    /// Checks parameter sanity independent of any schema.
    ///
    /// # Errors
    /// Returns [`ChurnError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<(), ChurnError> {
        if self.artifact_version != ARTIFACT_VERSION {
            return Err(ChurnError::Configuration(format!(
                "unsupported artifact_version {} (expected {ARTIFACT_VERSION})",
                self.artifact_version
            )));
        }

        match &self.model {
            ModelKind::Logistic {
                intercept,
                coefficients,
                threshold,
            } => {
                validate_linear_terms(*intercept, coefficients)?;
                validate_threshold(*threshold)?;
            }
            ModelKind::Linear {
                intercept,
                coefficients,
            } => validate_linear_terms(*intercept, coefficients)?,
            ModelKind::Forest { trees, threshold } => {
                if trees.is_empty() {
                    return Err(ChurnError::Configuration(
                        "forest MUST contain at least one tree".to_string(),
                    ));
                }
                for (index, tree) in trees.iter().enumerate() {
                    tree.validate(index)?;
                }
                validate_threshold(*threshold)?;
            }
        }

        Ok(())
    }

    /// Requires the model's parameters to fit a `width`-feature input.
    fn ensure_width(&self, width: usize) -> Result<(), ChurnError> {
        match &self.model {
            ModelKind::Logistic { coefficients, .. } | ModelKind::Linear { coefficients, .. } => {
                if coefficients.len() != width {
                    return Err(ChurnError::SchemaMismatch(format!(
                        "model has {} coefficients but schema declares {width} features",
                        coefficients.len()
                    )));
                }
            }
            ModelKind::Forest { trees, .. } => {
                if let Some(feature) = trees.iter().filter_map(ForestTree::max_feature).max() {
                    if feature >= width {
                        return Err(ChurnError::SchemaMismatch(format!(
                            "forest splits on feature {feature} but schema declares {width} features"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn decision(intercept: f64, coefficients: &[f64], values: &[f64]) -> f64 {
        intercept
            + coefficients
                .iter()
                .zip(values)
                .map(|(weight, value)| weight * value)
                .sum::<f64>()
    }

    fn probability(&self, values: &[f64]) -> Result<Option<f64>, ChurnError> {
        match &self.model {
            ModelKind::Logistic {
                intercept,
                coefficients,
                ..
            } => {
                let z = Self::decision(*intercept, coefficients, values);
                Ok(Some(1.0 / (1.0 + (-z).exp())))
            }
            ModelKind::Linear { .. } => Ok(None),
            ModelKind::Forest { trees, .. } => {
                let mut total = 0.0;
                for tree in trees {
                    total += tree.evaluate(values)?;
                }
                #[allow(clippy::cast_precision_loss)]
                let mean = total / trees.len() as f64;
                Ok(Some(mean))
            }
        }
    }
}

fn validate_linear_terms(intercept: f64, coefficients: &[f64]) -> Result<(), ChurnError> {
    if coefficients.is_empty() {
        return Err(ChurnError::Configuration(
            "coefficients MUST be non-empty".to_string(),
        ));
    }
    if !intercept.is_finite() || coefficients.iter().any(|value| !value.is_finite()) {
        return Err(ChurnError::Configuration(
            "intercept and coefficients MUST be finite".to_string(),
        ));
    }
    Ok(())
}

fn validate_threshold(threshold: f64) -> Result<(), ChurnError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ChurnError::Configuration(
            "threshold MUST be in [0.0, 1.0]".to_string(),
        ));
    }
    Ok(())
}

/// A [`ModelArtifact`] bound to the [`SchemaDescriptor`] it was trained on.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    schema: SchemaDescriptor,
    artifact: ModelArtifact,
}

impl TrainedModel {
    /// Binds an artifact to its schema.
    ///
    /// The schema companion file wins when present and must agree with any
    /// features the artifact declares. Without one, the artifact's own list is
    /// used, falling back to the hard-coded telco layout.
    ///
    /// # Errors
    /// Returns [`ChurnError::SchemaMismatch`] when the layouts disagree or the
    /// model parameters do not fit the schema width.
    pub fn bind(
        artifact: ModelArtifact,
        schema_file: Option<SchemaDescriptor>,
    ) -> Result<Self, ChurnError> {
        artifact.validate()?;

        let schema = match schema_file {
            Some(schema) => {
                if !artifact.features.is_empty() {
                    schema.ensure_matches(&artifact.features)?;
                }
                schema
            }
            None if artifact.features.is_empty() => SchemaDescriptor::telco_default(),
            None => SchemaDescriptor::new(artifact.schema_version, artifact.features.clone())?,
        };

        artifact.ensure_width(schema.len())?;
        Ok(Self { schema, artifact })
    }

    #[must_use]
    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    fn threshold(&self) -> Option<f64> {
        match &self.artifact.model {
            ModelKind::Logistic { threshold, .. } | ModelKind::Forest { threshold, .. } => {
                Some(*threshold)
            }
            ModelKind::Linear { .. } => None,
        }
    }
}

impl Scorer for TrainedModel {
    fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    fn predict(&self, vector: &FeatureVector) -> Result<ChurnLabel, ChurnError> {
        let churn = match (self.threshold(), self.artifact.probability(vector.values())?) {
            (Some(threshold), Some(probability)) => probability >= threshold,
            _ => match &self.artifact.model {
                ModelKind::Linear {
                    intercept,
                    coefficients,
                } => ModelArtifact::decision(*intercept, coefficients, vector.values()) > 0.0,
                _ => {
                    return Err(ChurnError::Scoring(
                        "probabilistic model produced no probability".to_string(),
                    ))
                }
            },
        };
        Ok(if churn {
            ChurnLabel::Churn
        } else {
            ChurnLabel::NoChurn
        })
    }

    fn predict_proba(&self, vector: &FeatureVector) -> Result<Option<f64>, ChurnError> {
        self.artifact.probability(vector.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RawRecord, Reconciler};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    const LOGISTIC_ARTIFACT: &str = r#"{
        "artifact_version": 1,
        "model": "logistic",
        "features": ["tenure", "MonthlyCharges", "Contract_One year", "Contract_Two year"],
        "intercept": -0.5,
        "coefficients": [-0.05, 0.03, -1.0, -2.0]
    }"#;

    const FOREST_ARTIFACT: &str = r#"{
        "artifact_version": 1,
        "model": "forest",
        "trees": [
            {"nodes": [
                {"split": {"feature": 0, "threshold": 6.0, "left": 1, "right": 2}},
                {"leaf": {"probability": 0.9}},
                {"leaf": {"probability": 0.2}}
            ]},
            {"nodes": [
                {"split": {"feature": 3, "threshold": 0.5, "left": 1, "right": 2}},
                {"leaf": {"probability": 0.7}},
                {"leaf": {"probability": 0.1}}
            ]}
        ]
    }"#;

    fn telco_vector(model: &TrainedModel, tenure: f64, contract: &str) -> FeatureVector {
        let raw = RawRecord::new()
            .with("tenure", tenure)
            .with("MonthlyCharges", 70.0)
            .with("Contract", contract);
        must_ok(Reconciler::new().reconcile(&raw, model.schema()))
    }

    #[test]
    fn logistic_artifact_scores_with_probability() {
        let model = must_ok(TrainedModel::bind(
            must_ok(ModelArtifact::from_json_str(LOGISTIC_ARTIFACT)),
            None,
        ));

        let short_tenure = must_ok(score(&model, &telco_vector(&model, 1.0, "Month-to-month")));
        assert_eq!(short_tenure.label, ChurnLabel::Churn);
        let probability = short_tenure.probability.unwrap_or_default();
        assert!(probability > 0.5 && probability < 1.0);

        let loyal = must_ok(score(&model, &telco_vector(&model, 60.0, "Two year")));
        assert_eq!(loyal.label, ChurnLabel::NoChurn);
        assert!(loyal.probability.unwrap_or(1.0) < 0.5);
    }

    #[test]
    fn forest_averages_leaf_probabilities() {
        let model = must_ok(TrainedModel::bind(
            must_ok(ModelArtifact::from_json_str(FOREST_ARTIFACT)),
            None,
        ));
        assert_eq!(model.schema(), &SchemaDescriptor::telco_default());

        let prediction = must_ok(score(&model, &telco_vector(&model, 3.0, "Month-to-month")));
        assert_eq!(prediction.label, ChurnLabel::Churn);
        assert!((prediction.probability.unwrap_or_default() - 0.8).abs() < 1e-9);

        let prediction = must_ok(score(&model, &telco_vector(&model, 30.0, "Two year")));
        assert_eq!(prediction.label, ChurnLabel::NoChurn);
        assert!((prediction.probability.unwrap_or_default() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn linear_artifact_has_no_probability() {
        let artifact = ModelArtifact {
            artifact_version: 1,
            schema_version: 1,
            features: Vec::new(),
            model: ModelKind::Linear {
                intercept: 1.0,
                coefficients: vec![-0.1, 0.0, 0.0, 0.0],
            },
        };
        let model = must_ok(TrainedModel::bind(artifact, None));
        let prediction = must_ok(score(&model, &telco_vector(&model, 2.0, "One year")));
        assert_eq!(prediction.label, ChurnLabel::Churn);
        assert_eq!(prediction.probability, None);
    }

    #[test]
    fn schema_file_must_agree_with_artifact_features() {
        let artifact = must_ok(ModelArtifact::from_json_str(LOGISTIC_ARTIFACT));
        let other = must_ok(SchemaDescriptor::new(
            1,
            vec![
                "tenure".to_string(),
                "MonthlyCharges".to_string(),
                "Contract_OneYear".to_string(),
                "Contract_TwoYear".to_string(),
            ],
        ));
        assert!(matches!(
            TrainedModel::bind(artifact, Some(other)),
            Err(ChurnError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn coefficient_width_must_match_schema() {
        let artifact = ModelArtifact {
            artifact_version: 1,
            schema_version: 1,
            features: Vec::new(),
            model: ModelKind::Logistic {
                intercept: 0.0,
                coefficients: vec![0.1, 0.2],
                threshold: 0.5,
            },
        };
        assert!(matches!(
            TrainedModel::bind(artifact, None),
            Err(ChurnError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn malformed_artifacts_are_rejected_at_load() {
        let wrong_version = LOGISTIC_ARTIFACT.replace("\"artifact_version\": 1", "\"artifact_version\": 9");
        assert!(matches!(
            ModelArtifact::from_json_str(&wrong_version),
            Err(ChurnError::Configuration(_))
        ));

        let cyclic = r#"{
            "artifact_version": 1,
            "model": "forest",
            "trees": [{"nodes": [{"split": {"feature": 0, "threshold": 1.0, "left": 0, "right": 0}}]}]
        }"#;
        assert!(matches!(
            ModelArtifact::from_json_str(cyclic),
            Err(ChurnError::Configuration(_))
        ));

        assert!(ModelArtifact::from_json_str("{not json").is_err());
    }

    struct BrokenScorer(SchemaDescriptor);

    impl Scorer for BrokenScorer {
        fn schema(&self) -> &SchemaDescriptor {
            &self.0
        }

        fn predict(&self, _vector: &FeatureVector) -> Result<ChurnLabel, ChurnError> {
            Err(ChurnError::Validation("model exploded".to_string()))
        }
    }

    #[test]
    fn scorer_failures_are_wrapped_as_scoring_errors() {
        let schema = SchemaDescriptor::telco_default();
        let vector = must_ok(FeatureVector::from_values(&schema, vec![0.0; 4]));
        let result = score(&BrokenScorer(schema), &vector);
        assert!(matches!(result, Err(ChurnError::Scoring(message)) if message.contains("model exploded")));
    }

    #[test]
    fn shape_mismatch_is_a_scoring_error() {
        let model = must_ok(TrainedModel::bind(
            must_ok(ModelArtifact::from_json_str(LOGISTIC_ARTIFACT)),
            None,
        ));
        let narrow = must_ok(SchemaDescriptor::new(1, vec!["tenure".to_string()]));
        let vector = must_ok(FeatureVector::from_values(&narrow, vec![1.0]));
        assert!(matches!(score(&model, &vector), Err(ChurnError::Scoring(_))));
    }

    #[test]
    fn labels_render_history_display_forms() {
        assert_eq!(ChurnLabel::Churn.as_str(), "Churn");
        assert_eq!(ChurnLabel::NoChurn.as_str(), "No Churn");
    }
}
