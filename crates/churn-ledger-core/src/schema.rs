use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ChurnError;

/// Feature layout the telco model was trained on: the numeric inputs plus the
/// `Contract` dummies left after dropping the `Month-to-month` reference level.
pub const TELCO_DEFAULT_FEATURES: [&str; 4] = [
    "tenure",
    "MonthlyCharges",
    "Contract_One year",
    "Contract_Two year",
];

#[derive(Debug, Clone, Deserialize)]
struct SchemaFile {
    schema_version: u32,
    features: Vec<String>,
}

/// Ordered, immutable list of feature names a scorer expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "SchemaFile")]
pub struct SchemaDescriptor {
    schema_version: u32,
    features: Vec<String>,
    #[serde(skip)]
    positions: BTreeMap<String, usize>,
}

impl TryFrom<SchemaFile> for SchemaDescriptor {
    type Error = ChurnError;

    fn try_from(file: SchemaFile) -> Result<Self, Self::Error> {
        Self::new(file.schema_version, file.features)
    }
}

impl SchemaDescriptor {
    /// Builds a descriptor from an ordered feature list.
    ///
    /// # Errors
    /// Returns [`ChurnError::Configuration`] when the version is zero, the list
    /// is empty, or a name is blank or repeated.
    pub fn new(schema_version: u32, features: Vec<String>) -> Result<Self, ChurnError> {
        if schema_version == 0 {
            return Err(ChurnError::Configuration(
                "schema_version MUST be >= 1".to_string(),
            ));
        }

        if features.is_empty() {
            return Err(ChurnError::Configuration(
                "schema MUST declare at least one feature".to_string(),
            ));
        }

        let mut positions = BTreeMap::new();
        for (index, name) in features.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(ChurnError::Configuration(format!(
                    "feature name at position {index} is blank"
                )));
            }
            if positions.insert(name.clone(), index).is_some() {
                return Err(ChurnError::Configuration(format!(
                    "feature {name:?} is declared more than once"
                )));
            }
        }

        Ok(Self {
            schema_version,
            features,
            positions,
        })
    }

    /// Hard-coded layout used when neither a schema file nor the model
    /// artifact declares one.
    #[must_use]
    pub fn telco_default() -> Self {
        let features: Vec<String> = TELCO_DEFAULT_FEATURES
            .iter()
            .map(|name| (*name).to_string())
            .collect();
        let positions = features
            .iter()
            .enumerate()
            .map(|(index, name)| (name.clone(), index))
            .collect();
        Self {
            schema_version: 1,
            features,
            positions,
        }
    }

    /// Decodes and validates a schema companion file.
    ///
    /// # Errors
    /// Returns [`ChurnError::Configuration`] when JSON decoding fails or the
    /// decoded layout is invalid.
    pub fn from_json_str(raw: &str) -> Result<Self, ChurnError> {
        serde_json::from_str(raw)
            .map_err(|err| ChurnError::Configuration(format!("invalid schema file: {err}")))
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn features(&self) -> &[String] {
        &self.features
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.positions.get(name).copied()
    }

    /// True when at least one feature is named `<field>_<something>`.
    #[must_use]
    pub fn has_one_hot_columns(&self, field: &str) -> bool {
        let prefix = format!("{field}_");
        self.positions
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(name, _)| name.starts_with(&prefix))
    }

    /// Requires `other` to declare exactly the same features in the same order.
    ///
    /// # Errors
    /// Returns [`ChurnError::SchemaMismatch`] naming the first divergence.
    pub fn ensure_matches(&self, other: &[String]) -> Result<(), ChurnError> {
        if self.features.len() != other.len() {
            return Err(ChurnError::SchemaMismatch(format!(
                "schema declares {} features but artifact declares {}",
                self.features.len(),
                other.len()
            )));
        }

        if let Some((index, (expected, actual))) = self
            .features
            .iter()
            .zip(other)
            .enumerate()
            .find(|(_, (expected, actual))| expected != actual)
        {
            return Err(ChurnError::SchemaMismatch(format!(
                "feature {index} is {expected:?} in schema but {actual:?} in artifact"
            )));
        }

        Ok(())
    }
}
