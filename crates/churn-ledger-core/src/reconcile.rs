use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{ChurnError, SchemaDescriptor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One human-entered submission, keyed by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<RawValue>) {
        self.fields.insert(field.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&RawValue> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RawValue)> {
        self.fields.iter().map(|(field, value)| (field.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<K: Into<String>, V: Into<RawValue>> FromIterator<(K, V)> for RawRecord {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut record = Self::new();
        for (field, value) in iter {
            record.insert(field, value);
        }
        record
    }
}

/// Numeric input aligned with a [`SchemaDescriptor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    schema_version: u32,
    values: Vec<f64>,
}

impl FeatureVector {
    /// Wraps pre-computed values after checking them against `schema`.
    ///
    /// # Errors
    /// Returns [`ChurnError::SchemaMismatch`] when the length differs from the
    /// schema and [`ChurnError::Validation`] for non-finite values.
    pub fn from_values(schema: &SchemaDescriptor, values: Vec<f64>) -> Result<Self, ChurnError> {
        if values.len() != schema.len() {
            return Err(ChurnError::SchemaMismatch(format!(
                "vector has {} values but schema declares {} features",
                values.len(),
                schema.len()
            )));
        }
        if let Some(index) = values.iter().position(|value| !value.is_finite()) {
            return Err(ChurnError::Validation(format!(
                "feature {} is not a finite number",
                schema.features()[index]
            )));
        }
        Ok(Self {
            schema_version: schema.schema_version(),
            values,
        })
    }

    #[must_use]
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UnknownFieldPolicy {
    #[default]
    Reject,
    Ignore,
}

/// Static label -> code table for ordinal encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrdinalTable {
    codes: BTreeMap<String, f64>,
}

impl OrdinalTable {
    #[must_use]
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        Self {
            codes: entries
                .into_iter()
                .map(|(label, code)| (label.to_string(), code))
                .collect(),
        }
    }

    #[must_use]
    pub fn contract() -> Self {
        Self::new([("Month-to-month", 0.0), ("One year", 1.0), ("Two year", 2.0)])
    }

    #[must_use]
    pub fn code(&self, label: &str) -> Option<f64> {
        self.codes.get(label).copied()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoricalEncoding {
    /// `<field>_<value>` set to 1; values without a column are the dropped
    /// reference level.
    #[default]
    OneHot,
    /// Value must be listed in the table.
    Ordinal(OrdinalTable),
}

/// Maps raw submissions onto a schema-aligned [`FeatureVector`].
///
/// Text fields are one-hot encoded unless an encoding is registered with
/// [`Reconciler::with_encoding`]. Fields the schema does not know about are
/// rejected unless [`UnknownFieldPolicy::Ignore`] is configured.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciler {
    unknown_fields: UnknownFieldPolicy,
    encodings: BTreeMap<String, CategoricalEncoding>,
}

impl Reconciler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_unknown_fields(mut self, policy: UnknownFieldPolicy) -> Self {
        self.unknown_fields = policy;
        self
    }

    #[must_use]
    pub fn with_encoding(mut self, field: impl Into<String>, encoding: CategoricalEncoding) -> Self {
        self.encodings.insert(field.into(), encoding);
        self
    }

    /// Builds the feature vector for `raw` in `schema` order.
    ///
    /// # Errors
    /// - [`ChurnError::SchemaMismatch`] for undeclared fields (strict mode) or
    ///   a value of the wrong kind for its column.
    /// - [`ChurnError::UnknownCategory`] for an ordinal label outside its table.
    /// - [`ChurnError::Validation`] for non-finite numbers.
    pub fn reconcile(
        &self,
        raw: &RawRecord,
        schema: &SchemaDescriptor,
    ) -> Result<FeatureVector, ChurnError> {
        let mut values = vec![0.0; schema.len()];

        for (field, value) in raw.iter() {
            let encoding = self.encodings.get(field);
            match value {
                RawValue::Number(number) => {
                    if !number.is_finite() {
                        return Err(ChurnError::Validation(format!(
                            "field {field} is not a finite number"
                        )));
                    }
                    if matches!(encoding, Some(CategoricalEncoding::Ordinal(_))) {
                        return Err(ChurnError::SchemaMismatch(format!(
                            "field {field} is ordinal-encoded and expects a category label"
                        )));
                    }
                    if let Some(position) = schema.position(field) {
                        values[position] = *number;
                    } else if schema.has_one_hot_columns(field) {
                        return Err(ChurnError::SchemaMismatch(format!(
                            "field {field} is one-hot encoded and expects a category label"
                        )));
                    } else {
                        self.unknown_field(field)?;
                    }
                }
                RawValue::Text(label) => match encoding {
                    Some(CategoricalEncoding::Ordinal(table)) => {
                        let Some(position) = schema.position(field) else {
                            self.unknown_field(field)?;
                            continue;
                        };
                        let code = table.code(label).ok_or_else(|| ChurnError::UnknownCategory {
                            field: field.to_string(),
                            value: label.clone(),
                        })?;
                        values[position] = code;
                    }
                    Some(CategoricalEncoding::OneHot) | None => {
                        if schema.position(field).is_some() {
                            return Err(ChurnError::SchemaMismatch(format!(
                                "field {field} is numeric but received text {label:?}"
                            )));
                        }
                        if !schema.has_one_hot_columns(field) {
                            self.unknown_field(field)?;
                            continue;
                        }
                        if let Some(position) = schema.position(&format!("{field}_{label}")) {
                            values[position] = 1.0;
                        }
                    }
                },
            }
        }

        Ok(FeatureVector {
            schema_version: schema.schema_version(),
            values,
        })
    }

    fn unknown_field(&self, field: &str) -> Result<(), ChurnError> {
        match self.unknown_fields {
            UnknownFieldPolicy::Reject => Err(ChurnError::SchemaMismatch(format!(
                "field {field} is not declared in the schema"
            ))),
            UnknownFieldPolicy::Ignore => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use proptest::prelude::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn compact_schema() -> SchemaDescriptor {
        must_ok(SchemaDescriptor::new(
            1,
            vec![
                "tenure".to_string(),
                "MonthlyCharges".to_string(),
                "Contract_OneYear".to_string(),
                "Contract_TwoYear".to_string(),
            ],
        ))
    }

    fn telco_record(contract: &str) -> RawRecord {
        RawRecord::new()
            .with("tenure", 12.0)
            .with("MonthlyCharges", 70.0)
            .with("Contract", contract)
    }

    #[test]
    fn reference_category_reconciles_to_all_zero_dummies() {
        let vector = must_ok(
            Reconciler::new().reconcile(&telco_record("Month-to-month"), &compact_schema()),
        );
        assert_eq!(vector.values(), &[12.0, 70.0, 0.0, 0.0]);
    }

    #[test]
    fn matching_category_sets_its_dummy() {
        let vector = must_ok(
            Reconciler::new()
                .reconcile(&telco_record("Two year"), &SchemaDescriptor::telco_default()),
        );
        assert_eq!(vector.values(), &[12.0, 70.0, 0.0, 1.0]);
    }

    #[test]
    fn missing_fields_default_to_zero() {
        let raw = RawRecord::new().with("MonthlyCharges", 55.5);
        let vector = must_ok(Reconciler::new().reconcile(&raw, &compact_schema()));
        assert_eq!(vector.values(), &[0.0, 55.5, 0.0, 0.0]);
        assert_eq!(vector.schema_version(), 1);
    }

    #[test]
    fn undeclared_numeric_field_is_rejected_in_strict_mode() {
        let raw = telco_record("One year").with("TotalCharge", 900.0);
        let result = Reconciler::new().reconcile(&raw, &compact_schema());
        assert!(matches!(result, Err(ChurnError::SchemaMismatch(_))));
    }

    #[test]
    fn permissive_mode_ignores_undeclared_fields() {
        let raw = telco_record("One year")
            .with("TotalCharge", 900.0)
            .with("PaymentMethod", "Mailed check");
        let vector = must_ok(
            Reconciler::new()
                .with_unknown_fields(UnknownFieldPolicy::Ignore)
                .reconcile(&raw, &compact_schema()),
        );
        assert_eq!(vector.values(), &[12.0, 70.0, 0.0, 0.0]);
    }

    #[test]
    fn undeclared_categorical_field_is_rejected_in_strict_mode() {
        let raw = telco_record("One year").with("PaymentMethod", "Mailed check");
        let result = Reconciler::new().reconcile(&raw, &compact_schema());
        assert!(matches!(result, Err(ChurnError::SchemaMismatch(_))));
    }

    #[test]
    fn wrong_value_kinds_are_schema_mismatches() {
        let text_for_numeric = RawRecord::new().with("tenure", "twelve");
        assert!(matches!(
            Reconciler::new().reconcile(&text_for_numeric, &compact_schema()),
            Err(ChurnError::SchemaMismatch(_))
        ));

        let number_for_categorical = RawRecord::new().with("Contract", 1.0);
        assert!(matches!(
            Reconciler::new().reconcile(&number_for_categorical, &compact_schema()),
            Err(ChurnError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        let raw = RawRecord::new().with("tenure", f64::NAN);
        assert!(matches!(
            Reconciler::new().reconcile(&raw, &compact_schema()),
            Err(ChurnError::Validation(_))
        ));
    }

    #[test]
    fn ordinal_encoding_maps_known_labels_and_rejects_others() {
        let schema = must_ok(SchemaDescriptor::new(
            3,
            vec!["tenure".to_string(), "Contract".to_string()],
        ));
        let reconciler = Reconciler::new()
            .with_encoding("Contract", CategoricalEncoding::Ordinal(OrdinalTable::contract()));

        let raw = RawRecord::new()
            .with("tenure", 12.0)
            .with("Contract", "Two year");
        let vector = must_ok(reconciler.reconcile(&raw, &schema));
        assert_eq!(vector.values(), &[12.0, 2.0]);

        let unknown =
            reconciler.reconcile(&RawRecord::new().with("Contract", "Three year"), &schema);
        assert_eq!(
            unknown,
            Err(ChurnError::UnknownCategory {
                field: "Contract".to_string(),
                value: "Three year".to_string(),
            })
        );
    }

    #[test]
    fn from_values_checks_length() {
        let schema = compact_schema();
        assert!(FeatureVector::from_values(&schema, vec![1.0, 2.0]).is_err());
        assert!(FeatureVector::from_values(&schema, vec![1.0, 2.0, 0.0, 1.0]).is_ok());
        assert!(FeatureVector::from_values(&schema, vec![1.0, f64::INFINITY, 0.0, 1.0]).is_err());
    }

    const CONTRACTS: [&str; 4] = ["Month-to-month", "One year", "Two year", "Three year"];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_vector_matches_schema_and_one_hot_is_exclusive(
            tenure in proptest::option::of(0.0f64..120.0),
            charges in proptest::option::of(0.0f64..200.0),
            contract in proptest::option::of(0usize..CONTRACTS.len()),
        ) {
            let schema = SchemaDescriptor::telco_default();
            let mut raw = RawRecord::new();
            if let Some(value) = tenure {
                raw.insert("tenure", value);
            }
            if let Some(value) = charges {
                raw.insert("MonthlyCharges", value);
            }
            if let Some(index) = contract {
                raw.insert("Contract", CONTRACTS[index]);
            }

            let vector = must_ok(Reconciler::new().reconcile(&raw, &schema));
            prop_assert_eq!(vector.len(), schema.len());

            let one_hot_sum: f64 = schema
                .features()
                .iter()
                .zip(vector.values())
                .filter(|(name, _)| name.starts_with("Contract_"))
                .map(|(_, value)| *value)
                .sum();
            prop_assert!(one_hot_sum == 0.0 || one_hot_sum == 1.0);
        }
    }
}
