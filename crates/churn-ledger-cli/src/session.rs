//! One request/response cycle per call: reconcile, score and record a
//! prediction, or pass the access gate and mutate a store.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use churn_ledger_core::{
    format_rfc3339, now_utc, score, AccessGate, CategoricalEncoding, ChurnError, ModelArtifact,
    OrdinalTable, Prediction, RawRecord, RawValue, Reconciler, SchemaDescriptor, Scorer,
    TrainedModel, UnknownFieldPolicy,
};
use churn_ledger_store_csv::{Row, StoreError, StoreLayout, StoreTable, TIMESTAMP_COLUMN};
use churn_ledger_store_csv::{MigrationReport, RecordStore};
use tracing::{info, warn};

use crate::config::{ContractEncoding, LedgerConfig};

pub const TENURE_FIELD: &str = "tenure";
pub const MONTHLY_CHARGES_FIELD: &str = "MonthlyCharges";
pub const CONTRACT_FIELD: &str = "Contract";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    History,
    Feedback,
}

impl StoreKind {
    #[must_use]
    pub fn command_name(self) -> &'static str {
        match self {
            Self::History => "history",
            Self::Feedback => "feedback",
        }
    }
}

/// Result of a gated operation. A denial is an outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum Guarded<T> {
    Denied,
    Done(T),
}

/// Customer attributes collected for one prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionRequest {
    pub customer_id: String,
    pub tenure: f64,
    pub monthly_charges: f64,
    pub contract: String,
    /// Additional model inputs beyond the fixed form fields.
    pub extra_fields: Vec<(String, RawValue)>,
}

impl PredictionRequest {
    fn validate(&self) -> Result<(), ChurnError> {
        if self.customer_id.trim().is_empty() {
            return Err(ChurnError::Validation(
                "customer id MUST be non-empty".to_string(),
            ));
        }
        for (name, value) in [
            ("tenure", self.tenure),
            ("monthly charges", self.monthly_charges),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ChurnError::Validation(format!(
                    "{name} MUST be a non-negative number, got {value}"
                )));
            }
        }
        if self.contract.trim().is_empty() {
            return Err(ChurnError::Validation(
                "contract MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }

    fn raw_record(&self) -> RawRecord {
        let mut raw = RawRecord::new()
            .with(TENURE_FIELD, self.tenure)
            .with(MONTHLY_CHARGES_FIELD, self.monthly_charges)
            .with(CONTRACT_FIELD, self.contract.trim());
        for (field, value) in &self.extra_fields {
            raw.insert(field.clone(), value.clone());
        }
        raw
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictionOutcome {
    pub customer_id: String,
    pub prediction: Prediction,
    pub timestamp: String,
    pub history_rows: usize,
}

#[derive(Debug)]
pub struct Session {
    reconciler: Reconciler,
    history: RecordStore,
    feedback: RecordStore,
    gate: Option<AccessGate>,
}

impl Session {
    #[must_use]
    pub fn new(
        reconciler: Reconciler,
        history: RecordStore,
        feedback: RecordStore,
        gate: Option<AccessGate>,
    ) -> Self {
        Self {
            reconciler,
            history,
            feedback,
            gate,
        }
    }

    /// Wires stores, reconciler and gate from configuration. Does not touch
    /// the model artifact; see [`load_model`].
    ///
    /// # Errors
    /// Returns an error when a configured admin secret is empty.
    pub fn from_config(config: &LedgerConfig) -> Result<Self> {
        let mut reconciler = Reconciler::new();
        if config.permissive_fields {
            reconciler = reconciler.with_unknown_fields(UnknownFieldPolicy::Ignore);
        }
        if config.contract_encoding == ContractEncoding::Ordinal {
            reconciler = reconciler.with_encoding(
                CONTRACT_FIELD,
                CategoricalEncoding::Ordinal(OrdinalTable::contract()),
            );
        }

        let gate = config
            .admin_secret
            .as_deref()
            .map(AccessGate::new)
            .transpose()?;

        Ok(Self::new(
            reconciler,
            RecordStore::open(&config.history_path, StoreLayout::prediction_history()),
            RecordStore::open(&config.feedback_path, StoreLayout::feedback_log()),
            gate,
        ))
    }

    #[must_use]
    pub fn store(&self, kind: StoreKind) -> &RecordStore {
        match kind {
            StoreKind::History => &self.history,
            StoreKind::Feedback => &self.feedback,
        }
    }

    /// Scores `request` and appends the result to the prediction history.
    ///
    /// # Errors
    /// Returns input validation, reconciliation and scoring errors before
    /// anything is written, and store errors from the append.
    pub fn predict<S: Scorer + ?Sized>(
        &self,
        scorer: &S,
        request: &PredictionRequest,
    ) -> Result<PredictionOutcome> {
        request.validate()?;
        let vector = self
            .reconciler
            .reconcile(&request.raw_record(), scorer.schema())?;
        let prediction = score(scorer, &vector)?;
        let timestamp = current_timestamp()?;

        let row = Row::new()
            .with("CustomerID", request.customer_id.trim())
            .with("Tenure", request.tenure.to_string())
            .with("MonthlyCharges", request.monthly_charges.to_string())
            .with("Contract", request.contract.trim())
            .with("Prediction", prediction.label.as_str())
            .with(
                "Probability",
                prediction
                    .probability
                    .map(|value| format!("{value:.4}"))
                    .unwrap_or_default(),
            )
            .with(TIMESTAMP_COLUMN, timestamp.as_str());
        let history_rows = self
            .history
            .append(row)
            .map_err(|err| store_failure(StoreKind::History, err))?;

        info!(
            customer_id = request.customer_id.trim(),
            label = prediction.label.as_str(),
            probability = ?prediction.probability,
            "recorded prediction"
        );
        Ok(PredictionOutcome {
            customer_id: request.customer_id.trim().to_string(),
            prediction,
            timestamp,
            history_rows,
        })
    }

    /// Appends one feedback entry. Returns the stored row.
    ///
    /// # Errors
    /// Returns [`ChurnError::Validation`] for empty text and store errors from
    /// the append.
    pub fn submit_feedback(&self, name: &str, text: &str) -> Result<Row> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChurnError::Validation("feedback text MUST be non-empty".to_string()).into());
        }

        let row = Row::new()
            .with("Name", name.trim())
            .with("Feedback", text)
            .with(TIMESTAMP_COLUMN, current_timestamp()?);
        self.feedback
            .append(row.clone())
            .map_err(|err| store_failure(StoreKind::Feedback, err))?;
        info!(name = name.trim(), "recorded feedback");
        Ok(row)
    }

    /// Rows of `kind` in display order.
    ///
    /// # Errors
    /// Returns store read errors with a reset hint for corrupt files.
    pub fn list(&self, kind: StoreKind) -> Result<StoreTable> {
        self.store(kind)
            .displayed()
            .map_err(|err| store_failure(kind, err))
    }

    /// Deletes the displayed row at `index` when `secret` passes the gate.
    ///
    /// # Errors
    /// Returns a configuration error when no admin secret is configured, and
    /// store errors such as an out-of-range index.
    pub fn delete_at(&self, kind: StoreKind, secret: &str, index: usize) -> Result<Guarded<Row>> {
        let Some(grant) = self.gate()?.authorize(secret) else {
            warn!(store = kind.command_name(), "access denied for row deletion");
            return Ok(Guarded::Denied);
        };
        self.store(kind)
            .delete_at(grant, index)
            .map(Guarded::Done)
            .map_err(|err| store_failure(kind, err))
    }

    /// Removes the whole store when `secret` passes the gate. The inner value
    /// reports whether a file existed.
    ///
    /// # Errors
    /// Returns a configuration error when no admin secret is configured, and
    /// store I/O errors.
    pub fn clear(&self, kind: StoreKind, secret: &str) -> Result<Guarded<bool>> {
        let Some(grant) = self.gate()?.authorize(secret) else {
            warn!(store = kind.command_name(), "access denied for store reset");
            return Ok(Guarded::Denied);
        };
        self.store(kind)
            .delete_all(grant)
            .map(Guarded::Done)
            .map_err(|err| store_failure(kind, err))
    }

    /// # Errors
    /// Returns store read/write errors.
    pub fn migrate(&self, kind: StoreKind) -> Result<MigrationReport> {
        self.store(kind)
            .migrate()
            .map_err(|err| store_failure(kind, err))
    }

    fn gate(&self) -> Result<&AccessGate> {
        self.gate.as_ref().ok_or_else(|| {
            ChurnError::Configuration(
                "no admin secret configured; set admin_secret or CHURN_ADMIN_SECRET".to_string(),
            )
            .into()
        })
    }
}

/// Loads the model artifact and its optional schema file.
///
/// # Errors
/// Returns an error when either file is missing, unreadable or inconsistent.
pub fn load_model(model_path: &Path, schema_path: Option<&Path>) -> Result<TrainedModel> {
    let raw = std::fs::read_to_string(model_path)
        .with_context(|| format!("failed reading model artifact {}", model_path.display()))?;
    let artifact = ModelArtifact::from_json_str(&raw)
        .with_context(|| format!("invalid model artifact {}", model_path.display()))?;

    let schema = match schema_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading schema file {}", path.display()))?;
            Some(
                SchemaDescriptor::from_json_str(&raw)
                    .with_context(|| format!("invalid schema file {}", path.display()))?,
            )
        }
        None => None,
    };

    TrainedModel::bind(artifact, schema)
        .with_context(|| format!("model artifact {} does not fit its schema", model_path.display()))
}

fn current_timestamp() -> Result<String> {
    let now = now_utc()
        .replace_nanosecond(0)
        .map_err(|err| anyhow!("failed to truncate timestamp: {err}"))?;
    Ok(format_rfc3339(now)?)
}

fn store_failure(kind: StoreKind, err: StoreError) -> anyhow::Error {
    if err.is_corrupt() {
        anyhow!(
            "{err}\nhint: the {} store cannot be read; reset it with `churn {} clear`",
            kind.command_name(),
            kind.command_name()
        )
    } else {
        anyhow::Error::new(err)
    }
}
