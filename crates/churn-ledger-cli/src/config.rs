//! Layered configuration for the `churn` binary.
//!
//! Each setting resolves as: command-line flag, then environment variable
//! (both handled by clap), then the TOML config file, then the built-in
//! default.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "churn-ledger.toml";
pub const DEFAULT_MODEL_FILE: &str = "rf_model.json";
pub const DEFAULT_HISTORY_FILE: &str = "predictions.csv";
pub const DEFAULT_FEEDBACK_FILE: &str = "user_feedback.csv";

/// How the `Contract` field is turned into features.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ContractEncoding {
    /// `Contract_<label>` indicator columns.
    #[default]
    OneHot,
    /// A single `Contract` column holding the ordinal code.
    Ordinal,
}

/// Contents of the TOML config file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    model_path: Option<PathBuf>,
    schema_path: Option<PathBuf>,
    history_path: Option<PathBuf>,
    feedback_path: Option<PathBuf>,
    admin_secret: Option<String>,
    permissive_fields: Option<bool>,
    contract_encoding: Option<ContractEncoding>,
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigOverrides {
    pub model_path: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
    pub history_path: Option<PathBuf>,
    pub feedback_path: Option<PathBuf>,
    pub admin_secret: Option<String>,
    pub permissive_fields: Option<bool>,
    pub contract_encoding: Option<ContractEncoding>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub model_path: PathBuf,
    pub schema_path: Option<PathBuf>,
    pub history_path: PathBuf,
    pub feedback_path: PathBuf,
    pub admin_secret: Option<String>,
    pub permissive_fields: bool,
    pub contract_encoding: ContractEncoding,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_FILE),
            schema_path: None,
            history_path: PathBuf::from(DEFAULT_HISTORY_FILE),
            feedback_path: PathBuf::from(DEFAULT_FEEDBACK_FILE),
            admin_secret: None,
            permissive_fields: false,
            contract_encoding: ContractEncoding::OneHot,
        }
    }
}

impl LedgerConfig {
    /// Resolves the effective configuration.
    ///
    /// An explicit `config_path` must exist. Without one, `./churn-ledger.toml`
    /// is read when present. Relative paths inside the file are taken relative
    /// to the file's directory.
    ///
    /// # Errors
    /// Returns an error when the config file cannot be read or parsed, or a
    /// path setting is empty.
    pub fn resolve(config_path: Option<&Path>, overrides: ConfigOverrides) -> Result<Self> {
        let (file, base) = match config_path {
            Some(path) => (read_file_config(path)?, parent_dir(path)),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    (read_file_config(default_path)?, PathBuf::new())
                } else {
                    (FileConfig::default(), PathBuf::new())
                }
            }
        };

        let defaults = Self::default();
        let config = Self {
            model_path: overrides
                .model_path
                .or_else(|| file.model_path.map(|path| base.join(path)))
                .unwrap_or(defaults.model_path),
            schema_path: overrides
                .schema_path
                .or_else(|| file.schema_path.map(|path| base.join(path))),
            history_path: overrides
                .history_path
                .or_else(|| file.history_path.map(|path| base.join(path)))
                .unwrap_or(defaults.history_path),
            feedback_path: overrides
                .feedback_path
                .or_else(|| file.feedback_path.map(|path| base.join(path)))
                .unwrap_or(defaults.feedback_path),
            admin_secret: overrides.admin_secret.or(file.admin_secret),
            permissive_fields: overrides
                .permissive_fields
                .or(file.permissive_fields)
                .unwrap_or(defaults.permissive_fields),
            contract_encoding: overrides
                .contract_encoding
                .or(file.contract_encoding)
                .unwrap_or(defaults.contract_encoding),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, path) in [
            ("model_path", &self.model_path),
            ("history_path", &self.history_path),
            ("feedback_path", &self.feedback_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(anyhow!("{name} MUST be non-empty"));
            }
        }
        if self.history_path == self.feedback_path {
            return Err(anyhow!(
                "history_path and feedback_path MUST differ (both are {})",
                self.history_path.display()
            ));
        }
        Ok(())
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("failed parsing TOML config {}", path.display()))
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}
