//! Embedded command surface for the `churn` binary.
//!
//! Hosts can drive the same behavior without spawning a process through:
//! - [`run_cli`] for a fully parsed command line.
//! - [`run_command`] for one [`Command`] against a resolved [`LedgerConfig`].
//!
//! Machine-readable output (`--json`) carries a `contract_version` and is
//! described by the JSON Schemas under `contracts/v1/schemas`.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use churn_ledger_core::{ChurnLabel, ModelKind, RawValue, Scorer, TrainedModel};
use churn_ledger_store_csv::{MigrationReport, StoreTable};
use clap::{Args, Parser, Subcommand};

mod config;
mod session;

pub use config::{
    ConfigOverrides, ContractEncoding, LedgerConfig, DEFAULT_CONFIG_FILE, DEFAULT_FEEDBACK_FILE,
    DEFAULT_HISTORY_FILE, DEFAULT_MODEL_FILE,
};
pub use session::{
    load_model, Guarded, PredictionOutcome, PredictionRequest, Session, StoreKind,
    CONTRACT_FIELD, MONTHLY_CHARGES_FIELD, TENURE_FIELD,
};

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "churn_ledger=info";

#[derive(Debug, Parser)]
#[command(name = "churn")]
#[command(about = "Churn prediction ledger")]
pub struct Cli {
    /// TOML config file; `./churn-ledger.toml` is read when present.
    #[arg(long, env = "CHURN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "CHURN_MODEL")]
    model: Option<PathBuf>,

    /// Optional schema companion file for the model artifact.
    #[arg(long)]
    schema: Option<PathBuf>,

    #[arg(long)]
    history: Option<PathBuf>,

    #[arg(long)]
    feedback: Option<PathBuf>,

    /// Secret that destructive commands are checked against.
    #[arg(long, env = "CHURN_ADMIN_SECRET", hide_env_values = true)]
    admin_secret: Option<String>,

    /// Ignore input fields the model schema does not declare
    /// (`--permissive-fields=false` overrides the config file).
    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true"
    )]
    permissive_fields: Option<bool>,

    #[arg(long, value_enum)]
    contract_encoding: Option<ContractEncoding>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            model_path: self.model.clone(),
            schema_path: self.schema.clone(),
            history_path: self.history.clone(),
            feedback_path: self.feedback.clone(),
            admin_secret: self.admin_secret.clone(),
            permissive_fields: self.permissive_fields,
            contract_encoding: self.contract_encoding,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Score one customer and record the result in the prediction history.
    Predict(PredictArgs),
    History {
        #[command(subcommand)]
        command: HistoryCommand,
    },
    Feedback {
        #[command(subcommand)]
        command: FeedbackCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    #[arg(long)]
    customer_id: String,
    #[arg(long)]
    tenure: f64,
    #[arg(long)]
    monthly_charges: f64,
    #[arg(long)]
    contract: String,
    /// Extra model input as `name=value`; numeric values are read as numbers.
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, RawValue)>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    List(ListArgs),
    Delete(DeleteArgs),
    Clear(ClearArgs),
    /// Rewrite an older history file with the current column set.
    Migrate(MigrateArgs),
}

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    Add(FeedbackAddArgs),
    List(ListArgs),
    Delete(DeleteArgs),
    Clear(ClearArgs),
    Migrate(MigrateArgs),
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Show(SchemaShowArgs),
}

#[derive(Debug, Args)]
pub struct FeedbackAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    /// Zero-based position in the listed (newest first) order.
    #[arg(long)]
    index: usize,
    #[arg(long, env = "CHURN_SECRET", hide_env_values = true)]
    secret: String,
}

#[derive(Debug, Args)]
pub struct ClearArgs {
    #[arg(long, env = "CHURN_SECRET", hide_env_values = true)]
    secret: String,
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SchemaShowArgs {
    #[arg(long)]
    json: bool,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when configuration cannot be resolved or the command
/// fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = LedgerConfig::resolve(cli.config.as_deref(), cli.overrides())?;
    run_command(cli.command, &config)
}

/// Executes one command against a resolved configuration.
///
/// # Errors
/// Returns an error when the model or a store cannot be used, input is
/// rejected, or the access gate denies a destructive command.
pub fn run_command(command: Command, config: &LedgerConfig) -> Result<()> {
    let session = Session::from_config(config)?;
    match command {
        Command::Predict(args) => {
            let model = load_model(&config.model_path, config.schema_path.as_deref())?;
            let request = PredictionRequest {
                customer_id: args.customer_id,
                tenure: args.tenure,
                monthly_charges: args.monthly_charges,
                contract: args.contract,
                extra_fields: args.fields,
            };
            let outcome = session.predict(&model, &request)?;
            if args.json {
                print_json(&build_prediction_json_payload(&outcome))?;
            } else {
                print_prediction(&outcome);
            }
            Ok(())
        }
        Command::History { command } => match command {
            HistoryCommand::List(args) => run_list(&session, StoreKind::History, &args),
            HistoryCommand::Delete(args) => run_delete(&session, StoreKind::History, &args),
            HistoryCommand::Clear(args) => run_clear(&session, StoreKind::History, &args),
            HistoryCommand::Migrate(args) => run_migrate(&session, StoreKind::History, &args),
        },
        Command::Feedback { command } => match command {
            FeedbackCommand::Add(args) => {
                session.submit_feedback(&args.name, &args.text)?;
                println!("feedback recorded");
                Ok(())
            }
            FeedbackCommand::List(args) => run_list(&session, StoreKind::Feedback, &args),
            FeedbackCommand::Delete(args) => run_delete(&session, StoreKind::Feedback, &args),
            FeedbackCommand::Clear(args) => run_clear(&session, StoreKind::Feedback, &args),
            FeedbackCommand::Migrate(args) => run_migrate(&session, StoreKind::Feedback, &args),
        },
        Command::Schema { command } => match command {
            SchemaCommand::Show(args) => {
                let model = load_model(&config.model_path, config.schema_path.as_deref())?;
                if args.json {
                    print_json(&build_schema_json_payload(&model))?;
                } else {
                    print_schema(&model);
                }
                Ok(())
            }
        },
    }
}

fn run_list(session: &Session, kind: StoreKind, args: &ListArgs) -> Result<()> {
    let table = session.list(kind)?;
    if args.json {
        print_json(&build_store_list_json_payload(kind, table))?;
    } else {
        print_store_table(kind, &table);
    }
    Ok(())
}

fn run_delete(session: &Session, kind: StoreKind, args: &DeleteArgs) -> Result<()> {
    match session.delete_at(kind, &args.secret, args.index)? {
        Guarded::Denied => Err(access_denied()),
        Guarded::Done(_) => {
            println!("deleted {} row {}", kind.command_name(), args.index);
            Ok(())
        }
    }
}

fn run_clear(session: &Session, kind: StoreKind, args: &ClearArgs) -> Result<()> {
    match session.clear(kind, &args.secret)? {
        Guarded::Denied => Err(access_denied()),
        Guarded::Done(true) => {
            println!("cleared {}", kind.command_name());
            Ok(())
        }
        Guarded::Done(false) => {
            println!("{} is already empty", kind.command_name());
            Ok(())
        }
    }
}

fn run_migrate(session: &Session, kind: StoreKind, args: &MigrateArgs) -> Result<()> {
    let report = session.migrate(kind)?;
    if args.json {
        print_json(&MigrationJsonPayload {
            contract_version: "migration.v1".to_string(),
            report,
        })?;
    } else if report.rewritten {
        println!(
            "migrated {}: added {} ({} rows)",
            kind.command_name(),
            report.added_columns.join(", "),
            report.rows
        );
    } else {
        println!("{} is up to date", kind.command_name());
    }
    Ok(())
}

fn access_denied() -> anyhow::Error {
    anyhow!("access denied")
}

fn parse_field(raw: &str) -> Result<(String, RawValue), String> {
    let Some((name, value)) = raw.split_once('=') else {
        return Err(format!("expected name=value, got {raw:?}"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("field name MUST be non-empty in {raw:?}"));
    }
    let value = match value.trim().parse::<f64>() {
        Ok(number) => RawValue::Number(number),
        Err(_) => RawValue::Text(value.to_string()),
    };
    Ok((name.to_string(), value))
}

fn model_kind_name(kind: &ModelKind) -> &'static str {
    match kind {
        ModelKind::Logistic { .. } => "logistic",
        ModelKind::Linear { .. } => "linear",
        ModelKind::Forest { .. } => "forest",
    }
}

fn print_json<T: serde::Serialize>(payload: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(payload)?);
    Ok(())
}

fn print_prediction(outcome: &PredictionOutcome) {
    println!("customer: {}", outcome.customer_id);
    println!("prediction: {}", outcome.prediction.label.as_str());
    match outcome.prediction.probability {
        Some(value) => println!("churn probability: {:.2}%", value * 100.0),
        None => println!("churn probability: n/a"),
    }
    println!("recorded at {} ({} rows)", outcome.timestamp, outcome.history_rows);
}

fn print_store_table(kind: StoreKind, table: &StoreTable) {
    if table.is_empty() {
        println!("{} is empty", kind.command_name());
        return;
    }

    let mut widths: Vec<usize> = table.header.iter().map(|column| column.chars().count()).collect();
    for row in &table.rows {
        for (width, column) in widths.iter_mut().zip(&table.header) {
            let len = display_cell(row.get(column).unwrap_or_default()).chars().count();
            *width = (*width).max(len);
        }
    }

    let mut line = format!("{:<5}", "index");
    for (column, width) in table.header.iter().zip(&widths) {
        line.push_str(&format!(" {column:<width$}"));
    }
    println!("{}", line.trim_end());
    println!("{}", "-".repeat(line.trim_end().chars().count()));

    for (index, row) in table.rows.iter().enumerate() {
        let mut line = format!("{index:<5}");
        for (column, width) in table.header.iter().zip(&widths) {
            let cell = display_cell(row.get(column).unwrap_or_default());
            line.push_str(&format!(" {cell:<width$}"));
        }
        println!("{}", line.trim_end());
    }
}

fn display_cell(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

fn print_schema(model: &TrainedModel) {
    let schema = model.schema();
    println!(
        "model: {} (artifact v{})",
        model_kind_name(&model.artifact().model),
        model.artifact().artifact_version
    );
    println!("schema version: {}", schema.schema_version());
    for (position, feature) in schema.features().iter().enumerate() {
        println!("{position:>3}  {feature}");
    }
}

#[derive(Debug, serde::Serialize, PartialEq)]
pub struct PredictionJsonPayload {
    contract_version: String,
    customer_id: String,
    label: ChurnLabel,
    prediction: String,
    probability: Option<f64>,
    timestamp: String,
    history_rows: usize,
}

fn build_prediction_json_payload(outcome: &PredictionOutcome) -> PredictionJsonPayload {
    PredictionJsonPayload {
        contract_version: "prediction.v1".to_string(),
        customer_id: outcome.customer_id.clone(),
        label: outcome.prediction.label,
        prediction: outcome.prediction.label.as_str().to_string(),
        probability: outcome.prediction.probability,
        timestamp: outcome.timestamp.clone(),
        history_rows: outcome.history_rows,
    }
}

#[derive(Debug, serde::Serialize, PartialEq)]
pub struct StoreListJsonPayload {
    contract_version: String,
    store: String,
    header: Vec<String>,
    rows: Vec<churn_ledger_store_csv::Row>,
}

fn build_store_list_json_payload(kind: StoreKind, table: StoreTable) -> StoreListJsonPayload {
    StoreListJsonPayload {
        contract_version: "store_list.v1".to_string(),
        store: kind.command_name().to_string(),
        header: table.header,
        rows: table.rows,
    }
}

#[derive(Debug, serde::Serialize, PartialEq)]
pub struct SchemaJsonPayload {
    contract_version: String,
    model: String,
    probabilistic: bool,
    schema_version: u32,
    features: Vec<String>,
}

fn build_schema_json_payload(model: &TrainedModel) -> SchemaJsonPayload {
    let kind = &model.artifact().model;
    SchemaJsonPayload {
        contract_version: "schema.v1".to_string(),
        model: model_kind_name(kind).to_string(),
        probabilistic: !matches!(kind, ModelKind::Linear { .. }),
        schema_version: model.schema().schema_version(),
        features: model.schema().features().to_vec(),
    }
}

#[derive(Debug, serde::Serialize, PartialEq)]
pub struct MigrationJsonPayload {
    contract_version: String,
    #[serde(flatten)]
    report: MigrationReport,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use churn_ledger_core::Prediction;
    use churn_ledger_store_csv::Row;
    use serde_json::json;
    use std::path::Path;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("churn-cli-{}", ulid::Ulid::new()));
        if let Err(err) = std::fs::create_dir_all(&dir) {
            panic!("failed to create {}: {err}", dir.display());
        }
        dir
    }

    fn write_model(dir: &Path) -> PathBuf {
        let path = dir.join("rf_model.json");
        let body = r#"{
            "artifact_version": 1,
            "model": "forest",
            "features": ["tenure", "MonthlyCharges", "Contract_One year", "Contract_Two year"],
            "trees": [
                {"nodes": [
                    {"split": {"feature": 0, "threshold": 24.0, "left": 1, "right": 2}},
                    {"leaf": {"probability": 0.8}},
                    {"leaf": {"probability": 0.1}}
                ]},
                {"nodes": [
                    {"split": {"feature": 3, "threshold": 0.5, "left": 1, "right": 2}},
                    {"leaf": {"probability": 0.6}},
                    {"leaf": {"probability": 0.0}}
                ]}
            ]
        }"#;
        if let Err(err) = std::fs::write(&path, body) {
            panic!("failed to write {}: {err}", path.display());
        }
        path
    }

    fn execute_cli(dir: &Path, args: &[&str]) -> Result<()> {
        let model = dir.join("rf_model.json");
        let history = dir.join("predictions.csv");
        let feedback = dir.join("user_feedback.csv");
        let mut argv = vec![
            "churn".to_string(),
            "--model".to_string(),
            model.display().to_string(),
            "--history".to_string(),
            history.display().to_string(),
            "--feedback".to_string(),
            feedback.display().to_string(),
            "--admin-secret".to_string(),
            "admin123".to_string(),
        ];
        argv.extend(args.iter().map(|arg| (*arg).to_string()));
        let cli = Cli::try_parse_from(argv)?;
        run_cli(cli)
    }

    #[test]
    fn parse_field_reads_numbers_and_text() {
        assert_eq!(
            parse_field("SeniorCitizen=1"),
            Ok(("SeniorCitizen".to_string(), RawValue::Number(1.0)))
        );
        assert_eq!(
            parse_field("PaymentMethod=Electronic check"),
            Ok((
                "PaymentMethod".to_string(),
                RawValue::Text("Electronic check".to_string())
            ))
        );
        assert!(parse_field("missing-separator").is_err());
        assert!(parse_field("=1").is_err());
    }

    #[test]
    fn permissive_flag_is_tri_state() {
        let parse = |args: &[&str]| match Cli::try_parse_from(args) {
            Ok(cli) => cli.overrides().permissive_fields,
            Err(err) => panic!("failed to parse {args:?}: {err}"),
        };
        assert_eq!(parse(&["churn", "schema", "show"]), None);
        assert_eq!(parse(&["churn", "--permissive-fields", "schema", "show"]), Some(true));
        assert_eq!(
            parse(&["churn", "--permissive-fields=false", "schema", "show"]),
            Some(false)
        );
    }

    #[test]
    fn prediction_json_contract_is_stable_v1() {
        let outcome = PredictionOutcome {
            customer_id: "7590-VHVEG".to_string(),
            prediction: Prediction {
                label: ChurnLabel::Churn,
                probability: Some(0.7),
            },
            timestamp: "2026-02-07T12:00:00Z".to_string(),
            history_rows: 3,
        };

        let value = must(serde_json::to_value(build_prediction_json_payload(&outcome)).map_err(Into::into));
        assert_eq!(
            value,
            json!({
                "contract_version": "prediction.v1",
                "customer_id": "7590-VHVEG",
                "label": "churn",
                "prediction": "Churn",
                "probability": 0.7,
                "timestamp": "2026-02-07T12:00:00Z",
                "history_rows": 3
            })
        );
    }

    #[test]
    fn store_list_json_keeps_column_order() {
        let mut table = StoreTable::with_header(vec!["Name".to_string(), "Feedback".to_string()]);
        table.rows.push(Row::new().with("Name", "ana").with("Feedback", "ok"));

        let payload = build_store_list_json_payload(StoreKind::Feedback, table);
        let rendered = must(serde_json::to_string(&payload).map_err(Into::into));
        assert_eq!(
            rendered,
            r#"{"contract_version":"store_list.v1","store":"feedback","header":["Name","Feedback"],"rows":[{"Name":"ana","Feedback":"ok"}]}"#
        );
    }

    #[test]
    fn embedded_cli_runs_predict_list_and_guarded_clear() {
        let dir = temp_dir();
        write_model(&dir);

        must(execute_cli(
            &dir,
            &[
                "predict",
                "--customer-id",
                "C-1",
                "--tenure",
                "3",
                "--monthly-charges",
                "80.5",
                "--contract",
                "Month-to-month",
            ],
        ));
        must(execute_cli(&dir, &["feedback", "add", "--name", "ana", "--text", "useful"]));
        must(execute_cli(&dir, &["history", "list"]));

        let history = dir.join("predictions.csv");
        let body = std::fs::read_to_string(&history).unwrap_or_default();
        assert!(body.contains("C-1,3,80.5,Month-to-month,Churn,0.7000,"));

        match execute_cli(&dir, &["history", "clear", "--secret", "nope"]) {
            Ok(()) => panic!("clear with a wrong secret succeeded"),
            Err(err) => assert_eq!(format!("{err:#}"), "access denied"),
        }
        assert!(history.exists());

        must(execute_cli(&dir, &["history", "clear", "--secret", "admin123"]));
        assert!(!history.exists());

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_model_is_fatal_only_for_commands_that_need_it() {
        let dir = temp_dir();
        assert!(execute_cli(&dir, &["schema", "show"]).is_err());
        assert!(execute_cli(
            &dir,
            &[
                "predict",
                "--customer-id",
                "C-1",
                "--tenure",
                "3",
                "--monthly-charges",
                "80.5",
                "--contract",
                "One year",
            ],
        )
        .is_err());
        must(execute_cli(&dir, &["feedback", "list", "--json"]));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn schema_payload_reports_model_kind() {
        let dir = temp_dir();
        let path = write_model(&dir);
        let model = must(load_model(&path, None));

        let value = must(serde_json::to_value(build_schema_json_payload(&model)).map_err(Into::into));
        assert_eq!(value["contract_version"], json!("schema.v1"));
        assert_eq!(value["model"], json!("forest"));
        assert_eq!(value["probabilistic"], json!(true));
        assert_eq!(value["features"][3], json!("Contract_Two year"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
