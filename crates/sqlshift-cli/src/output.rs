//! Output formatters for command results.

use clap::ValueEnum;
use comfy_table::Table;
use serde_json::json;
use sqlshift_core::{
    Catalog, Checkpoint, Error, MigrationRun, RollbackOutcome, RollbackPlan, RunReport,
    StepAction,
};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting command output.
pub trait Formatter: Send + Sync {
    /// Format a validated catalog.
    fn format_catalog(&self, catalog: &Catalog) -> String;

    /// Format the report of a run.
    fn format_run(&self, report: &RunReport) -> String;

    /// Format a rollback plan before it executes.
    fn format_plan(&self, plan: &RollbackPlan) -> String;

    /// Format a completed rollback.
    fn format_rollback(&self, outcome: &RollbackOutcome) -> String;

    /// Format checkpoints with their rollback state.
    fn format_checkpoints(&self, checkpoints: &[(Checkpoint, bool)]) -> String;

    /// Format recorded runs.
    fn format_runs(&self, runs: &[MigrationRun]) -> String;

    /// Format an error.
    fn format_error(&self, error: &Error) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_catalog(&self, catalog: &Catalog) -> String {
        if catalog.is_empty() {
            return "No migrations".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["#", "Migration", "Operations", "Reversible", "Checksum"]);
        for unit in catalog.units() {
            table.add_row(vec![
                unit.ordinal().to_string(),
                unit.name().to_string(),
                unit.operations().len().to_string(),
                yes_no(!unit.is_irreversible()).to_string(),
                short(&unit.checksum()).to_string(),
            ]);
        }
        format!("{}\n{} migration(s) valid", table, catalog.len())
    }

    fn format_run(&self, report: &RunReport) -> String {
        let run = &report.run;
        let mut output = format!(
            "Run {} ({}) {}",
            run.id,
            run.environment,
            run.status
        );

        if !run.outcomes.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["#", "Migration", "Status", "Checkpoints", "Duration", "Message"]);
            for outcome in &run.outcomes {
                let checkpoints = match (outcome.pre_checkpoint, outcome.post_checkpoint) {
                    (Some(pre), Some(post)) => format!("{} -> {}", pre, post),
                    (Some(pre), None) => pre.to_string(),
                    _ => String::new(),
                };
                table.add_row(vec![
                    outcome.ordinal.to_string(),
                    outcome.name.clone(),
                    outcome.status.to_string(),
                    checkpoints,
                    format!("{} ms", outcome.duration_ms),
                    outcome.message.clone().unwrap_or_default(),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }

        for warning in &run.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        if let Some(path) = &run.rollback_script {
            output.push_str(&format!("\nEmergency rollback script: {}", path));
        }
        if let Some(error) = &report.error {
            output.push('\n');
            output.push_str(&self.format_error(error));
            output.push_str(&format!(
                "\nLast applied: {}",
                report.last_applied.as_deref().unwrap_or("none")
            ));
            match report.last_checkpoint {
                Some(id) => output.push_str(&format!(
                    "\nLast checkpoint: {} (sqlshift rollback {})",
                    id, id
                )),
                None => output.push_str("\nLast checkpoint: none"),
            }
        }
        output
    }

    fn format_plan(&self, plan: &RollbackPlan) -> String {
        if plan.is_empty() {
            return format!("Nothing to roll back after {}", plan.target.id);
        }
        let mut table = Table::new();
        table.set_header(vec!["Checkpoint", "Migration", "Action", "Statements"]);
        for step in &plan.steps {
            let action = match step.action {
                StepAction::Undo => "undo",
                StepAction::PassOver => "leave in place",
            };
            table.add_row(vec![
                step.checkpoint.id.to_string(),
                step.checkpoint.unit_name.clone(),
                action.to_string(),
                step.checkpoint.inverse.statements.len().to_string(),
            ]);
        }
        format!("Rollback to {}\n{}", plan.target.id, table)
    }

    fn format_rollback(&self, outcome: &RollbackOutcome) -> String {
        let mut output = format!(
            "Rolled back to {}: {} migration(s) undone in {} ms",
            outcome.target,
            outcome.undone.len(),
            outcome.duration_ms
        );
        for unit in &outcome.undone {
            output.push_str(&format!("\n  undone {} ({})", unit.name, unit.checkpoint));
        }
        for name in &outcome.passed_over {
            output.push_str(&format!("\n  left in place {} (irreversible)", name));
        }
        output
    }

    fn format_checkpoints(&self, checkpoints: &[(Checkpoint, bool)]) -> String {
        if checkpoints.is_empty() {
            return "No checkpoints".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Checkpoint", "Phase", "Migration", "Run", "Created", "Rolled back"]);
        for (checkpoint, rolled_back) in checkpoints {
            table.add_row(vec![
                checkpoint.id.to_string(),
                checkpoint.phase.to_string(),
                checkpoint.unit_name.clone(),
                checkpoint.run_id.clone(),
                checkpoint.created_at_rfc3339(),
                yes_no(*rolled_back).to_string(),
            ]);
        }
        table.to_string()
    }

    fn format_runs(&self, runs: &[MigrationRun]) -> String {
        if runs.is_empty() {
            return "No runs".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Run", "Environment", "Started", "Status", "Migrations", "Duration"]);
        for run in runs {
            table.add_row(vec![
                run.id.clone(),
                run.environment.clone(),
                run.started_at_rfc3339(),
                run.status.to_string(),
                run.outcomes.len().to_string(),
                run.duration_ms()
                    .map(|ms| format!("{} ms", ms))
                    .unwrap_or_default(),
            ]);
        }
        table.to_string()
    }

    fn format_error(&self, error: &Error) -> String {
        format!("Error: {}", error)
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_catalog(&self, catalog: &Catalog) -> String {
        let units: Vec<_> = catalog
            .units()
            .iter()
            .map(|unit| {
                json!({
                    "ordinal": unit.ordinal(),
                    "name": unit.name(),
                    "description": unit.description(),
                    "operations": unit.operations().iter().map(|op| op.describe()).collect::<Vec<_>>(),
                    "irreversible": unit.is_irreversible(),
                    "checksum": unit.checksum(),
                })
            })
            .collect();
        pretty(json!({ "valid": true, "migrations": units }))
    }

    fn format_run(&self, report: &RunReport) -> String {
        let run = &report.run;
        let outcomes: Vec<_> = run
            .outcomes
            .iter()
            .map(|o| {
                json!({
                    "ordinal": o.ordinal,
                    "name": o.name,
                    "status": o.status.to_string(),
                    "pre_checkpoint": o.pre_checkpoint.map(|c| c.to_string()),
                    "post_checkpoint": o.post_checkpoint.map(|c| c.to_string()),
                    "duration_ms": o.duration_ms,
                    "message": o.message,
                })
            })
            .collect();
        let integrity = report.integrity.as_ref().map(|r| {
            json!({
                "tables_checked": r.tables_checked,
                "findings": r.messages(),
            })
        });
        pretty(json!({
            "id": run.id,
            "environment": run.environment,
            "dry_run": run.dry_run,
            "status": run.status.to_string(),
            "started_at": run.started_at_rfc3339(),
            "duration_ms": run.duration_ms(),
            "outcomes": outcomes,
            "warnings": run.warnings,
            "integrity": integrity,
            "rollback_script": run.rollback_script,
            "error": report.error.as_ref().map(error_json),
            "last_applied": report.last_applied,
            "last_checkpoint": report.last_checkpoint.map(|c| c.to_string()),
        }))
    }

    fn format_plan(&self, plan: &RollbackPlan) -> String {
        let steps: Vec<_> = plan
            .steps
            .iter()
            .map(|step| {
                json!({
                    "checkpoint": step.checkpoint.id.to_string(),
                    "migration": step.checkpoint.unit_name,
                    "action": match step.action {
                        StepAction::Undo => "undo",
                        StepAction::PassOver => "pass-over",
                    },
                    "statements": step.checkpoint.inverse.statements,
                })
            })
            .collect();
        pretty(json!({
            "target": plan.target.id.to_string(),
            "steps": steps,
        }))
    }

    fn format_rollback(&self, outcome: &RollbackOutcome) -> String {
        let undone: Vec<_> = outcome
            .undone
            .iter()
            .map(|u| {
                json!({
                    "ordinal": u.ordinal,
                    "name": u.name,
                    "checkpoint": u.checkpoint.to_string(),
                    "statements": u.statements,
                })
            })
            .collect();
        pretty(json!({
            "id": outcome.id,
            "target": outcome.target.to_string(),
            "undone": undone,
            "passed_over": outcome.passed_over,
            "duration_ms": outcome.duration_ms,
        }))
    }

    fn format_checkpoints(&self, checkpoints: &[(Checkpoint, bool)]) -> String {
        let rows: Vec<_> = checkpoints
            .iter()
            .map(|(c, rolled_back)| {
                json!({
                    "id": c.id.to_string(),
                    "phase": c.phase.to_string(),
                    "migration": c.unit_name,
                    "ordinal": c.unit_ordinal,
                    "run_id": c.run_id,
                    "created_at": c.created_at_rfc3339(),
                    "rolled_back": rolled_back,
                    "reversible": !c.inverse.irreversible && c.inverse.is_complete(),
                })
            })
            .collect();
        pretty(json!(rows))
    }

    fn format_runs(&self, runs: &[MigrationRun]) -> String {
        let rows: Vec<_> = runs
            .iter()
            .map(|run| {
                json!({
                    "id": run.id,
                    "environment": run.environment,
                    "dry_run": run.dry_run,
                    "started_at": run.started_at_rfc3339(),
                    "status": run.status.to_string(),
                    "migrations": run.outcomes.len(),
                    "duration_ms": run.duration_ms(),
                    "error": run.error,
                })
            })
            .collect();
        pretty(json!(rows))
    }

    fn format_error(&self, error: &Error) -> String {
        pretty(error_json(error))
    }

    fn format_message(&self, message: &str) -> String {
        json!({ "message": message }).to_string()
    }
}

fn error_json(error: &Error) -> serde_json::Value {
    let mut value = json!({
        "error": error.to_string(),
        "class": format!("{:?}", error.class()).to_lowercase(),
    });
    match error {
        Error::Transaction {
            unit,
            last_applied,
            last_checkpoint,
            ..
        } => {
            value["unit"] = json!(unit);
            value["last_applied"] = json!(last_applied);
            value["last_checkpoint"] = json!(last_checkpoint.map(|c| c.to_string()));
        }
        Error::Validation { findings } => {
            value["findings"] = json!(findings);
        }
        _ => {}
    }
    value
}

fn pretty(value: serde_json::Value) -> String {
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlshift_core::{MigrationUnit, Operation};

    fn catalog() -> Catalog {
        Catalog::from_units(vec![MigrationUnit::new(1, "0001_users").with_operation(
            Operation::create_table("users", "CREATE TABLE users (id INTEGER PRIMARY KEY)"),
        )])
    }

    #[test]
    fn test_table_formatter_catalog() {
        let output = TableFormatter.format_catalog(&catalog());
        assert!(output.contains("0001_users"));
        assert!(output.contains("1 migration(s) valid"));
        assert_eq!(TableFormatter.format_catalog(&Catalog::from_units(vec![])), "No migrations");
    }

    #[test]
    fn test_json_formatter_catalog() {
        let output = JsonFormatter.format_catalog(&catalog());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["valid"], true);
        assert_eq!(value["migrations"][0]["name"], "0001_users");
        assert_eq!(value["migrations"][0]["operations"][0], "create-table users");
    }

    #[test]
    fn test_json_formatter_error() {
        let error = Error::Validation {
            findings: vec!["unit 0002_x requires 'teams' which does not exist".to_string()],
        };
        let value: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_error(&error)).unwrap();
        assert_eq!(value["class"], "validation");
        assert_eq!(value["findings"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_halted_run_reports_last_applied_and_checkpoint() {
        let mut run = MigrationRun::new("run-1", "test", false);
        run.fail("unit 0002_x failed validation");
        let report = RunReport {
            run,
            integrity: None,
            error: Some(Error::Validation {
                findings: vec!["table 'teams' already exists".to_string()],
            }),
            last_applied: Some("0001_users".to_string()),
            last_checkpoint: Some(sqlshift_core::CheckpointId(4)),
        };

        let value: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_run(&report)).unwrap();
        assert_eq!(value["last_applied"], "0001_users");
        assert_eq!(value["last_checkpoint"], "ckpt-4");

        let text = TableFormatter.format_run(&report);
        assert!(text.contains("Last applied: 0001_users"));
        assert!(text.contains("sqlshift rollback ckpt-4"));
    }

    #[test]
    fn test_empty_listings() {
        assert_eq!(TableFormatter.format_runs(&[]), "No runs");
        assert_eq!(TableFormatter.format_checkpoints(&[]), "No checkpoints");
        assert_eq!(JsonFormatter.format_runs(&[]), "[]");
    }

    #[test]
    fn test_output_format_display() {
        assert_eq!(OutputFormat::Table.to_string(), "table");
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }
}
