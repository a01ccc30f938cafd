use crate::config::NodeConfig;
use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Cell, Color, Table as ComfyTable};
use query_distributed::{
    OperatorProfile, ResultSet, Task, TaskOutcome, TaskPlan, TaskStatus, Worker,
};
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

fn load_plans(paths: &[PathBuf]) -> Result<Vec<TaskPlan>> {
    paths
        .iter()
        .map(|path| {
            TaskPlan::from_file(path).with_context(|| format!("Loading {}", path.display()))
        })
        .collect()
}

/// Run every plan on one worker. Returns the number of tasks that did not
/// complete.
pub fn run_plans(config: &NodeConfig, paths: &[PathBuf]) -> Result<usize> {
    let plans = load_plans(paths)?;
    info!("Loaded {} task plans", plans.len());
    let worker = Worker::new(&config.address, config.network.clone())?;
    println!(
        "{} Worker {} listening on {}",
        "→".bright_blue(),
        worker.id().to_string().bright_cyan(),
        worker.address()
    );

    let start = Instant::now();
    let mut handles = Vec::with_capacity(plans.len());
    for (plan, path) in plans.into_iter().zip(paths) {
        let task_id = plan.task_id;
        let handle = worker
            .submit(plan)
            .with_context(|| format!("Starting {} from {}", task_id, path.display()))?;
        handles.push(handle);
    }

    let mut failed = 0;
    for handle in handles {
        let outcome = handle.join()?;
        if !outcome.is_success() {
            failed += 1;
        }
        print_outcome(&outcome, config);
    }
    worker.shutdown();

    println!(
        "{} {:.2}ms",
        "Total time:".bright_yellow(),
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(failed)
}

/// Parse the plans and check their structure without running them
pub fn validate_plans(paths: &[PathBuf]) -> Result<usize> {
    let mut invalid = 0;
    for path in paths {
        let checked = TaskPlan::from_file(path).and_then(Task::from_plan);
        match checked {
            Ok(task) => println!(
                "{} {} ({}, {} operators)",
                "✓".bright_green(),
                path.display(),
                task.task_id(),
                task.operator_count()
            ),
            Err(e) => {
                invalid += 1;
                println!("{} {}: {}", "✗".bright_red(), path.display(), e);
            }
        }
    }
    Ok(invalid)
}

fn print_outcome(outcome: &TaskOutcome, config: &NodeConfig) {
    match &outcome.status {
        TaskStatus::Completed => {
            println!("{} {} completed", "✓".bright_green(), outcome.task_id)
        }
        TaskStatus::Failed { error } => println!(
            "{} {} failed: {}",
            "✗".bright_red(),
            outcome.task_id,
            error.to_string().bright_red()
        ),
        TaskStatus::UpstreamFailed { failure } => println!(
            "{} {} stopped by upstream failure: {}",
            "!".bright_yellow(),
            outcome.task_id,
            failure.to_string().bright_yellow()
        ),
    }

    for result in &outcome.results {
        println!("{}", render_results(result, config.max_rows));
        println!(
            "{} {}",
            "Rows:".bright_yellow(),
            result.len().to_string().bright_white()
        );
        if config.show_profiles && !result.profiles().is_empty() {
            println!("{}", render_profiles(result.profiles()));
        }
    }
}

pub fn render_results(result: &ResultSet, max_rows: usize) -> ComfyTable {
    let mut table = ComfyTable::new();
    table.set_header(
        result
            .schema
            .fields()
            .iter()
            .map(|f| Cell::new(f.name()).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    for row in result.rows.iter().take(max_rows) {
        table.add_row(row.iter().map(|v| v.to_string()).collect::<Vec<_>>());
    }
    table
}

pub fn render_profiles(profiles: &[OperatorProfile]) -> ComfyTable {
    let mut table = ComfyTable::new();
    table.set_header(vec![
        Cell::new("Operator").fg(Color::Cyan),
        Cell::new("Kind").fg(Color::Yellow),
        Cell::new("Tuples").fg(Color::Green),
        Cell::new("Elapsed (ms)").fg(Color::Magenta),
    ]);
    for profile in profiles {
        table.add_row(vec![
            profile.operator_id.to_string(),
            profile.kind.clone(),
            profile.processed.to_string(),
            profile.elapsed_ms().to_string(),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::{DataType, Field, Schema, Value};
    use query_distributed::{
        operators::{CollectConfig, ValuesConfig},
        JobId, OperatorConfig,
    };

    fn schema() -> Schema {
        Schema::new(vec![Field::new("id", DataType::Int64, false)])
    }

    fn write_plan(dir: &std::path::Path, name: &str, plan: &TaskPlan) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, plan.to_json().unwrap()).unwrap();
        path
    }

    fn local_plan(rows: i64) -> TaskPlan {
        TaskPlan::pipeline(
            JobId::new(),
            vec![
                OperatorConfig::Values(ValuesConfig {
                    schema: Some(schema()),
                    rows: (0..rows).map(|i| vec![Value::Int64(i)]).collect(),
                }),
                OperatorConfig::Collect(CollectConfig {
                    schema: Some(schema()),
                }),
            ],
        )
    }

    #[test]
    fn test_validate_reports_invalid_plans() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_plan(dir.path(), "good.json", &local_plan(3));
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();

        assert_eq!(validate_plans(&[good.clone()]).unwrap(), 0);
        assert_eq!(validate_plans(&[good, bad]).unwrap(), 1);
    }

    #[test]
    fn test_run_local_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_plan(dir.path(), "plan.json", &local_plan(5));
        let config = NodeConfig {
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };
        assert_eq!(run_plans(&config, &[path]).unwrap(), 0);
    }

    #[test]
    fn test_demo_plans_are_valid() {
        let demos = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        let plans = vec![demos.join("consumer.json"), demos.join("producer.json")];
        assert_eq!(validate_plans(&plans).unwrap(), 0);
        assert!(NodeConfig::from_file(&demos.join("node.json")).is_ok());
    }

    #[test]
    fn test_render_results_respects_max_rows() {
        let result = ResultSet {
            operator_id: Default::default(),
            schema: schema(),
            rows: (0..10).map(|i| vec![Value::Int64(i)]).collect(),
            fin: None,
        };
        assert_eq!(render_results(&result, 3).row_iter().count(), 3);
    }
}
