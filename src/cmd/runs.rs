//! Offline run inspection: `ontextract status` and `ontextract runs`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;

use ontextract::config::OntExtractConfig;
use ontextract::orchestration::db::OrchestrationDb;
use ontextract::orchestration::models::RunStatusView;

fn open_db(project_dir: &Path) -> Result<OrchestrationDb> {
    let config = OntExtractConfig::new(project_dir.to_path_buf())?;
    let db_path = config.db_path();
    if !db_path.exists() {
        bail!(
            "No database at {}. Run 'ontextract init' first.",
            db_path.display()
        );
    }
    OrchestrationDb::new(&db_path).context("Failed to open database")
}

pub fn cmd_status(project_dir: &Path, run_id: &str) -> Result<()> {
    let db = open_db(project_dir)?;
    let run = db.require_run(run_id)?;
    let checkpoint = db.load_checkpoint(run_id)?;
    let view = RunStatusView::build(run, checkpoint, Utc::now());
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub fn cmd_runs(project_dir: &Path, experiment_id: i64) -> Result<()> {
    let db = open_db(project_dir)?;
    if db.get_experiment(experiment_id)?.is_none() {
        bail!("Experiment {} not found", experiment_id);
    }
    let runs = db.list_runs_for_experiment(experiment_id)?;
    if runs.is_empty() {
        println!("No runs for experiment {}.", experiment_id);
        return Ok(());
    }

    println!(
        "{:<36}  {:<12}  {:<9}  {:>4}  STARTED",
        "RUN", "STAGE", "STATUS", "%"
    );
    for run in runs {
        println!(
            "{:<36}  {:<12}  {:<9}  {:>4}  {}",
            run.run_id,
            run.current_stage.as_str(),
            run.status.as_str(),
            run.progress_percentage,
            run.started_at
        );
        if let Some(error) = &run.error_message {
            println!("    error: {}", error);
        }
    }
    Ok(())
}
