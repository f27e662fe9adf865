use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::store::ResultStore;

pub fn run(args: StatusArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| args.output_dir.join("likert_results.sqlite"));

    info!(output_dir = %args.output_dir.display(), "status requested");

    if !db_path.exists() {
        warn!(path = %db_path.display(), "results database missing");
        return Ok(());
    }

    let store = ResultStore::open(&db_path)?;
    let summary = store.summary()?;
    match &summary.latest {
        Some(latest) => info!(
            path = %db_path.display(),
            runs = summary.runs,
            run_id = %latest.run_id,
            status = %latest.status,
            model = %latest.model,
            evidence_mode = %latest.evidence_mode,
            started_at = %latest.started_at,
            finished_at = %latest.finished_at.clone().unwrap_or_default(),
            completed = summary.completed,
            failed = summary.failed,
            budget_exhausted = summary.budget_exhausted,
            estimation_runs = summary.estimation_runs,
            usage = %latest.usage_json.clone().unwrap_or_default(),
            "latest run"
        ),
        None => warn!(path = %db_path.display(), "results database has no runs"),
    }

    Ok(())
}
