use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};

use crate::capability::UsageLedger;
use crate::likert::{Distribution, LikertLabel};
use crate::model::EstimateCounts;
use crate::orchestrator::{ConceptRecord, IterationRecord};
use crate::util::ensure_directory;

pub struct ResultStore {
    connection: Connection,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub model: String,
    pub evidence_mode: String,
    pub usage_json: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSummary {
    pub runs: i64,
    pub latest: Option<RunSummary>,
    pub completed: i64,
    pub failed: i64,
    pub budget_exhausted: i64,
    pub estimation_runs: i64,
}

impl ResultStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                ensure_directory(parent)?;
            }
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        configure_connection(&connection)?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory db")?;
        ensure_schema(&connection)?;
        Ok(Self { connection })
    }

    pub fn begin_run(
        &self,
        run_id: &str,
        started_at: &str,
        model: &str,
        evidence_mode: &str,
    ) -> Result<()> {
        self.connection
            .execute(
                "INSERT INTO runs (run_id, status, started_at, model, evidence_mode)
                 VALUES (?1, 'running', ?2, ?3, ?4)",
                params![run_id, started_at, model, evidence_mode],
            )
            .with_context(|| format!("failed to insert run {run_id}"))?;
        Ok(())
    }

    pub fn finish_run(
        &self,
        run_id: &str,
        status: &str,
        finished_at: &str,
        counts: &EstimateCounts,
        usage: &UsageLedger,
    ) -> Result<()> {
        let counts_json = serde_json::to_string(counts).context("failed to encode counts")?;
        let usage_json =
            serde_json::to_string(&usage.to_json()).context("failed to encode usage")?;
        self.connection
            .execute(
                "UPDATE runs SET status = ?2, finished_at = ?3, counts_json = ?4, usage_json = ?5
                 WHERE run_id = ?1",
                params![run_id, status, finished_at, counts_json, usage_json],
            )
            .with_context(|| format!("failed to finish run {run_id}"))?;
        Ok(())
    }

    /// Writes one concept's result row and every estimation run it produced, atomically.
    pub fn record_concept(
        &mut self,
        run_id: &str,
        record: &ConceptRecord,
        runs_per_iteration: usize,
    ) -> Result<()> {
        let tx = self
            .connection
            .transaction()
            .context("failed to open transaction")?;
        insert_concept_result(&tx, run_id, record, runs_per_iteration)?;
        let concept = &record.concept().text;
        for iteration in record.history() {
            insert_estimation_runs(&tx, run_id, concept, iteration)?;
        }
        tx.commit()
            .with_context(|| format!("failed to commit results for {concept}"))?;
        Ok(())
    }

    pub fn summary(&self) -> Result<StoreSummary> {
        let runs = query_count(&self.connection, "SELECT COUNT(*) FROM runs", [])?;
        let latest = self
            .connection
            .query_row(
                "SELECT run_id, status, started_at, finished_at, model, evidence_mode, usage_json
                 FROM runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                [],
                |row| {
                    Ok(RunSummary {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        started_at: row.get(2)?,
                        finished_at: row.get(3)?,
                        model: row.get(4)?,
                        evidence_mode: row.get(5)?,
                        usage_json: row.get(6)?,
                    })
                },
            )
            .optional()
            .context("failed to read latest run")?;

        let Some(run) = latest else {
            return Ok(StoreSummary::default());
        };
        let run_id = run.run_id.as_str();
        Ok(StoreSummary {
            runs,
            completed: query_count(
                &self.connection,
                "SELECT COUNT(*) FROM concept_results WHERE run_id = ?1 AND status = 'completed'",
                [run_id],
            )?,
            failed: query_count(
                &self.connection,
                "SELECT COUNT(*) FROM concept_results WHERE run_id = ?1 AND status = 'failed'",
                [run_id],
            )?,
            budget_exhausted: query_count(
                &self.connection,
                "SELECT COUNT(*) FROM concept_results WHERE run_id = ?1 AND budget_exhausted = 1",
                [run_id],
            )?,
            estimation_runs: query_count(
                &self.connection,
                "SELECT COUNT(*) FROM estimation_runs WHERE run_id = ?1",
                [run_id],
            )?,
            latest: Some(run),
        })
    }
}

fn configure_connection(connection: &Connection) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    Ok(())
}

fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
        CREATE TABLE IF NOT EXISTS runs (
          run_id TEXT PRIMARY KEY,
          status TEXT NOT NULL,
          started_at TEXT NOT NULL,
          finished_at TEXT,
          model TEXT NOT NULL,
          evidence_mode TEXT NOT NULL,
          counts_json TEXT,
          usage_json TEXT
        );

        CREATE TABLE IF NOT EXISTS concept_results (
          run_id TEXT NOT NULL,
          concept TEXT NOT NULL,
          segment TEXT,
          status TEXT NOT NULL,
          strongly_agree REAL,
          slightly_agree REAL,
          neither_agree_nor_disagree REAL,
          slightly_disagree REAL,
          strongly_disagree REAL,
          iterations INTEGER NOT NULL,
          runs_per_iteration INTEGER NOT NULL,
          estimator_confidence REAL,
          critic_confidence REAL,
          needs_revision INTEGER,
          budget_exhausted INTEGER NOT NULL DEFAULT 0,
          proximal_topline REAL,
          concept_type TEXT NOT NULL,
          selection_notes TEXT,
          rationale TEXT,
          critic_feedback TEXT,
          failure_stage TEXT,
          failure_reason TEXT,
          PRIMARY KEY (run_id, concept),
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE TABLE IF NOT EXISTS estimation_runs (
          run_id TEXT NOT NULL,
          concept TEXT NOT NULL,
          iteration INTEGER NOT NULL,
          run_index INTEGER NOT NULL,
          strongly_agree REAL NOT NULL,
          slightly_agree REAL NOT NULL,
          neither_agree_nor_disagree REAL NOT NULL,
          slightly_disagree REAL NOT NULL,
          strongly_disagree REAL NOT NULL,
          confidence REAL NOT NULL,
          rationale TEXT,
          PRIMARY KEY (run_id, concept, iteration, run_index),
          FOREIGN KEY(run_id) REFERENCES runs(run_id)
        );

        CREATE INDEX IF NOT EXISTS idx_concept_results_status
          ON concept_results(run_id, status);
        ",
        )
        .context("failed to create results schema")?;
    Ok(())
}

fn label_values(distribution: Option<&Distribution>) -> [Option<f64>; 5] {
    LikertLabel::ALL.map(|label| distribution.map(|value| value.get(label)))
}

fn insert_concept_result(
    tx: &Transaction<'_>,
    run_id: &str,
    record: &ConceptRecord,
    runs_per_iteration: usize,
) -> Result<()> {
    let concept = record.concept();
    let sql = "INSERT OR REPLACE INTO concept_results (
          run_id, concept, segment, status,
          strongly_agree, slightly_agree, neither_agree_nor_disagree, slightly_disagree, strongly_disagree,
          iterations, runs_per_iteration, estimator_confidence, critic_confidence, needs_revision,
          budget_exhausted, proximal_topline, concept_type, selection_notes, rationale,
          critic_feedback, failure_stage, failure_reason
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
          ?19, ?20, ?21, ?22)";

    let inserted = match record {
        ConceptRecord::Completed(outcome) => {
            let [sa, a, n, sd, sdd] = label_values(Some(&outcome.final_result.aggregated_distribution));
            tx.execute(
                sql,
                params![
                    run_id,
                    concept.text,
                    concept.segment,
                    "completed",
                    sa,
                    a,
                    n,
                    sd,
                    sdd,
                    outcome.iterations as i64,
                    runs_per_iteration as i64,
                    outcome.final_result.avg_confidence,
                    outcome.final_assessment.confidence,
                    outcome.final_assessment.needs_revision,
                    outcome.budget_exhausted,
                    outcome.bundle.proximal_topline,
                    outcome.bundle.concept_type.as_str(),
                    outcome.bundle.selection_notes,
                    outcome.rationale(),
                    outcome.final_assessment.feedback,
                    Option::<&str>::None,
                    Option::<&str>::None,
                ],
            )
        }
        ConceptRecord::Failed(failure) => {
            let last = failure.history.last().map(|iteration| &iteration.result);
            let [sa, a, n, sd, sdd] = label_values(last.map(|result| &result.aggregated_distribution));
            tx.execute(
                sql,
                params![
                    run_id,
                    concept.text,
                    concept.segment,
                    "failed",
                    sa,
                    a,
                    n,
                    sd,
                    sdd,
                    failure.iterations_completed as i64,
                    runs_per_iteration as i64,
                    last.map(|result| result.avg_confidence),
                    Option::<f64>::None,
                    Option::<bool>::None,
                    false,
                    failure.bundle.proximal_topline,
                    failure.bundle.concept_type.as_str(),
                    failure.bundle.selection_notes,
                    last.map(|result| result.joined_rationale()),
                    Option::<&str>::None,
                    failure.stage.as_str(),
                    failure.reason,
                ],
            )
        }
    };
    inserted.with_context(|| format!("failed to insert result for {}", concept.text))?;
    Ok(())
}

fn insert_estimation_runs(
    tx: &Transaction<'_>,
    run_id: &str,
    concept: &str,
    iteration: &IterationRecord,
) -> Result<()> {
    let mut statement = tx
        .prepare_cached(
            "INSERT OR REPLACE INTO estimation_runs (
              run_id, concept, iteration, run_index,
              strongly_agree, slightly_agree, neither_agree_nor_disagree, slightly_disagree,
              strongly_disagree, confidence, rationale
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .context("failed to prepare estimation run insert")?;
    for run in &iteration.result.runs {
        let [sa, a, n, sd, sdd] = run.distribution.values();
        statement
            .execute(params![
                run_id,
                concept,
                iteration.result.iteration as i64,
                run.run_index as i64,
                sa,
                a,
                n,
                sd,
                sdd,
                run.confidence,
                run.rationale,
            ])
            .with_context(|| {
                format!(
                    "failed to insert run {} of iteration {} for {concept}",
                    run.run_index, iteration.result.iteration
                )
            })?;
    }
    Ok(())
}

fn query_count<P: rusqlite::Params>(connection: &Connection, sql: &str, params: P) -> Result<i64> {
    let count = connection
        .query_row(sql, params, |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    Ok(count)
}

#[cfg(test)]
mod tests;
