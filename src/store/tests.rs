use tempfile::TempDir;

use super::*;
use crate::capability::Stage;
use crate::likert::largest_remainder_round;
use crate::model::{
    Concept, ConceptType, CriticAssessment, EstimationResult, EstimationRun, EvidenceBundle,
};
use crate::orchestrator::{ConceptFailure, ConceptOutcome};

fn bundle() -> EvidenceBundle {
    EvidenceBundle {
        quant_summary: String::new(),
        textual_summary: String::new(),
        weight_hints: Vec::new(),
        selection_notes: "Balanced selection used.".to_string(),
        top_sources: Vec::new(),
        types_present: Vec::new(),
        proximal_topline: Some(0.62),
        concept_type: ConceptType::BehaviorLowFriction,
        segment: Some("Finance".to_string()),
    }
}

fn result(iteration: usize) -> EstimationResult {
    let runs = (1..=2)
        .map(|run_index| EstimationRun {
            run_index,
            distribution: largest_remainder_round([30.0, 30.0, 20.0, 10.0, 10.0]),
            confidence: 0.6,
            rationale: format!("run {run_index}"),
        })
        .collect::<Vec<EstimationRun>>();
    EstimationResult {
        aggregated_distribution: runs[0].distribution,
        runs,
        avg_confidence: 0.6,
        iteration,
        failed_runs: Vec::new(),
        pre_adjustment: None,
    }
}

fn assessment(needs_revision: bool) -> CriticAssessment {
    CriticAssessment {
        needs_revision,
        confidence: 0.4,
        feedback: "Lower the agree share.".to_string(),
    }
}

fn completed(text: &str, iterations: usize) -> ConceptRecord {
    let history = (1..=iterations)
        .map(|iteration| IterationRecord {
            result: result(iteration),
            assessment: Some(assessment(true)),
        })
        .collect::<Vec<IterationRecord>>();
    ConceptRecord::Completed(ConceptOutcome {
        concept: Concept::parse(text),
        bundle: bundle(),
        iterations,
        final_result: result(iterations),
        final_assessment: assessment(true),
        budget_exhausted: true,
        history,
        usage: UsageLedger::default(),
    })
}

fn failed(text: &str) -> ConceptRecord {
    ConceptRecord::Failed(ConceptFailure {
        concept: Concept::parse(text),
        stage: Stage::Estimation,
        reason: "estimation failed at iteration 1: all 2 estimation runs failed".to_string(),
        iterations_completed: 0,
        bundle: bundle(),
        history: Vec::new(),
        usage: UsageLedger::default(),
    })
}

#[test]
fn records_concepts_and_summarises_latest_run() {
    let mut store = ResultStore::open_in_memory().expect("store");
    store
        .begin_run("run-1", "2026-01-01T00:00:00Z", "gpt-4.1", "leave-one-out")
        .expect("begin");
    store
        .record_concept("run-1", &completed("Finance: I save regularly", 2), 2)
        .expect("completed concept");
    store
        .record_concept("run-1", &failed("Finance: I budget monthly"), 2)
        .expect("failed concept");
    let counts = EstimateCounts {
        concepts: 2,
        completed: 1,
        failed: 1,
        budget_exhausted: 1,
        ..EstimateCounts::default()
    };
    store
        .finish_run(
            "run-1",
            "completed",
            "2026-01-01T00:05:00Z",
            &counts,
            &UsageLedger::default(),
        )
        .expect("finish");

    let summary = store.summary().expect("summary");
    assert_eq!(summary.runs, 1);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.budget_exhausted, 1);
    assert_eq!(summary.estimation_runs, 4);
    let latest = summary.latest.expect("latest run");
    assert_eq!(latest.status, "completed");
    assert_eq!(latest.finished_at.as_deref(), Some("2026-01-01T00:05:00Z"));
}

#[test]
fn completed_row_carries_distribution_and_feedback() {
    let mut store = ResultStore::open_in_memory().expect("store");
    store
        .begin_run("run-1", "2026-01-01T00:00:00Z", "gpt-4.1", "full")
        .expect("begin");
    store
        .record_concept("run-1", &completed("Finance: I save regularly", 1), 2)
        .expect("record");

    let (topline, rationale, feedback, segment): (f64, String, String, Option<String>) = store
        .connection
        .query_row(
            "SELECT strongly_agree + slightly_agree, rationale, critic_feedback, segment
             FROM concept_results WHERE concept = ?1",
            ["Finance: I save regularly"],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .expect("row");
    assert_eq!(topline, 60.0);
    assert_eq!(rationale, "run 1\n---\nrun 2");
    assert_eq!(feedback, "Lower the agree share.");
    assert_eq!(segment.as_deref(), Some("Finance"));
}

#[test]
fn failed_row_keeps_stage_and_reason() {
    let mut store = ResultStore::open_in_memory().expect("store");
    store
        .begin_run("run-1", "2026-01-01T00:00:00Z", "gpt-4.1", "full")
        .expect("begin");
    store
        .record_concept("run-1", &failed("I budget monthly"), 3)
        .expect("record");

    let (stage, reason, strongly_agree): (String, String, Option<f64>) = store
        .connection
        .query_row(
            "SELECT failure_stage, failure_reason, strongly_agree FROM concept_results",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("row");
    assert_eq!(stage, "estimation");
    assert!(reason.contains("all 2 estimation runs failed"));
    assert_eq!(strongly_agree, None);
}

#[test]
fn schema_creation_is_idempotent_on_disk() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("nested").join("results.sqlite");

    let store = ResultStore::open(&path).expect("first open");
    store
        .begin_run("run-1", "2026-01-01T00:00:00Z", "gpt-4.1", "full")
        .expect("begin");
    drop(store);

    let reopened = ResultStore::open(&path).expect("second open");
    assert_eq!(reopened.summary().expect("summary").runs, 1);
}

#[test]
fn empty_store_summary_has_no_latest_run() {
    let store = ResultStore::open_in_memory().expect("store");
    assert_eq!(store.summary().expect("summary"), StoreSummary::default());
}

#[test]
fn runs_started_in_the_same_second_keep_separate_rows() {
    let ts = chrono::DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .expect("timestamp")
        .with_timezone(&chrono::Utc);
    let first = crate::util::new_run_id(ts);
    let second = crate::util::new_run_id(ts);
    let mut store = ResultStore::open_in_memory().expect("store");

    store
        .begin_run(&first, "2026-01-01T00:00:00Z", "gpt-4.1", "full")
        .expect("first run");
    store
        .begin_run(&second, "2026-01-01T00:00:00Z", "gpt-4.1", "full")
        .expect("second run in the same second");
    store
        .record_concept(&second, &completed("Finance: I save regularly", 1), 2)
        .expect("concept kept before the abort");
    store
        .finish_run(
            &second,
            "failed",
            "2026-01-01T00:00:09Z",
            &EstimateCounts::default(),
            &UsageLedger::default(),
        )
        .expect("mark failed");

    let summary = store.summary().expect("summary");
    assert_eq!(summary.runs, 2);
    assert_eq!(summary.completed, 1);
    let latest = summary.latest.expect("latest run");
    assert_eq!(latest.run_id, second);
    assert_eq!(latest.status, "failed");
}
