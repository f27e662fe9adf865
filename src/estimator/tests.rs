use std::fs;

use serde_json::json;
use tempfile::TempDir;

use super::*;
use crate::capability::mock::ScriptedCapability;
use crate::likert::Distribution;
use crate::model::{ConceptType, SourceType};

fn reply(values: [f64; 5], confidence: f64, rationale: &str) -> Result<String, CapabilityError> {
    Ok(json!({
        "distribution": {
            "strongly_agree": values[0],
            "slightly_agree": values[1],
            "neither_agree_nor_disagree": values[2],
            "slightly_disagree": values[3],
            "strongly_disagree": values[4],
        },
        "confidence": confidence,
        "rationale": rationale,
    })
    .to_string())
}

fn bundle() -> EvidenceBundle {
    EvidenceBundle {
        quant_summary: "Save | Regularly | value=0.6200 [PROXIMAL] (file=survey.jsonl, relevance=0.98)"
            .to_string(),
        textual_summary: "Most members save for a house deposit. (file=members.txt, relevance=0.83)"
            .to_string(),
        weight_hints: vec!["Save -> Regularly (value=0.62)".to_string()],
        selection_notes: "Balanced selection used.".to_string(),
        top_sources: Vec::new(),
        types_present: vec![SourceType::Quant, SourceType::Qual],
        proximal_topline: Some(0.62),
        concept_type: ConceptType::BehaviorLowFriction,
        segment: Some("Finance".to_string()),
    }
}

fn concept() -> Concept {
    Concept::parse("Finance: I save regularly")
}

fn estimator(runs: usize) -> DistributionEstimator {
    DistributionEstimator::new(runs, SamplingParams::default(), SystemPrompts::default())
}

#[tokio::test]
async fn aggregates_runs_into_exact_hundred() {
    let capability = ScriptedCapability::new()
        .push(Stage::Estimation, reply([30.0, 30.0, 20.0, 10.0, 10.0], 0.6, "first"))
        .push(Stage::Estimation, reply([20.0, 40.0, 20.0, 10.0, 10.0], 0.7, "second"))
        .push(Stage::Estimation, reply([25.0, 35.0, 15.0, 15.0, 10.0], 0.8, "third"));
    let mut ledger = UsageLedger::default();

    let result = estimator(3)
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect("estimate");

    assert_eq!(result.runs.len(), 3);
    assert!(result.failed_runs.is_empty());
    assert_eq!(
        result.aggregated_distribution.values(),
        [25.0, 35.0, 18.33, 11.67, 10.0]
    );
    assert_eq!(result.aggregated_distribution.total(), 100.0);
    assert_eq!(result.aggregated_distribution.topline(), 60.0);
    assert!((result.avg_confidence - 0.7).abs() < 1e-9);
    assert_eq!(result.iteration, 1);
    assert_eq!(result.pre_adjustment, None);
    assert_eq!(ledger.stage(Stage::Estimation).calls, 3);
    assert_eq!(ledger.stage(Stage::Estimation).total_tokens, 45);
}

#[tokio::test]
async fn partial_failure_averages_survivors() {
    let capability = ScriptedCapability::new()
        .push(Stage::Estimation, reply([40.0, 20.0, 20.0, 10.0, 10.0], 0.9, "kept"))
        .push(Stage::Estimation, Err(CapabilityError::Auth("bad key".to_string())))
        .push(Stage::Estimation, reply([20.0, 20.0, 20.0, 20.0, 20.0], 0.5, "kept too"));
    let mut ledger = UsageLedger::default();

    let result = estimator(3)
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect("estimate");

    assert_eq!(result.runs.len(), 2);
    assert_eq!(result.failed_runs.len(), 1);
    assert!(result.failed_runs[0].error.contains("bad key"));
    assert_eq!(
        result.aggregated_distribution.values(),
        [30.0, 20.0, 20.0, 15.0, 15.0]
    );
    assert!((result.avg_confidence - 0.7).abs() < 1e-9);
    assert_eq!(result.joined_rationale(), "kept\n---\nkept too");
}

#[tokio::test]
async fn misspelled_label_is_rejected_instead_of_read_as_zero() {
    let misspelled = json!({
        "distribution": {
            "strongly_agre": 40.0,
            "slightly_agree": 30.0,
            "neither_agree_nor_disagree": 10.0,
            "slightly_disagree": 10.0,
            "strongly_disagree": 10.0,
        },
        "confidence": 0.8,
        "rationale": "typo",
    })
    .to_string();
    let capability = ScriptedCapability::new().always(Stage::Estimation, Ok(misspelled));
    let mut ledger = UsageLedger::default();

    let err = estimator(1)
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect_err("typo never parses");

    let EstimationError::NoSuccessfulRuns { failures, .. } = err;
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.contains("strongly_agre"), "{}", failures[0].error);
    assert_eq!(capability.calls(), 2);
}

#[tokio::test]
async fn all_runs_failing_is_an_error() {
    let capability = ScriptedCapability::new().always(
        Stage::Estimation,
        Err(CapabilityError::BadRequest("context too long".to_string())),
    );
    let mut ledger = UsageLedger::default();

    let err = estimator(2)
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect_err("no runs succeed");

    let EstimationError::NoSuccessfulRuns { attempted, failures } = err;
    assert_eq!(attempted, 2);
    assert_eq!(failures.len(), 2);
    assert_eq!(
        failures.iter().map(|failure| failure.run_index).collect::<Vec<_>>(),
        vec![1, 2]
    );
}

#[tokio::test]
async fn malformed_values_fall_back_to_equal_split() {
    let capability = ScriptedCapability::new().push(
        Stage::Estimation,
        reply([-5.0, 0.0, 0.0, 0.0, 0.0], 1.7, "nothing usable"),
    );
    let mut ledger = UsageLedger::default();

    let result = estimator(1)
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect("estimate");

    assert_eq!(result.aggregated_distribution, Distribution::equal_split());
    assert_eq!(result.avg_confidence, 1.0);
}

#[tokio::test]
async fn prompt_carries_feedback_and_run_number() {
    let capability = ScriptedCapability::new().always(
        Stage::Estimation,
        reply([20.0, 20.0, 20.0, 20.0, 20.0], 0.5, "flat"),
    );
    let mut ledger = UsageLedger::default();

    estimator(2)
        .estimate(
            &concept(),
            &bundle(),
            "Raise the neutral share.",
            2,
            &capability,
            &mut ledger,
        )
        .await
        .expect("estimate");

    let requests = capability.requests();
    assert_eq!(requests.len(), 2);
    let prompts = requests
        .iter()
        .map(|request| request.user_prompt.as_str())
        .collect::<Vec<&str>>();
    assert!(prompts.iter().any(|prompt| prompt.ends_with("Run number: 1")));
    assert!(prompts.iter().any(|prompt| prompt.ends_with("Run number: 2")));
    for prompt in prompts {
        assert!(prompt.contains("Critic feedback to address:\nRaise the neutral share."));
        assert!(prompt.contains("Proximal topline for exact concept: 0.6200"));
        assert!(prompt.contains("Segment: Finance"));
        assert!(prompt.contains("Item type:\nbehavior_low_friction"));
    }
    let schema = requests[0].response_schema.as_ref().expect("schema");
    assert_eq!(schema.name, "likert_estimate");
}

#[tokio::test]
async fn first_pass_prompt_omits_feedback_section() {
    let capability = ScriptedCapability::new().always(
        Stage::Estimation,
        reply([20.0, 20.0, 20.0, 20.0, 20.0], 0.5, "flat"),
    );
    let mut ledger = UsageLedger::default();

    estimator(1)
        .estimate(&concept(), &bundle(), "  ", 1, &capability, &mut ledger)
        .await
        .expect("estimate");

    let prompt = &capability.requests()[0].user_prompt;
    assert!(!prompt.contains("Critic feedback"));
    assert!(prompt.contains("Evidence selection rationale: Balanced selection used."));
}

#[tokio::test]
async fn adjuster_rescales_topline_and_keeps_original() {
    let rules = ToplineRules::new(vec![ToplineRule {
        segment: Some("finance".to_string()),
        keywords: vec!["save".to_string()],
        target_topline: 50.0,
    }])
    .expect("rules");
    let capability = ScriptedCapability::new().always(
        Stage::Estimation,
        reply([30.0, 30.0, 20.0, 10.0, 10.0], 0.5, "anchored"),
    );
    let mut ledger = UsageLedger::default();

    let result = estimator(1)
        .with_adjuster(Arc::new(rules))
        .estimate(&concept(), &bundle(), "", 1, &capability, &mut ledger)
        .await
        .expect("estimate");

    assert_eq!(
        result.aggregated_distribution.values(),
        [25.0, 25.0, 25.0, 12.5, 12.5]
    );
    let before = result.pre_adjustment.expect("pre adjustment");
    assert_eq!(before.topline(), 60.0);
}

#[test]
fn adjustment_rules_require_other_segment_to_match() {
    let rules = ToplineRules::new(vec![ToplineRule {
        segment: Some("Health".to_string()),
        keywords: vec!["save".to_string()],
        target_topline: 50.0,
    }])
    .expect("rules");
    let distribution = Distribution::equal_split();

    assert_eq!(rules.adjust(&concept(), &distribution), None);
    assert_eq!(rules.len(), 1);
}

#[test]
fn adjustment_rules_reject_out_of_range_targets() {
    let err = ToplineRules::new(vec![ToplineRule {
        segment: None,
        keywords: vec!["save".to_string()],
        target_topline: 140.0,
    }])
    .expect_err("invalid target");
    assert!(err.to_string().contains("outside 0..=100"));

    let err = ToplineRules::new(vec![ToplineRule {
        segment: None,
        keywords: vec![" ".to_string()],
        target_topline: 40.0,
    }])
    .expect_err("missing keywords");
    assert!(err.to_string().contains("no keywords"));
}

#[test]
fn adjustment_rules_load_from_json() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("adjustments.json");
    fs::write(
        &path,
        r#"[{"segment": null, "keywords": ["save", "regularly"], "target_topline": 55.0}]"#,
    )
    .expect("write rules");

    let rules = ToplineRules::from_path(&path).expect("load rules");
    let adjusted = rules
        .adjust(&concept(), &Distribution::equal_split())
        .expect("rule matches");
    assert_eq!(adjusted.topline(), 55.0);
    assert_eq!(adjusted.total(), 100.0);
}

#[test]
fn segment_guidance_is_appended_by_slug() {
    let dir = TempDir::new().expect("tempdir");
    let prompt_path = dir.path().join("system.txt");
    fs::write(&prompt_path, "Base prompt.\n").expect("write prompt");
    let guidance_dir = dir.path().join("guidance");
    fs::create_dir(&guidance_dir).expect("guidance dir");
    fs::write(guidance_dir.join("Young Savers.txt"), "Lean cautious.").expect("write guidance");
    fs::write(guidance_dir.join("notes.md"), "ignored").expect("write notes");

    let prompts = SystemPrompts::load(Some(&prompt_path), Some(&guidance_dir)).expect("load");

    assert_eq!(
        prompts.for_segment(Some("young savers")),
        "Base prompt.\n\n---\n\nSEGMENT-SPECIFIC GUIDANCE:\n\nLean cautious."
    );
    assert_eq!(prompts.for_segment(Some("Finance")), "Base prompt.");
    assert_eq!(prompts.for_segment(None), "Base prompt.");
}

#[test]
fn empty_system_prompt_file_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let prompt_path = dir.path().join("system.txt");
    fs::write(&prompt_path, "   \n").expect("write prompt");

    assert!(SystemPrompts::load(Some(&prompt_path), None).is_err());
}
