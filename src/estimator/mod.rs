//! Monte-Carlo distribution estimator.

use std::sync::Arc;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capability::{
    Capability, CapabilityError, CapabilityRequest, JsonResponse, ResponseSchema, SamplingParams,
    Stage, UsageLedger, invoke_json,
};
use crate::likert::{LikertFields, LikertLabel, mean_distribution, normalise_distribution};
use crate::model::{Concept, EstimationResult, EstimationRun, EvidenceBundle, RunFailure};

mod adjust;
mod prompts;

pub use adjust::{DistributionAdjuster, ToplineRule, ToplineRules};
pub use prompts::SystemPrompts;

use prompts::{build_estimator_prompt, run_prompt};

#[derive(Debug, Error)]
pub enum EstimationError {
    #[error("all {attempted} estimation runs failed; last error: {}", last_error(.failures))]
    NoSuccessfulRuns {
        attempted: usize,
        failures: Vec<RunFailure>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EstimateResponse {
    distribution: LikertFields,
    confidence: f64,
    #[serde(default)]
    rationale: String,
}

impl JsonResponse for EstimateResponse {
    fn validate(&self) -> Result<(), String> {
        if self.confidence.is_finite() {
            Ok(())
        } else {
            Err("confidence is not a finite number".to_string())
        }
    }
}

fn estimate_schema() -> ResponseSchema {
    let mut labels = serde_json::Map::new();
    for label in LikertLabel::ALL {
        labels.insert(label.key().to_string(), json!({"type": "number", "minimum": 0}));
    }
    let required = LikertLabel::ALL.map(LikertLabel::key);
    ResponseSchema {
        name: "likert_estimate".to_string(),
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "distribution": {
                    "type": "object",
                    "additionalProperties": false,
                    "properties": labels,
                    "required": required,
                },
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "rationale": {"type": "string"},
            },
            "required": ["distribution", "confidence", "rationale"],
        }),
    }
}

pub struct DistributionEstimator {
    runs: usize,
    sampling: SamplingParams,
    prompts: SystemPrompts,
    adjuster: Option<Arc<dyn DistributionAdjuster>>,
}

impl DistributionEstimator {
    pub fn new(runs: usize, sampling: SamplingParams, prompts: SystemPrompts) -> Self {
        Self {
            runs: runs.max(1),
            sampling,
            prompts,
            adjuster: None,
        }
    }

    pub fn with_adjuster(mut self, adjuster: Arc<dyn DistributionAdjuster>) -> Self {
        self.adjuster = Some(adjuster);
        self
    }

    pub fn runs(&self) -> usize {
        self.runs
    }

    /// Issues the configured number of independent draws concurrently and aggregates the
    /// successful ones. Failed draws are reported in `failed_runs`; if none succeed the
    /// iteration fails.
    pub async fn estimate<C: Capability + ?Sized>(
        &self,
        concept: &Concept,
        bundle: &EvidenceBundle,
        feedback: &str,
        iteration: usize,
        capability: &C,
        ledger: &mut UsageLedger,
    ) -> Result<EstimationResult, EstimationError> {
        let system_prompt = self.prompts.for_segment(bundle.segment.as_deref());
        let base_prompt = build_estimator_prompt(concept, bundle, feedback);
        let schema = estimate_schema();

        let draws = (1..=self.runs).map(|run_index| {
            let request = CapabilityRequest {
                stage: Stage::Estimation,
                system_prompt: system_prompt.clone(),
                user_prompt: run_prompt(&base_prompt, run_index),
                response_schema: Some(schema.clone()),
                sampling: self.sampling.clone(),
            };
            async move {
                let mut run_ledger = UsageLedger::default();
                let outcome =
                    invoke_json::<EstimateResponse, C>(capability, &request, &mut run_ledger).await;
                (run_index, outcome, run_ledger)
            }
        });

        let mut runs = Vec::new();
        let mut failed_runs = Vec::new();
        for (run_index, outcome, run_ledger) in join_all(draws).await {
            ledger.merge(&run_ledger);
            match outcome {
                Ok(response) => runs.push(to_run(run_index, response)),
                Err(err) => {
                    warn!(
                        concept = %concept.text,
                        iteration,
                        run_index,
                        error = %err,
                        "estimation run failed"
                    );
                    failed_runs.push(failure(run_index, &err));
                }
            }
        }

        let distributions = runs.iter().map(|run| run.distribution).collect::<Vec<_>>();
        let Some(aggregate) = mean_distribution(&distributions) else {
            return Err(EstimationError::NoSuccessfulRuns {
                attempted: self.runs,
                failures: failed_runs,
            });
        };
        let avg_confidence = runs.iter().map(|run| run.confidence).sum::<f64>() / runs.len() as f64;

        let adjusted = self
            .adjuster
            .as_ref()
            .and_then(|adjuster| adjuster.adjust(concept, &aggregate))
            .filter(|adjusted| *adjusted != aggregate);
        let (aggregated_distribution, pre_adjustment) = match adjusted {
            Some(adjusted) => {
                debug!(
                    concept = %concept.text,
                    before = aggregate.topline(),
                    after = adjusted.topline(),
                    "aggregate adjusted"
                );
                (adjusted, Some(aggregate))
            }
            None => (aggregate, None),
        };

        info!(
            concept = %concept.text,
            iteration,
            runs_ok = runs.len(),
            runs_failed = failed_runs.len(),
            topline = aggregated_distribution.topline(),
            avg_confidence,
            "estimation complete"
        );

        Ok(EstimationResult {
            runs,
            aggregated_distribution,
            avg_confidence,
            iteration,
            failed_runs,
            pre_adjustment,
        })
    }
}

fn last_error(failures: &[RunFailure]) -> &str {
    failures
        .last()
        .map(|failure| failure.error.as_str())
        .unwrap_or("none recorded")
}

fn to_run(run_index: usize, response: EstimateResponse) -> EstimationRun {
    EstimationRun {
        run_index,
        distribution: normalise_distribution(response.distribution.to_array()),
        confidence: response.confidence.clamp(0.0, 1.0),
        rationale: response.rationale.trim().to_string(),
    }
}

fn failure(run_index: usize, err: &CapabilityError) -> RunFailure {
    RunFailure {
        run_index,
        error: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
