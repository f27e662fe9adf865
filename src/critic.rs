use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::capability::{
    Capability, CapabilityError, CapabilityRequest, JsonResponse, ResponseSchema, SamplingParams,
    Stage, UsageLedger, invoke_json,
};
use crate::model::{Concept, CriticAssessment, EstimationResult, EvidenceBundle};

pub const CRITIC_SYSTEM_PROMPT: &str = "You are a methodological critic ensuring simulated survey predictions are grounded in the provided evidence.";

#[derive(Debug, Error)]
#[error("critic call failed")]
pub struct CriticError(#[from] pub CapabilityError);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CriticResponse {
    needs_revision: bool,
    confidence: f64,
    feedback: String,
}

impl JsonResponse for CriticResponse {
    fn validate(&self) -> Result<(), String> {
        if self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence) {
            Ok(())
        } else {
            Err(format!("confidence {} outside [0, 1]", self.confidence))
        }
    }
}

fn critic_schema() -> ResponseSchema {
    ResponseSchema {
        name: "critic_assessment".to_string(),
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "needs_revision": {"type": "boolean"},
                "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                "feedback": {"type": "string"},
            },
            "required": ["needs_revision", "confidence", "feedback"],
        }),
    }
}

/// Judges one aggregated estimate against its evidence. Never alters the estimate.
#[derive(Debug, Clone)]
pub struct Critic {
    sampling: SamplingParams,
}

impl Critic {
    pub fn new(sampling: SamplingParams) -> Self {
        Self { sampling }
    }

    pub async fn assess<C: Capability + ?Sized>(
        &self,
        concept: &Concept,
        bundle: &EvidenceBundle,
        result: &EstimationResult,
        capability: &C,
        ledger: &mut UsageLedger,
    ) -> Result<CriticAssessment, CriticError> {
        let request = CapabilityRequest {
            stage: Stage::Critique,
            system_prompt: CRITIC_SYSTEM_PROMPT.to_string(),
            user_prompt: build_critic_prompt(concept, bundle, result),
            response_schema: Some(critic_schema()),
            sampling: self.sampling.clone(),
        };
        let response = invoke_json::<CriticResponse, C>(capability, &request, ledger).await?;

        let assessment = CriticAssessment {
            needs_revision: response.needs_revision,
            confidence: response.confidence,
            feedback: response.feedback.trim().to_string(),
        };
        info!(
            concept = %concept.text,
            iteration = result.iteration,
            needs_revision = assessment.needs_revision,
            confidence = assessment.confidence,
            "critique complete"
        );
        Ok(assessment)
    }
}

pub fn build_critic_prompt(
    concept: &Concept,
    bundle: &EvidenceBundle,
    result: &EstimationResult,
) -> String {
    let run_block = if result.runs.is_empty() {
        "No run details.".to_string()
    } else {
        result
            .runs
            .iter()
            .map(|run| {
                format!(
                    "Run {}: {}\nRationale: {}",
                    run.run_index,
                    run.distribution.format_inline(),
                    run.rationale
                )
            })
            .collect::<Vec<String>>()
            .join("\n\n")
    };

    let mut prompt = format!(
        "Quantitative toplines:\n{}\n\n\
         Qualitative notes:\n{}\n\n\
         Latest estimate for concept \"{}\" (iteration {}):\n{}\n\n\
         Run-level detail:\n{run_block}\n",
        bundle.quant_summary,
        bundle.textual_summary,
        concept.text,
        result.iteration,
        result.aggregated_distribution.format_lines(),
    );
    let notes = bundle.selection_notes.trim();
    if !notes.is_empty() {
        prompt.push_str(&format!("\nEvidence selection rationale: {notes}\n"));
    }
    prompt.push_str(
        "\nEvaluate whether the estimate is sufficiently justified. If not, specify corrective feedback.",
    );
    prompt
}
