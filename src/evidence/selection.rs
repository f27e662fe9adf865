use std::collections::HashSet;
use std::sync::LazyLock;

use jsonschema::Validator;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::candidates::CandidatePools;
use super::scoring::entry_relevance;
use super::{MAX_SELECTION_ATTEMPTS, TOP_K};
use crate::capability::{
    Capability, CapabilityError, CapabilityRequest, JsonResponse, ResponseSchema, SamplingParams,
    Stage, UsageLedger, invoke_json, schema_violations,
};
use crate::model::{Candidate, Concept, EvidenceSource, SourceType};
use crate::util::truncate_words;

const MAX_CHOSEN_SOURCES: usize = 4;
const MAX_RESPONSE_HINTS: usize = 5;
const WEIGHT_HINT_WORDS: usize = 16;

pub const SELECTION_SYSTEM_PROMPT: &str = "You select survey evidence for a single statement.
You receive pre-filtered quantitative rows and qualitative excerpts, each tagged with its match tier.
Choose the smallest set that directly supports estimating agreement with the statement.
Prefer exact matches over behavior matches and behavior matches over proxies.
Include at least one quantitative and one qualitative item when both kinds are offered.
Copy files, questions, options, values and excerpts verbatim from the candidates. Never invent evidence.
Respond with a JSON object matching the provided schema and nothing else.";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionResponse {
    #[serde(default)]
    pub question: Option<String>,
    pub top_sources: Vec<ChosenSource>,
    #[serde(default)]
    pub weight_hints: Option<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChosenSource {
    pub source_type: SourceType,
    pub file: String,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub option: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub excerpt: Option<String>,
    pub relevance: f64,
    #[serde(default)]
    pub weight_hint: Option<String>,
}

static SELECTION_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    jsonschema::validator_for(&selection_schema().schema).map_err(|err| err.to_string())
});

impl JsonResponse for SelectionResponse {
    fn check_schema(raw: &Value) -> Result<(), String> {
        match SELECTION_VALIDATOR.as_ref() {
            Ok(validator) => schema_violations(validator, raw),
            Err(err) => Err(format!("selection schema does not compile: {err}")),
        }
    }
}

pub fn selection_schema() -> ResponseSchema {
    let nullable_string = json!({"type": ["string", "null"]});
    ResponseSchema {
        name: "evidence_selection".to_string(),
        schema: json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "question": nullable_string,
                "top_sources": {
                    "type": "array",
                    "maxItems": MAX_CHOSEN_SOURCES,
                    "items": {
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "source_type": {"type": "string", "enum": ["quant", "qual"]},
                            "file": {"type": "string"},
                            "question": nullable_string,
                            "option": nullable_string,
                            "value": {"type": ["number", "null"]},
                            "excerpt": nullable_string,
                            "relevance": {"type": "number", "minimum": 0, "maximum": 1},
                            "weight_hint": nullable_string,
                        },
                        "required": [
                            "source_type", "file", "question", "option",
                            "value", "excerpt", "relevance", "weight_hint"
                        ],
                    },
                },
                "weight_hints": {
                    "type": ["array", "null"],
                    "items": {"type": "string"},
                    "maxItems": MAX_RESPONSE_HINTS,
                },
                "notes": nullable_string,
            },
            "required": ["question", "top_sources", "weight_hints", "notes"],
        }),
    }
}

pub fn build_selection_prompt(concept: &Concept, pools: &CandidatePools) -> String {
    format!(
        "Concept:\n{}\n\nQuantitative candidates (pre-filtered, tier-aligned):\n{}\n\n\
         Qualitative candidates (pre-filtered, tier-aligned):\n{}\n\n\
         Select up to 3 evidence items. Keep balance: include at least one quantitative and one \
         qualitative item when both candidate types exist. Prefer exact matches over behavior or \
         proxy evidence.",
        concept.text,
        format_prompt_candidates(pools.prompt_quant()),
        format_prompt_candidates(pools.prompt_qual()),
    )
}

fn format_prompt_candidates(candidates: &[Candidate]) -> String {
    if candidates.is_empty() {
        return "None.".to_string();
    }
    candidates
        .iter()
        .map(|candidate| match candidate.source_type {
            SourceType::Quant => format!(
                "- [quant] file={} | question={} | option={} | value={:.4} | match={} | score={:.3}",
                candidate.file,
                candidate.question,
                candidate.option,
                candidate.value.unwrap_or_default(),
                candidate.match_class.as_str(),
                candidate.score
            ),
            SourceType::Qual => format!(
                "- [qual] file={} | match={} | score={:.3} | excerpt={}",
                candidate.file,
                candidate.match_class.as_str(),
                candidate.score,
                candidate.excerpt
            ),
        })
        .collect::<Vec<String>>()
        .join("\n")
}

/// Asks the capability for a pick. Malformed output is retried up to the attempt limit; any
/// other failure, or exhausting the attempts, yields `None` so the caller can degrade.
pub async fn request_selection<C: Capability + ?Sized>(
    concept: &Concept,
    pools: &CandidatePools,
    capability: &C,
    ledger: &mut UsageLedger,
) -> Option<SelectionResponse> {
    let request = CapabilityRequest {
        stage: Stage::Selection,
        system_prompt: SELECTION_SYSTEM_PROMPT.to_string(),
        user_prompt: build_selection_prompt(concept, pools),
        response_schema: Some(selection_schema()),
        sampling: SamplingParams {
            temperature: 0.1,
            top_p: Some(1.0),
            max_output_tokens: 280,
            seed: None,
        },
    };

    for attempt in 1..=MAX_SELECTION_ATTEMPTS {
        match invoke_json::<SelectionResponse, C>(capability, &request, ledger).await {
            Ok(selection) => {
                debug!(
                    concept = %concept.text,
                    attempt,
                    question = selection.question.as_deref().unwrap_or_default(),
                    chosen = selection.top_sources.len(),
                    hints = selection.weight_hints.as_ref().map_or(0, Vec::len),
                    "selection received"
                );
                return Some(selection);
            }
            Err(err @ (CapabilityError::Schema(_) | CapabilityError::EmptyResponse)) => {
                warn!(concept = %concept.text, attempt, error = %err, "invalid selection output");
            }
            Err(err) => {
                warn!(concept = %concept.text, attempt, error = %err, "selection call failed");
                return None;
            }
        }
    }
    None
}

/// Maps chosen items back onto the deterministic pools. Items absent from the pools are dropped,
/// relevance comes from the scorer, duplicates collapse and the result is capped at `TOP_K`.
/// Beyond the first qualitative item, further ones are dropped when quantitative evidence is
/// present.
pub fn resolve_chosen_sources(chosen: &[ChosenSource], pools: &CandidatePools) -> Vec<EvidenceSource> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::new();

    for item in chosen {
        let Some(candidate) = find_in_pools(item, pools) else {
            debug!(
                file = %item.file,
                source_type = item.source_type.as_str(),
                value = ?item.value,
                excerpt = item.excerpt.as_deref().unwrap_or_default(),
                "chosen item not in candidate pools"
            );
            continue;
        };
        if !seen.insert(candidate.key()) {
            continue;
        }
        let mut source = source_from_candidate(candidate);
        source.weight_hint = item
            .weight_hint
            .as_deref()
            .map(|hint| truncate_words(hint, WEIGHT_HINT_WORDS))
            .filter(|hint| !hint.is_empty());
        resolved.push(source);
    }

    resolved.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
    if resolved.iter().any(|source| source.source_type == SourceType::Quant) {
        let mut qual_seen = false;
        resolved.retain(|source| {
            if source.source_type != SourceType::Qual {
                return true;
            }
            let keep = !qual_seen;
            qual_seen = true;
            keep
        });
    }
    resolved.truncate(TOP_K);
    resolved
}

pub fn source_from_candidate(candidate: &Candidate) -> EvidenceSource {
    EvidenceSource {
        source_type: candidate.source_type,
        file: candidate.file.clone(),
        question: candidate.question.clone(),
        option: candidate.option.clone(),
        value: candidate.value,
        excerpt: candidate.excerpt.clone(),
        relevance: entry_relevance(candidate.score, candidate.match_class),
        weight_hint: None,
        match_class: candidate.match_class,
        score: candidate.score.max(0.0),
    }
}

fn find_in_pools<'a>(item: &ChosenSource, pools: &'a CandidatePools) -> Option<&'a Candidate> {
    match item.source_type {
        SourceType::Quant => {
            let question = item.question.as_deref().unwrap_or_default().trim();
            let option = item.option.as_deref().unwrap_or_default().trim();
            pools.quant.iter().find(|candidate| {
                candidate.question.eq_ignore_ascii_case(question)
                    && candidate.option.eq_ignore_ascii_case(option)
            })
        }
        SourceType::Qual => {
            let file = item.file.trim();
            pools.qual.iter().find(|candidate| candidate.file == file)
        }
    }
}
