use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::model::{Concept, EvidenceBundle};
use crate::util::slugify;

pub const DEFAULT_ESTIMATOR_SYSTEM_PROMPT: &str = "You estimate how a population segment answers a survey statement on a five-point Likert scale.
Ground the estimate in the quantitative toplines and qualitative notes provided. Treat a proximal topline, when given, as the strongest anchor for the combined agree share.
Return percentages for strongly_agree, slightly_agree, neither_agree_nor_disagree, slightly_disagree and strongly_disagree that sum to 100, a confidence between 0 and 1, and a short rationale citing the evidence used.
Respond with a JSON object matching the provided schema and nothing else.";

/// Estimator system prompt plus optional per-segment guidance, all read once at startup.
#[derive(Debug, Clone)]
pub struct SystemPrompts {
    base: String,
    guidance: HashMap<String, String>,
}

impl Default for SystemPrompts {
    fn default() -> Self {
        Self {
            base: DEFAULT_ESTIMATOR_SYSTEM_PROMPT.to_string(),
            guidance: HashMap::new(),
        }
    }
}

impl SystemPrompts {
    pub fn load(prompt_path: Option<&Path>, guidance_dir: Option<&Path>) -> Result<Self> {
        let base = match prompt_path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read system prompt: {}", path.display()))?;
                let trimmed = raw.trim();
                if trimmed.is_empty() {
                    anyhow::bail!("system prompt file is empty: {}", path.display());
                }
                trimmed.to_string()
            }
            None => DEFAULT_ESTIMATOR_SYSTEM_PROMPT.to_string(),
        };

        let mut guidance = HashMap::new();
        if let Some(dir) = guidance_dir {
            let entries = fs::read_dir(dir)
                .with_context(|| format!("failed to read guidance directory: {}", dir.display()))?;
            for entry in entries {
                let path = entry
                    .with_context(|| format!("failed to read guidance directory: {}", dir.display()))?
                    .path();
                if path.extension().and_then(|value| value.to_str()) != Some("txt") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|value| value.to_str()) else {
                    continue;
                };
                let text = fs::read_to_string(&path)
                    .with_context(|| format!("failed to read guidance: {}", path.display()))?;
                if !text.trim().is_empty() {
                    guidance.insert(slugify(stem), text.trim().to_string());
                }
            }
            debug!(dir = %dir.display(), segments = guidance.len(), "segment guidance loaded");
        }

        Ok(Self { base, guidance })
    }

    pub fn for_segment(&self, segment: Option<&str>) -> String {
        let extra = segment
            .map(slugify)
            .and_then(|slug| self.guidance.get(&slug));
        match extra {
            Some(guidance) => format!(
                "{}\n\n---\n\nSEGMENT-SPECIFIC GUIDANCE:\n\n{guidance}",
                self.base
            ),
            None => self.base.clone(),
        }
    }
}

/// Shared part of every run prompt; callers append the run number.
pub fn build_estimator_prompt(concept: &Concept, bundle: &EvidenceBundle, feedback: &str) -> String {
    let or_none = |value: &str| {
        if value.trim().is_empty() {
            "(none)".to_string()
        } else {
            value.trim().to_string()
        }
    };

    let proximal = bundle
        .proximal_topline
        .map(|value| format!("\nProximal topline for exact concept: {value:.4}"))
        .unwrap_or_default();
    let segment = bundle
        .segment
        .as_deref()
        .map(|value| format!("\nSegment: {value}"))
        .unwrap_or_default();
    let hints = bundle
        .weight_hints
        .iter()
        .map(|hint| hint.trim())
        .filter(|hint| !hint.is_empty())
        .collect::<Vec<&str>>();
    let hints = if hints.is_empty() {
        "(none provided)".to_string()
    } else {
        hints.join("\n\n")
    };

    let mut prompt = format!(
        "Segment quantitative toplines (retrieved subset):\n{}{proximal}\n\n\
         Segment qualitative notes (retrieved subset):\n{}{segment}\n\n\
         Weighting hints (strong to weak):\n\n{hints}\n\n\
         Item type:\n{}\n\n\
         Target concept:\n{}\n",
        or_none(&bundle.quant_summary),
        or_none(&bundle.textual_summary),
        bundle.concept_type.as_str(),
        concept.text,
    );

    let notes = bundle.selection_notes.trim();
    if !notes.is_empty() {
        prompt.push_str(&format!("\nEvidence selection rationale: {notes}"));
    }
    let feedback = feedback.trim();
    if !feedback.is_empty() {
        prompt.push_str(&format!("\nCritic feedback to address:\n{feedback}"));
    }
    prompt.push_str(&format!(
        "\nConcept-specific focus:\n- Use only the context that concerns '{}'; ignore material about other statements.\n",
        concept.text
    ));
    prompt
}

pub fn run_prompt(base: &str, run_index: usize) -> String {
    format!("{base}\nRun number: {run_index}")
}
