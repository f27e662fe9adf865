use serde::{Deserialize, Serialize};

use crate::likert::Distribution;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub question: String,
    pub option: String,
    pub value: f64,
    pub source_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub file: String,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Quant,
    Qual,
}

impl SourceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Quant => "quant",
            Self::Qual => "qual",
        }
    }
}

/// Evidence tier, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchClass {
    Exact,
    Behavior,
    Proxy,
    None,
}

impl MatchClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Behavior => "behavior",
            Self::Proxy => "proxy",
            Self::None => "none",
        }
    }

    pub fn tier_weight(self) -> f64 {
        match self {
            Self::Exact => 1.0,
            Self::Behavior => 0.7,
            Self::Proxy => 0.4,
            Self::None => 0.0,
        }
    }

    pub fn base_relevance(self) -> f64 {
        match self {
            Self::Exact => 0.82,
            Self::Behavior => 0.68,
            Self::Proxy => 0.50,
            Self::None => 0.38,
        }
    }
}

/// Identity of a piece of evidence for de-duplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub source_type: SourceType,
    pub question: String,
    pub option: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub source_type: SourceType,
    pub file: String,
    pub question: String,
    pub option: String,
    pub value: Option<f64>,
    pub excerpt: String,
    pub score: f64,
    pub match_class: MatchClass,
}

impl Candidate {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            source_type: self.source_type,
            question: self.question.clone(),
            option: self.option.clone(),
            excerpt: self.excerpt.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceSource {
    pub source_type: SourceType,
    pub file: String,
    pub question: String,
    pub option: String,
    pub value: Option<f64>,
    pub excerpt: String,
    pub relevance: f64,
    pub weight_hint: Option<String>,
    pub match_class: MatchClass,
    #[serde(skip)]
    pub score: f64,
}

impl EvidenceSource {
    pub fn key(&self) -> SourceKey {
        SourceKey {
            source_type: self.source_type,
            question: self.question.clone(),
            option: self.option.clone(),
            excerpt: self.excerpt.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConceptType {
    Identity,
    BehaviorHighFriction,
    BehaviorLowFriction,
    Attitude,
}

impl ConceptType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::BehaviorHighFriction => "behavior_high_friction",
            Self::BehaviorLowFriction => "behavior_low_friction",
            Self::Attitude => "attitude",
        }
    }
}

/// A survey statement, optionally prefixed with a segment label (`segment: construct`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Concept {
    pub text: String,
    pub segment: Option<String>,
    pub construct: String,
}

impl Concept {
    pub fn parse(raw: &str) -> Self {
        let text = raw.trim().to_string();
        match text.split_once(':') {
            Some((segment, construct)) if !construct.trim().is_empty() => {
                let segment = segment.trim();
                Self {
                    segment: (!segment.is_empty()).then(|| segment.to_string()),
                    construct: construct.trim().to_string(),
                    text: text.clone(),
                }
            }
            _ => Self {
                segment: None,
                construct: text.clone(),
                text,
            },
        }
    }

    /// The statement wording compared against option labels for leave-one-out exclusion.
    pub fn statement(&self) -> &str {
        self.construct
            .split_once(" - ")
            .map(|(_, statement)| statement.trim())
            .unwrap_or(&self.construct)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvidenceBundle {
    pub quant_summary: String,
    pub textual_summary: String,
    pub weight_hints: Vec<String>,
    pub selection_notes: String,
    pub top_sources: Vec<EvidenceSource>,
    pub types_present: Vec<SourceType>,
    pub proximal_topline: Option<f64>,
    pub concept_type: ConceptType,
    pub segment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationRun {
    pub run_index: usize,
    pub distribution: Distribution,
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunFailure {
    pub run_index: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimationResult {
    pub runs: Vec<EstimationRun>,
    pub aggregated_distribution: Distribution,
    pub avg_confidence: f64,
    pub iteration: usize,
    pub failed_runs: Vec<RunFailure>,
    pub pre_adjustment: Option<Distribution>,
}

impl EstimationResult {
    pub fn joined_rationale(&self) -> String {
        let joined = self
            .runs
            .iter()
            .map(|run| run.rationale.trim())
            .filter(|value| !value.is_empty())
            .collect::<Vec<&str>>()
            .join("\n---\n");
        if joined.is_empty() {
            "No rationale provided.".to_string()
        } else {
            joined
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticAssessment {
    pub needs_revision: bool,
    pub confidence: f64,
    pub feedback: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorpusFileEntry {
    pub filename: String,
    pub kind: String,
    pub entries: usize,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EstimateCounts {
    pub concepts: usize,
    pub completed: usize,
    pub failed: usize,
    pub budget_exhausted: usize,
    pub critic_satisfied: usize,
    pub estimation_runs: usize,
    pub failed_estimation_runs: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimateRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
    pub command: String,
    pub model: String,
    pub evidence_mode: String,
    pub runs_per_iteration: usize,
    pub max_iterations: usize,
    pub db_path: String,
    pub corpus_dir: String,
    pub corpus_files: Vec<CorpusFileEntry>,
    pub counts: EstimateCounts,
    pub usage: serde_json::Value,
    pub warnings: Vec<String>,
}
