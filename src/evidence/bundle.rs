use crate::model::{ConceptType, EvidenceBundle, EvidenceSource, MatchClass, SourceType};

const MAX_WEIGHT_HINTS: usize = 5;

const IDENTITY_KEYWORDS: &[&str] = &["i am", "i'm", "myself", "identity", "who i am", "type of person"];
const HIGH_FRICTION_KEYWORDS: &[&str] = &[
    "invest",
    "purchase",
    "buy a home",
    "switch",
    "change provider",
    "pension",
    "mortgage",
];
const LOW_FRICTION_KEYWORDS: &[&str] = &["use", "prefer", "choose", "consider", "look at", "browse"];
const GENERIC_BEHAVIOR_KEYWORDS: &[&str] = &["buy", "visit", "go to", "travel", "spend", "save"];

pub fn assemble_bundle(
    concept_text: &str,
    segment: Option<&str>,
    top_sources: Vec<EvidenceSource>,
    selection_notes: String,
) -> EvidenceBundle {
    let mut types_present = top_sources
        .iter()
        .map(|source| source.source_type)
        .collect::<Vec<SourceType>>();
    types_present.sort();
    types_present.dedup();

    EvidenceBundle {
        quant_summary: format_quant_summary(&top_sources),
        textual_summary: format_textual_summary(&top_sources),
        weight_hints: build_weight_hints(&top_sources),
        selection_notes: if selection_notes.trim().is_empty() {
            "Balanced selection used.".to_string()
        } else {
            selection_notes.trim().to_string()
        },
        proximal_topline: proximal_topline(&top_sources),
        concept_type: infer_concept_type(concept_text),
        segment: segment.map(str::to_string),
        types_present,
        top_sources,
    }
}

pub fn format_quant_summary(sources: &[EvidenceSource]) -> String {
    sources
        .iter()
        .filter(|source| source.source_type == SourceType::Quant)
        .map(|source| {
            let value = source
                .value
                .map(|value| format!("value={value:.4}"))
                .unwrap_or_else(|| "value=n/a".to_string());
            let marker = if source.match_class == MatchClass::Exact {
                " [PROXIMAL]"
            } else {
                ""
            };
            format!(
                "{} | {} | {value}{marker} (file={}, relevance={:.2})",
                source.question, source.option, source.file, source.relevance
            )
        })
        .collect::<Vec<String>>()
        .join("\n")
}

pub fn format_textual_summary(sources: &[EvidenceSource]) -> String {
    sources
        .iter()
        .filter(|source| source.source_type == SourceType::Qual && !source.excerpt.is_empty())
        .map(|source| {
            format!(
                "{} (file={}, relevance={:.2})",
                source.excerpt, source.file, source.relevance
            )
        })
        .collect::<Vec<String>>()
        .join("\n\n")
}

pub fn build_weight_hints(sources: &[EvidenceSource]) -> Vec<String> {
    sources
        .iter()
        .filter_map(|source| match source.source_type {
            SourceType::Quant => Some(match source.value {
                Some(value) => format!("{} -> {} (value={value:.2})", source.question, source.option),
                None => source.question.clone(),
            }),
            SourceType::Qual if !source.excerpt.is_empty() => {
                Some(format!("Quote: \"{}\"", source.excerpt))
            }
            SourceType::Qual => None,
        })
        .take(MAX_WEIGHT_HINTS)
        .collect()
}

/// Value of the first exact-tier quantitative source.
pub fn proximal_topline(sources: &[EvidenceSource]) -> Option<f64> {
    sources
        .iter()
        .find(|source| source.source_type == SourceType::Quant && source.match_class == MatchClass::Exact)
        .and_then(|source| source.value)
}

pub fn infer_concept_type(concept: &str) -> ConceptType {
    let lower = concept.to_lowercase();
    let mentions = |keywords: &[&str]| keywords.iter().any(|keyword| lower.contains(keyword));

    if mentions(IDENTITY_KEYWORDS) {
        ConceptType::Identity
    } else if mentions(HIGH_FRICTION_KEYWORDS) {
        ConceptType::BehaviorHighFriction
    } else if mentions(LOW_FRICTION_KEYWORDS) || mentions(GENERIC_BEHAVIOR_KEYWORDS) {
        ConceptType::BehaviorLowFriction
    } else {
        ConceptType::Attitude
    }
}
