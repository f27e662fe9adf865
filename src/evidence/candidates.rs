use tracing::debug;

use super::scoring::CandidateScorer;
use super::{EvidenceMode, PROMPT_QUANT_LIMIT, PROMPT_TEXT_LIMIT};
use crate::corpus::Corpus;
use crate::model::{Candidate, Concept, MatchClass, SourceType, StructuredRecord, TextChunk};
use crate::similarity::fold_for_comparison;

/// Whitelisted, score-sorted candidates for one concept.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidatePools {
    pub quant: Vec<Candidate>,
    pub qual: Vec<Candidate>,
}

impl CandidatePools {
    pub fn prompt_quant(&self) -> &[Candidate] {
        &self.quant[..self.quant.len().min(PROMPT_QUANT_LIMIT)]
    }

    pub fn prompt_qual(&self) -> &[Candidate] {
        &self.qual[..self.qual.len().min(PROMPT_TEXT_LIMIT)]
    }

    pub fn has_positive(&self, source_type: SourceType) -> bool {
        self.pool(source_type).iter().any(|candidate| candidate.score > 0.0)
    }

    pub fn pool(&self, source_type: SourceType) -> &[Candidate] {
        match source_type {
            SourceType::Quant => &self.quant,
            SourceType::Qual => &self.qual,
        }
    }

    /// Both pools merged and re-sorted by score; quantitative first on ties.
    pub fn combined(&self) -> Vec<&Candidate> {
        let mut combined = self.quant.iter().chain(self.qual.iter()).collect::<Vec<_>>();
        combined.sort_by(|left, right| right.score.total_cmp(&left.score));
        combined
    }

    pub fn is_empty(&self) -> bool {
        self.quant.is_empty() && self.qual.is_empty()
    }
}

pub fn build_pools(
    scorer: &CandidateScorer,
    concept: &Concept,
    terms: &[String],
    corpus: &Corpus,
    mode: EvidenceMode,
) -> CandidatePools {
    let (records, chunks) = segment_lock(concept.segment.as_deref(), corpus);

    let quant = records
        .iter()
        .map(|record| {
            let text = format!("{} {}", record.question, record.option);
            let (score, match_class) = scorer.score(terms, &text);
            Candidate {
                source_type: SourceType::Quant,
                file: record.source_file.clone(),
                question: record.question.clone(),
                option: record.option.clone(),
                value: Some(record.value),
                excerpt: String::new(),
                score,
                match_class,
            }
        })
        .collect::<Vec<Candidate>>();

    let qual = chunks
        .iter()
        .map(|chunk| {
            let (sentence, match_class) = scorer.best_sentence(&chunk.text, terms);
            let (score, _) = scorer.score(terms, &sentence);
            Candidate {
                source_type: SourceType::Qual,
                file: chunk.file.clone(),
                question: String::new(),
                option: String::new(),
                value: None,
                excerpt: sentence,
                score,
                match_class,
            }
        })
        .collect::<Vec<Candidate>>();

    let skip_exact = mode.excludes_exact();
    let mut quant = apply_tier_whitelist(quant, skip_exact);
    let qual = apply_tier_whitelist(qual, skip_exact);

    if skip_exact {
        let statement = fold_for_comparison(concept.statement());
        let before = quant.len();
        quant.retain(|candidate| fold_for_comparison(&candidate.option) != statement);
        if quant.len() != before {
            debug!(
                concept = %concept.text,
                removed = before - quant.len(),
                "dropped quantitative rows matching the concept wording"
            );
        }
    }

    CandidatePools {
        quant: sort_by_score(quant),
        qual: sort_by_score(qual),
    }
}

/// Restricts the corpus to entries mentioning the segment label. A side that would end up
/// empty is left unfiltered.
fn segment_lock<'a>(
    segment: Option<&str>,
    corpus: &'a Corpus,
) -> (Vec<&'a StructuredRecord>, Vec<&'a TextChunk>) {
    let records = corpus.records().iter().collect::<Vec<_>>();
    let chunks = corpus.chunks().iter().collect::<Vec<_>>();
    let Some(segment) = segment.map(str::to_lowercase).filter(|value| !value.is_empty()) else {
        return (records, chunks);
    };

    let locked_records = records
        .iter()
        .copied()
        .filter(|record| {
            format!("{} {}", record.question, record.option)
                .to_lowercase()
                .contains(&segment)
        })
        .collect::<Vec<_>>();
    let locked_chunks = chunks
        .iter()
        .copied()
        .filter(|chunk| chunk.text.to_lowercase().contains(&segment))
        .collect::<Vec<_>>();

    (
        if locked_records.is_empty() { records } else { locked_records },
        if locked_chunks.is_empty() { chunks } else { locked_chunks },
    )
}

/// Keeps only the strongest tier present in the pool. `none` never qualifies and `exact` is
/// passed over entirely when `skip_exact` is set.
pub fn apply_tier_whitelist(candidates: Vec<Candidate>, skip_exact: bool) -> Vec<Candidate> {
    let tiers: &[MatchClass] = if skip_exact {
        &[MatchClass::Behavior, MatchClass::Proxy]
    } else {
        &[MatchClass::Exact, MatchClass::Behavior, MatchClass::Proxy]
    };
    let Some(tier) = tiers
        .iter()
        .copied()
        .find(|tier| candidates.iter().any(|candidate| candidate.match_class == *tier))
    else {
        return Vec::new();
    };
    candidates
        .into_iter()
        .filter(|candidate| candidate.match_class == tier)
        .collect()
}

fn sort_by_score(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|left, right| right.score.total_cmp(&left.score));
    candidates
}
