use std::collections::HashSet;

use super::candidates::CandidatePools;
use super::selection::source_from_candidate;
use super::{MIN_K, TOP_K};
use crate::model::{Candidate, EvidenceSource, SourceKey, SourceType};
use crate::util::round_to;

const RANK_BONUS: f64 = 0.05;
const FLAT_NORM: f64 = 0.5;

/// Guarantees both evidence types when the pools offer both, then tops up to `MIN_K`.
/// Returns the adjusted selection and the notes explaining what was added.
pub fn enforce_parity(
    mut selected: Vec<EvidenceSource>,
    pools: &CandidatePools,
) -> (Vec<EvidenceSource>, Vec<String>) {
    selected.truncate(TOP_K);
    let mut notes = Vec::new();

    if pools.has_positive(SourceType::Quant) && pools.has_positive(SourceType::Qual) {
        for (source_type, note) in [
            (SourceType::Quant, "Balanced selection by adding quantitative evidence."),
            (SourceType::Qual, "Balanced selection by adding qualitative evidence."),
        ] {
            if selected.iter().any(|source| source.source_type == source_type) {
                continue;
            }
            let Some(candidate) = best_unused(pools.pool(source_type).iter(), &selected) else {
                continue;
            };
            if selected.len() >= TOP_K {
                evict_lowest_relevance(&mut selected);
            }
            selected.push(source_from_candidate(candidate));
            notes.push(note.to_string());
        }
    }

    if selected.len() < MIN_K {
        let mut added = false;
        for candidate in pools.combined() {
            if selected.len() >= MIN_K {
                break;
            }
            if candidate.score <= 0.0 || used_keys(&selected).contains(&candidate.key()) {
                continue;
            }
            selected.push(source_from_candidate(candidate));
            added = true;
        }
        if added {
            notes.push("Top-up evidence added to satisfy minimum context.".to_string());
        }
    }

    selected.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
    selected.truncate(TOP_K);
    (selected, notes)
}

/// Pure-score selection used when nothing else produced evidence.
pub fn fallback_selection(pools: &CandidatePools) -> (Vec<EvidenceSource>, String) {
    let mut combined = Vec::new();
    for candidate in pools.quant.iter().take(TOP_K) {
        let mut source = source_from_candidate(candidate);
        source.weight_hint = Some(format!("Auto proxy (score={:.2})", candidate.score));
        combined.push(source);
    }
    let needed = TOP_K.saturating_sub(combined.len());
    for candidate in pools.qual.iter().take(needed) {
        if candidate.excerpt.is_empty() {
            continue;
        }
        let mut source = source_from_candidate(candidate);
        source.weight_hint = Some("Auto-selected qualitative proxy.".to_string());
        combined.push(source);
    }

    let mut seen = HashSet::new();
    combined.retain(|source| seen.insert(source.key()));
    combined.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
    combined.truncate(TOP_K);

    let has_quant = combined.iter().any(|source| source.source_type == SourceType::Quant);
    let has_qual = combined.iter().any(|source| source.source_type == SourceType::Qual);
    let note = match (has_quant, has_qual) {
        (false, false) => "No related evidence surfaced; selector returned empty.",
        (true, false) => "Auto-selected quantitative proxies.",
        (false, true) => "Auto-selected qualitative proxies.",
        (true, true) => "Auto-selected proxies from both quant and qual.",
    };
    (combined, note.to_string())
}

/// Re-derives relevance inside the bundle: `clamp(base + 0.25 * norm + rank_bonus, 0.10, 0.99)`
/// where `norm` is the min-max normalised score and the rank bonus favours higher scores.
/// The result is ordered by relevance, highest first.
pub fn finalize_relevance(sources: &[EvidenceSource]) -> Vec<EvidenceSource> {
    if sources.is_empty() {
        return Vec::new();
    }

    let max_score = sources.iter().map(|source| source.score).fold(f64::MIN, f64::max);
    let min_score = sources.iter().map(|source| source.score).fold(f64::MAX, f64::min);
    let spread = max_score - min_score;
    let last_rank = (sources.len() - 1).max(1) as f64;

    let mut by_score = sources.to_vec();
    by_score.sort_by(|left, right| right.score.total_cmp(&left.score));

    let mut finalized = by_score
        .into_iter()
        .enumerate()
        .map(|(rank, mut source)| {
            let norm = if spread > 1e-6 {
                (source.score - min_score) / spread
            } else {
                FLAT_NORM
            };
            let rank_bonus = RANK_BONUS * (1.0 - rank as f64 / last_rank);
            let relevance = source.match_class.base_relevance() + 0.25 * norm + rank_bonus;
            source.relevance = round_to(relevance.clamp(0.10, 0.99), 2);
            source
        })
        .collect::<Vec<EvidenceSource>>();

    finalized.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
    finalized
}

fn best_unused<'a>(
    pool: impl Iterator<Item = &'a Candidate>,
    selected: &[EvidenceSource],
) -> Option<&'a Candidate> {
    let used = used_keys(selected);
    pool.filter(|candidate| candidate.score > 0.0)
        .find(|candidate| !used.contains(&candidate.key()))
}

fn used_keys(selected: &[EvidenceSource]) -> HashSet<SourceKey> {
    selected.iter().map(EvidenceSource::key).collect()
}

fn evict_lowest_relevance(selected: &mut Vec<EvidenceSource>) {
    let lowest = selected
        .iter()
        .enumerate()
        .min_by(|(left_index, left), (right_index, right)| {
            left.relevance
                .total_cmp(&right.relevance)
                .then(right_index.cmp(left_index))
        })
        .map(|(index, _)| index);
    if let Some(index) = lowest {
        selected.remove(index);
    }
}
