//! Evidence selection: candidate scoring, tier filtering, leave-one-out exclusion,
//! capability-assisted picking, balance enforcement and bundle formatting.

use tracing::{info, warn};

use crate::capability::{Capability, UsageLedger};
use crate::corpus::Corpus;
use crate::model::{Concept, EvidenceBundle};
use crate::similarity::tokenize_construct;

mod bundle;
mod candidates;
mod parity;
mod scoring;
mod selection;

use bundle::assemble_bundle;
use candidates::{CandidatePools, build_pools};
use parity::{enforce_parity, fallback_selection, finalize_relevance};
use scoring::CandidateScorer;
use selection::{request_selection, resolve_chosen_sources};

pub const TOP_K: usize = 5;
pub const MIN_K: usize = 3;
pub const PROMPT_QUANT_LIMIT: usize = 6;
pub const PROMPT_TEXT_LIMIT: usize = 6;
pub const MAX_SELECTION_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceMode {
    /// Exact-tier evidence is hidden so the estimate cannot echo the answer.
    LeaveOneOut,
    Full,
}

impl EvidenceMode {
    pub fn excludes_exact(self) -> bool {
        matches!(self, Self::LeaveOneOut)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LeaveOneOut => "leave-one-out",
            Self::Full => "full",
        }
    }
}

pub struct EvidenceSelector {
    scorer: CandidateScorer,
    mode: EvidenceMode,
}

impl EvidenceSelector {
    pub fn new(mode: EvidenceMode) -> Result<Self, regex::Error> {
        Ok(Self {
            scorer: CandidateScorer::new()?,
            mode,
        })
    }

    fn pools(&self, concept: &Concept, corpus: &Corpus) -> CandidatePools {
        let terms = tokenize_construct(&concept.construct);
        build_pools(&self.scorer, concept, &terms, corpus, self.mode)
    }

    /// Builds the evidence bundle for one concept. Capability failures never escape: they
    /// degrade to the deterministic selection.
    pub async fn select<C: Capability + ?Sized>(
        &self,
        concept: &Concept,
        corpus: &Corpus,
        capability: &C,
        ledger: &mut UsageLedger,
    ) -> EvidenceBundle {
        let pools = self.pools(concept, corpus);

        let selection = if pools.is_empty() {
            None
        } else {
            request_selection(concept, &pools, capability, ledger).await
        };
        if selection.is_none() && !pools.is_empty() {
            warn!(concept = %concept.text, "selection unavailable; using deterministic evidence");
        }

        let chosen = selection
            .as_ref()
            .map(|selection| resolve_chosen_sources(&selection.top_sources, &pools))
            .unwrap_or_default();
        let (selected, parity_notes) = enforce_parity(chosen, &pools);

        let mut notes = selection
            .as_ref()
            .and_then(|selection| selection.notes.as_deref())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        for note in parity_notes {
            if !notes.is_empty() {
                notes.push(' ');
            }
            notes.push_str(&note);
        }

        let selected = if selected.is_empty() {
            let (fallback, note) = fallback_selection(&pools);
            notes = note;
            fallback
        } else {
            selected
        };

        let bundle = assemble_bundle(
            &concept.text,
            concept.segment.as_deref(),
            finalize_relevance(&selected),
            notes,
        );

        info!(
            concept = %concept.text,
            mode = self.mode.as_str(),
            quant_candidates = pools.quant.len(),
            qual_candidates = pools.qual.len(),
            sources = bundle.top_sources.len(),
            proximal_topline = ?bundle.proximal_topline,
            concept_type = bundle.concept_type.as_str(),
            "evidence bundle assembled"
        );
        bundle
    }
}
