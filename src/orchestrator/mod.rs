//! Per-concept state machine (select, then estimate and critique until satisfied or out of
//! iterations) and the batch runner that fans concepts out over a shared capability.

use std::error::Error as _;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::capability::{Capability, Stage, UsageLedger};
use crate::corpus::Corpus;
use crate::critic::{Critic, CriticError};
use crate::estimator::{DistributionEstimator, EstimationError};
use crate::evidence::EvidenceSelector;
use crate::model::{Concept, CriticAssessment, EstimationResult, EvidenceBundle};

#[derive(Debug, Error)]
pub enum ConceptError {
    #[error("estimation failed at iteration {iteration}")]
    Estimation {
        iteration: usize,
        #[source]
        source: EstimationError,
    },
    #[error("critique failed at iteration {iteration}")]
    Critique {
        iteration: usize,
        #[source]
        source: CriticError,
    },
}

impl ConceptError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Estimation { .. } => Stage::Estimation,
            Self::Critique { .. } => Stage::Critique,
        }
    }

    /// Iterations whose estimate and critique both finished before the failure.
    pub fn iterations_completed(&self) -> usize {
        match self {
            Self::Estimation { iteration, .. } | Self::Critique { iteration, .. } => {
                iteration.saturating_sub(1)
            }
        }
    }

    fn reason(&self) -> String {
        let mut parts = vec![self.to_string()];
        let mut source = self.source();
        while let Some(cause) = source {
            parts.push(cause.to_string());
            source = cause.source();
        }
        parts.join(": ")
    }
}

/// One estimate/critique round. `assessment` is `None` when the critic failed on it.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub result: EstimationResult,
    pub assessment: Option<CriticAssessment>,
}

#[derive(Debug, Clone)]
pub struct ConceptOutcome {
    pub concept: Concept,
    pub bundle: EvidenceBundle,
    pub iterations: usize,
    pub final_result: EstimationResult,
    pub final_assessment: CriticAssessment,
    /// The critic still wanted a revision when `max_iterations` ran out.
    pub budget_exhausted: bool,
    pub history: Vec<IterationRecord>,
    pub usage: UsageLedger,
}

impl ConceptOutcome {
    pub fn rationale(&self) -> String {
        self.final_result.joined_rationale()
    }
}

#[derive(Debug, Clone)]
pub struct ConceptFailure {
    pub concept: Concept,
    pub stage: Stage,
    pub reason: String,
    pub iterations_completed: usize,
    pub bundle: EvidenceBundle,
    pub history: Vec<IterationRecord>,
    pub usage: UsageLedger,
}

#[derive(Debug, Clone)]
pub enum ConceptRecord {
    Completed(ConceptOutcome),
    Failed(ConceptFailure),
}

impl ConceptRecord {
    pub fn concept(&self) -> &Concept {
        match self {
            Self::Completed(outcome) => &outcome.concept,
            Self::Failed(failure) => &failure.concept,
        }
    }

    pub fn usage(&self) -> &UsageLedger {
        match self {
            Self::Completed(outcome) => &outcome.usage,
            Self::Failed(failure) => &failure.usage,
        }
    }

    pub fn history(&self) -> &[IterationRecord] {
        match self {
            Self::Completed(outcome) => &outcome.history,
            Self::Failed(failure) => &failure.history,
        }
    }
}

enum Phase {
    Selecting,
    Estimating {
        bundle: EvidenceBundle,
        iteration: usize,
        feedback: String,
    },
    Critiquing {
        bundle: EvidenceBundle,
        result: EstimationResult,
    },
    Done {
        bundle: EvidenceBundle,
        result: EstimationResult,
        assessment: CriticAssessment,
    },
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Selecting => "selecting",
            Self::Estimating { .. } => "estimating",
            Self::Critiquing { .. } => "critiquing",
            Self::Done { .. } => "done",
        }
    }
}

/// A revision is only granted while the iteration budget lasts.
pub fn wants_retry(assessment: &CriticAssessment, iteration: usize, max_iterations: usize) -> bool {
    assessment.needs_revision && iteration < max_iterations
}

pub struct Orchestrator {
    selector: EvidenceSelector,
    estimator: DistributionEstimator,
    critic: Critic,
    max_iterations: usize,
}

impl Orchestrator {
    pub fn new(
        selector: EvidenceSelector,
        estimator: DistributionEstimator,
        critic: Critic,
        max_iterations: usize,
    ) -> Self {
        Self {
            selector,
            estimator,
            critic,
            max_iterations: max_iterations.max(1),
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub fn runs_per_iteration(&self) -> usize {
        self.estimator.runs()
    }

    pub async fn run_concept<C: Capability + ?Sized>(
        &self,
        concept: &Concept,
        corpus: &Corpus,
        capability: &C,
    ) -> ConceptRecord {
        let mut usage = UsageLedger::default();
        let mut history = Vec::new();
        let mut phase = Phase::Selecting;

        loop {
            debug!(concept = %concept.text, phase = phase.name(), "phase");
            phase = match phase {
                Phase::Selecting => {
                    let bundle = self
                        .selector
                        .select(concept, corpus, capability, &mut usage)
                        .await;
                    Phase::Estimating {
                        bundle,
                        iteration: 1,
                        feedback: String::new(),
                    }
                }
                Phase::Estimating {
                    bundle,
                    iteration,
                    feedback,
                } => {
                    let estimate = self
                        .estimator
                        .estimate(concept, &bundle, &feedback, iteration, capability, &mut usage)
                        .await;
                    match estimate {
                        Ok(result) => Phase::Critiquing { bundle, result },
                        Err(source) => {
                            let err = ConceptError::Estimation { iteration, source };
                            return failed(concept, err, bundle, history, usage);
                        }
                    }
                }
                Phase::Critiquing { bundle, result } => {
                    let iteration = result.iteration;
                    let verdict = self
                        .critic
                        .assess(concept, &bundle, &result, capability, &mut usage)
                        .await;
                    let assessment = match verdict {
                        Ok(assessment) => assessment,
                        Err(source) => {
                            history.push(IterationRecord {
                                result,
                                assessment: None,
                            });
                            let err = ConceptError::Critique { iteration, source };
                            return failed(concept, err, bundle, history, usage);
                        }
                    };
                    history.push(IterationRecord {
                        result: result.clone(),
                        assessment: Some(assessment.clone()),
                    });

                    if wants_retry(&assessment, iteration, self.max_iterations) {
                        Phase::Estimating {
                            bundle,
                            iteration: iteration + 1,
                            feedback: assessment.feedback,
                        }
                    } else {
                        Phase::Done {
                            bundle,
                            result,
                            assessment,
                        }
                    }
                }
                Phase::Done {
                    bundle,
                    result,
                    assessment,
                } => {
                    let budget_exhausted = assessment.needs_revision;
                    info!(
                        concept = %concept.text,
                        iterations = result.iteration,
                        topline = result.aggregated_distribution.topline(),
                        budget_exhausted,
                        "concept complete"
                    );
                    return ConceptRecord::Completed(ConceptOutcome {
                        concept: concept.clone(),
                        bundle,
                        iterations: result.iteration,
                        final_result: result,
                        final_assessment: assessment,
                        budget_exhausted,
                        history,
                        usage,
                    });
                }
            };
        }
    }

    /// Runs up to `parallelism` concepts at once. `on_record` sees each record as soon as its
    /// concept finishes, so callers can persist incrementally; an error from it stops the batch.
    /// The returned records are in input order.
    pub async fn run_batch<C, F, E>(
        &self,
        concepts: &[Concept],
        corpus: &Corpus,
        capability: &C,
        parallelism: usize,
        mut on_record: F,
    ) -> Result<Vec<ConceptRecord>, E>
    where
        C: Capability + ?Sized,
        F: FnMut(&ConceptRecord) -> Result<(), E>,
    {
        let mut pending = stream::iter(concepts.iter().enumerate())
            .map(|(index, concept)| async move {
                (index, self.run_concept(concept, corpus, capability).await)
            })
            .buffer_unordered(parallelism.max(1));

        let mut records = Vec::with_capacity(concepts.len());
        while let Some((index, record)) = pending.next().await {
            on_record(&record)?;
            records.push((index, record));
        }
        records.sort_by_key(|(index, _)| *index);
        Ok(records.into_iter().map(|(_, record)| record).collect())
    }
}

fn failed(
    concept: &Concept,
    err: ConceptError,
    bundle: EvidenceBundle,
    history: Vec<IterationRecord>,
    usage: UsageLedger,
) -> ConceptRecord {
    let reason = err.reason();
    error!(
        concept = %concept.text,
        stage = err.stage().as_str(),
        error = %reason,
        "concept failed"
    );
    ConceptRecord::Failed(ConceptFailure {
        concept: concept.clone(),
        stage: err.stage(),
        reason,
        iterations_completed: err.iterations_completed(),
        bundle,
        history,
        usage,
    })
}
