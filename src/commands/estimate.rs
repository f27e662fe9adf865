use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::capability::{Stage, UsageLedger};
use crate::cli::EstimateArgs;
use crate::commands::{
    build_capability, build_runtime, load_concept_list, load_corpus, sampling_params,
};
use crate::critic::Critic;
use crate::estimator::{DistributionEstimator, SystemPrompts, ToplineRules};
use crate::evidence::{EvidenceMode, EvidenceSelector};
use crate::model::{EstimateCounts, EstimateRunManifest};
use crate::orchestrator::{ConceptRecord, Orchestrator};
use crate::store::ResultStore;
use crate::util::{ensure_directory, new_run_id, now_utc_string, write_json_pretty};

const MANIFEST_VERSION: u32 = 1;

#[derive(Default)]
struct RunTally {
    counts: EstimateCounts,
    usage: UsageLedger,
    warnings: Vec<String>,
}

impl RunTally {
    fn add(&mut self, record: &ConceptRecord) {
        self.usage.merge(record.usage());
        for iteration in record.history() {
            self.counts.estimation_runs += iteration.result.runs.len();
            self.counts.failed_estimation_runs += iteration.result.failed_runs.len();
        }
        match record {
            ConceptRecord::Completed(outcome) => {
                self.counts.completed += 1;
                if outcome.budget_exhausted {
                    self.counts.budget_exhausted += 1;
                } else {
                    self.counts.critic_satisfied += 1;
                }
            }
            ConceptRecord::Failed(failure) => {
                self.counts.failed += 1;
                self.warnings.push(format!(
                    "{} failed during {}: {}",
                    failure.concept.text,
                    failure.stage.as_str(),
                    failure.reason
                ));
            }
        }
    }
}

fn default_manifest_path(manifest_dir: &Path, run_id: &str) -> PathBuf {
    manifest_dir.join(format!("estimate_{run_id}.json"))
}

pub fn run(args: EstimateArgs) -> Result<()> {
    let started_ts = Utc::now();
    let started_at = now_utc_string();
    let run_id = new_run_id(started_ts);

    let output_dir = args.output_dir.clone();
    let manifest_dir = output_dir.join("manifests");
    ensure_directory(&manifest_dir)?;
    let manifest_path = args
        .manifest_path
        .clone()
        .unwrap_or_else(|| default_manifest_path(&manifest_dir, &run_id));
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| output_dir.join("likert_results.sqlite"));
    let mode = EvidenceMode::from(args.corpus.evidence_mode);

    info!(
        run_id = %run_id,
        corpus_dir = %args.corpus.corpus_dir.display(),
        mode = mode.as_str(),
        runs = args.runs,
        max_iterations = args.max_iterations,
        "starting estimate"
    );

    let corpus = load_corpus(&args.corpus)?;
    let concepts = load_concept_list(&args.corpus)?;
    info!(
        records = corpus.records().len(),
        chunks = corpus.chunks().len(),
        concepts = concepts.len(),
        "inputs loaded"
    );

    let prompts = SystemPrompts::load(
        args.system_prompt_path.as_deref(),
        args.segment_guidance_dir.as_deref(),
    )?;
    let sampling = sampling_params(&args.provider);
    let mut estimator = DistributionEstimator::new(args.runs, sampling.clone(), prompts);
    if let Some(path) = &args.adjustments_path {
        let rules = ToplineRules::from_path(path)?;
        info!(path = %path.display(), rules = rules.len(), "topline adjustments enabled");
        estimator = estimator.with_adjuster(Arc::new(rules));
    }
    let selector = EvidenceSelector::new(mode).context("failed to compile sentence splitter")?;
    let orchestrator = Orchestrator::new(
        selector,
        estimator,
        Critic::new(sampling),
        args.max_iterations,
    );

    let capability = build_capability(&args.provider)?;
    let runtime = build_runtime()?;
    let mut store = ResultStore::open(&db_path)?;
    store.begin_run(&run_id, &started_at, &args.provider.model, mode.as_str())?;

    let runs_per_iteration = orchestrator.runs_per_iteration();
    let mut tally = RunTally {
        counts: EstimateCounts {
            concepts: concepts.len(),
            ..EstimateCounts::default()
        },
        ..RunTally::default()
    };
    let batch = runtime.block_on(orchestrator.run_batch(
        &concepts,
        &corpus,
        &capability,
        args.concept_parallelism,
        |record| {
            store.record_concept(&run_id, record, runs_per_iteration)?;
            tally.add(record);
            Ok::<(), anyhow::Error>(())
        },
    ));

    let status = match &batch {
        Err(_) => "failed",
        Ok(_) if tally.counts.failed == 0 => "completed",
        Ok(_) => "completed_with_failures",
    };
    if let Err(err) = &batch {
        error!(
            run_id = %run_id,
            kept = tally.counts.completed + tally.counts.failed,
            error = %err,
            "estimate aborted; concepts finished so far are kept"
        );
        tally.warnings.push(format!("run aborted: {err:#}"));
    }
    let finished_at = now_utc_string();
    store.finish_run(&run_id, status, &finished_at, &tally.counts, &tally.usage)?;

    let manifest = EstimateRunManifest {
        manifest_version: MANIFEST_VERSION,
        run_id: run_id.clone(),
        status: status.to_string(),
        started_at,
        finished_at,
        command: "estimate".to_string(),
        model: args.provider.model.clone(),
        evidence_mode: mode.as_str().to_string(),
        runs_per_iteration,
        max_iterations: orchestrator.max_iterations(),
        db_path: db_path.display().to_string(),
        corpus_dir: args.corpus.corpus_dir.display().to_string(),
        corpus_files: corpus.files().to_vec(),
        counts: tally.counts.clone(),
        usage: tally.usage.to_json(),
        warnings: tally.warnings,
    };
    write_json_pretty(&manifest_path, &manifest)?;
    batch.with_context(|| format!("estimate run {run_id} failed"))?;

    let counts = &tally.counts;
    if counts.failed > 0 {
        warn!(failed = counts.failed, "some concepts failed; see manifest warnings");
    }
    let usage = &tally.usage;
    let total = usage.total();
    info!(
        run_id = %run_id,
        completed = counts.completed,
        failed = counts.failed,
        budget_exhausted = counts.budget_exhausted,
        selection_calls = usage.stage(Stage::Selection).calls,
        estimation_calls = usage.stage(Stage::Estimation).calls,
        critique_calls = usage.stage(Stage::Critique).calls,
        total_tokens = total.total_tokens,
        db = %db_path.display(),
        manifest = %manifest_path.display(),
        "estimate finished"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::cli::{Cli, Commands};

    #[test]
    fn manifest_defaults_to_estimate_run_id_under_manifests() {
        let path = default_manifest_path(
            Path::new(".cache/likert/manifests"),
            "run-20260101T000000Z-0a1b2c3d",
        );
        assert_eq!(
            path,
            PathBuf::from(".cache/likert/manifests/estimate_run-20260101T000000Z-0a1b2c3d.json")
        );

        let cli = Cli::try_parse_from(["likert-estimator", "estimate"]).expect("defaults parse");
        let Commands::Estimate(args) = cli.command else {
            panic!("estimate subcommand expected");
        };
        assert_eq!(args.manifest_path, None);
        assert_eq!(args.output_dir, PathBuf::from(".cache/likert"));
    }
}
