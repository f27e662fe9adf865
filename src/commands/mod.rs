pub mod context;
pub mod estimate;
pub mod status;

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::runtime::Runtime;
use tracing::info;

use crate::capability::{
    LimitedCapability, LimiterConfig, OpenAiCompatibleCapability, ProviderConfig, RetryPolicy,
    SamplingParams,
};
use crate::cli::{CorpusArgs, ProviderArgs};
use crate::corpus::{Corpus, load_concepts};
use crate::model::Concept;

pub(crate) fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

pub(crate) fn load_corpus(args: &CorpusArgs) -> Result<Corpus> {
    let corpus = Corpus::load(&args.corpus_dir)
        .with_context(|| format!("failed to load corpus from {}", args.corpus_dir.display()))?;
    Ok(corpus)
}

pub(crate) fn load_concept_list(args: &CorpusArgs) -> Result<Vec<Concept>> {
    let raw = if args.concepts.is_empty() {
        let path = args
            .concepts_path
            .clone()
            .unwrap_or_else(|| args.corpus_dir.join("concepts.txt"));
        load_concepts(&path)
            .with_context(|| format!("failed to load concepts from {}", path.display()))?
    } else {
        args.concepts
            .iter()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .collect()
    };
    if raw.is_empty() {
        bail!("no concepts to process");
    }
    Ok(raw.iter().map(|value| Concept::parse(value)).collect())
}

pub(crate) fn sampling_params(args: &ProviderArgs) -> SamplingParams {
    SamplingParams {
        temperature: args.temperature,
        max_output_tokens: args.max_output_tokens,
        ..SamplingParams::default()
    }
}

pub(crate) fn build_capability(
    args: &ProviderArgs,
) -> Result<LimitedCapability<OpenAiCompatibleCapability>> {
    let api_key = env::var(&args.api_key_env)
        .with_context(|| format!("environment variable {} is not set", args.api_key_env))?;
    if api_key.trim().is_empty() {
        bail!("environment variable {} is empty", args.api_key_env);
    }

    let provider = OpenAiCompatibleCapability::new(ProviderConfig {
        api_base: args.api_base.clone(),
        api_key,
        model: args.model.clone(),
        structured_output: args.structured_output,
        request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
    })
    .context("failed to build provider client")?;

    let limiter = LimiterConfig {
        max_in_flight: args.max_in_flight.max(1),
        max_calls_per_second: args.max_calls_per_second,
        retry: RetryPolicy::new(
            args.max_attempts,
            Duration::from_millis(args.backoff_base_ms),
            Duration::from_millis(args.backoff_max_ms),
        ),
    };
    info!(
        model = %args.model,
        api_base = %args.api_base,
        structured_output = args.structured_output,
        max_in_flight = limiter.max_in_flight,
        max_calls_per_second = limiter.max_calls_per_second,
        max_attempts = limiter.retry.max_attempts,
        "capability configured"
    );
    Ok(LimitedCapability::new(provider, limiter))
}
