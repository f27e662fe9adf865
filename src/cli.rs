use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};

use crate::evidence::EvidenceMode;

#[derive(Parser, Debug)]
#[command(
    name = "likert-estimator",
    version,
    about = "Evidence-grounded Likert distribution estimation"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Select evidence, estimate and critique every concept; persist the results.
    Estimate(EstimateArgs),
    /// Print the evidence bundle selected for every concept.
    Context(ContextArgs),
    /// Summarise a results database.
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct CorpusArgs {
    #[arg(long, default_value = "data")]
    pub corpus_dir: PathBuf,

    /// Defaults to `<corpus-dir>/concepts.txt`.
    #[arg(long)]
    pub concepts_path: Option<PathBuf>,

    /// Overrides the concepts file; may be repeated.
    #[arg(long = "concept")]
    pub concepts: Vec<String>,

    #[arg(long, value_enum, default_value_t = EvidenceModeArg::LeaveOneOut)]
    pub evidence_mode: EvidenceModeArg,
}

#[derive(Args, Debug, Clone)]
pub struct ProviderArgs {
    #[arg(long, default_value = "gpt-4.1")]
    pub model: String,

    #[arg(long, default_value = "https://api.openai.com/v1")]
    pub api_base: String,

    #[arg(long, default_value = "OPENAI_API_KEY")]
    pub api_key_env: String,

    #[arg(long, default_value_t = 0.1)]
    pub temperature: f32,

    #[arg(long, default_value_t = 400)]
    pub max_output_tokens: u32,

    /// Request schema-constrained output; `false` falls back to free text plus JSON extraction.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub structured_output: bool,

    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 8)]
    pub max_in_flight: usize,

    #[arg(long, default_value_t = 4.0)]
    pub max_calls_per_second: f64,

    #[arg(long, default_value_t = 5)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 500)]
    pub backoff_base_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub backoff_max_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct EstimateArgs {
    #[command(flatten)]
    pub corpus: CorpusArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    #[arg(long, default_value_t = 5)]
    pub runs: usize,

    #[arg(long, default_value_t = 3)]
    pub max_iterations: usize,

    #[arg(long, default_value_t = 4)]
    pub concept_parallelism: usize,

    #[arg(long, default_value = ".cache/likert")]
    pub output_dir: PathBuf,

    /// Defaults to `<output-dir>/likert_results.sqlite`.
    #[arg(long)]
    pub db_path: Option<PathBuf>,

    /// Defaults to `<output-dir>/manifests/estimate_<run-id>.json`.
    #[arg(long)]
    pub manifest_path: Option<PathBuf>,

    #[arg(long)]
    pub system_prompt_path: Option<PathBuf>,

    /// Directory of `<segment>.txt` files appended to the system prompt per segment.
    #[arg(long)]
    pub segment_guidance_dir: Option<PathBuf>,

    /// JSON list of topline rules applied after aggregation.
    #[arg(long)]
    pub adjustments_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ContextArgs {
    #[command(flatten)]
    pub corpus: CorpusArgs,

    #[command(flatten)]
    pub provider: ProviderArgs,

    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Write the summary here instead of stdout.
    #[arg(long)]
    pub output_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/likert")]
    pub output_dir: PathBuf,

    #[arg(long)]
    pub db_path: Option<PathBuf>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum EvidenceModeArg {
    LeaveOneOut,
    Full,
}

impl From<EvidenceModeArg> for EvidenceMode {
    fn from(value: EvidenceModeArg) -> Self {
        match value {
            EvidenceModeArg::LeaveOneOut => EvidenceMode::LeaveOneOut,
            EvidenceModeArg::Full => EvidenceMode::Full,
        }
    }
}
