use std::fs::File;
use std::io::{self, Write};

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::info;

use crate::capability::UsageLedger;
use crate::cli::ContextArgs;
use crate::commands::{build_capability, build_runtime, load_concept_list, load_corpus};
use crate::evidence::{EvidenceMode, EvidenceSelector};
use crate::model::{EvidenceBundle, SourceType};

#[derive(Debug, Serialize)]
struct ContextEntry {
    concept: String,
    bundle: EvidenceBundle,
}

pub fn run(args: ContextArgs) -> Result<()> {
    let mode = EvidenceMode::from(args.corpus.evidence_mode);
    let corpus = load_corpus(&args.corpus)?;
    let concepts = load_concept_list(&args.corpus)?;
    let selector = EvidenceSelector::new(mode).context("failed to compile sentence splitter")?;
    let capability = build_capability(&args.provider)?;

    info!(concepts = concepts.len(), mode = mode.as_str(), "selecting context");

    let runtime = build_runtime()?;
    let selected = runtime.block_on(
        stream::iter(concepts.iter())
            .map(|concept| {
                let selector = &selector;
                let corpus = &corpus;
                let capability = &capability;
                async move {
                    let mut ledger = UsageLedger::default();
                    let bundle = selector
                        .select(concept, corpus, capability, &mut ledger)
                        .await;
                    (
                        ContextEntry {
                            concept: concept.text.clone(),
                            bundle,
                        },
                        ledger,
                    )
                }
            })
            .buffered(args.provider.max_in_flight.max(1))
            .collect::<Vec<(ContextEntry, UsageLedger)>>(),
    );

    let mut usage = UsageLedger::default();
    let mut entries = Vec::with_capacity(selected.len());
    for (entry, ledger) in selected {
        usage.merge(&ledger);
        entries.push(entry);
    }

    let mut output: Box<dyn Write> = match &args.output_path {
        Some(path) => Box::new(io::BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::BufWriter::new(io::stdout().lock())),
    };
    if args.json {
        serde_json::to_writer_pretty(&mut output, &entries)
            .context("failed to serialize context json output")?;
        writeln!(output)?;
    } else {
        output.write_all(render_context(&entries).as_bytes())?;
    }
    output.flush()?;

    let total = usage.total();
    info!(
        concepts = entries.len(),
        calls = total.calls,
        total_tokens = total.total_tokens,
        "context selection finished"
    );
    Ok(())
}

fn render_context(entries: &[ContextEntry]) -> String {
    let or_none = |value: &str| {
        if value.trim().is_empty() {
            "(none)".to_string()
        } else {
            value.to_string()
        }
    };

    let mut lines = Vec::new();
    for entry in entries {
        let bundle = &entry.bundle;
        lines.push(format!("### Concept: {}", entry.concept));
        lines.push(format!("Selection notes: {}", or_none(&bundle.selection_notes)));
        let types = bundle
            .types_present
            .iter()
            .map(|value| value.as_str())
            .collect::<Vec<&str>>()
            .join(", ");
        lines.push(format!("Types present: {}", or_none(&types)));
        lines.push(String::new());

        if !bundle.top_sources.is_empty() {
            lines.push("Top sources:".to_string());
            for source in &bundle.top_sources {
                match source.source_type {
                    SourceType::Quant => {
                        let value = source
                            .value
                            .map(|value| format!("value={value:.4}"))
                            .unwrap_or_default();
                        lines.push(format!(
                            "- [quant] {} | {} | {} {value} | relevance={:.2}",
                            source.file, source.question, source.option, source.relevance
                        ));
                    }
                    SourceType::Qual => lines.push(format!(
                        "- [qual] {} | relevance={:.2} | {}",
                        source.file, source.relevance, source.excerpt
                    )),
                }
            }
            lines.push(String::new());
        }

        lines.push("Quantitative summary:".to_string());
        lines.push(or_none(&bundle.quant_summary));
        lines.push(String::new());
        lines.push("Qualitative summary:".to_string());
        lines.push(or_none(&bundle.textual_summary));
        lines.push(String::new());
        if bundle.weight_hints.is_empty() {
            lines.push("Weight hints: (none)".to_string());
        } else {
            lines.push("Weight hints:".to_string());
            lines.extend(bundle.weight_hints.iter().map(|hint| format!("- {hint}")));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}
