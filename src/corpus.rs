use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{CorpusFileEntry, StructuredRecord, TextChunk};
use crate::util::sha256_hex;

pub const STRUCTURED_DIR: &str = "structured";
pub const TEXT_DIR: &str = "text";

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("corpus directory missing: {}", path.display())]
    Missing { path: PathBuf },
    #[error("no {kind} found under {}", path.display())]
    Empty { kind: &'static str, path: PathBuf },
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed record at {}:{line}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct RecordLine {
    question: String,
    option: String,
    value: f64,
}

/// Immutable evidence corpus shared by every concept of a run.
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    records: Vec<StructuredRecord>,
    chunks: Vec<TextChunk>,
    files: Vec<CorpusFileEntry>,
}

impl Corpus {
    #[cfg(test)]
    pub fn new(records: Vec<StructuredRecord>, chunks: Vec<TextChunk>) -> Self {
        Self {
            records,
            chunks,
            files: Vec::new(),
        }
    }

    pub fn load(dir: &Path) -> Result<Self, CorpusError> {
        if !dir.is_dir() {
            return Err(CorpusError::Missing {
                path: dir.to_path_buf(),
            });
        }

        let structured_dir = dir.join(STRUCTURED_DIR);
        let text_dir = dir.join(TEXT_DIR);
        let mut files = Vec::new();

        let mut records = Vec::new();
        for path in list_files(&structured_dir, "jsonl")? {
            let raw = read_file(&path)?;
            let source_file = file_name(&path);
            let before = records.len();
            parse_records(&path, &source_file, &raw, &mut records)?;
            files.push(CorpusFileEntry {
                filename: source_file,
                kind: STRUCTURED_DIR.to_string(),
                entries: records.len() - before,
                sha256: sha256_hex(raw.as_bytes()),
            });
        }
        if records.is_empty() {
            return Err(CorpusError::Empty {
                kind: "structured records",
                path: structured_dir,
            });
        }

        let mut chunks = Vec::new();
        for path in list_files(&text_dir, "txt")? {
            let raw = read_file(&path)?;
            let file = file_name(&path);
            let text = raw.trim();
            files.push(CorpusFileEntry {
                filename: file.clone(),
                kind: TEXT_DIR.to_string(),
                entries: usize::from(!text.is_empty()),
                sha256: sha256_hex(raw.as_bytes()),
            });
            if text.is_empty() {
                debug!(file = %file, "skipping empty text file");
                continue;
            }
            chunks.push(TextChunk {
                file,
                text: text.to_string(),
            });
        }
        if chunks.is_empty() {
            return Err(CorpusError::Empty {
                kind: "text chunks",
                path: text_dir,
            });
        }

        info!(
            corpus_dir = %dir.display(),
            records = records.len(),
            chunks = chunks.len(),
            files = files.len(),
            "corpus loaded"
        );

        Ok(Self {
            records,
            chunks,
            files,
        })
    }

    pub fn records(&self) -> &[StructuredRecord] {
        &self.records
    }

    pub fn chunks(&self) -> &[TextChunk] {
        &self.chunks
    }

    pub fn files(&self) -> &[CorpusFileEntry] {
        &self.files
    }
}

/// One concept per line; blank lines and `#` comments are skipped.
pub fn load_concepts(path: &Path) -> Result<Vec<String>, CorpusError> {
    if !path.is_file() {
        return Err(CorpusError::Missing {
            path: path.to_path_buf(),
        });
    }
    let concepts = parse_concepts(&read_file(path)?);
    if concepts.is_empty() {
        return Err(CorpusError::Empty {
            kind: "concepts",
            path: path.to_path_buf(),
        });
    }
    Ok(concepts)
}

pub fn parse_concepts(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn parse_records(
    path: &Path,
    source_file: &str,
    raw: &str,
    out: &mut Vec<StructuredRecord>,
) -> Result<(), CorpusError> {
    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed: RecordLine =
            serde_json::from_str(line).map_err(|source| CorpusError::Malformed {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
        out.push(StructuredRecord {
            question: parsed.question.trim().to_string(),
            option: parsed.option.trim().to_string(),
            value: parsed.value,
            source_file: source_file.to_string(),
        });
    }
    Ok(())
}

fn list_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, CorpusError> {
    if !dir.is_dir() {
        return Err(CorpusError::Missing {
            path: dir.to_path_buf(),
        });
    }
    let entries = fs::read_dir(dir).map_err(|source| CorpusError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CorpusError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let matches = path
            .extension()
            .and_then(|value| value.to_str())
            .is_some_and(|value| value.eq_ignore_ascii_case(extension));
        if path.is_file() && matches {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn read_file(path: &Path) -> Result<String, CorpusError> {
    fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|value| value.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write fixture");
    }

    #[test]
    fn load_reads_records_and_chunks_in_file_order() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "structured/b.jsonl",
            "{\"question\":\"Save\",\"option\":\"Regularly\",\"value\":0.62}\n\n",
        );
        write(
            dir.path(),
            "structured/a.jsonl",
            "{\"question\":\"Bank\",\"option\":\"Online\",\"value\":0.4}\n",
        );
        write(dir.path(), "text/notes.txt", "  Most members save for a house deposit.\n");
        write(dir.path(), "text/empty.txt", "   \n");
        write(dir.path(), "text/ignored.md", "not a chunk");

        let corpus = Corpus::load(dir.path()).expect("load");

        assert_eq!(corpus.records().len(), 2);
        assert_eq!(corpus.records()[0].source_file, "a.jsonl");
        assert_eq!(corpus.records()[1].option, "Regularly");
        assert_eq!(corpus.chunks().len(), 1);
        assert_eq!(corpus.chunks()[0].text, "Most members save for a house deposit.");
        assert_eq!(corpus.files().len(), 4);
        assert!(corpus.files().iter().all(|entry| entry.sha256.len() == 64));
    }

    #[test]
    fn load_reports_malformed_line_number() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "structured/a.jsonl",
            "{\"question\":\"Bank\",\"option\":\"Online\",\"value\":0.4}\n{\"question\":\"x\"}\n",
        );
        write(dir.path(), "text/notes.txt", "text");

        let err = Corpus::load(dir.path()).expect_err("malformed");
        assert!(matches!(err, CorpusError::Malformed { line: 2, .. }), "{err}");
    }

    #[test]
    fn load_fails_when_corpus_is_missing_or_empty() {
        let dir = TempDir::new().expect("tempdir");
        let err = Corpus::load(&dir.path().join("absent")).expect_err("missing");
        assert!(matches!(err, CorpusError::Missing { .. }));

        fs::create_dir_all(dir.path().join("structured")).expect("mkdir");
        fs::create_dir_all(dir.path().join("text")).expect("mkdir");
        let err = Corpus::load(dir.path()).expect_err("empty");
        assert!(matches!(err, CorpusError::Empty { .. }));
    }

    #[test]
    fn parse_concepts_skips_comments_and_blank_lines() {
        let concepts = parse_concepts("# header\n\nFinance: I save regularly\n  I hate to borrow  \n");
        assert_eq!(concepts, vec!["Finance: I save regularly", "I hate to borrow"]);
    }
}
