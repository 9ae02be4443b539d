//! Test corpus loading.
//!
//! A corpus file holds any number of levels, each introduced by a marker line
//! `;LEVEL <n>`. Everything up to the next marker (or end of file) is the
//! level's board text. Text before the first marker is ignored.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::InstanceLimit;

const MARKER: &str = ";LEVEL";

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("failed to read corpus {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: level marker has no numeric identifier: {text:?}")]
    BadMarker { line: usize, text: String },

    #[error("line {line}: level {identifier} appears more than once")]
    DuplicateLevel { line: usize, identifier: u32 },

    #[error("corpus contains no levels")]
    NoInstances,
}

/// One level of the corpus, immutable once read
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuzzleInstance {
    pub identifier: u32,
    pub raw_text: String,
}

impl PuzzleInstance {
    pub fn new(identifier: u32, raw_text: impl Into<String>) -> Self {
        Self {
            identifier,
            raw_text: raw_text.into(),
        }
    }

    /// The bytes written to the solver's stdin: the board without surrounding
    /// blank lines, one newline, then the `;` terminator line.
    pub fn solver_input(&self) -> String {
        let board = self.raw_text.trim_matches('\n');
        let mut input = String::with_capacity(board.len() + 3);
        input.push_str(board);
        input.push_str("\n;\n");
        input
    }
}

/// Split corpus text into levels, in file order
pub fn parse_corpus(text: &str) -> Result<Vec<PuzzleInstance>, CorpusError> {
    let text = text.replace('\r', "");
    let mut instances = Vec::new();
    let mut seen = HashSet::new();
    let mut current: Option<(u32, Vec<&str>)> = None;

    for (index, line) in text.lines().enumerate() {
        let Some(rest) = line.strip_prefix(MARKER) else {
            if let Some((_, lines)) = current.as_mut() {
                lines.push(line);
            }
            continue;
        };

        let identifier = rest
            .trim()
            .parse::<u32>()
            .map_err(|_| CorpusError::BadMarker {
                line: index + 1,
                text: line.to_string(),
            })?;
        if !seen.insert(identifier) {
            return Err(CorpusError::DuplicateLevel {
                line: index + 1,
                identifier,
            });
        }

        if let Some((id, lines)) = current.take() {
            push_section(&mut instances, id, &lines);
        }
        current = Some((identifier, Vec::new()));
    }

    if let Some((id, lines)) = current.take() {
        push_section(&mut instances, id, &lines);
    }

    if instances.is_empty() {
        return Err(CorpusError::NoInstances);
    }
    Ok(instances)
}

fn push_section(instances: &mut Vec<PuzzleInstance>, identifier: u32, lines: &[&str]) {
    let raw_text = lines.join("\n");
    if raw_text.trim().is_empty() {
        tracing::debug!(level = identifier, "skipping empty level");
        return;
    }
    instances.push(PuzzleInstance::new(identifier, raw_text));
}

/// Read and split a corpus file, keeping at most `limit` levels
pub fn load_corpus(path: &Path, limit: InstanceLimit) -> Result<Vec<PuzzleInstance>, CorpusError> {
    let text = fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut instances = parse_corpus(&text)?;
    if let InstanceLimit::Count(n) = limit {
        instances.truncate(n);
    }
    tracing::info!(path = %path.display(), levels = instances.len(), "loaded corpus");
    Ok(instances)
}
