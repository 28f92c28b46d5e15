//! Pruning engine: drops baseline records whose file is gone.
//!
//! Pattern syntax is a path glob: `*` matches within one component, `**`
//! across components (`**/` may match nothing), `?` one non-separator
//! character. `[abc]`, `[a-z]` and the negated `[!x]` (or `[^x]`) match one
//! non-separator character from a set; a `]` right after the opening bracket
//! is a member, and a `[` with no closing bracket is literal. Everything else
//! is literal. A record is pruned only when
//! `symlink_metadata` reports `NotFound`, so dangling symlinks and paths we
//! merely cannot stat are kept.

#![allow(missing_docs)]

use std::fs;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Instant;

use regex::Regex;
use serde::Serialize;

use crate::core::errors::{BrsError, Result};
use crate::core::signals::SignalHandler;
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle};
use crate::scanner::progress::PruneProgress;
use crate::store::{FileRecord, SharedStore};

// ──────────────────── pattern ────────────────────

/// Compiled path glob.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(BrsError::InvalidPattern {
                pattern: String::new(),
                details: "pattern is empty".to_string(),
            });
        }
        Ok(Self {
            source: pattern.to_string(),
            regex: glob_to_regex(pattern)?,
        })
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut regex_str = String::with_capacity(pattern.len() * 2);
    regex_str.push('^');

    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    regex_str.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    regex_str.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                regex_str.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                regex_str.push_str("[^/]");
                i += 1;
            }
            '[' => {
                if let Some((class, next)) = bracket_class(&chars, i + 1) {
                    regex_str.push_str(&class);
                    i = next;
                } else {
                    regex_str.push_str(r"\[");
                    i += 1;
                }
            }
            c => {
                let mut buf = [0u8; 4];
                regex_str.push_str(&regex::escape(c.encode_utf8(&mut buf)));
                i += 1;
            }
        }
    }
    regex_str.push('$');

    Regex::new(&regex_str).map_err(|err| BrsError::InvalidPattern {
        pattern: pattern.to_string(),
        details: err.to_string(),
    })
}

/// Translate the class whose body starts at `start` (just past `[`).
/// Returns the regex class and the index past the closing `]`, or `None`
/// when the class is never closed. Classes never match `/`.
fn bracket_class(chars: &[char], start: usize) -> Option<(String, usize)> {
    let mut end = start;
    let negated = matches!(chars.get(end), Some('!' | '^'));
    if negated {
        end += 1;
    }
    let body_start = end;
    if chars.get(end) == Some(&']') {
        end += 1;
    }
    while chars.get(end).is_some_and(|&c| c != ']') {
        end += 1;
    }
    if end >= chars.len() {
        return None;
    }

    let members = &chars[body_start..end];
    let mut body = String::with_capacity(members.len() * 2);
    for (k, &c) in members.iter().enumerate() {
        // Interior `-` is a range; at either edge it is a member.
        if c == '-' && k > 0 && k + 1 < members.len() {
            body.push('-');
        } else {
            let mut buf = [0u8; 4];
            body.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
    }

    let class = if negated {
        format!("[^/{body}]")
    } else {
        format!("[{body}&&[^/]]")
    };
    Some((class, end + 1))
}

// ──────────────────── pruner ────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub pattern: String,
    /// Records whose path matched the pattern.
    pub matched: u64,
    /// Paths whose records were deleted.
    pub pruned: Vec<String>,
    /// Matched records kept because their path could not be checked.
    pub unverifiable: u64,
    pub duration_ms: u64,
    pub interrupted: bool,
}

impl PruneReport {
    #[must_use]
    pub fn pruned_count(&self) -> u64 {
        self.pruned.len() as u64
    }
}

pub struct Pruner {
    store: SharedStore,
    logger: ActivityLoggerHandle,
    progress: Arc<PruneProgress>,
}

impl Pruner {
    pub fn new(store: SharedStore, logger: ActivityLoggerHandle, progress: Arc<PruneProgress>) -> Self {
        Self {
            store,
            logger,
            progress,
        }
    }

    /// Remove records matching `pattern` whose path no longer exists.
    ///
    /// The iteration counter is never touched and nothing is hashed.
    pub fn prune(&self, pattern: &PathPattern, signals: &SignalHandler) -> Result<PruneReport> {
        let started = Instant::now();
        let candidates = self
            .store
            .lock()
            .for_each(|record| pattern.matches(&record.path))?;
        self.progress.set_total(candidates.len() as u64);

        let mut report = PruneReport {
            pattern: pattern.as_str().to_string(),
            matched: candidates.len() as u64,
            pruned: Vec::new(),
            unverifiable: 0,
            duration_ms: 0,
            interrupted: false,
        };

        for record in candidates {
            if signals.is_interrupted() {
                report.interrupted = true;
                break;
            }
            let pruned = self.prune_one(&record, &mut report);
            self.progress.record(pruned);
        }

        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as u64;
        report.duration_ms = duration_ms;
        self.logger.send(ActivityEvent::PruneCompleted {
            pattern: report.pattern.clone(),
            examined: self.progress.snapshot().processed,
            pruned: report.pruned_count(),
            duration_ms,
            interrupted: report.interrupted,
        });
        Ok(report)
    }

    fn prune_one(&self, record: &FileRecord, report: &mut PruneReport) -> bool {
        match fs::symlink_metadata(&record.path) {
            Ok(_) => false,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                match self.store.lock().delete(record.id) {
                    Ok(deleted) => {
                        if deleted {
                            self.logger.send(ActivityEvent::RecordPruned {
                                path: record.path.clone(),
                            });
                            report.pruned.push(record.path.clone());
                        }
                        deleted
                    }
                    Err(err) => {
                        self.logger.send(ActivityEvent::StoreError {
                            path: Some(record.path.clone()),
                            code: err.code().to_string(),
                            message: err.to_string(),
                        });
                        false
                    }
                }
            }
            Err(source) => {
                let err = BrsError::io(&record.path, source);
                self.logger.send(ActivityEvent::Error {
                    code: err.code().to_string(),
                    message: format!("kept record, existence unknown: {err}"),
                });
                report.unverifiable += 1;
                false
            }
        }
    }
}
