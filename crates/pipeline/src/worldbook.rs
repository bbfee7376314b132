//! World-book entry activation.
//!
//! `keyword` entries fire when one of their keys appears in a history
//! message inside the entry's depth window, and, if secondary keys are
//! listed, one of those too. `always` entries fire without a key, but one
//! that sets `min_depth` or `max_depth` still needs a history message
//! inside that window. `vector` entries are reported as skipped.

use loomweave_assets::{Activation, BookEntry, EntryPosition, WorldBookEntry};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A history message as seen by the keyword scanner.
#[derive(Debug, Clone)]
pub struct ScanItem<'a> {
    pub text: &'a str,
    /// 0 = newest
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivationReason {
    Always,
    Keyword { key: String, depth: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    /// Vector retrieval is not implemented
    VectorUnsupported,
    /// No history message falls inside the entry's depth window
    OutOfWindow,
}

/// Reported in a build result for every entry that fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivatedEntry {
    pub book: String,
    pub uid: String,
    #[serde(default)]
    pub comment: String,
    pub position: EntryPosition,
    pub reason: ActivationReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub book: String,
    pub uid: String,
    #[serde(default)]
    pub comment: String,
    pub reason: SkipReason,
}

/// An entry that fired, with everything the assembler needs.
#[derive(Debug, Clone)]
pub struct FiredEntry {
    pub book: String,
    pub entry: WorldBookEntry,
    pub reason: ActivationReason,
}

impl FiredEntry {
    pub fn report(&self) -> ActivatedEntry {
        ActivatedEntry {
            book: self.book.clone(),
            uid: self.entry.uid.clone(),
            comment: self.entry.comment.clone(),
            position: self.entry.position,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    pub fired: Vec<FiredEntry>,
    pub skipped: Vec<SkippedEntry>,
}

/// Decide which entries fire against `history`.
pub fn activate(entries: &[BookEntry], history: &[ScanItem<'_>], scan_depth: usize) -> ActivationReport {
    let mut report = ActivationReport::default();
    for BookEntry { book, entry } in entries {
        let skip = |reason| SkippedEntry {
            book: book.clone(),
            uid: entry.uid.clone(),
            comment: entry.comment.clone(),
            reason,
        };
        if !entry.enabled {
            report.skipped.push(skip(SkipReason::Disabled));
            continue;
        }
        let reason = match entry.activation {
            Activation::Always if has_window(entry) && window(entry, history, scan_depth).is_empty() => {
                report.skipped.push(skip(SkipReason::OutOfWindow));
                continue;
            }
            Activation::Always => Some(ActivationReason::Always),
            Activation::Vector => {
                report.skipped.push(skip(SkipReason::VectorUnsupported));
                continue;
            }
            Activation::Keyword => keyword_match(entry, history, scan_depth),
        };
        if let Some(reason) = reason {
            debug!(book = %book, uid = %entry.uid, ?reason, "World-book entry fired");
            report.fired.push(FiredEntry {
                book: book.clone(),
                entry: entry.clone(),
                reason,
            });
        }
    }
    report
}

fn has_window(entry: &WorldBookEntry) -> bool {
    entry.min_depth.is_some() || entry.max_depth.is_some()
}

/// History messages inside `[min_depth, max_depth]`, defaulting to the
/// newest `scan_depth` messages.
fn window<'h, 'a>(
    entry: &WorldBookEntry,
    history: &'h [ScanItem<'a>],
    scan_depth: usize,
) -> Vec<&'h ScanItem<'a>> {
    let lo = entry.min_depth.unwrap_or(0);
    let hi = entry.max_depth.unwrap_or(scan_depth.saturating_sub(1));
    history
        .iter()
        .filter(|item| item.depth >= lo && item.depth <= hi)
        .collect()
}

fn keyword_match(
    entry: &WorldBookEntry,
    history: &[ScanItem<'_>],
    scan_depth: usize,
) -> Option<ActivationReason> {
    let window = window(entry, history, scan_depth);
    if window.is_empty() {
        return None;
    }

    let primary = entry
        .keys
        .iter()
        .map(|key| KeyMatcher::new(key, entry.case_sensitive))
        .find_map(|matcher| {
            let matcher = matcher?;
            window
                .iter()
                .find(|item| matcher.is_match(item.text))
                .map(|item| (matcher.key.clone(), item.depth))
        })?;

    if !entry.secondary_keys.is_empty() {
        let secondary = entry
            .secondary_keys
            .iter()
            .filter_map(|key| KeyMatcher::new(key, entry.case_sensitive))
            .any(|matcher| window.iter().any(|item| matcher.is_match(item.text)));
        if !secondary {
            return None;
        }
    }

    Some(ActivationReason::Keyword {
        key: primary.0,
        depth: primary.1,
    })
}

/// A plain substring key, or a `/pattern/flags` regex key.
struct KeyMatcher {
    key: String,
    kind: KeyKind,
}

enum KeyKind {
    Plain { needle: String, case_sensitive: bool },
    Pattern(Regex),
}

impl KeyMatcher {
    fn new(key: &str, case_sensitive: bool) -> Option<Self> {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return None;
        }
        let kind = match parse_regex_key(trimmed) {
            Some((pattern, flags)) => {
                let flags: String = flags.chars().filter(|c| "imsx".contains(*c)).collect();
                let source = if flags.is_empty() {
                    pattern.to_string()
                } else {
                    format!("(?{flags}){pattern}")
                };
                match Regex::new(&source) {
                    Ok(re) => KeyKind::Pattern(re),
                    Err(e) => {
                        warn!(key, error = %e, "Ignoring invalid world-book key pattern");
                        return None;
                    }
                }
            }
            None => KeyKind::Plain {
                needle: if case_sensitive {
                    trimmed.to_string()
                } else {
                    trimmed.to_lowercase()
                },
                case_sensitive,
            },
        };
        Some(Self {
            key: key.to_string(),
            kind,
        })
    }

    fn is_match(&self, text: &str) -> bool {
        match &self.kind {
            KeyKind::Plain {
                needle,
                case_sensitive: true,
            } => text.contains(needle.as_str()),
            KeyKind::Plain { needle, .. } => text.to_lowercase().contains(needle.as_str()),
            KeyKind::Pattern(re) => re.is_match(text),
        }
    }
}

fn parse_regex_key(key: &str) -> Option<(&str, &str)> {
    let body = key.strip_prefix('/')?;
    let end = body.rfind('/')?;
    let (pattern, flags) = (&body[..end], &body[end + 1..]);
    if pattern.is_empty() || !flags.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((pattern, flags))
}
