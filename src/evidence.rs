//! Citations and claim-support validation.
//!
//! A citation is a `path:line` reference produced by a tool. The envelope
//! accumulates citations across the whole request; the critic validates
//! synthesized claims against that accumulated set, never against what the
//! model remembers seeing.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;

use crate::pipeline::outputs::Claim;
use crate::tools::types::{ToolData, ToolResult};

/// A `path:line` evidence reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Citation {
    pub path: String,
    pub line: u32,
}

impl Citation {
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            path: path.into(),
            line,
        }
    }
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.path, self.line)
    }
}

impl From<Citation> for String {
    fn from(c: Citation) -> Self {
        c.to_string()
    }
}

impl FromStr for Citation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split on the last colon so Windows-style prefixes survive.
        let (path, line) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("not a path:line citation: {s:?}"))?;
        if path.is_empty() {
            return Err(format!("empty path in citation: {s:?}"));
        }
        let line: u32 = line
            .parse()
            .map_err(|_| format!("invalid line number in citation: {s:?}"))?;
        Ok(Self {
            path: path.to_string(),
            line,
        })
    }
}

impl TryFrom<String> for Citation {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Ordered, stably de-duplicated set of citations.
///
/// Iteration order is the order citations were first observed; inserting an
/// already-present citation is a no-op.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(into = "Vec<Citation>", from = "Vec<Citation>")]
pub struct CitationSet {
    items: Vec<Citation>,
    seen: HashSet<Citation>,
}

impl CitationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a citation, returning true if it was not already present.
    pub fn insert(&mut self, citation: Citation) -> bool {
        if self.seen.contains(&citation) {
            return false;
        }
        self.seen.insert(citation.clone());
        self.items.push(citation);
        true
    }

    /// Insert many citations, returning how many were new.
    pub fn extend(&mut self, citations: impl IntoIterator<Item = Citation>) -> usize {
        citations
            .into_iter()
            .filter(|c| self.insert(c.clone()))
            .count()
    }

    pub fn contains(&self, citation: &Citation) -> bool {
        self.seen.contains(citation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Citation> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Distinct paths in first-observed order.
    pub fn paths(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .map(|c| c.path.as_str())
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Render as one `path:line` per line, for inlining into critic prompts.
    pub fn as_listing(&self) -> String {
        self.items
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl From<CitationSet> for Vec<Citation> {
    fn from(set: CitationSet) -> Self {
        set.items
    }
}

impl From<Vec<Citation>> for CitationSet {
    fn from(items: Vec<Citation>) -> Self {
        let mut set = CitationSet::new();
        set.extend(items);
        set
    }
}

/// Extract citations from a tool result's data payload.
///
/// Search-style results cite each match's path and line; file slices cite the
/// first line of the returned range. Candidate lists and raw text carry no
/// line knowledge and yield nothing.
pub fn extract_citations(result: &ToolResult) -> Vec<Citation> {
    match &result.data {
        ToolData::Matches(matches) => matches
            .iter()
            .map(|m| Citation::new(m.path.clone(), m.line))
            .collect(),
        ToolData::Slice(slice) => vec![Citation::new(slice.path.clone(), slice.start_line)],
        ToolData::Candidates(_)
        | ToolData::Entries(_)
        | ToolData::Text(_)
        | ToolData::Tools(_)
        | ToolData::None => Vec::new(),
    }
}

/// Outcome of checking claims against the accumulated citation set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupportReport {
    /// Claims whose citations are all present in the set (and non-empty).
    pub supported: Vec<Claim>,
    /// Claims with no citations, or citing something never observed.
    pub unsupported: Vec<Claim>,
    /// Citations referenced by claims but absent from the set.
    pub missing_evidence: Vec<Citation>,
}

impl SupportReport {
    pub fn all_supported(&self) -> bool {
        self.unsupported.is_empty()
    }
}

/// Validate each claim against the accumulated citation set.
///
/// A claim is supported iff it carries at least one citation and every
/// citation it carries appears in `set`.
pub fn validate_claims(claims: &[Claim], set: &CitationSet) -> SupportReport {
    let mut report = SupportReport::default();
    let mut missing = HashSet::new();

    for claim in claims {
        if claim.supporting_citations.is_empty() {
            report.unsupported.push(claim.clone());
            continue;
        }
        let absent: Vec<&Citation> = claim
            .supporting_citations
            .iter()
            .filter(|c| !set.contains(c))
            .collect();
        if absent.is_empty() {
            report.supported.push(claim.clone());
        } else {
            for c in &absent {
                if missing.insert((*c).clone()) {
                    report.missing_evidence.push((*c).clone());
                }
            }
            report.unsupported.push(claim.clone());
        }
    }

    report
}
