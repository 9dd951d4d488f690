//! Consistency checks over stored records.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use vintro_core::{CommitId, VintroError};

use crate::store::{ResolutionRecord, Store};

/// A commit that shows up as both an introducing commit and a fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateFinding {
    /// The commit.
    pub commit: CommitId,
    /// CVEs it was attributed as introducing.
    pub introduced_in: Vec<String>,
    /// CVEs it fixes.
    pub fixes: Vec<String>,
}

/// What `audit` found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    /// Records read.
    pub records_scanned: usize,
    /// Commits that are both a fix and an introducing commit.
    pub duplicates: Vec<DuplicateFinding>,
    /// `(cve, patch commit)` pairs whose targets came from context lines.
    pub context_line_records: Vec<(String, CommitId)>,
    /// CVEs with records but no completeness marker.
    pub unmarked: Vec<String>,
}

impl AuditReport {
    /// Whether nothing needs attention.
    pub fn is_clean(&self) -> bool {
        self.duplicates.is_empty() && self.unmarked.is_empty()
    }
}

/// Scan every record in `store`.
///
/// # Errors
///
/// Returns [`VintroError::Io`] if the records directory cannot be listed.
pub fn audit(store: &Store) -> Result<AuditReport, VintroError> {
    let records = store.load_all_records()?;
    let mut report = summarize(&records);
    report.unmarked = store.unmarked_cves()?;
    Ok(report)
}

fn summarize(records: &[ResolutionRecord]) -> AuditReport {
    let mut introduced: BTreeMap<&CommitId, BTreeSet<&str>> = BTreeMap::new();
    let mut fixes: BTreeMap<&CommitId, BTreeSet<&str>> = BTreeMap::new();
    let mut context_line_records = Vec::new();

    for record in records {
        fixes
            .entry(&record.commit_id)
            .or_default()
            .insert(record.cve_id.as_str());
        for intro in &record.introducing_commits {
            introduced
                .entry(intro)
                .or_default()
                .insert(record.cve_id.as_str());
        }
        if record.used_context_lines {
            context_line_records.push((record.cve_id.clone(), record.commit_id.clone()));
        }
    }

    let duplicates = introduced
        .iter()
        .filter_map(|(commit, intro_cves)| {
            let fix_cves = fixes.get(commit)?;
            Some(DuplicateFinding {
                commit: (*commit).clone(),
                introduced_in: intro_cves.iter().map(|c| c.to_string()).collect(),
                fixes: fix_cves.iter().map(|c| c.to_string()).collect(),
            })
        })
        .collect();

    AuditReport {
        records_scanned: records.len(),
        duplicates,
        context_line_records,
        unmarked: Vec::new(),
    }
}
