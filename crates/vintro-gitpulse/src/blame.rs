//! Line attribution against the parent of a patch commit.
//!
//! The fix removed or rewrote some lines; whoever last touched those lines
//! *before* the fix is a candidate for having introduced the bug. All
//! lookups run against the first parent, so the file is seen as it was
//! right before the fix landed.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use vintro_core::{CommitId, VintroError};
use vintro_difflens::select::AttributionTarget;

use crate::repo::{BlameLine, RepositoryHandle};

/// One target line matched in the parent revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct BlameRecord {
    /// Target line text that matched.
    pub line: String,
    /// Commit the matching blame line is attributed to.
    pub commit: CommitId,
}

/// Everything blame found for one file.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileAttribution {
    /// Revision the blame ran against.
    pub revision: Option<CommitId>,
    /// Every (line, commit) match, deduplicated.
    pub records: BTreeSet<BlameRecord>,
    /// Distinct commits across all records.
    pub commits: BTreeSet<CommitId>,
}

impl FileAttribution {
    /// Target lines that found at least one blame match.
    pub fn matched_lines(&self) -> BTreeSet<&str> {
        self.records.iter().map(|r| r.line.as_str()).collect()
    }
}

/// Why a file produced no attribution. Each of these means "zero evidence
/// for this file", never a failure of the whole patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupMiss {
    /// The patch commit has no parent.
    RootCommit,
    /// The file did not exist in the parent revision.
    MissingFile {
        /// Revision that lacked the file.
        revision: CommitId,
    },
    /// Any other history query failure.
    History(String),
}

impl fmt::Display for LookupMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupMiss::RootCommit => f.write_str("patch commit is a root commit"),
            LookupMiss::MissingFile { revision } => {
                write!(f, "file does not exist at {}", revision.short())
            }
            LookupMiss::History(msg) => write!(f, "history query failed: {msg}"),
        }
    }
}

/// Attribute `target` lines of `path` as of the parent of `patch_commit`.
///
/// Exact matches on trimmed content come first. A target line that matched
/// nothing exactly falls back to substring matching, but only when it is at
/// least `substring_min_len` characters long; shorter lines such as `}` or
/// `break;` would otherwise match half the file.
///
/// # Errors
///
/// Returns a [`LookupMiss`] when the parent cannot be determined, the file
/// is absent there, or the blame query fails. A warning is logged; callers
/// treat this as zero evidence for the file.
pub fn resolve_file<R: RepositoryHandle + ?Sized>(
    repo: &R,
    path: &str,
    target: &AttributionTarget,
    patch_commit: &CommitId,
    substring_min_len: usize,
) -> Result<FileAttribution, LookupMiss> {
    let miss = |reason: LookupMiss| {
        warn!(commit = %patch_commit.short(), file = path, %reason, "no blame evidence");
        reason
    };

    let parents = repo
        .parents(patch_commit)
        .map_err(|e| miss(LookupMiss::History(e.to_string())))?;
    let Some(parent) = parents.into_iter().next() else {
        return Err(miss(LookupMiss::RootCommit));
    };

    let blame = match repo.blame_file(path, &parent) {
        Ok(lines) => lines,
        Err(VintroError::MissingFile { .. }) => {
            return Err(miss(LookupMiss::MissingFile { revision: parent }))
        }
        Err(e) => return Err(miss(LookupMiss::History(e.to_string()))),
    };

    let records = match_lines(&blame, target, substring_min_len);
    let commits = records.iter().map(|r| r.commit.clone()).collect();
    debug!(
        commit = %patch_commit.short(),
        file = path,
        targets = target.len(),
        matches = records.len(),
        "blame matched"
    );

    Ok(FileAttribution {
        revision: Some(parent),
        records,
        commits,
    })
}

/// Match target lines against blamed lines.
pub fn match_lines(
    blame: &[BlameLine],
    target: &AttributionTarget,
    substring_min_len: usize,
) -> BTreeSet<BlameRecord> {
    let mut records = BTreeSet::new();
    let mut exact_hits: BTreeSet<&str> = BTreeSet::new();

    for line in blame {
        let trimmed = line.content.trim();
        if let Some(hit) = target.lines.get(trimmed) {
            exact_hits.insert(hit.as_str());
            records.insert(BlameRecord {
                line: hit.clone(),
                commit: line.commit.clone(),
            });
        }
    }

    for wanted in &target.lines {
        if exact_hits.contains(wanted.as_str()) || wanted.chars().count() < substring_min_len {
            continue;
        }
        for line in blame {
            if line.content.contains(wanted.as_str()) {
                records.insert(BlameRecord {
                    line: wanted.clone(),
                    commit: line.commit.clone(),
                });
            }
        }
    }

    records.retain(|r| !r.commit.is_empty());
    records
}

/// Parse the default output of `git blame -l`.
///
/// Each line looks like `<hash> [<file>] (<author> <date> <lineno>) <text>`.
/// Boundary commits carry a leading `^`, which [`CommitId`] strips. Lines
/// that do not fit the shape are skipped.
///
/// # Examples
///
/// ```
/// use vintro_gitpulse::blame::parse_blame_output;
///
/// let out = "^abc1230000000000000000000000000000000000 (Jane 2019-06-04 10:12:44 +0200 1) int x = 1;\n";
/// let lines = parse_blame_output(out);
/// assert_eq!(lines[0].commit.as_str(), "abc1230000000000000000000000000000000000");
/// assert_eq!(lines[0].content, "int x = 1;");
/// ```
pub fn parse_blame_output(output: &str) -> Vec<BlameLine> {
    output.lines().filter_map(parse_blame_line).collect()
}

fn parse_blame_line(line: &str) -> Option<BlameLine> {
    let (hash, rest) = line.split_once(' ')?;
    let commit = CommitId::new(hash);
    if !commit.is_well_formed() {
        return None;
    }

    // The metadata block ends at the first ") " preceded by a line number.
    for (idx, _) in rest.match_indices(')') {
        let head = &rest[..idx];
        let Some(number) = head.rsplit(' ').next() else {
            continue;
        };
        let Ok(line_number) = number.parse::<usize>() else {
            continue;
        };
        let tail = &rest[idx + 1..];
        let content = tail.strip_prefix(' ').unwrap_or(tail);
        return Some(BlameLine {
            line_number,
            content: content.to_string(),
            commit,
        });
    }
    None
}
