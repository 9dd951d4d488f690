//! Pruning blame candidates to true ancestors of the patch commit.
//!
//! Blame can name commits that are not behind the fix: boundary markers
//! from shallow history, commits merged in from a side branch after the
//! fix, or the fix itself when a line survived unchanged. Only strict
//! ancestors are kept.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};
use vintro_core::CommitId;

use crate::repo::RepositoryHandle;

/// Outcome of checking one candidate against the patch commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "detail", rename_all = "snake_case")]
pub enum AncestryVerdict {
    /// A strict ancestor, with its full resolved id.
    Included(CommitId),
    /// The candidate is the patch commit itself.
    SelfReference,
    /// The candidate does not name any commit in the repository.
    Unresolvable,
    /// The candidate resolves but is not behind the patch commit.
    NotAncestor,
    /// The ancestry query itself failed.
    QueryFailed(String),
}

impl AncestryVerdict {
    /// The resolved id, if the candidate was included.
    pub fn included(self) -> Option<CommitId> {
        match self {
            AncestryVerdict::Included(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for AncestryVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AncestryVerdict::Included(id) => write!(f, "included as {}", id.short()),
            AncestryVerdict::SelfReference => f.write_str("is the patch commit"),
            AncestryVerdict::Unresolvable => f.write_str("does not resolve"),
            AncestryVerdict::NotAncestor => f.write_str("not an ancestor"),
            AncestryVerdict::QueryFailed(msg) => write!(f, "ancestry query failed: {msg}"),
        }
    }
}

/// Decide whether `candidate` belongs in the introducing set of
/// `patch_commit`.
///
/// Unresolvable candidates are dropped quietly since they mostly come from
/// boundary placeholders. A failed ancestry query is logged as a warning
/// and treated as exclusion.
pub fn check_candidate<R: RepositoryHandle + ?Sized>(
    repo: &R,
    candidate: &CommitId,
    patch_commit: &CommitId,
) -> AncestryVerdict {
    if candidate.same_commit(patch_commit) {
        return AncestryVerdict::SelfReference;
    }

    let resolved = match repo.resolve_commit(candidate.as_str()) {
        Ok(id) => id,
        Err(_) => {
            debug!(candidate = %candidate, "candidate does not resolve");
            return AncestryVerdict::Unresolvable;
        }
    };
    if resolved.same_commit(patch_commit) {
        return AncestryVerdict::SelfReference;
    }

    match repo.is_ancestor(&resolved, patch_commit) {
        Ok(true) => AncestryVerdict::Included(resolved),
        Ok(false) => AncestryVerdict::NotAncestor,
        Err(e) => {
            warn!(
                candidate = %resolved.short(),
                commit = %patch_commit.short(),
                error = %e,
                "ancestry query failed"
            );
            AncestryVerdict::QueryFailed(e.to_string())
        }
    }
}

/// Keep only the candidates that are strict ancestors of `patch_commit`,
/// as full resolved ids.
pub fn filter_candidates<'a, R, I>(repo: &R, candidates: I, patch_commit: &CommitId) -> BTreeSet<CommitId>
where
    R: RepositoryHandle + ?Sized,
    I: IntoIterator<Item = &'a CommitId>,
{
    candidates
        .into_iter()
        .filter_map(|candidate| {
            let verdict = check_candidate(repo, candidate, patch_commit);
            debug!(candidate = %candidate.short(), %verdict, "ancestry verdict");
            verdict.included()
        })
        .collect()
}
