//! Attributing one parsed patch: select targets, blame the parent, prune to
//! ancestors, then merge the survivors across files.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::debug;
use vintro_core::{CommitId, ResolveConfig};
use vintro_difflens::filter::{PathFilter, SkippedFile};
use vintro_difflens::parser::FileChange;
use vintro_difflens::select::select_targets;
use vintro_gitpulse::ancestry::filter_candidates;
use vintro_gitpulse::blame::resolve_file;
use vintro_gitpulse::repo::RepositoryHandle;

use crate::store::FileEvidence;

/// Introducing commits for one patch, with the evidence behind them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchAttribution {
    /// Deduplicated strict ancestors of the patch commit.
    pub introducing_commits: BTreeSet<CommitId>,
    /// Evidence per attributed file, keyed by post-change path.
    pub files: BTreeMap<String, FileEvidence>,
    /// Files excluded by path rules.
    pub skipped: Vec<SkippedFile>,
}

impl PatchAttribution {
    /// Files that contributed at least one introducing commit.
    pub fn malicious_files(&self) -> Vec<String> {
        self.files
            .iter()
            .filter(|(_, ev)| !ev.introducing_commits.is_empty())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Whether any file's targets came from the context fallback.
    pub fn used_context_lines(&self) -> bool {
        self.files.values().any(|ev| ev.used_context_lines)
    }
}

/// Attribute every file of a patch against `repo`.
///
/// Per-file misses (root commit, file absent in the parent, failed history
/// query) are recorded on that file's evidence and never stop the rest.
/// `patch_commit` should already be resolved to a full id.
pub fn attribute_patch<R: RepositoryHandle + ?Sized>(
    repo: &R,
    files: Vec<FileChange>,
    patch_commit: &CommitId,
    config: &ResolveConfig,
    filter: &PathFilter,
) -> PatchAttribution {
    let (kept, skipped) = filter.partition(files);
    for skip in &skipped {
        debug!(commit = %patch_commit.short(), file = %skip.path, reason = %skip.reason, "file skipped");
    }

    let mut out = PatchAttribution {
        skipped,
        ..PatchAttribution::default()
    };

    for change in kept {
        let target = select_targets(&change, config.context_window);
        let mut evidence = FileEvidence {
            removed_lines: change.removed_lines.clone(),
            added_lines: change.added_lines.clone(),
            target_lines: target.lines.iter().cloned().collect(),
            used_context_lines: target.used_context_lines,
            ..FileEvidence::default()
        };

        if target.is_empty() {
            evidence.miss = Some("no lines to attribute".into());
            out.files.insert(change.path, evidence);
            continue;
        }

        match resolve_file(
            repo,
            change.pre_change_path(),
            &target,
            patch_commit,
            config.substring_min_len,
        ) {
            Ok(found) => {
                evidence.matched_lines = found.matched_lines().into_iter().map(str::to_string).collect();
                let kept = filter_candidates(repo, &found.commits, patch_commit);
                out.introducing_commits.extend(kept.iter().cloned());
                evidence.introducing_commits = kept.into_iter().collect();
            }
            Err(miss) => evidence.miss = Some(miss.to_string()),
        }
        out.files.insert(change.path, evidence);
    }

    out
}
