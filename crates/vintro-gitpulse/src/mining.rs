//! Commit metadata and patch rendering via git2.
//!
//! Extracts the author, date, message and per-file line counts for a single
//! commit, and renders its change as mail-style patch text.

use chrono::{DateTime, FixedOffset};
use git2::{Commit, Diff, DiffFormat, DiffOptions, Repository};
use serde::{Deserialize, Serialize};
use vintro_core::{CommitId, VintroError};

/// Descriptive data for one commit.
///
/// # Examples
///
/// ```
/// use vintro_core::CommitId;
/// use vintro_gitpulse::mining::CommitInfo;
///
/// let info = CommitInfo {
///     hash: CommitId::new("abc123"),
///     author: "alice".into(),
///     email: "alice@example.com".into(),
///     committed_date: "2019-06-04T10:12:44+02:00".into(),
///     message: "fix: header bounds".into(),
///     files_changed: vec!["src/header.c".into()],
///     insertions: 4,
///     deletions: 0,
/// };
/// assert_eq!(info.summary(), "fix: header bounds");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Full commit hash.
    pub hash: CommitId,
    /// Author name.
    pub author: String,
    /// Author email.
    pub email: String,
    /// Commit time as RFC 3339 in the committer's offset.
    pub committed_date: String,
    /// Full commit message.
    pub message: String,
    /// Paths touched by the commit.
    pub files_changed: Vec<String>,
    /// Lines added.
    pub insertions: usize,
    /// Lines removed.
    pub deletions: usize,
}

impl CommitInfo {
    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Collect [`CommitInfo`] for `commit`, diffed against its first parent.
///
/// # Errors
///
/// Returns [`VintroError::Git`] if the diff cannot be computed.
pub fn describe_commit(repo: &Repository, commit: &Commit<'_>) -> Result<CommitInfo, VintroError> {
    let diff = first_parent_diff(repo, commit)?;
    let stats = diff
        .stats()
        .map_err(|e| VintroError::Git(format!("failed to compute diff stats: {e}")))?;

    let files_changed = diff
        .deltas()
        .filter_map(|delta| {
            delta
                .new_file()
                .path()
                .or_else(|| delta.old_file().path())
                .map(|p| p.to_string_lossy().to_string())
        })
        .collect();

    let author = commit.author();
    Ok(CommitInfo {
        hash: CommitId::new(&commit.id().to_string()),
        author: author.name().unwrap_or("unknown").to_string(),
        email: author.email().unwrap_or("unknown").to_string(),
        committed_date: format_time(commit.time()),
        message: String::from_utf8_lossy(commit.message_bytes()).trim_end().to_string(),
        files_changed,
        insertions: stats.insertions(),
        deletions: stats.deletions(),
    })
}

/// Render `commit` the way `git format-patch` would: a mail header, the
/// message, then the unified diff against its first parent.
///
/// # Errors
///
/// Returns [`VintroError::Git`] if the diff cannot be computed or printed.
pub fn render_patch(repo: &Repository, commit: &Commit<'_>) -> Result<String, VintroError> {
    let diff = first_parent_diff(repo, commit)?;
    let author = commit.author();
    let message = String::from_utf8_lossy(commit.message_bytes()).to_string();
    let (subject, body) = message.split_once('\n').unwrap_or((message.as_str(), ""));

    let mut out = format!(
        "From {} Mon Sep 17 00:00:00 2001\nFrom: {} <{}>\nDate: {}\nSubject: [PATCH] {}\n\n",
        commit.id(),
        author.name().unwrap_or("unknown"),
        author.email().unwrap_or("unknown"),
        format_time(commit.author().when()),
        subject.trim(),
    );
    let body = body.trim();
    if !body.is_empty() {
        out.push_str(body);
        out.push('\n');
    }
    out.push_str("---\n");

    diff.print(DiffFormat::Patch, |_delta, _hunk, line| {
        if matches!(line.origin(), '+' | '-' | ' ') {
            out.push(line.origin());
        }
        out.push_str(&String::from_utf8_lossy(line.content()));
        true
    })
    .map_err(|e| VintroError::Git(format!("failed to print diff: {e}")))?;

    Ok(out)
}

fn first_parent_diff<'r>(repo: &'r Repository, commit: &Commit<'_>) -> Result<Diff<'r>, VintroError> {
    let commit_tree = commit
        .tree()
        .map_err(|e| VintroError::Git(format!("failed to get commit tree: {e}")))?;

    let parent_tree = if commit.parent_count() > 0 {
        let parent = commit
            .parent(0)
            .map_err(|e| VintroError::Git(format!("failed to get parent: {e}")))?;
        Some(
            parent
                .tree()
                .map_err(|e| VintroError::Git(format!("failed to get parent tree: {e}")))?,
        )
    } else {
        None
    };

    let mut diff_opts = DiffOptions::new();
    let mut diff = repo
        .diff_tree_to_tree(parent_tree.as_ref(), Some(&commit_tree), Some(&mut diff_opts))
        .map_err(|e| VintroError::Git(format!("failed to compute diff: {e}")))?;

    let mut find_opts = git2::DiffFindOptions::new();
    find_opts.renames(true);
    diff.find_similar(Some(&mut find_opts))
        .map_err(|e| VintroError::Git(format!("failed to find renames: {e}")))?;

    Ok(diff)
}

fn format_time(time: git2::Time) -> String {
    let offset = FixedOffset::east_opt(time.offset_minutes() * 60)
        .or_else(|| FixedOffset::east_opt(0));
    match (DateTime::from_timestamp(time.seconds(), 0), offset) {
        (Some(utc), Some(offset)) => utc.with_timezone(&offset).to_rfc3339(),
        _ => time.seconds().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_time_keeps_committer_offset() {
        let time = git2::Time::new(1_559_635_964, 120);
        assert_eq!(format_time(time), "2019-06-04T10:12:44+02:00");
    }

    #[test]
    fn summary_is_first_line() {
        let info = CommitInfo {
            hash: CommitId::new("abc123"),
            author: "a".into(),
            email: "a@b".into(),
            committed_date: String::new(),
            message: "subject\n\nbody".into(),
            files_changed: vec![],
            insertions: 0,
            deletions: 0,
        };
        assert_eq!(info.summary(), "subject");
    }
}
