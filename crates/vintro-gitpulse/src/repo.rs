//! Repository handle: the history queries attribution needs.
//!
//! [`RepositoryHandle`] is the seam between attribution logic and git. The
//! production implementation, [`GitRepository`], answers everything through
//! git2 except blame, which can optionally shell out to `git blame` for
//! parity with the command-line tool's copy and move detection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use git2::{BlameOptions, ErrorCode, Oid, Repository};
use serde::Serialize;
use tracing::debug;
use vintro_core::{BlameBackend, CommitId, VintroError};

use crate::blame::parse_blame_output;
use crate::mining::{describe_commit, render_patch, CommitInfo};

/// One line of a file as of some revision, with the commit that last
/// touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameLine {
    /// 1-based line number in the blamed revision.
    pub line_number: usize,
    /// Line text without the trailing newline.
    pub content: String,
    /// Commit that last modified the line, already normalized.
    pub commit: CommitId,
}

/// History queries against one repository.
///
/// Every method fails explicitly rather than returning an empty answer, so
/// callers decide what a miss means.
pub trait RepositoryHandle {
    /// Resolve a revision string (full or abbreviated hash, ref name) to a
    /// full commit id.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::UnknownRevision`] if nothing matches or the
    /// object is not a commit.
    fn resolve_commit(&self, revision: &str) -> Result<CommitId, VintroError>;

    /// Parents of `commit`, first parent first. Empty for a root commit.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::UnknownRevision`] if `commit` does not resolve.
    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>, VintroError>;

    /// Whether `ancestor` is reachable from `descendant` through parent
    /// links. A commit is not its own ancestor.
    ///
    /// # Errors
    ///
    /// Returns an error if either side does not resolve.
    fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId)
        -> Result<bool, VintroError>;

    /// Per-line attribution for `path` as of `revision`.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::MissingFile`] if `path` does not exist at
    /// `revision`, [`VintroError::Git`] for any other history failure.
    fn blame_file(&self, path: &str, revision: &CommitId) -> Result<Vec<BlameLine>, VintroError>;

    /// The commit's own change as unified diff text with a mail-style header.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit does not resolve or the diff fails.
    fn commit_patch(&self, commit: &CommitId) -> Result<String, VintroError>;

    /// Author, date, message and diff statistics for a commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit does not resolve or the diff fails.
    fn commit_info(&self, commit: &CommitId) -> Result<CommitInfo, VintroError>;
}

/// A [`RepositoryHandle`] backed by a git2 repository on disk.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use vintro_gitpulse::repo::{GitRepository, RepositoryHandle};
///
/// let repo = GitRepository::open(Path::new("repo_cache/openssl")).unwrap();
/// let head = repo.resolve_commit("HEAD").unwrap();
/// println!("{} has {} parent(s)", head.short(), repo.parents(&head).unwrap().len());
/// ```
pub struct GitRepository {
    repo: Repository,
    path: PathBuf,
    backend: BlameBackend,
}

impl GitRepository {
    /// Open an existing repository with the libgit2 blame backend.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Git`] if `path` is not a git repository.
    pub fn open(path: &Path) -> Result<Self, VintroError> {
        let repo = Repository::open(path)
            .map_err(|e| VintroError::Git(format!("failed to open repository: {e}")))?;
        Ok(Self {
            repo,
            path: path.to_path_buf(),
            backend: BlameBackend::default(),
        })
    }

    /// Select which blame implementation [`RepositoryHandle::blame_file`]
    /// uses.
    pub fn with_blame_backend(mut self, backend: BlameBackend) -> Self {
        self.backend = backend;
        self
    }

    fn find_commit(&self, commit: &CommitId) -> Result<git2::Commit<'_>, VintroError> {
        self.repo
            .revparse_single(commit.as_str())
            .and_then(|obj| obj.peel_to_commit())
            .map_err(|_| VintroError::UnknownRevision(commit.to_string()))
    }

    fn oid_of(&self, commit: &CommitId) -> Result<Oid, VintroError> {
        self.find_commit(commit).map(|c| c.id())
    }

    /// Read `path` at `revision`, failing with `MissingFile` if absent.
    fn file_at(&self, path: &str, revision: &CommitId) -> Result<String, VintroError> {
        let commit = self.find_commit(revision)?;
        let tree = commit
            .tree()
            .map_err(|e| VintroError::Git(format!("failed to get commit tree: {e}")))?;
        let entry = match tree.get_path(Path::new(path)) {
            Ok(entry) => entry,
            Err(e) if e.code() == ErrorCode::NotFound => {
                return Err(VintroError::MissingFile {
                    path: path.to_string(),
                    revision: revision.to_string(),
                })
            }
            Err(e) => return Err(VintroError::Git(format!("failed to look up {path}: {e}"))),
        };
        let blob = entry
            .to_object(&self.repo)
            .and_then(|obj| obj.peel_to_blob())
            .map_err(|_| VintroError::MissingFile {
                path: path.to_string(),
                revision: revision.to_string(),
            })?;
        Ok(String::from_utf8_lossy(blob.content()).into_owned())
    }

    fn blame_libgit2(
        &self,
        path: &str,
        revision: &CommitId,
    ) -> Result<Vec<BlameLine>, VintroError> {
        let content = self.file_at(path, revision)?;
        let oid = self.oid_of(revision)?;

        let mut opts = BlameOptions::new();
        opts.newest_commit(oid);
        let blame = self
            .repo
            .blame_file(Path::new(path), Some(&mut opts))
            .map_err(|e| VintroError::Git(format!("blame failed for {path}: {e}")))?;

        let mut lines = Vec::new();
        for (idx, text) in content.lines().enumerate() {
            let line_number = idx + 1;
            let Some(hunk) = blame.get_line(line_number) else {
                debug!(file = path, line = line_number, "no blame hunk for line");
                continue;
            };
            lines.push(BlameLine {
                line_number,
                content: text.to_string(),
                commit: CommitId::new(&hunk.final_commit_id().to_string()),
            });
        }
        Ok(lines)
    }

    fn blame_cli(&self, path: &str, revision: &CommitId) -> Result<Vec<BlameLine>, VintroError> {
        // Distinguish a missing file from other failures before shelling out.
        self.file_at(path, revision)?;

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.path)
            .args(["blame", "-l", "-C", "-C", "-M"])
            .arg(revision.as_str())
            .arg("--")
            .arg(path)
            .output()
            .map_err(|e| VintroError::Git(format!("failed to run git blame: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VintroError::Git(format!(
                "git blame exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        // Boundary hashes come back one digit short; expand what resolves.
        let mut expanded: HashMap<CommitId, CommitId> = HashMap::new();
        let mut lines = parse_blame_output(&String::from_utf8_lossy(&output.stdout));
        for line in &mut lines {
            let full = expanded
                .entry(line.commit.clone())
                .or_insert_with(|| {
                    self.resolve_commit(line.commit.as_str())
                        .unwrap_or_else(|_| line.commit.clone())
                })
                .clone();
            line.commit = full;
        }
        Ok(lines)
    }
}

impl RepositoryHandle for GitRepository {
    fn resolve_commit(&self, revision: &str) -> Result<CommitId, VintroError> {
        let normalized = CommitId::new(revision);
        if normalized.is_empty() {
            return Err(VintroError::UnknownRevision(revision.to_string()));
        }
        let spec = if normalized.is_well_formed() {
            normalized.as_str().to_string()
        } else {
            revision.trim().to_string()
        };
        self.repo
            .revparse_single(&spec)
            .and_then(|obj| obj.peel_to_commit())
            .map(|c| CommitId::new(&c.id().to_string()))
            .map_err(|_| VintroError::UnknownRevision(revision.to_string()))
    }

    fn parents(&self, commit: &CommitId) -> Result<Vec<CommitId>, VintroError> {
        let commit = self.find_commit(commit)?;
        Ok(commit
            .parent_ids()
            .map(|oid| CommitId::new(&oid.to_string()))
            .collect())
    }

    fn is_ancestor(
        &self,
        ancestor: &CommitId,
        descendant: &CommitId,
    ) -> Result<bool, VintroError> {
        let ancestor = self.oid_of(ancestor)?;
        let descendant = self.oid_of(descendant)?;
        self.repo
            .graph_descendant_of(descendant, ancestor)
            .map_err(|e| VintroError::Git(format!("ancestry query failed: {e}")))
    }

    fn blame_file(&self, path: &str, revision: &CommitId) -> Result<Vec<BlameLine>, VintroError> {
        match self.backend {
            BlameBackend::Libgit2 => self.blame_libgit2(path, revision),
            BlameBackend::Cli => self.blame_cli(path, revision),
        }
    }

    fn commit_patch(&self, commit: &CommitId) -> Result<String, VintroError> {
        let commit = self.find_commit(commit)?;
        render_patch(&self.repo, &commit)
    }

    fn commit_info(&self, commit: &CommitId) -> Result<CommitInfo, VintroError> {
        let commit = self.find_commit(commit)?;
        describe_commit(&self.repo, &commit)
    }
}
