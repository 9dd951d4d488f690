//! On-disk working copies, one per repository URL.
//!
//! [`RepoCache::sync`] is get-or-create: clone when absent, otherwise fetch
//! and hard-reset to the remote default branch so blame sees the newest
//! known history. Each repository is synced at most once per process.
//! Callers serialize access to the same working copy through [`RepoLocks`].

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use git2::{build::CheckoutBuilder, Repository, ResetType};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use vintro_core::VintroError;

/// Clones and refreshes working copies under one directory.
#[derive(Debug)]
pub struct RepoCache {
    root: PathBuf,
    synced: Mutex<HashSet<PathBuf>>,
}

impl RepoCache {
    /// A cache rooted at `root`. Nothing touches the disk until [`sync`].
    ///
    /// [`sync`]: RepoCache::sync
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            synced: Mutex::new(HashSet::new()),
        }
    }

    /// Directory that holds (or will hold) the working copy for `url`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::Path;
    /// use vintro_gitpulse::cache::RepoCache;
    ///
    /// let cache = RepoCache::new("repo_cache");
    /// assert_eq!(
    ///     cache.path_for("https://github.com/madler/zlib.git"),
    ///     Path::new("repo_cache/madler__zlib-64bdfa32")
    /// );
    /// ```
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.root.join(repo_dir_name(url))
    }

    /// Make the working copy for `url` current and return its path.
    ///
    /// Not safe to call concurrently for the same `url`; hold the
    /// [`RepoLocks`] entry for the returned path first.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Git`] if the clone fails, or if an existing
    /// copy cannot be opened. A failed fetch on an existing copy only logs a
    /// warning and keeps the stale history.
    pub fn sync(&self, url: &str) -> Result<PathBuf, VintroError> {
        let dest = self.path_for(url);
        if self.already_synced(&dest) {
            debug!(repo = url, "working copy already synced this run");
            return Ok(dest);
        }

        if dest.join(".git").exists() || looks_bare(&dest) {
            let repo = Repository::open(&dest)
                .map_err(|e| VintroError::Git(format!("failed to open {}: {e}", dest.display())))?;
            if let Err(e) = refresh(&repo) {
                warn!(repo = url, error = %e, "update failed, using existing history");
            }
        } else {
            clone_into(url, &dest)?;
        }

        self.mark_synced(dest.clone());
        Ok(dest)
    }

    fn already_synced(&self, dest: &Path) -> bool {
        self.synced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(dest)
    }

    fn mark_synced(&self, dest: PathBuf) {
        self.synced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(dest);
    }
}

/// One async mutex per working-copy path.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use std::sync::Arc;
/// use vintro_gitpulse::cache::RepoLocks;
///
/// let locks = RepoLocks::default();
/// let a = locks.lock_for(Path::new("repo_cache/x"));
/// let b = locks.lock_for(Path::new("repo_cache/x"));
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RepoLocks {
    inner: Arc<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RepoLocks {
    /// The lock guarding `path`, created on first use.
    pub fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(path.to_path_buf()).or_default().clone()
    }
}

/// Directory name for a repository URL: the last two path segments joined
/// by `__`, then a short digest of the whole URL so the same owner and name
/// on different hosts never share a working copy. A trailing `/` or `.git`
/// does not change the name.
pub fn repo_dir_name(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    if trimmed.is_empty() {
        return "repo".to_string();
    }
    let segments: Vec<&str> = trimmed
        .rsplit(['/', ':', '\\'])
        .filter(|s| !s.is_empty())
        .take(2)
        .collect();
    let name = segments
        .iter()
        .rev()
        .copied()
        .collect::<Vec<_>>()
        .join("__");

    let mut hasher = Sha256::new();
    hasher.update(trimmed.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", sanitize(&name), &digest[..8])
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "repo".to_string()
    } else {
        cleaned
    }
}

fn looks_bare(path: &Path) -> bool {
    path.join("HEAD").is_file() && path.join("objects").is_dir()
}

/// Clone into a sibling directory and rename, so a crash never leaves a
/// half-written copy at `dest`.
fn clone_into(url: &str, dest: &Path) -> Result<(), VintroError> {
    let parent = dest.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent)?;

    let mut partial = dest.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);
    if partial.exists() {
        fs::remove_dir_all(&partial)?;
    }

    info!(repo = url, dest = %dest.display(), "cloning");
    Repository::clone(url, &partial)
        .map_err(|e| VintroError::Git(format!("failed to clone {url}: {e}")))?;
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&partial, dest)?;
    Ok(())
}

/// Fetch `origin` and hard-reset to its default branch.
fn refresh(repo: &Repository) -> Result<(), VintroError> {
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| VintroError::Git(format!("no origin remote: {e}")))?;
    remote
        .fetch(&[] as &[&str], None, None)
        .map_err(|e| VintroError::Git(format!("fetch failed: {e}")))?;

    let target = default_branch_ref(repo)
        .ok_or_else(|| VintroError::Git("cannot determine remote default branch".into()))?;
    let oid = repo
        .refname_to_id(&target)
        .map_err(|e| VintroError::Git(format!("failed to resolve {target}: {e}")))?;
    let object = repo
        .find_object(oid, None)
        .map_err(|e| VintroError::Git(format!("failed to find {oid}: {e}")))?;
    repo.reset(&object, ResetType::Hard, Some(CheckoutBuilder::new().force()))
        .map_err(|e| VintroError::Git(format!("hard reset failed: {e}")))?;
    debug!(target = %target, "reset to remote head");
    Ok(())
}

fn default_branch_ref(repo: &Repository) -> Option<String> {
    if let Some(target) = repo
        .find_reference("refs/remotes/origin/HEAD")
        .ok()
        .and_then(|r| r.symbolic_target().map(str::to_string))
    {
        return Some(target);
    }

    let mut candidates = Vec::new();
    if let Some(branch) = repo.head().ok().and_then(|h| h.shorthand().map(str::to_string)) {
        candidates.push(format!("refs/remotes/origin/{branch}"));
    }
    candidates.push("refs/remotes/origin/main".into());
    candidates.push("refs/remotes/origin/master".into());

    candidates
        .into_iter()
        .find(|name| repo.find_reference(name).is_ok())
}
