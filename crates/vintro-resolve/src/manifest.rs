//! Work input: which (CVE, patch commit) pairs to resolve in this run.
//!
//! A manifest is a JSON array of rows. Rows are grouped by CVE into units
//! of work, optionally restricted to a CVE list and split into shards so a
//! large backlog can be spread across invocations.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vintro_core::{CommitId, VintroError};

/// One patch commit to resolve.
///
/// # Examples
///
/// ```
/// use vintro_resolve::manifest::WorkItem;
///
/// let item: WorkItem = serde_json::from_str(
///     r#"{"cve_id":"CVE-2019-0001","project_name":"zlib",
///        "repo_url":"https://github.com/madler/zlib.git","commit_id":"^ABC123"}"#,
/// ).unwrap();
/// assert_eq!(item.commit_id.as_str(), "abc123");
/// assert_eq!(item.commit_url(), "https://github.com/madler/zlib/commit/abc123");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    /// CVE identifier.
    pub cve_id: String,
    /// Project name used in records.
    pub project_name: String,
    /// Clone URL or local path of the repository.
    pub repo_url: String,
    /// The fixing commit.
    pub commit_id: CommitId,
    /// Where to fetch the patch; derived from `repo_url` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_url: Option<String>,
}

impl WorkItem {
    /// The URL the patch text is fetched from.
    pub fn commit_url(&self) -> String {
        match &self.commit_url {
            Some(url) => url.clone(),
            None => commit_url_for(&self.repo_url, &self.commit_id),
        }
    }
}

/// Web URL of `commit` in the repository at `repo_url`, in the
/// `<repo>/commit/<id>` form GitHub and GitLab share.
pub fn commit_url_for(repo_url: &str, commit: &CommitId) -> String {
    let base = repo_url.trim().trim_end_matches('/');
    let base = base.strip_suffix(".git").unwrap_or(base);
    format!("{base}/commit/{commit}")
}

/// All patch commits of one CVE, processed together as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CveUnit {
    /// CVE identifier.
    pub cve_id: String,
    /// Patch commits in manifest order.
    pub items: Vec<WorkItem>,
}

/// Load a manifest file.
///
/// # Errors
///
/// Returns [`VintroError::FileNotFound`] if the file is missing, or a
/// serialization error if it is not a JSON array of rows.
pub fn load_manifest(path: &Path) -> Result<Vec<WorkItem>, VintroError> {
    if !path.exists() {
        return Err(VintroError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let items: Vec<WorkItem> = serde_json::from_str(&content)?;
    Ok(items)
}

/// Read a CVE list: one id per line, blank lines and `#` comments ignored.
///
/// # Errors
///
/// Returns [`VintroError::FileNotFound`] if the file is missing.
pub fn load_cve_list(path: &Path) -> Result<Vec<String>, VintroError> {
    if !path.exists() {
        return Err(VintroError::FileNotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Group rows by CVE in order of first appearance, keeping only CVEs in
/// `only` when given. Rows with an empty commit id are dropped.
pub fn group_units(items: Vec<WorkItem>, only: Option<&[String]>) -> Vec<CveUnit> {
    let mut units: Vec<CveUnit> = Vec::new();
    for item in items {
        if item.commit_id.is_empty() {
            continue;
        }
        if let Some(only) = only {
            if !only.iter().any(|c| c == &item.cve_id) {
                continue;
            }
        }
        match units.iter_mut().find(|u| u.cve_id == item.cve_id) {
            Some(unit) => {
                if !unit.items.iter().any(|i| i.commit_id == item.commit_id) {
                    unit.items.push(item);
                }
            }
            None => units.push(CveUnit {
                cve_id: item.cve_id.clone(),
                items: vec![item],
            }),
        }
    }
    units
}

/// Shard `K/N`: the K-th (1-based) of N ceiling-sized slices.
///
/// # Examples
///
/// ```
/// use vintro_resolve::manifest::Shard;
///
/// let shard: Shard = "2/3".parse().unwrap();
/// let all: Vec<u32> = (0..10).collect();
/// assert_eq!(shard.select(&all), &[4, 5, 6, 7]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shard {
    /// 1-based shard number.
    pub index: usize,
    /// Total number of shards.
    pub count: usize,
}

impl Shard {
    /// The slice of `items` this shard owns.
    pub fn select<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let size = items.len().div_ceil(self.count);
        let start = ((self.index - 1) * size).min(items.len());
        let end = (start + size).min(items.len());
        &items[start..end]
    }
}

impl FromStr for Shard {
    type Err = VintroError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VintroError::Config(format!("invalid shard '{s}', expected K/N with 1 <= K <= N"));
        let (k, n) = s.split_once('/').ok_or_else(invalid)?;
        let index: usize = k.trim().parse().map_err(|_| invalid())?;
        let count: usize = n.trim().parse().map_err(|_| invalid())?;
        if count == 0 || index == 0 || index > count {
            return Err(invalid());
        }
        Ok(Self { index, count })
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}
