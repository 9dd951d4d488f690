//! Durable output: resolution records, completeness markers and
//! introducing-commit evidence.
//!
//! Layout, relative to the configured directories:
//!
//! ```text
//! <records>/<CVE>/<patch commit>.json
//! <records>/<CVE>/processed
//! <intro_patches>/<CVE>/<introducing commit>.patch
//! <intro_metadata>/<CVE>/<introducing commit>.json
//! ```
//!
//! Every file is written through [`write_atomic`], so an interrupted run
//! never leaves a truncated record or a marker without its record.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;
use vintro_core::{CommitId, PathsConfig, VintroError};
use vintro_gitpulse::mining::CommitInfo;

const MARKER: &str = "processed";

/// Line evidence for one file of a patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvidence {
    /// Removed lines as they appear in the patch.
    pub removed_lines: Vec<String>,
    /// Added lines as they appear in the patch.
    pub added_lines: Vec<String>,
    /// Trimmed lines that were looked up in blame.
    pub target_lines: Vec<String>,
    /// Target lines that matched at least one blamed line.
    pub matched_lines: Vec<String>,
    /// Ancestors of the patch commit attributed from this file.
    pub introducing_commits: Vec<CommitId>,
    /// Whether the targets came from context lines around an insertion.
    pub used_context_lines: bool,
    /// Why the file produced no evidence, when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss: Option<String>,
}

/// The persisted outcome for one (CVE, patch commit) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionRecord {
    /// CVE identifier.
    pub cve_id: String,
    /// Project or repository name.
    pub project_name: String,
    /// Repository the patch commit lives in.
    pub repo_url: String,
    /// The fixing commit.
    pub commit_id: CommitId,
    /// Deduplicated introducing commits across all files.
    pub introducing_commits: BTreeSet<CommitId>,
    /// Files that contributed at least one introducing commit.
    pub malicious_files: Vec<String>,
    /// Per-file evidence, keyed by post-change path.
    pub file_changes: BTreeMap<String, FileEvidence>,
    /// Whether any file fell back to context lines.
    pub used_context_lines: bool,
    /// Descriptive data for the patch commit, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_metadata: Option<CommitInfo>,
    /// Sections the diff parser dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
    /// When the record was produced.
    pub resolved_at: DateTime<Utc>,
}

/// Added and removed lines of one file in an introducing commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntroFileChange {
    /// Added lines.
    pub added_lines: Vec<String>,
    /// Removed lines.
    pub removed_lines: Vec<String>,
}

/// Metadata stored next to each introducing commit's patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntroRecord {
    /// CVE identifier.
    pub cve_id: String,
    /// Project or repository name.
    pub project_name: String,
    /// The introducing commit.
    pub commit_id: CommitId,
    /// The fix it was attributed from.
    pub patch_commit: CommitId,
    /// Author, date and statistics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_metadata: Option<CommitInfo>,
    /// Per-file lines of the introducing change.
    pub file_changes: BTreeMap<String, IntroFileChange>,
}

/// Write `bytes` to `path` via a uniquely named sibling temp file and a
/// rename, so concurrent writers never share a temp file.
///
/// # Errors
///
/// Returns [`VintroError::Io`] if the parent cannot be created or either
/// step fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VintroError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| VintroError::Io(e.error))?;
    Ok(())
}

/// Make a CVE id or commit id safe to use as one path component.
pub fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
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
        "_".to_string()
    } else {
        cleaned
    }
}

/// Reads and writes everything under the configured output directories.
#[derive(Debug, Clone)]
pub struct Store {
    records: PathBuf,
    intro_patches: PathBuf,
    intro_metadata: PathBuf,
}

impl Store {
    /// A store over the directories in `paths`.
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            records: paths.records_dir(),
            intro_patches: paths.intro_patches_dir(),
            intro_metadata: paths.intro_metadata_dir(),
        }
    }

    fn cve_dir(&self, cve_id: &str) -> PathBuf {
        self.records.join(path_component(cve_id))
    }

    /// Completeness marker path for `cve_id`.
    pub fn marker_path(&self, cve_id: &str) -> PathBuf {
        self.cve_dir(cve_id).join(MARKER)
    }

    /// Record path for one patch commit of `cve_id`.
    pub fn record_path(&self, cve_id: &str, commit: &CommitId) -> PathBuf {
        self.cve_dir(cve_id)
            .join(format!("{}.json", path_component(commit.as_str())))
    }

    /// Patch file for an introducing commit.
    pub fn intro_patch_path(&self, cve_id: &str, commit: &CommitId) -> PathBuf {
        self.intro_patches
            .join(path_component(cve_id))
            .join(format!("{}.patch", path_component(commit.as_str())))
    }

    /// Metadata file for an introducing commit.
    pub fn intro_metadata_path(&self, cve_id: &str, commit: &CommitId) -> PathBuf {
        self.intro_metadata
            .join(path_component(cve_id))
            .join(format!("{}.json", path_component(commit.as_str())))
    }

    /// Whether `cve_id` has been fully processed.
    pub fn is_processed(&self, cve_id: &str) -> bool {
        self.marker_path(cve_id).exists()
    }

    /// Write the zero-byte completeness marker for `cve_id`.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Io`] if the marker cannot be written.
    pub fn mark_processed(&self, cve_id: &str) -> Result<(), VintroError> {
        write_atomic(&self.marker_path(cve_id), b"")
    }

    /// Persist a resolution record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_record(&self, record: &ResolutionRecord) -> Result<PathBuf, VintroError> {
        let path = self.record_path(&record.cve_id, &record.commit_id);
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&path, &json)?;
        Ok(path)
    }

    /// Load one record, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_record(
        &self,
        cve_id: &str,
        commit: &CommitId,
    ) -> Result<Option<ResolutionRecord>, VintroError> {
        let path = self.record_path(cve_id, commit);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Every readable record, grouped by CVE directory in name order.
    /// Unparsable files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Io`] if the records directory cannot be listed.
    pub fn load_all_records(&self) -> Result<Vec<ResolutionRecord>, VintroError> {
        let mut records = Vec::new();
        for cve_dir in self.cve_dirs()? {
            let mut files: Vec<PathBuf> = fs::read_dir(&cve_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            files.sort();
            for file in files {
                match fs::read_to_string(&file)
                    .map_err(VintroError::from)
                    .and_then(|c| serde_json::from_str(&c).map_err(VintroError::from))
                {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(file = %file.display(), error = %e, "skipping unreadable record"),
                }
            }
        }
        Ok(records)
    }

    /// CVE directory names that hold at least one record but no marker.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Io`] if the records directory cannot be listed.
    pub fn unmarked_cves(&self) -> Result<Vec<String>, VintroError> {
        let mut unmarked = Vec::new();
        for cve_dir in self.cve_dirs()? {
            if cve_dir.join(MARKER).exists() {
                continue;
            }
            let has_record = fs::read_dir(&cve_dir)?
                .filter_map(Result::ok)
                .any(|e| e.path().extension().is_some_and(|ext| ext == "json"));
            if has_record {
                if let Some(name) = cve_dir.file_name() {
                    unmarked.push(name.to_string_lossy().to_string());
                }
            }
        }
        Ok(unmarked)
    }

    fn cve_dirs(&self) -> Result<Vec<PathBuf>, VintroError> {
        if !self.records.exists() {
            return Ok(Vec::new());
        }
        let mut dirs: Vec<PathBuf> = fs::read_dir(&self.records)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();
        Ok(dirs)
    }

    /// Write an introducing commit's patch unless it already exists.
    /// Returns `true` if a file was written.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Io`] if the write fails.
    pub fn write_intro_patch(
        &self,
        cve_id: &str,
        commit: &CommitId,
        text: &str,
    ) -> Result<bool, VintroError> {
        let path = self.intro_patch_path(cve_id, commit);
        if path.exists() {
            return Ok(false);
        }
        write_atomic(&path, text.as_bytes())?;
        Ok(true)
    }

    /// Write an introducing commit's metadata unless it already exists.
    /// Returns `true` if a file was written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn write_intro_record(&self, record: &IntroRecord) -> Result<bool, VintroError> {
        let path = self.intro_metadata_path(&record.cve_id, &record.commit_id);
        if path.exists() {
            return Ok(false);
        }
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
        Ok(true)
    }

    /// Whether both evidence files for an introducing commit exist.
    pub fn has_intro_evidence(&self, cve_id: &str, commit: &CommitId) -> bool {
        self.intro_patch_path(cve_id, commit).exists()
            && self.intro_metadata_path(cve_id, commit).exists()
    }
}
