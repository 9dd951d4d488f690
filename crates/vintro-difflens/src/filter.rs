//! Excluding files that carry no attributable code.
//!
//! Changelogs, release notes and similar files are touched by many security
//! fixes but blaming them only finds whoever wrote the previous entry.

use std::fmt;
use std::path::Path;

use serde::Serialize;
use tracing::warn;
use vintro_core::ResolveConfig;

use crate::parser::FileChange;

/// Reason a file was excluded from attribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum SkipReason {
    /// Matched a configured glob pattern.
    PatternMatch(String),
    /// Has a configured extension.
    Extension(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PatternMatch(p) => write!(f, "matches pattern {p}"),
            SkipReason::Extension(ext) => write!(f, "extension .{ext}"),
        }
    }
}

/// A file excluded before attribution.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    /// Post-change path.
    pub path: String,
    /// Why it was excluded.
    pub reason: SkipReason,
}

/// Path-based exclusion rules.
///
/// # Examples
///
/// ```
/// use vintro_core::ResolveConfig;
/// use vintro_difflens::filter::PathFilter;
///
/// let config = ResolveConfig {
///     skip_patterns: vec!["ChangeLog".into(), "docs/**".into()],
///     skip_extensions: vec!["md".into()],
///     ..ResolveConfig::default()
/// };
/// let filter = PathFilter::from_config(&config);
/// assert!(filter.check("ChangeLog").is_some());
/// assert!(filter.check("docs/api/index.html").is_some());
/// assert!(filter.check("NEWS.md").is_some());
/// assert!(filter.check("src/main.c").is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    skip_patterns: Vec<glob::Pattern>,
    skip_extensions: Vec<String>,
}

impl PathFilter {
    /// A filter that keeps everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Build the filter from resolve settings. Invalid patterns are logged
    /// and left out.
    pub fn from_config(config: &ResolveConfig) -> Self {
        let skip_patterns = config
            .skip_patterns
            .iter()
            .filter_map(|pat| match glob::Pattern::new(pat) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %pat, error = %e, "ignoring invalid skip pattern");
                    None
                }
            })
            .collect();
        let skip_extensions = config
            .skip_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Self {
            skip_patterns,
            skip_extensions,
        }
    }

    /// Why `path` should be skipped, if it should.
    pub fn check(&self, path: &str) -> Option<SkipReason> {
        if let Some(ext) = Path::new(path).extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            if self.skip_extensions.contains(&ext) {
                return Some(SkipReason::Extension(ext));
            }
        }

        let file_name = Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(path);
        self.skip_patterns
            .iter()
            .find(|pat| pat.matches(path) || pat.matches(file_name))
            .map(|pat| SkipReason::PatternMatch(pat.to_string()))
    }

    /// Split file changes into those to attribute and those skipped.
    pub fn partition(&self, files: Vec<FileChange>) -> (Vec<FileChange>, Vec<SkippedFile>) {
        let mut kept = Vec::new();
        let mut skipped = Vec::new();
        for file in files {
            match self.check(&file.path) {
                Some(reason) => skipped.push(SkippedFile {
                    path: file.path,
                    reason,
                }),
                None => kept.push(file),
            }
        }
        (kept, skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(path: &str) -> FileChange {
        FileChange {
            path: path.into(),
            ..FileChange::default()
        }
    }

    #[test]
    fn allow_all_keeps_everything() {
        let filter = PathFilter::allow_all();
        assert!(filter.check("ChangeLog").is_none());
        assert!(filter.check("README.md").is_none());
    }

    #[test]
    fn invalid_patterns_are_dropped_valid_ones_kept() {
        let config = ResolveConfig {
            skip_patterns: vec!["a[b".into(), "***".into(), "ChangeLog".into()],
            ..ResolveConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        assert_eq!(filter.skip_patterns.len(), 1);
        assert!(filter.check("ChangeLog").is_some());
        assert!(filter.check("a[b").is_none());
    }

    #[test]
    fn pattern_matches_basename_anywhere() {
        let config = ResolveConfig {
            skip_patterns: vec!["ChangeLog".into()],
            ..ResolveConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        assert_eq!(
            filter.check("lib/ChangeLog"),
            Some(SkipReason::PatternMatch("ChangeLog".into()))
        );
    }

    #[test]
    fn extension_is_case_insensitive_and_dot_tolerant() {
        let config = ResolveConfig {
            skip_extensions: vec![".TXT".into()],
            ..ResolveConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        assert_eq!(
            filter.check("notes/Release.txt"),
            Some(SkipReason::Extension("txt".into()))
        );
    }

    #[test]
    fn partition_preserves_order() {
        let config = ResolveConfig {
            skip_patterns: vec!["*.md".into()],
            ..ResolveConfig::default()
        };
        let filter = PathFilter::from_config(&config);
        let (kept, skipped) =
            filter.partition(vec![change("a.c"), change("NEWS.md"), change("b.c")]);
        let kept: Vec<&str> = kept.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(kept, vec!["a.c", "b.c"]);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].path, "NEWS.md");
        assert_eq!(skipped[0].reason.to_string(), "matches pattern *.md");
    }
}
