use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A normalized commit identifier.
///
/// Construction trims surrounding whitespace, strips the leading `^` that
/// some blame backends emit for boundary commits, and lowercases the hex
/// digits. Every identifier that enters vintro goes through here, so set
/// membership, ancestry checks and file naming all see the same spelling.
///
/// # Examples
///
/// ```
/// use vintro_core::CommitId;
///
/// let id = CommitId::new("^ABC123 ");
/// assert_eq!(id.as_str(), "abc123");
/// assert_eq!(id, CommitId::new("abc123"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct CommitId(String);

impl CommitId {
    /// Normalize a raw identifier.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().trim_start_matches('^').to_ascii_lowercase())
    }

    /// The normalized identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether nothing was left after normalization.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the identifier looks like an abbreviated or full object id
    /// (4 to 64 hex digits).
    ///
    /// # Examples
    ///
    /// ```
    /// use vintro_core::CommitId;
    ///
    /// assert!(CommitId::new("^deadbeef").is_well_formed());
    /// assert!(!CommitId::new("HEAD~1").is_well_formed());
    /// assert!(!CommitId::new("").is_well_formed());
    /// ```
    pub fn is_well_formed(&self) -> bool {
        (4..=64).contains(&self.0.len()) && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// First 12 characters, for log lines and summaries.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    /// Whether `other` names the same commit, allowing either side to be
    /// an abbreviation of the other.
    pub fn same_commit(&self, other: &CommitId) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        self.0.starts_with(&other.0) || other.0.starts_with(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CommitId {
    fn from(raw: String) -> Self {
        Self::new(&raw)
    }
}

impl From<&str> for CommitId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<CommitId> for String {
    fn from(id: CommitId) -> Self {
        id.0
    }
}

impl AsRef<str> for CommitId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Output format for CLI results.
///
/// # Examples
///
/// ```
/// use vintro_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables and summaries.
    #[default]
    Text,
    /// Machine-readable JSON.
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_marker_is_stripped() {
        assert_eq!(CommitId::new("^abc123").as_str(), "abc123");
        assert_eq!(CommitId::new("^^abc123").as_str(), "abc123");
        assert_eq!(CommitId::new("  abc123\n").as_str(), "abc123");
    }

    #[test]
    fn normalization_is_case_insensitive() {
        assert_eq!(CommitId::new("ABCDEF"), CommitId::new("abcdef"));
    }

    #[test]
    fn marker_only_input_is_empty() {
        let id = CommitId::new("^");
        assert!(id.is_empty());
        assert!(!id.is_well_formed());
    }

    #[test]
    fn short_truncates_long_ids() {
        let id = CommitId::new("0123456789abcdef0123456789abcdef01234567");
        assert_eq!(id.short(), "0123456789ab");
        assert_eq!(CommitId::new("abc").short(), "abc");
    }

    #[test]
    fn same_commit_accepts_abbreviations() {
        let full = CommitId::new("abc1234def5678");
        assert!(full.same_commit(&CommitId::new("abc1234")));
        assert!(CommitId::new("abc1234").same_commit(&full));
        assert!(!full.same_commit(&CommitId::new("abd")));
        assert!(!full.same_commit(&CommitId::new("")));
    }

    #[test]
    fn deserialization_normalizes() {
        let id: CommitId = serde_json::from_str("\"^ABC123\"").unwrap();
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc123\"");
    }

    #[test]
    fn output_format_from_str() {
        assert_eq!("text".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn output_format_default_is_text() {
        assert_eq!(OutputFormat::default(), OutputFormat::Text);
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }
}
