use std::path::PathBuf;

/// Errors that can occur across vintro.
///
/// Each variant wraps a specific error domain. Library crates use this type
/// directly; the binary crate reports it through `miette` at the boundary.
///
/// # Examples
///
/// ```
/// use vintro_core::VintroError;
///
/// let err = VintroError::Config("missing data_dir".into());
/// assert!(err.to_string().contains("missing data_dir"));
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum VintroError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Git operation failure.
    #[error("git error: {0}")]
    Git(String),

    /// Patch or manifest parsing failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Network fetch failure, including timeouts.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A required file was not found on disk.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A file does not exist at the requested revision.
    #[error("{path} does not exist at revision {revision}")]
    MissingFile {
        /// Repository-relative path.
        path: String,
        /// Revision the lookup ran against.
        revision: String,
    },

    /// A revision string does not resolve to a commit.
    #[error("unknown revision: {0}")]
    UnknownRevision(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: VintroError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = VintroError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn missing_file_names_path_and_revision() {
        let err = VintroError::MissingFile {
            path: "src/foo.c".into(),
            revision: "abc123".into(),
        };
        assert_eq!(err.to_string(), "src/foo.c does not exist at revision abc123");
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = VintroError::FileNotFound(PathBuf::from("/tmp/missing.json"));
        assert!(err.to_string().contains("/tmp/missing.json"));
    }
}
