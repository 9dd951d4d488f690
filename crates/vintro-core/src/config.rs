use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::VintroError;

/// Top-level configuration loaded from `.vintro.toml`.
///
/// Supports layered resolution: CLI flags > config file > defaults. The
/// whole object is handed to the resolver at construction, so tests can
/// point every directory at a temporary location.
///
/// # Examples
///
/// ```
/// use vintro_core::VintroConfig;
///
/// let config = VintroConfig::default();
/// assert_eq!(config.resolve.context_window, 3);
/// assert_eq!(config.run.jobs, 4);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VintroConfig {
    /// On-disk layout.
    #[serde(default)]
    pub paths: PathsConfig,
    /// Attribution behavior.
    #[serde(default)]
    pub resolve: ResolveConfig,
    /// Network fetch settings.
    #[serde(default)]
    pub fetch: FetchConfig,
    /// Worker pool settings.
    #[serde(default)]
    pub run: RunConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
}

impl VintroConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Io`] if the file cannot be read, or
    /// [`VintroError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use vintro_core::VintroConfig;
    /// use std::path::Path;
    ///
    /// let config = VintroConfig::from_file(Path::new(".vintro.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, VintroError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Toml`] if parsing fails, or
    /// [`VintroError::Config`] if a value is out of range.
    ///
    /// # Examples
    ///
    /// ```
    /// use vintro_core::VintroConfig;
    ///
    /// let toml = r#"
    /// [run]
    /// jobs = 8
    /// "#;
    /// let config = VintroConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.run.jobs, 8);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, VintroError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a run meaningless.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Config`] naming the offending key.
    pub fn validate(&self) -> Result<(), VintroError> {
        if self.run.jobs == 0 {
            return Err(VintroError::Config("run.jobs must be at least 1".into()));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(VintroError::Config(
                "fetch.timeout_secs must be at least 1".into(),
            ));
        }
        for pat in &self.resolve.skip_patterns {
            if let Err(e) = glob::Pattern::new(pat) {
                return Err(VintroError::Config(format!(
                    "resolve.skip_patterns: invalid pattern '{pat}': {e}"
                )));
            }
        }
        Ok(())
    }
}

/// Where caches, records and the log live.
///
/// Relative sub-directories are resolved against `data_dir`; absolute ones
/// are used as-is.
///
/// # Examples
///
/// ```
/// use vintro_core::PathsConfig;
/// use std::path::PathBuf;
///
/// let paths = PathsConfig::rooted_at("/srv/vintro");
/// assert_eq!(paths.records_dir(), PathBuf::from("/srv/vintro/commit_metadata"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of every relative path below (default: `.`).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Cached patch texts keyed by normalized commit URL.
    #[serde(default = "default_patch_cache")]
    pub patch_cache: PathBuf,
    /// Working copies of cloned repositories.
    #[serde(default = "default_repo_cache")]
    pub repo_cache: PathBuf,
    /// Resolution records and completeness markers, one directory per CVE.
    #[serde(default = "default_records")]
    pub records: PathBuf,
    /// Patch texts of introducing commits, one directory per CVE.
    #[serde(default = "default_intro_patches")]
    pub intro_patches: PathBuf,
    /// Per-introducing-commit change documents, one directory per CVE.
    #[serde(default = "default_intro_metadata")]
    pub intro_metadata: PathBuf,
    /// Persistent log file.
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_patch_cache() -> PathBuf {
    PathBuf::from("patch_cache")
}

fn default_repo_cache() -> PathBuf {
    PathBuf::from("repo_cache")
}

fn default_records() -> PathBuf {
    PathBuf::from("commit_metadata")
}

fn default_intro_patches() -> PathBuf {
    PathBuf::from("vulnerability_patches")
}

fn default_intro_metadata() -> PathBuf {
    PathBuf::from("vulnerability_intro_metadata")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("vintro.log")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            patch_cache: default_patch_cache(),
            repo_cache: default_repo_cache(),
            records: default_records(),
            intro_patches: default_intro_patches(),
            intro_metadata: default_intro_metadata(),
            log_file: default_log_file(),
        }
    }
}

impl PathsConfig {
    /// Default layout under `data_dir`.
    pub fn rooted_at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn under_root(&self, sub: &Path) -> PathBuf {
        if sub.is_absolute() {
            sub.to_path_buf()
        } else {
            self.data_dir.join(sub)
        }
    }

    /// Resolved patch cache directory.
    pub fn patch_cache_dir(&self) -> PathBuf {
        self.under_root(&self.patch_cache)
    }

    /// Resolved repository cache directory.
    pub fn repo_cache_dir(&self) -> PathBuf {
        self.under_root(&self.repo_cache)
    }

    /// Resolved records directory.
    pub fn records_dir(&self) -> PathBuf {
        self.under_root(&self.records)
    }

    /// Resolved introducing-commit patch directory.
    pub fn intro_patches_dir(&self) -> PathBuf {
        self.under_root(&self.intro_patches)
    }

    /// Resolved introducing-commit metadata directory.
    pub fn intro_metadata_dir(&self) -> PathBuf {
        self.under_root(&self.intro_metadata)
    }

    /// Resolved log file path.
    pub fn log_path(&self) -> PathBuf {
        self.under_root(&self.log_file)
    }
}

/// Which engine produces per-line attribution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlameBackend {
    /// In-process blame through libgit2.
    #[default]
    Libgit2,
    /// `git blame -l -C -C -M` subprocess.
    Cli,
}

/// Where introducing commits' patch texts come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntroPatchSource {
    /// Render the patch from the local working copy.
    #[default]
    Local,
    /// Fetch `<repo_url>/commit/<id>.patch` through the patch cache.
    Remote,
}

/// Attribution behavior.
///
/// # Examples
///
/// ```
/// use vintro_core::{BlameBackend, ResolveConfig};
///
/// let config = ResolveConfig::default();
/// assert_eq!(config.context_window, 3);
/// assert_eq!(config.substring_min_len, 8);
/// assert_eq!(config.blame_backend, BlameBackend::Libgit2);
/// assert!(config.fetch_intro_patches);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveConfig {
    /// Lines on either side of the first added line used as fallback
    /// context (default: 3).
    #[serde(default = "default_context_window")]
    pub context_window: usize,
    /// Shortest target line allowed to match by substring (default: 8).
    #[serde(default = "default_substring_min_len")]
    pub substring_min_len: usize,
    /// Blame engine (default: libgit2).
    #[serde(default)]
    pub blame_backend: BlameBackend,
    /// Store each introducing commit's own patch text (default: true).
    #[serde(default = "default_true")]
    pub fetch_intro_patches: bool,
    /// Source of introducing commits' patch texts (default: local).
    #[serde(default)]
    pub intro_patch_source: IntroPatchSource,
    /// Glob patterns for files never attributed (e.g. `"ChangeLog"`).
    #[serde(default)]
    pub skip_patterns: Vec<String>,
    /// File extensions never attributed (e.g. `"md"`).
    #[serde(default)]
    pub skip_extensions: Vec<String>,
}

fn default_context_window() -> usize {
    3
}

fn default_substring_min_len() -> usize {
    8
}

fn default_true() -> bool {
    true
}

impl Default for ResolveConfig {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            substring_min_len: default_substring_min_len(),
            blame_backend: BlameBackend::default(),
            fetch_intro_patches: true,
            intro_patch_source: IntroPatchSource::default(),
            skip_patterns: Vec::new(),
            skip_extensions: Vec::new(),
        }
    }
}

/// Network fetch settings.
///
/// # Examples
///
/// ```
/// use vintro_core::FetchConfig;
///
/// let config = FetchConfig::default();
/// assert_eq!(config.timeout_secs, 30);
/// assert_eq!(config.retries, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// `User-Agent` header (default: `vintro`).
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Extra attempts after a transport error (default: 1).
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "vintro".into()
}

fn default_retries() -> u32 {
    1
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            retries: default_retries(),
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Units of work in flight at once (default: 4).
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

fn default_jobs() -> usize {
    4
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset (default: `info`).
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}
