//! Fetching patch text by commit URL, with a transparent disk cache.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use vintro_core::{FetchConfig, VintroError};

use crate::store::write_atomic;

/// Anything that can produce patch text for a commit URL.
#[async_trait]
pub trait PatchSource: Send + Sync {
    /// Fetch the unified diff for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Fetch`] on any transport failure, timeout or
    /// non-success response.
    async fn fetch(&self, url: &str) -> Result<String, VintroError>;
}

/// Fetches `<commit url>.patch` over HTTP.
///
/// # Examples
///
/// ```
/// use vintro_core::FetchConfig;
/// use vintro_resolve::patch::HttpPatchSource;
///
/// let source = HttpPatchSource::new(&FetchConfig::default()).unwrap();
/// ```
pub struct HttpPatchSource {
    client: reqwest::Client,
    retries: u32,
}

impl HttpPatchSource {
    /// Build a client with the configured timeout and user agent.
    ///
    /// # Errors
    ///
    /// Returns [`VintroError::Fetch`] if the HTTP client cannot be built.
    pub fn new(config: &FetchConfig) -> Result<Self, VintroError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| VintroError::Fetch(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            retries: config.retries,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<String, VintroError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                VintroError::Fetch(format!("timed out fetching {url}"))
            } else {
                VintroError::Fetch(format!("request to {url} failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(VintroError::Fetch(format!("{url} returned {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| VintroError::Fetch(format!("failed to read body of {url}: {e}")))
    }
}

#[async_trait]
impl PatchSource for HttpPatchSource {
    async fn fetch(&self, url: &str) -> Result<String, VintroError> {
        let target = patch_url(url);
        let mut attempt = 0;
        loop {
            match self.fetch_once(&target).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(url = %target, attempt, error = %e, "patch fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Wraps a [`PatchSource`] with an on-disk cache keyed by normalized URL.
///
/// A cached copy is always preferred; a fresh fetch is persisted before it
/// is returned.
pub struct PatchCache {
    dir: PathBuf,
    source: Arc<dyn PatchSource>,
}

impl PatchCache {
    /// Cache files under `dir`, fetching misses from `source`.
    pub fn new(dir: impl Into<PathBuf>, source: Arc<dyn PatchSource>) -> Self {
        Self {
            dir: dir.into(),
            source,
        }
    }

    /// Cache file that holds (or would hold) the patch for `url`.
    pub fn path_for(&self, url: &str) -> PathBuf {
        self.dir.join(cache_key(url))
    }

    /// Patch text for `url`, from disk if cached, otherwise fetched and
    /// stored.
    ///
    /// # Errors
    ///
    /// Returns the source's error on a cache miss that fails to fetch, or
    /// [`VintroError::Io`] if the fetched text cannot be stored.
    pub async fn fetch(&self, url: &str) -> Result<String, VintroError> {
        let path = self.path_for(url);
        if let Some(text) = read_if_present(&path) {
            debug!(url, cache = %path.display(), "patch cache hit");
            return Ok(text);
        }

        let text = self.source.fetch(url).await?;
        write_atomic(&path, text.as_bytes())?;
        debug!(url, cache = %path.display(), bytes = text.len(), "patch cached");
        Ok(text)
    }
}

fn read_if_present(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Canonical form of a commit URL: no fragment, and no trailing slash or
/// `.patch`/`.diff` suffix on the path. The query is kept, since forges such
/// as cgit carry the commit id there.
///
/// # Examples
///
/// ```
/// use vintro_resolve::patch::normalize_url;
///
/// assert_eq!(
///     normalize_url("https://github.com/o/r/commit/abc123.patch#diff"),
///     "https://github.com/o/r/commit/abc123"
/// );
/// assert_eq!(
///     normalize_url("https://git.example.org/p.git/commit/?id=abc123"),
///     "https://git.example.org/p.git/commit?id=abc123"
/// );
/// ```
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split('#').next().unwrap_or(url);
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (url, None),
    };
    let path = path.trim_end_matches('/');
    let path = path
        .strip_suffix(".patch")
        .or_else(|| path.strip_suffix(".diff"))
        .unwrap_or(path);
    match query.filter(|q| !q.is_empty()) {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// URL to request for the raw patch of a commit URL. `.patch` is appended
/// only when the commit is named by the path, not by a query.
///
/// # Examples
///
/// ```
/// use vintro_resolve::patch::patch_url;
///
/// assert_eq!(patch_url("https://github.com/o/r/commit/abc/"), "https://github.com/o/r/commit/abc.patch");
/// assert_eq!(
///     patch_url("https://git.example.org/p.git/patch/?id=abc"),
///     "https://git.example.org/p.git/patch?id=abc"
/// );
/// ```
pub fn patch_url(url: &str) -> String {
    let normalized = normalize_url(url);
    if normalized.contains('?') {
        normalized
    } else {
        format!("{normalized}.patch")
    }
}

/// Cache file name for `url`: the sanitized last path segment plus a short
/// digest of the normalized URL, so distinct repositories never collide.
///
/// # Examples
///
/// ```
/// use vintro_resolve::patch::cache_key;
///
/// let a = cache_key("https://github.com/o/r/commit/abc123");
/// let b = cache_key("https://github.com/o/r/commit/abc123.patch/");
/// assert_eq!(a, b);
/// assert!(a.starts_with("abc123-"));
/// assert!(a.ends_with(".patch"));
/// ```
pub fn cache_key(url: &str) -> String {
    let normalized = normalize_url(url);
    let path = normalized.split('?').next().unwrap_or(&normalized);
    let last = path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("patch");
    let stem: String = last
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{stem}-{}.patch", &digest[..12])
}
