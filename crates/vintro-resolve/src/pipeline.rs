//! The resolution orchestrator.
//!
//! Each CVE is one unit of work. Every patch commit in the unit moves
//! through `PENDING -> FETCHING_REPO -> FETCHING_PATCH -> PARSING ->
//! RESOLVING -> AGGREGATING -> PERSISTED`, or drops to `SKIPPED` when a
//! collaborator fails. Units run concurrently up to `run.jobs`; git work
//! for one working copy is serialized through its repository lock, while
//! network fetches happen outside it.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use vintro_core::{CommitId, IntroPatchSource, VintroConfig, VintroError};
use vintro_difflens::filter::PathFilter;
use vintro_difflens::parser::parse_patch;
use vintro_gitpulse::cache::{RepoCache, RepoLocks};
use vintro_gitpulse::mining::CommitInfo;
use vintro_gitpulse::repo::{GitRepository, RepositoryHandle};

use crate::attribute::{attribute_patch, PatchAttribution};
use crate::manifest::{commit_url_for, CveUnit, WorkItem};
use crate::patch::{PatchCache, PatchSource};
use crate::store::{IntroFileChange, IntroRecord, ResolutionRecord, Store};

/// Where a patch commit is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitState {
    /// Not started.
    Pending,
    /// Cloning or updating the working copy.
    FetchingRepo,
    /// Getting the patch text.
    FetchingPatch,
    /// Parsing the diff.
    Parsing,
    /// Blaming and filtering per file.
    Resolving,
    /// Merging results and collecting introducing-commit evidence.
    Aggregating,
    /// Record written.
    Persisted,
    /// Abandoned; eligible for a later run.
    Skipped,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UnitState::Pending => "PENDING",
            UnitState::FetchingRepo => "FETCHING_REPO",
            UnitState::FetchingPatch => "FETCHING_PATCH",
            UnitState::Parsing => "PARSING",
            UnitState::Resolving => "RESOLVING",
            UnitState::Aggregating => "AGGREGATING",
            UnitState::Persisted => "PERSISTED",
            UnitState::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// How one CVE ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// The completeness marker already existed; nothing was done.
    AlreadyProcessed,
    /// At least one introducing commit was found and the marker written.
    Resolved,
    /// Records were written but no introducing commit was found.
    NoIntroducingCommit,
    /// At least one patch commit was skipped. No marker is written, so the
    /// unit is retried on the next run.
    Skipped,
}

/// Result for one patch commit.
#[derive(Debug, Clone, Serialize)]
pub struct PatchReport {
    /// The fixing commit.
    pub commit_id: CommitId,
    /// Final state.
    pub state: UnitState,
    /// State the commit was in when it was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<UnitState>,
    /// Why it was skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Introducing commits found.
    pub introducing_commits: BTreeSet<CommitId>,
}

/// Result for one CVE.
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    /// CVE identifier.
    pub cve_id: String,
    /// Overall outcome.
    pub outcome: UnitOutcome,
    /// Per patch commit detail.
    pub patches: Vec<PatchReport>,
}

impl UnitReport {
    /// Distinct introducing commits across all patch commits.
    pub fn introducing_commits(&self) -> BTreeSet<&CommitId> {
        self.patches
            .iter()
            .flat_map(|p| p.introducing_commits.iter())
            .collect()
    }
}

/// Counts for a whole run.
///
/// # Examples
///
/// ```
/// use vintro_resolve::pipeline::RunSummary;
///
/// let summary = RunSummary::default();
/// assert_eq!(summary.units, 0);
/// assert_eq!(summary.to_string(), "0 CVEs: 0 resolved, 0 already processed, 0 skipped, 0 without an introducing commit (0 introducing commits)");
/// ```
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// CVEs considered.
    pub units: usize,
    /// CVEs newly resolved with at least one introducing commit.
    pub resolved: usize,
    /// CVEs skipped because their marker existed.
    pub already_processed: usize,
    /// CVEs whose every patch commit was skipped.
    pub skipped: usize,
    /// CVEs processed without finding an introducing commit.
    pub no_introducing_commit: usize,
    /// Distinct introducing commits found this run.
    pub introducing_commits: usize,
    /// Per-CVE detail, sorted by CVE id.
    pub reports: Vec<UnitReport>,
}

impl RunSummary {
    fn record(&mut self, report: UnitReport) {
        self.units += 1;
        match report.outcome {
            UnitOutcome::AlreadyProcessed => self.already_processed += 1,
            UnitOutcome::Resolved => self.resolved += 1,
            UnitOutcome::NoIntroducingCommit => self.no_introducing_commit += 1,
            UnitOutcome::Skipped => self.skipped += 1,
        }
        self.introducing_commits += report.introducing_commits().len();
        self.reports.push(report);
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} CVEs: {} resolved, {} already processed, {} skipped, {} without an introducing commit ({} introducing commits)",
            self.units,
            self.resolved,
            self.already_processed,
            self.skipped,
            self.no_introducing_commit,
            self.introducing_commits
        )
    }
}

/// A patch commit that fell to `SKIPPED`.
struct Skip {
    at: UnitState,
    reason: String,
}

impl Skip {
    fn at(at: UnitState) -> impl FnOnce(VintroError) -> Skip {
        move |e| Skip {
            at,
            reason: e.to_string(),
        }
    }
}

/// An introducing commit whose evidence files are still missing.
struct PendingIntro {
    commit: CommitId,
    info: Option<CommitInfo>,
    patch: Option<String>,
}

/// What the locked git step hands back.
struct Resolution {
    patch_commit: CommitId,
    attribution: PatchAttribution,
    metadata: Option<CommitInfo>,
    pending_intro: Vec<PendingIntro>,
}

/// Drives resolution for a batch of CVEs.
///
/// Cheap to clone; clones share caches, locks and configuration.
#[derive(Clone)]
pub struct Resolver {
    config: Arc<VintroConfig>,
    store: Store,
    patches: Arc<PatchCache>,
    repos: Arc<RepoCache>,
    locks: RepoLocks,
    filter: Arc<PathFilter>,
}

impl Resolver {
    /// Build a resolver over the directories in `config.paths`, fetching
    /// patch text through `source`.
    pub fn new(config: VintroConfig, source: Arc<dyn PatchSource>) -> Self {
        let store = Store::new(&config.paths);
        let patches = Arc::new(PatchCache::new(config.paths.patch_cache_dir(), source));
        let repos = Arc::new(RepoCache::new(config.paths.repo_cache_dir()));
        let filter = Arc::new(PathFilter::from_config(&config.resolve));
        Self {
            config: Arc::new(config),
            store,
            patches,
            repos,
            locks: RepoLocks::default(),
            filter,
        }
    }

    /// The output store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Resolve every unit with at most `run.jobs` in flight.
    ///
    /// Never fails as a whole: each unit's failure is contained in its
    /// report.
    pub async fn run(&self, units: Vec<CveUnit>, show_progress: bool) -> RunSummary {
        let progress = if show_progress {
            let pb = ProgressBar::new(units.len() as u64);
            pb.set_style(
                ProgressStyle::with_template("{spinner:.cyan} [{bar:30}] {pos}/{len} {msg} ({elapsed})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            pb
        } else {
            ProgressBar::hidden()
        };

        let semaphore = Arc::new(Semaphore::new(self.config.run.jobs.max(1)));
        let mut tasks = JoinSet::new();
        for unit in units {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let resolver = self.clone();
            let progress = progress.clone();
            tasks.spawn(async move {
                let _permit = permit;
                progress.set_message(unit.cve_id.clone());
                let report = resolver.resolve_unit(&unit).await;
                progress.inc(1);
                report
            });
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => summary.record(report),
                Err(e) => {
                    error!(error = %e, "worker task failed");
                    summary.units += 1;
                    summary.skipped += 1;
                }
            }
        }
        progress.finish_and_clear();

        summary.reports.sort_by(|a, b| a.cve_id.cmp(&b.cve_id));
        info!(
            units = summary.units,
            resolved = summary.resolved,
            already_processed = summary.already_processed,
            skipped = summary.skipped,
            no_introducing_commit = summary.no_introducing_commit,
            "run finished"
        );
        summary
    }

    /// Resolve one CVE: every patch commit, then the marker if anything was
    /// found.
    pub async fn resolve_unit(&self, unit: &CveUnit) -> UnitReport {
        let cve = unit.cve_id.as_str();
        if self.store.is_processed(cve) {
            debug!(cve, "already processed");
            return UnitReport {
                cve_id: unit.cve_id.clone(),
                outcome: UnitOutcome::AlreadyProcessed,
                patches: Vec::new(),
            };
        }

        let mut patches = Vec::with_capacity(unit.items.len());
        for item in &unit.items {
            let report = match self.resolve_item(item).await {
                Ok(found) => PatchReport {
                    commit_id: item.commit_id.clone(),
                    state: UnitState::Persisted,
                    skipped_at: None,
                    reason: None,
                    introducing_commits: found,
                },
                Err(skip) => {
                    warn!(cve, commit = %item.commit_id.short(), state = %skip.at, reason = %skip.reason, "skipped");
                    PatchReport {
                        commit_id: item.commit_id.clone(),
                        state: UnitState::Skipped,
                        skipped_at: Some(skip.at),
                        reason: Some(skip.reason),
                        introducing_commits: BTreeSet::new(),
                    }
                }
            };
            patches.push(report);
        }

        // A unit is complete only if every patch commit ran to the end.
        let any_skipped = patches.iter().any(|p| p.state == UnitState::Skipped);
        let found_any = patches.iter().any(|p| !p.introducing_commits.is_empty());
        let outcome = if any_skipped {
            UnitOutcome::Skipped
        } else if found_any {
            if let Err(e) = self.store.mark_processed(cve) {
                error!(cve, error = %e, "failed to write completeness marker");
            }
            UnitOutcome::Resolved
        } else {
            UnitOutcome::NoIntroducingCommit
        };
        info!(cve, outcome = ?outcome, "unit finished");

        UnitReport {
            cve_id: unit.cve_id.clone(),
            outcome,
            patches,
        }
    }

    async fn resolve_item(&self, item: &WorkItem) -> Result<BTreeSet<CommitId>, Skip> {
        let cve = item.cve_id.as_str();
        let repo_path = self.repos.path_for(&item.repo_url);
        let lock = self.locks.lock_for(&repo_path);

        debug!(cve, commit = %item.commit_id.short(), state = %UnitState::FetchingRepo);
        {
            let _guard = lock.lock().await;
            let repos = Arc::clone(&self.repos);
            let url = item.repo_url.clone();
            blocking(move || repos.sync(&url))
                .await
                .map_err(Skip::at(UnitState::FetchingRepo))?;
        }

        debug!(cve, commit = %item.commit_id.short(), state = %UnitState::FetchingPatch);
        let text = self
            .patches
            .fetch(&item.commit_url())
            .await
            .map_err(Skip::at(UnitState::FetchingPatch))?;

        debug!(cve, commit = %item.commit_id.short(), state = %UnitState::Parsing);
        let parsed = parse_patch(&text);
        if parsed.files.is_empty() {
            warn!(cve, commit = %item.commit_id.short(), "no patches generated");
        }
        let diagnostics: Vec<String> = parsed
            .diagnostics
            .iter()
            .map(|d| format!("line {}: {}", d.line, d.reason))
            .collect();

        debug!(cve, commit = %item.commit_id.short(), state = %UnitState::Resolving);
        let resolution = {
            let _guard = lock.lock().await;
            let config = Arc::clone(&self.config);
            let filter = Arc::clone(&self.filter);
            let store = self.store.clone();
            let cve_id = item.cve_id.clone();
            let commit = item.commit_id.clone();
            let files = parsed.files;
            blocking(move || resolve_locked(repo_path, &config, &filter, &store, &cve_id, &commit, files))
                .await
                .map_err(Skip::at(UnitState::Resolving))?
        };

        debug!(cve, commit = %resolution.patch_commit.short(), state = %UnitState::Aggregating);
        self.store_intro_evidence(item, &resolution).await;

        let record = ResolutionRecord {
            cve_id: item.cve_id.clone(),
            project_name: item.project_name.clone(),
            repo_url: item.repo_url.clone(),
            commit_id: resolution.patch_commit.clone(),
            introducing_commits: resolution.attribution.introducing_commits.clone(),
            malicious_files: resolution.attribution.malicious_files(),
            used_context_lines: resolution.attribution.used_context_lines(),
            file_changes: resolution.attribution.files,
            commit_metadata: resolution.metadata,
            diagnostics,
            resolved_at: Utc::now(),
        };
        let path = self
            .store
            .write_record(&record)
            .map_err(Skip::at(UnitState::Persisted))?;
        info!(
            cve,
            commit = %record.commit_id.short(),
            introducing = record.introducing_commits.len(),
            record = %path.display(),
            "persisted"
        );

        Ok(record.introducing_commits)
    }

    /// Write patch and metadata files for each introducing commit that does
    /// not have them yet. A failure for one commit never affects the others.
    async fn store_intro_evidence(&self, item: &WorkItem, resolution: &Resolution) {
        let cve = item.cve_id.as_str();
        for pending in &resolution.pending_intro {
            let text = match (&pending.patch, self.config.resolve.intro_patch_source) {
                (Some(text), _) => Some(text.clone()),
                (None, IntroPatchSource::Remote) => {
                    let url = commit_url_for(&item.repo_url, &pending.commit);
                    match self.patches.fetch(&url).await {
                        Ok(text) => Some(text),
                        Err(e) => {
                            warn!(cve, commit = %pending.commit.short(), error = %e, "introducing patch unavailable");
                            None
                        }
                    }
                }
                (None, IntroPatchSource::Local) => None,
            };
            let Some(text) = text else { continue };

            if let Err(e) = self.store.write_intro_patch(cve, &pending.commit, &text) {
                warn!(cve, commit = %pending.commit.short(), error = %e, "failed to store introducing patch");
                continue;
            }

            let file_changes = parse_patch(&text)
                .files
                .into_iter()
                .map(|f| {
                    (
                        f.path,
                        IntroFileChange {
                            added_lines: f.added_lines,
                            removed_lines: f.removed_lines,
                        },
                    )
                })
                .collect();
            let record = IntroRecord {
                cve_id: item.cve_id.clone(),
                project_name: item.project_name.clone(),
                commit_id: pending.commit.clone(),
                patch_commit: resolution.patch_commit.clone(),
                commit_metadata: pending.info.clone(),
                file_changes,
            };
            if let Err(e) = self.store.write_intro_record(&record) {
                warn!(cve, commit = %pending.commit.short(), error = %e, "failed to store introducing metadata");
            }
        }
    }
}

/// Everything that touches the working copy, run on a blocking thread
/// while the repository lock is held.
fn resolve_locked(
    repo_path: PathBuf,
    config: &VintroConfig,
    filter: &PathFilter,
    store: &Store,
    cve_id: &str,
    commit: &CommitId,
    files: Vec<vintro_difflens::parser::FileChange>,
) -> Result<Resolution, VintroError> {
    let repo = GitRepository::open(&repo_path)?.with_blame_backend(config.resolve.blame_backend);
    let patch_commit = repo.resolve_commit(commit.as_str())?;

    let attribution = attribute_patch(&repo, files, &patch_commit, &config.resolve, filter);

    let metadata = match repo.commit_info(&patch_commit) {
        Ok(info) => Some(info),
        Err(e) => {
            warn!(cve = cve_id, commit = %patch_commit.short(), error = %e, "no commit metadata");
            None
        }
    };

    let mut pending_intro = Vec::new();
    if config.resolve.fetch_intro_patches {
        for intro in &attribution.introducing_commits {
            if store.has_intro_evidence(cve_id, intro) {
                debug!(cve = cve_id, commit = %intro.short(), "introducing evidence already stored");
                continue;
            }
            let patch = match config.resolve.intro_patch_source {
                IntroPatchSource::Local => match repo.commit_patch(intro) {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(cve = cve_id, commit = %intro.short(), error = %e, "failed to render introducing patch");
                        None
                    }
                },
                IntroPatchSource::Remote => None,
            };
            pending_intro.push(PendingIntro {
                commit: intro.clone(),
                info: repo.commit_info(intro).ok(),
                patch,
            });
        }
    }

    Ok(Resolution {
        patch_commit,
        attribution,
        metadata,
        pending_intro,
    })
}

async fn blocking<T, F>(work: F) -> Result<T, VintroError>
where
    F: FnOnce() -> Result<T, VintroError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VintroError::Git(format!("blocking task failed: {e}")))?
}
