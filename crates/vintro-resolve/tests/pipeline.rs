use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use git2::{Commit, Oid, Repository, Signature, Time};
use tempfile::TempDir;
use vintro_core::{CommitId, IntroPatchSource, PathsConfig, VintroConfig, VintroError};
use vintro_gitpulse::repo::{GitRepository, RepositoryHandle};
use vintro_resolve::manifest::{commit_url_for, group_units, WorkItem};
use vintro_resolve::patch::PatchSource;
use vintro_resolve::pipeline::{Resolver, UnitOutcome, UnitState};
use vintro_resolve::store::IntroRecord;

fn commit_files(repo: &Repository, files: &[(&str, &str)], message: &str, tick: i64) -> Oid {
    let workdir = repo.workdir().unwrap().to_path_buf();
    let mut index = repo.index().unwrap();
    for (path, content) in files {
        fs::write(workdir.join(path), content).unwrap();
        index.add_path(Path::new(path)).unwrap();
    }
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let parents: Vec<Commit<'_>> = repo
        .head()
        .ok()
        .and_then(|h| h.peel_to_commit().ok())
        .into_iter()
        .collect();
    let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();
    let sig = Signature::new("Tester", "tester@example.com", &Time::new(1_600_000_000 + tick, 0)).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

/// Serves patches rendered from the upstream repository, recording calls.
struct UpstreamPatches {
    patches: HashMap<String, String>,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PatchSource for UpstreamPatches {
    async fn fetch(&self, url: &str) -> Result<String, VintroError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(url.to_string());
        self.patches
            .iter()
            .find(|(sha, _)| url.ends_with(sha.as_str()))
            .map(|(_, text)| text.clone())
            .ok_or_else(|| VintroError::Fetch(format!("{url} returned 404 Not Found")))
    }
}

struct Upstream {
    _dir: TempDir,
    url: String,
    root: CommitId,
    fix: CommitId,
    add_only: CommitId,
    harden: CommitId,
    patches: HashMap<String, String>,
}

/// root adds foo.c, feature adds bar.c, fix rewrites a line of foo.c and
/// adds new.c, add_only adds extra.c, harden inserts a line into foo.c.
fn upstream() -> Upstream {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("project");
    let repo = Repository::init(&path).unwrap();

    let root = commit_files(
        &repo,
        &[("foo.c", "int main() {\n    int x = 1;\n    return x;\n}\n")],
        "initial import",
        0,
    );
    commit_files(&repo, &[("bar.c", "void bar(void) {}\n")], "add bar", 60);
    let fix = commit_files(
        &repo,
        &[
            ("foo.c", "int main() {\n    int x = 2;\n    return x;\n}\n"),
            ("new.c", "int fresh;\n"),
        ],
        "fix x",
        120,
    );
    let add_only = commit_files(&repo, &[("extra.c", "int extra;\n")], "add extra", 180);
    let harden = commit_files(
        &repo,
        &[(
            "foo.c",
            "int main() {\n    int x = 2;\n    check(x);\n    return x;\n}\n",
        )],
        "check x",
        240,
    );

    let handle = GitRepository::open(&path).unwrap();
    let mut patches = HashMap::new();
    for oid in [root, fix, add_only, harden] {
        let id = CommitId::new(&oid.to_string());
        patches.insert(id.to_string(), handle.commit_patch(&id).unwrap());
    }

    Upstream {
        url: path.to_string_lossy().to_string(),
        _dir: dir,
        root: CommitId::new(&root.to_string()),
        fix: CommitId::new(&fix.to_string()),
        add_only: CommitId::new(&add_only.to_string()),
        harden: CommitId::new(&harden.to_string()),
        patches,
    }
}

fn item(cve: &str, url: &str, commit: &CommitId) -> WorkItem {
    WorkItem {
        cve_id: cve.into(),
        project_name: "project".into(),
        repo_url: url.into(),
        commit_id: commit.clone(),
        commit_url: None,
    }
}

fn config(data: &Path) -> VintroConfig {
    VintroConfig {
        paths: PathsConfig::rooted_at(data),
        ..VintroConfig::default()
    }
}

fn resolver_with(
    config: VintroConfig,
    upstream: &Upstream,
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<String>>>,
) -> Resolver {
    Resolver::new(
        config,
        Arc::new(UpstreamPatches {
            patches: upstream.patches.clone(),
            calls,
            seen,
        }),
    )
}

fn resolver(data: &Path, upstream: &Upstream, calls: Arc<AtomicUsize>) -> Resolver {
    resolver_with(config(data), upstream, calls, Arc::default())
}

fn data_dir(dir: &TempDir) -> PathBuf {
    dir.path().join("data")
}

#[tokio::test]
async fn fix_resolves_to_its_introducing_commit() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = resolver(&data_dir(&data), &upstream, calls.clone());

    let units = group_units(vec![item("CVE-2020-0001", &upstream.url, &upstream.fix)], None);
    let summary = resolver.run(units, false).await;

    assert_eq!(summary.units, 1);
    assert_eq!(summary.resolved, 1);
    assert_eq!(summary.reports[0].outcome, UnitOutcome::Resolved);
    assert_eq!(summary.reports[0].patches[0].state, UnitState::Persisted);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let store = resolver.store();
    assert!(store.is_processed("CVE-2020-0001"));
    let record = store
        .load_record("CVE-2020-0001", &upstream.fix)
        .unwrap()
        .expect("record written");
    assert_eq!(record.introducing_commits, BTreeSet::from([upstream.root.clone()]));
    assert_eq!(record.malicious_files, vec!["foo.c".to_string()]);
    assert!(!record.used_context_lines);
    assert_eq!(record.file_changes["foo.c"].removed_lines, vec!["    int x = 1;".to_string()]);
    assert_eq!(record.file_changes["new.c"].miss.as_deref(), Some("no lines to attribute"));
    assert_eq!(record.commit_metadata.as_ref().map(|m| m.summary()), Some("fix x"));

    assert!(store.intro_patch_path("CVE-2020-0001", &upstream.root).exists());
    let intro: IntroRecord = serde_json::from_str(
        &fs::read_to_string(store.intro_metadata_path("CVE-2020-0001", &upstream.root)).unwrap(),
    )
    .unwrap();
    assert_eq!(intro.patch_commit, upstream.fix);
    assert!(intro.file_changes["foo.c"]
        .added_lines
        .contains(&"    int x = 1;".to_string()));
}

#[tokio::test]
async fn processed_cve_is_not_touched_again() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let units = || group_units(vec![item("CVE-2020-0001", &upstream.url, &upstream.fix)], None);

    let first = resolver(&data_dir(&data), &upstream, Arc::new(AtomicUsize::new(0)));
    first.run(units(), false).await;
    let before = first
        .store()
        .load_record("CVE-2020-0001", &upstream.fix)
        .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let second = resolver(&data_dir(&data), &upstream, calls.clone());
    let summary = second.run(units(), false).await;

    assert_eq!(summary.already_processed, 1);
    assert_eq!(summary.resolved, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let after = second
        .store()
        .load_record("CVE-2020-0001", &upstream.fix)
        .unwrap();
    assert_eq!(before, after);
}

#[tokio::test]
async fn unit_without_evidence_stays_unmarked() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let resolver = resolver(&data_dir(&data), &upstream, Arc::new(AtomicUsize::new(0)));

    let units = group_units(vec![item("CVE-2020-0002", &upstream.url, &upstream.add_only)], None);
    let summary = resolver.run(units, false).await;

    assert_eq!(summary.no_introducing_commit, 1);
    assert!(!resolver.store().is_processed("CVE-2020-0002"));
    let record = resolver
        .store()
        .load_record("CVE-2020-0002", &upstream.add_only)
        .unwrap()
        .expect("record written even without evidence");
    assert!(record.introducing_commits.is_empty());
}

#[tokio::test]
async fn unreachable_repository_skips_the_unit() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = resolver(&data_dir(&data), &upstream, calls.clone());
    let missing = data.path().join("no-such-repo").to_string_lossy().to_string();

    let units = group_units(
        vec![
            item("CVE-2020-0003", &missing, &upstream.fix),
            item("CVE-2020-0001", &upstream.url, &upstream.fix),
        ],
        None,
    );
    let summary = resolver.run(units, false).await;

    assert_eq!(summary.units, 2);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.resolved, 1);
    let skipped = &summary.reports.iter().find(|r| r.cve_id == "CVE-2020-0003").unwrap().patches[0];
    assert_eq!(skipped.state, UnitState::Skipped);
    assert_eq!(skipped.skipped_at, Some(UnitState::FetchingRepo));
    assert!(!resolver.store().is_processed("CVE-2020-0003"));
}

#[tokio::test]
async fn skipped_sibling_keeps_the_unit_unmarked() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let resolver = resolver(&data_dir(&data), &upstream, Arc::new(AtomicUsize::new(0)));
    let missing = data.path().join("no-such-repo").to_string_lossy().to_string();

    let units = group_units(
        vec![
            item("CVE-2020-0004", &upstream.url, &upstream.fix),
            item("CVE-2020-0004", &missing, &upstream.add_only),
        ],
        None,
    );
    let summary = resolver.run(units, false).await;

    assert_eq!(summary.units, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.resolved, 0);
    assert_eq!(summary.reports[0].outcome, UnitOutcome::Skipped);
    assert!(!resolver.store().is_processed("CVE-2020-0004"));

    let record = resolver
        .store()
        .load_record("CVE-2020-0004", &upstream.fix)
        .unwrap()
        .expect("resolved sibling is still recorded");
    assert_eq!(record.introducing_commits, BTreeSet::from([upstream.root.clone()]));
}

#[tokio::test]
async fn stored_intro_evidence_is_not_fetched_again() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let mut config = config(&data_dir(&data));
    config.resolve.intro_patch_source = IntroPatchSource::Remote;
    config.resolve.fetch_intro_patches = true;
    let units = || group_units(vec![item("CVE-2020-0005", &upstream.url, &upstream.fix)], None);
    let intro_url = commit_url_for(&upstream.url, &upstream.root);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = resolver_with(config.clone(), &upstream, Arc::new(AtomicUsize::new(0)), seen.clone());
    let summary = first.run(units(), false).await;
    assert_eq!(summary.resolved, 1);
    assert!(seen.lock().unwrap().contains(&intro_url));

    let store = first.store();
    let patch_path = store.intro_patch_path("CVE-2020-0005", &upstream.root);
    let meta_path = store.intro_metadata_path("CVE-2020-0005", &upstream.root);
    let patch_before = fs::read(&patch_path).unwrap();
    let meta_before = fs::read(&meta_path).unwrap();
    let meta_mtime = fs::metadata(&meta_path).unwrap().modified().unwrap();

    fs::remove_file(store.marker_path("CVE-2020-0005")).unwrap();
    fs::remove_dir_all(config.paths.patch_cache_dir()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let second = resolver_with(config.clone(), &upstream, Arc::new(AtomicUsize::new(0)), seen.clone());
    let summary = second.run(units(), false).await;

    assert_eq!(summary.resolved, 1);
    let urls = seen.lock().unwrap().clone();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].ends_with(upstream.fix.as_str()));
    assert!(!urls.contains(&intro_url));
    assert_eq!(fs::read(&patch_path).unwrap(), patch_before);
    assert_eq!(fs::read(&meta_path).unwrap(), meta_before);
    assert_eq!(fs::metadata(&meta_path).unwrap().modified().unwrap(), meta_mtime);
}

#[tokio::test]
async fn insertion_falls_back_to_surrounding_lines() {
    let upstream = upstream();
    let data = TempDir::new().unwrap();
    let resolver = resolver(&data_dir(&data), &upstream, Arc::new(AtomicUsize::new(0)));

    let units = group_units(vec![item("CVE-2020-0006", &upstream.url, &upstream.harden)], None);
    let summary = resolver.run(units, false).await;
    assert_eq!(summary.resolved, 1);

    let record = resolver
        .store()
        .load_record("CVE-2020-0006", &upstream.harden)
        .unwrap()
        .expect("record written");
    assert!(record.used_context_lines);
    let foo = &record.file_changes["foo.c"];
    assert!(foo.used_context_lines);
    assert!(foo.removed_lines.is_empty());
    assert!(foo.target_lines.contains(&"return x;".to_string()));
    assert!(record.introducing_commits.contains(&upstream.root));
    assert!(!record.introducing_commits.contains(&upstream.harden));
    assert_eq!(record.malicious_files, vec!["foo.c".to_string()]);
}
