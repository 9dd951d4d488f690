use std::fs;
use std::path::Path;

use git2::{Commit, Oid, Repository, Signature, Time};
use tempfile::TempDir;
use vintro_core::{BlameBackend, CommitId};
use vintro_difflens::parser::parse_patch;
use vintro_difflens::select::AttributionTarget;
use vintro_gitpulse::ancestry::{check_candidate, filter_candidates, AncestryVerdict};
use vintro_gitpulse::blame::{resolve_file, LookupMiss};
use vintro_gitpulse::cache::RepoCache;
use vintro_gitpulse::repo::{GitRepository, RepositoryHandle};

fn signature(offset: i64) -> Signature<'static> {
    Signature::new("Tester", "tester@example.com", &Time::new(1_600_000_000 + offset, 0)).unwrap()
}

fn commit_files(repo: &Repository, files: &[(&str, &str)], message: &str, tick: i64) -> Oid {
    let workdir = repo.workdir().unwrap().to_path_buf();
    let mut index = repo.index().unwrap();
    for (path, content) in files {
        let full = workdir.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
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
    let sig = signature(tick);
    repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)
        .unwrap()
}

struct Fixture {
    _dir: TempDir,
    path: std::path::PathBuf,
    root: CommitId,
    feature: CommitId,
    fix: CommitId,
    side: CommitId,
}

/// root: foo.c with `int x = 1;`
/// feature: adds bar.c
/// fix: rewrites `int x = 1;` and adds new.c
/// side: a commit off root that HEAD never reaches
fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("project");
    let repo = Repository::init(&path).unwrap();

    let root = commit_files(
        &repo,
        &[("foo.c", "int main() {\n    int x = 1;\n    return x;\n}\n")],
        "initial import",
        0,
    );
    let feature = commit_files(&repo, &[("bar.c", "void bar(void) {}\n")], "add bar", 60);
    let fix = commit_files(
        &repo,
        &[
            ("foo.c", "int main() {\n    int x = 2;\n    return x;\n}\n"),
            ("new.c", "int fresh;\n"),
        ],
        "fix x\n\nUse the safe value.",
        120,
    );

    let root_commit = repo.find_commit(root).unwrap();
    let tree = root_commit.tree().unwrap();
    let sig = signature(180);
    let side = repo
        .commit(None, &sig, &sig, "side branch", &tree, &[&root_commit])
        .unwrap();

    Fixture {
        _dir: dir,
        path,
        root: CommitId::new(&root.to_string()),
        feature: CommitId::new(&feature.to_string()),
        fix: CommitId::new(&fix.to_string()),
        side: CommitId::new(&side.to_string()),
    }
}

fn target(lines: &[&str]) -> AttributionTarget {
    AttributionTarget {
        lines: lines.iter().map(|l| l.to_string()).collect(),
        used_context_lines: false,
    }
}

#[test]
fn blame_attributes_removed_line_to_root() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let found = resolve_file(&repo, "foo.c", &target(&["int x = 1;"]), &fx.fix, 8).unwrap();

    assert_eq!(found.revision.as_ref(), Some(&fx.feature));
    assert_eq!(found.commits.len(), 1);
    assert!(found.commits.contains(&fx.root));
    assert!(found.matched_lines().contains("int x = 1;"));
}

#[test]
fn introducing_set_is_ancestors_only() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let boundary = CommitId::new(&format!("^{}", &fx.root.as_str()[..39]));
    let unknown = CommitId::new("0123456789abcdef0123456789abcdef01234567");
    let candidates = vec![
        boundary,
        fx.fix.clone(),
        unknown,
        fx.side.clone(),
        fx.feature.clone(),
    ];

    let kept = filter_candidates(&repo, &candidates, &fx.fix);
    let expected: std::collections::BTreeSet<CommitId> =
        [fx.root.clone(), fx.feature.clone()].into_iter().collect();
    assert_eq!(kept, expected);
    assert!(!kept.contains(&fx.fix));
}

#[test]
fn verdicts_name_each_exclusion() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    assert_eq!(
        check_candidate(&repo, &fx.fix, &fx.fix),
        AncestryVerdict::SelfReference
    );
    assert_eq!(
        check_candidate(&repo, &CommitId::new(fx.fix.short()), &fx.fix),
        AncestryVerdict::SelfReference
    );
    assert_eq!(
        check_candidate(&repo, &CommitId::new("feedface"), &fx.fix),
        AncestryVerdict::Unresolvable
    );
    assert_eq!(
        check_candidate(&repo, &fx.side, &fx.fix),
        AncestryVerdict::NotAncestor
    );
    assert_eq!(
        check_candidate(&repo, &fx.root, &fx.fix),
        AncestryVerdict::Included(fx.root.clone())
    );
}

#[test]
fn root_commit_has_no_evidence() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let miss = resolve_file(&repo, "foo.c", &target(&["int x = 1;"]), &fx.root, 8).unwrap_err();
    assert_eq!(miss, LookupMiss::RootCommit);
}

#[test]
fn file_absent_in_parent_is_an_explicit_miss() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let err = repo.blame_file("new.c", &fx.feature).unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    let miss = resolve_file(&repo, "new.c", &target(&["int fresh;"]), &fx.fix, 8).unwrap_err();
    assert_eq!(
        miss,
        LookupMiss::MissingFile {
            revision: fx.feature.clone()
        }
    );
}

#[test]
fn resolve_commit_accepts_boundary_and_short_forms() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let caret = format!("^{}", fx.root.short());
    assert_eq!(repo.resolve_commit(&caret).unwrap(), fx.root);
    assert_eq!(repo.resolve_commit("HEAD").unwrap(), fx.fix);
    assert!(repo.resolve_commit("no-such-ref").is_err());
    assert_eq!(repo.parents(&fx.fix).unwrap(), vec![fx.feature.clone()]);
    assert!(repo.parents(&fx.root).unwrap().is_empty());
}

#[test]
fn commit_info_and_patch_describe_the_fix() {
    let fx = fixture();
    let repo = GitRepository::open(&fx.path).unwrap();

    let info = repo.commit_info(&fx.fix).unwrap();
    assert_eq!(info.hash, fx.fix);
    assert_eq!(info.author, "Tester");
    assert_eq!(info.summary(), "fix x");
    assert_eq!(info.insertions, 2);
    assert_eq!(info.deletions, 1);
    assert_eq!(info.files_changed, vec!["foo.c".to_string(), "new.c".to_string()]);

    let patch = repo.commit_patch(&fx.fix).unwrap();
    assert!(patch.starts_with(&format!("From {} ", fx.fix)));
    assert!(patch.contains("Subject: [PATCH] fix x"));
    let parsed = parse_patch(&patch);
    assert!(parsed.diagnostics.is_empty());
    let foo = parsed.get("foo.c").unwrap();
    assert_eq!(foo.removed_lines, vec!["    int x = 1;"]);
    assert_eq!(foo.added_lines, vec!["    int x = 2;"]);
    assert!(parsed.get("new.c").unwrap().is_new_file);
}

#[test]
fn cli_backend_agrees_with_libgit2() {
    if std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_err()
    {
        return;
    }
    let fx = fixture();
    let repo = GitRepository::open(&fx.path)
        .unwrap()
        .with_blame_backend(BlameBackend::Cli);

    let found = resolve_file(&repo, "foo.c", &target(&["int x = 1;"]), &fx.fix, 8).unwrap();
    assert_eq!(
        found.commits.into_iter().collect::<Vec<_>>(),
        vec![fx.root.clone()]
    );
}

#[test]
fn repo_cache_clones_then_updates() {
    let fx = fixture();
    let cache_dir = TempDir::new().unwrap();
    let url = fx.path.to_string_lossy().to_string();

    let first = RepoCache::new(cache_dir.path());
    let dest = first.sync(&url).unwrap();
    assert_eq!(dest, first.path_for(&url));
    let cloned = GitRepository::open(&dest).unwrap();
    assert_eq!(cloned.resolve_commit("HEAD").unwrap(), fx.fix);

    let upstream = Repository::open(&fx.path).unwrap();
    let newer = commit_files(&upstream, &[("foo.c", "int main() { return 0; }\n")], "later", 240);

    // Same process: synced once, no refresh.
    first.sync(&url).unwrap();
    let unchanged = GitRepository::open(&dest).unwrap();
    assert_eq!(unchanged.resolve_commit("HEAD").unwrap(), fx.fix);

    // A new run fetches and resets to the remote head.
    let second = RepoCache::new(cache_dir.path());
    second.sync(&url).unwrap();
    let refreshed = GitRepository::open(&dest).unwrap();
    assert_eq!(
        refreshed.resolve_commit("HEAD").unwrap(),
        CommitId::new(&newer.to_string())
    );
    assert!(!Path::new(&format!("{}.partial", dest.display())).exists());
}
