use std::fs::OpenOptions;
use std::io::{IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use clap::{CommandFactory, Parser, Subcommand};
use miette::{Context, IntoDiagnostic, Result};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use vintro_core::{CommitId, OutputFormat, VintroConfig};
use vintro_difflens::filter::PathFilter;
use vintro_difflens::parser::{parse_patch, FileChange};
use vintro_difflens::select::select_targets;
use vintro_gitpulse::repo::{GitRepository, RepositoryHandle};
use vintro_resolve::attribute::attribute_patch;
use vintro_resolve::manifest::{group_units, load_cve_list, load_manifest, Shard};
use vintro_resolve::patch::HttpPatchSource;
use vintro_resolve::pipeline::{Resolver, RunSummary, UnitState};
use vintro_resolve::store::Store;

const CONFIG_FILE: &str = ".vintro.toml";

#[derive(Parser)]
#[command(
    name = "vintro",
    version,
    about = "Trace security fixes back to the commits that introduced the vulnerable code",
    long_about = "vintro takes the commits that fixed known vulnerabilities and finds the earlier\n\
                   commits that introduced the vulnerable lines, using blame on the fix's parent\n\
                   revision and keeping only true ancestors of the fix.\n\n\
                   Examples:\n  \
                     vintro resolve --manifest fixes.json          Resolve every CVE in a manifest\n  \
                     vintro resolve --manifest fixes.json --shard 2/4\n  \
                     vintro inspect --repo ./zlib --commit 8a2f9c  Attribute one local fix\n  \
                     git show HEAD | vintro parse                  Show what a patch would attribute\n  \
                     vintro audit                                  Check stored records"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .vintro.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Also log to stderr
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve introducing commits for every CVE in a manifest
    #[command(long_about = "Resolve introducing commits for every CVE in a manifest.\n\n\
        The manifest is a JSON array of {cve_id, project_name, repo_url, commit_id, commit_url?}\n\
        rows. CVEs that already carry a completeness marker are not touched again.\n\n\
        Examples:\n  vintro resolve --manifest fixes.json\n  vintro resolve --manifest fixes.json --cves todo.txt --jobs 8")]
    Resolve {
        /// Manifest of patch commits
        #[arg(long)]
        manifest: PathBuf,

        /// Only process CVE ids listed in this file (one per line)
        #[arg(long)]
        cves: Option<PathBuf>,

        /// Process the K-th of N slices of the CVE list, e.g. 2/4
        #[arg(long)]
        shard: Option<Shard>,

        /// Units of work in flight at once (overrides run.jobs)
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        jobs: Option<u16>,

        /// Root for caches, records and the log (overrides paths.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,
    },
    /// Parse a patch and show the lines that would be attributed
    #[command(long_about = "Parse a patch and show the lines that would be attributed.\n\n\
        Reads from stdin or a file.\n\n\
        Examples:\n  git format-patch -1 --stdout | vintro parse\n  vintro parse --file fix.patch --format json")]
    Parse {
        /// Read the patch from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Attribute one fix against a local repository without persisting
    Inspect {
        /// Local repository path
        #[arg(long, default_value = ".")]
        repo: PathBuf,

        /// The fixing commit
        #[arg(long)]
        commit: String,

        /// Use this patch instead of rendering the commit locally
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Report duplicate, context-only and unmarked records
    Audit {
        /// Root of the stored records (overrides paths.data_dir)
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Create a default .vintro.toml in the current directory
    Init,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

const DEFAULT_CONFIG: &str = r#"# vintro configuration

[paths]
# data_dir = "."
# patch_cache = "patch_cache"
# repo_cache = "repo_cache"
# records = "commit_metadata"
# intro_patches = "vulnerability_patches"
# intro_metadata = "vulnerability_intro_metadata"
# log_file = "vintro.log"

[resolve]
# context_window = 3
# substring_min_len = 8
# blame_backend = "libgit2"        # or "cli"
# fetch_intro_patches = true
# intro_patch_source = "local"     # or "remote"
# skip_patterns = ["ChangeLog", "NEWS"]
# skip_extensions = ["md", "txt"]

[fetch]
# timeout_secs = 30
# user_agent = "vintro"
# retries = 1

[run]
# jobs = 4

[log]
# level = "info"
"#;

fn load_config(path: Option<&Path>) -> Result<VintroConfig> {
    let config = match path {
        Some(path) => VintroConfig::from_file(path).wrap_err(format!("loading {}", path.display()))?,
        None => {
            let default_path = Path::new(CONFIG_FILE);
            if default_path.exists() {
                VintroConfig::from_file(default_path).wrap_err(format!("loading {CONFIG_FILE}"))?
            } else {
                VintroConfig::default()
            }
        }
    };
    Ok(config)
}

/// Install the subscriber: the persistent log file when `persist` is set,
/// stderr when `verbose` is set. `RUST_LOG` overrides `log.level`.
fn init_logging(config: &VintroConfig, verbose: bool, persist: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .into_diagnostic()
        .wrap_err(format!("invalid log level '{}'", config.log.level))?;

    let file_layer = if persist {
        let path = config.paths.log_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .into_diagnostic()
                .wrap_err(format!("creating {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .into_diagnostic()
            .wrap_err(format!("opening log file {}", path.display()))?;
        Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
    } else {
        None
    };

    let stderr_layer = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .into_diagnostic()
        .wrap_err("installing log subscriber")
}

fn read_patch_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .into_diagnostic()
            .wrap_err(format!("reading {}", path.display())),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .into_diagnostic()
                .wrap_err("reading stdin")?;
            Ok(input)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).into_diagnostic()?);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!("{summary}");
    for report in &summary.reports {
        for patch in &report.patches {
            if patch.state != UnitState::Skipped {
                continue;
            }
            let at = patch.skipped_at.map(|s| s.to_string()).unwrap_or_default();
            println!(
                "  {} {} skipped at {}: {}",
                report.cve_id,
                patch.commit_id.short(),
                at,
                patch.reason.as_deref().unwrap_or("unknown")
            );
        }
    }
}

#[derive(Serialize)]
struct ParsedFile<'a> {
    #[serde(flatten)]
    change: &'a FileChange,
    targets: Vec<&'a str>,
    used_context_lines: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(miette::MietteHandlerOpts::new().terminal_links(true).build())
    }))
    .into_diagnostic()?;
    human_panic::setup_panic!();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Resolve {
            ref manifest,
            ref cves,
            shard,
            jobs,
            ref data_dir,
            no_progress,
        } => {
            if let Some(dir) = data_dir {
                config.paths.data_dir = dir.clone();
            }
            if let Some(jobs) = jobs {
                config.run.jobs = usize::from(jobs);
            }
            init_logging(&config, cli.verbose, true)?;

            let items = load_manifest(manifest)?;
            let only = match cves {
                Some(path) => Some(load_cve_list(path)?),
                None => None,
            };
            let mut units = group_units(items, only.as_deref());
            if let Some(shard) = shard {
                units = shard.select(&units).to_vec();
                tracing::info!(%shard, units = units.len(), "selected shard");
            }

            let source = HttpPatchSource::new(&config.fetch)?;
            let show_progress = !no_progress && !cli.verbose && std::io::stderr().is_terminal();
            let resolver = Resolver::new(config, Arc::new(source));
            let summary = resolver.run(units, show_progress).await;

            match cli.format {
                OutputFormat::Json => print_json(&summary)?,
                OutputFormat::Text => print_summary(&summary),
            }
        }
        Command::Parse { ref file } => {
            init_logging(&config, cli.verbose, false)?;
            let input = read_patch_input(file.as_deref())?;
            let parsed = parse_patch(&input);
            let targets: Vec<_> = parsed
                .files
                .iter()
                .map(|change| (change, select_targets(change, config.resolve.context_window)))
                .collect();

            match cli.format {
                OutputFormat::Json => {
                    let files: Vec<ParsedFile<'_>> = targets
                        .iter()
                        .map(|(change, target)| ParsedFile {
                            change,
                            targets: target.lines.iter().map(String::as_str).collect(),
                            used_context_lines: target.used_context_lines,
                        })
                        .collect();
                    print_json(&serde_json::json!({
                        "files": files,
                        "diagnostics": parsed.diagnostics,
                    }))?;
                }
                OutputFormat::Text => {
                    if parsed.files.is_empty() {
                        println!("no patches generated");
                    }
                    for (change, target) in &targets {
                        let source = if target.used_context_lines { " (context)" } else { "" };
                        println!("{change}{source}");
                        for line in &target.lines {
                            println!("    {line}");
                        }
                    }
                    for diag in &parsed.diagnostics {
                        let path = diag.path.as_deref().unwrap_or("?");
                        println!("skipped {path} at line {}: {}", diag.line, diag.reason);
                    }
                }
            }
        }
        Command::Inspect {
            ref repo,
            ref commit,
            ref file,
        } => {
            init_logging(&config, cli.verbose, false)?;
            let handle = GitRepository::open(repo)?.with_blame_backend(config.resolve.blame_backend);
            let patch_commit = handle.resolve_commit(CommitId::new(commit).as_str())?;
            let text = match file {
                Some(path) => read_patch_input(Some(path.as_path()))?,
                None => handle.commit_patch(&patch_commit)?,
            };
            let parsed = parse_patch(&text);
            let filter = PathFilter::from_config(&config.resolve);
            let attribution = attribute_patch(&handle, parsed.files, &patch_commit, &config.resolve, &filter);

            match cli.format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "commit_id": patch_commit,
                    "introducing_commits": attribution.introducing_commits,
                    "malicious_files": attribution.malicious_files(),
                    "used_context_lines": attribution.used_context_lines(),
                    "file_changes": attribution.files,
                    "skipped": attribution.skipped,
                }))?,
                OutputFormat::Text => {
                    println!("fix {}", patch_commit.short());
                    for (path, evidence) in &attribution.files {
                        let found: Vec<&str> = evidence.introducing_commits.iter().map(CommitId::short).collect();
                        match &evidence.miss {
                            Some(miss) => println!("  {path}: {miss}"),
                            None if found.is_empty() => println!("  {path}: no ancestor attributed"),
                            None => println!("  {path}: {}", found.join(", ")),
                        }
                        if evidence.used_context_lines {
                            println!("    (attributed from context lines)");
                        }
                    }
                    for skip in &attribution.skipped {
                        println!("  {}: skipped, {}", skip.path, skip.reason);
                    }
                    if attribution.introducing_commits.is_empty() {
                        println!("no introducing commit found");
                    } else {
                        println!("introduced by:");
                        for intro in &attribution.introducing_commits {
                            match handle.commit_info(intro) {
                                Ok(info) => println!("  {} {} ({})", intro.short(), info.summary(), info.committed_date),
                                Err(_) => println!("  {}", intro.short()),
                            }
                        }
                    }
                }
            }
        }
        Command::Audit { ref data_dir } => {
            if let Some(dir) = data_dir {
                config.paths.data_dir = dir.clone();
            }
            init_logging(&config, cli.verbose, false)?;
            let store = Store::new(&config.paths);
            let report = vintro_resolve::audit::audit(&store)?;

            match cli.format {
                OutputFormat::Json => print_json(&report)?,
                OutputFormat::Text => {
                    println!("{} records scanned", report.records_scanned);
                    for dup in &report.duplicates {
                        println!(
                            "duplicate {}: introduces {} and fixes {}",
                            dup.commit.short(),
                            dup.introduced_in.join(", "),
                            dup.fixes.join(", ")
                        );
                    }
                    for (cve, commit) in &report.context_line_records {
                        println!("context-only {cve} {}", commit.short());
                    }
                    for cve in &report.unmarked {
                        println!("unmarked {cve}");
                    }
                    if report.is_clean() {
                        println!("no issues found");
                    }
                }
            }
        }
        Command::Init => {
            let path = Path::new(CONFIG_FILE);
            if path.exists() {
                miette::bail!("{CONFIG_FILE} already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created {CONFIG_FILE} with default configuration");
        }
        Command::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "vintro", &mut std::io::stdout());
        }
    }

    Ok(())
}
