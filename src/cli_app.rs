//! Top-level CLI definition and dispatch.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use drift_agent::core::config::Config;
use drift_agent::core::errors::DriftError;
use drift_agent::core::paths::absolutize;
use drift_agent::daemon::loop_main::DriftDaemon;
use drift_agent::daemon::signals::SignalHandler;
use drift_agent::drift::changeset::{Category, ChangeType, DirectoryEntry, Header};
use drift_agent::drift::codec::{ChangeSetReader, write_change_set};
use drift_agent::drift::coordinator::DriftCoordinator;
use drift_agent::drift::definition::{Filter, ResourceId, ScheduleKey};
use drift_agent::drift::store::ChangeSetStore;
use drift_agent::drift::transport::SpoolServer;
use drift_agent::logger::diagnostics;
use drift_agent::logger::journal::JournalHandle;
use drift_agent::scanner::analyzer::{AnalyzerConfig, DirectoryAnalyzer, Snapshot};
use drift_agent::scanner::filter::FilterSet;

/// driftd: agent-side drift detection.
#[derive(Debug, Parser)]
#[command(
    name = "driftd",
    author,
    version,
    about = "Drift detection agent - fingerprints directory trees and ships change-sets",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Increase diagnostic verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    verbose: u8,
    /// Quiet mode (errors only).
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the drift detection daemon.
    Daemon,
    /// Snapshot a directory once and print the resulting change-set.
    Scan(ScanArgs),
    /// Decode and summarize a change-set file.
    Show(ShowArgs),
    /// Acknowledge delivered bundles for a definition.
    Ack(AckArgs),
    /// Show stored change-sets and pending bundles.
    Status,
    /// Print the effective configuration.
    Config(ConfigArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Directory to scan.
    dir: PathBuf,
    /// Definition name written into the change-set header.
    #[arg(long, default_value = "adhoc")]
    name: String,
    /// Include filter: `DIR` or `DIR:GLOB` (repeatable).
    #[arg(long = "include", value_name = "FILTER")]
    includes: Vec<String>,
    /// Exclude filter: `DIR` or `DIR:GLOB` (repeatable).
    #[arg(long = "exclude", value_name = "FILTER")]
    excludes: Vec<String>,
    /// Coverage change-set to diff against (e.g. a stored snapshot.txt).
    #[arg(long, value_name = "CHANGESET")]
    against: Option<PathBuf>,
    /// Write the change-set here instead of stdout.
    #[arg(long, short, value_name = "FILE")]
    output: Option<PathBuf>,
    /// Follow symbolic links.
    #[arg(long)]
    follow_symlinks: bool,
}

#[derive(Debug, Clone, Args)]
struct ShowArgs {
    /// Change-set file to decode.
    file: PathBuf,
}

#[derive(Debug, Clone, Args)]
struct AckArgs {
    /// Resource the definition belongs to.
    #[arg(long)]
    resource: ResourceId,
    /// Definition name.
    #[arg(long)]
    definition: String,
    /// Acknowledge one content bundle instead of the change-sets.
    #[arg(long)]
    token: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Print only the config file path.
    #[arg(long)]
    path: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Failure reported by the drift engine.
    #[error("{0}")]
    Drift(#[from] DriftError),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Drift(DriftError::InvalidConfig { .. } | DriftError::MissingConfig { .. }) => 1,
            Self::Drift(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }
    // Ignored when a subscriber is already installed.
    let _ = diagnostics::init(diagnostics::level_from_flags(cli.verbose, cli.quiet));

    match &cli.command {
        Command::Daemon => run_daemon(cli),
        Command::Scan(args) => run_scan(cli, args),
        Command::Show(args) => run_show(cli, args),
        Command::Ack(args) => run_ack(cli, args),
        Command::Status => run_status(cli),
        Command::Config(args) => run_config(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
    }
}

fn run_daemon(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let mut daemon = DriftDaemon::init(config, SignalHandler::install())?;
    daemon.run()?;
    Ok(())
}

// ──────────────────── scan ────────────────────

fn parse_filter(raw: &str) -> Filter {
    match raw.split_once(':') {
        Some((path, glob)) if !glob.is_empty() => Filter::new(path, Some(glob)),
        Some((path, _)) => Filter::new(path, None),
        None => Filter::new(raw, None),
    }
}

fn load_baseline(path: &Path) -> Result<Snapshot, CliError> {
    let (header, entries) = ChangeSetReader::open(path)?.read_all()?;
    if header.category != Category::Coverage {
        return Err(CliError::User(format!(
            "{} is a DRIFT change-set; --against needs a coverage change-set",
            path.display()
        )));
    }
    Ok(Snapshot::from_coverage(&entries)?)
}

fn run_scan(cli: &Cli, args: &ScanArgs) -> Result<(), CliError> {
    let includes: Vec<Filter> = args.includes.iter().map(|f| parse_filter(f)).collect();
    let excludes: Vec<Filter> = args.excludes.iter().map(|f| parse_filter(f)).collect();
    let filters = FilterSet::new(&includes, &excludes)?;
    let baseline = args.against.as_deref().map(load_baseline).transpose()?;

    let basedir = absolutize(&args.dir);
    let analyzer = DirectoryAnalyzer::new(AnalyzerConfig {
        follow_symlinks: args.follow_symlinks,
        ..AnalyzerConfig::default()
    });
    let analysis = analyzer.analyze(&basedir, &filters, baseline.as_ref())?;
    let entries = analysis.diff.directory_entries();
    let header = Header {
        definition_name: args.name.clone(),
        basedir_path: basedir.to_string_lossy().into_owned(),
        category: analysis.diff.category,
        version: 0,
    };

    match &args.output {
        Some(path) => {
            let file = File::create(path).map_err(|e| DriftError::io(path, e))?;
            write_change_set(BufWriter::new(file), &header, &entries)?
                .flush()
                .map_err(|e| DriftError::io(path, e))?;
        }
        None if output_mode(cli) == OutputMode::Human => {
            let stdout = io::stdout().lock();
            write_change_set(stdout, &header, &entries)?.flush()?;
        }
        None => {}
    }

    match output_mode(cli) {
        OutputMode::Human => {
            eprintln!(
                "{} files scanned, {} skipped: {} added, {} changed, {} removed",
                analysis.scan.snapshot.len(),
                analysis.scan.skipped.len(),
                analysis.diff.added.len(),
                analysis.diff.changed.len(),
                analysis.diff.removed.len()
            );
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "scan",
                "basedir": header.basedir_path,
                "category": header.category,
                "files": analysis.scan.snapshot.len(),
                "skipped": analysis.scan.skipped.len(),
                "added": analysis.diff.added.len(),
                "changed": analysis.diff.changed.len(),
                "removed": analysis.diff.removed.len(),
                "output": args.output.as_ref().map(|p| p.display().to_string()),
                "entries": entries,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── show ────────────────────

fn run_show(cli: &Cli, args: &ShowArgs) -> Result<(), CliError> {
    let (header, entries) = ChangeSetReader::open(&args.file)?.read_all()?;

    match output_mode(cli) {
        OutputMode::Human => {
            let counts = change_counts(&entries);
            println!("{} {}", "Definition:".bold(), header.definition_name);
            println!("  Basedir:  {}", header.basedir_path);
            println!("  Category: {}", header.category);
            println!("  Version:  {}", header.version);
            println!(
                "  Changes:  {} added, {} changed, {} removed in {} directories",
                counts.0,
                counts.1,
                counts.2,
                entries.len()
            );
            for dir in &entries {
                println!("\n  {}/", dir.directory);
                for file in &dir.files {
                    let flag = match file.change_type {
                        ChangeType::Added => "A".green(),
                        ChangeType::Changed => "C".yellow(),
                        ChangeType::Removed => "R".red(),
                    };
                    println!("    {flag} {}", file.file_name);
                }
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "show",
                "file": args.file.display().to_string(),
                "header": header,
                "entries": entries,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn change_counts(entries: &[DirectoryEntry]) -> (usize, usize, usize) {
    entries
        .iter()
        .flat_map(|d| &d.files)
        .fold((0, 0, 0), |(a, c, r), f| match f.change_type {
            ChangeType::Added => (a + 1, c, r),
            ChangeType::Changed => (a, c + 1, r),
            ChangeType::Removed => (a, c, r + 1),
        })
}

// ──────────────────── ack ────────────────────

fn run_ack(cli: &Cli, args: &AckArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let store = ChangeSetStore::open(&config.agent.data_dir)?;
    let server = Arc::new(SpoolServer::new(&config.transport.outbox_dir)?);
    let coordinator = DriftCoordinator::new(store, server, JournalHandle::detached());
    let key = ScheduleKey::new(args.resource, args.definition.clone());

    let (what, removed) = match &args.token {
        Some(token) => ("content blobs", coordinator.ack_change_set_content(&key, token)?),
        None => ("change-set bundles", coordinator.ack_change_set(&key)?),
    };

    match output_mode(cli) {
        OutputMode::Human => println!("{key}: removed {removed} {what}"),
        OutputMode::Json => {
            let payload = json!({
                "command": "ack",
                "resource_id": args.resource,
                "definition": args.definition,
                "token": args.token,
                "removed": removed,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── status ────────────────────

fn run_status(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let store = ChangeSetStore::open(&config.agent.data_dir)?;
    let keys = store.definitions()?;

    let mut rows = Vec::with_capacity(keys.len());
    for key in &keys {
        let header = store.get_reader(key)?.map(|r| r.header().clone());
        rows.push(json!({
            "resource_id": key.resource_id,
            "definition": key.definition_name,
            "version": header.as_ref().map(|h| h.version),
            "category": header.as_ref().map(|h| h.category),
            "has_previous": store.previous_path(key).exists(),
            "pending_change_sets": store.pending_change_set_bundles(key)?.len(),
            "pending_content": store.pending_content_bundles(key)?.len(),
            "content_blobs": store.list_content(key)?.len(),
        }));
    }

    match output_mode(cli) {
        OutputMode::Human => {
            println!("driftd v{}", env!("CARGO_PKG_VERSION"));
            println!("  Data dir: {}", config.agent.data_dir.display());
            println!("  Configured definitions: {}", config.definitions.len());
            if rows.is_empty() {
                println!("\nNo stored change-sets.");
                return Ok(());
            }
            println!(
                "\n  {:<30}  {:>7}  {:>9}  {:>8}  {:>6}",
                "Definition", "Version", "Changesets", "Content", "Blobs"
            );
            println!("  {}", "-".repeat(68));
            for row in &rows {
                let pending = row["pending_change_sets"].as_u64().unwrap_or(0)
                    + row["pending_content"].as_u64().unwrap_or(0);
                let label = format!(
                    "{}/{}",
                    row["resource_id"],
                    row["definition"].as_str().unwrap_or_default()
                );
                let line = format!(
                    "  {:<30}  {:>7}  {:>9}  {:>8}  {:>6}",
                    label,
                    row["version"].as_u64().map_or("-".to_string(), |v| v.to_string()),
                    row["pending_change_sets"],
                    row["pending_content"],
                    row["content_blobs"],
                );
                if pending == 0 {
                    println!("{}", line.green());
                } else {
                    println!("{}", line.yellow());
                }
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "data_dir": config.agent.data_dir.display().to_string(),
                "definitions": rows,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── config ────────────────────

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    if args.path {
        let path = cli.config.clone().unwrap_or_else(Config::default_path);
        match output_mode(cli) {
            OutputMode::Human => {
                println!("{}", path.display());
                if !path.exists() {
                    println!("  (file does not exist; defaults will be used)");
                }
            }
            OutputMode::Json => write_json_line(&json!({
                "command": "config path",
                "path": path.to_string_lossy(),
                "exists": path.exists(),
            }))?,
        }
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref())?;
    match output_mode(cli) {
        OutputMode::Human => {
            println!("# hash: {}", config.stable_hash()?);
            println!("{}", config.to_toml()?);
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "config",
                "hash": config.stable_hash()?,
                "config": serde_json::to_value(&config)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

// ──────────────────── output ────────────────────

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("DRIFTD_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref())
}

/// `--json` wins, then `DRIFTD_OUTPUT_FORMAT`, then human output.
fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }
    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        _ => OutputMode::Human,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_scan_with_filters() {
        let cli = Cli::try_parse_from([
            "driftd",
            "scan",
            "/etc",
            "--include",
            "conf:*.xml",
            "--exclude",
            "cache",
            "--against",
            "snapshot.txt",
        ])
        .unwrap();
        let Command::Scan(args) = cli.command else {
            panic!("expected scan");
        };
        assert_eq!(args.includes, vec!["conf:*.xml"]);
        assert_eq!(args.against, Some(PathBuf::from("snapshot.txt")));
        assert_eq!(args.name, "adhoc");
    }

    #[test]
    fn filters_parse_with_and_without_glob() {
        assert_eq!(parse_filter("conf:*.xml"), Filter::new("conf", Some("*.xml")));
        assert_eq!(parse_filter("cache"), Filter::new("cache", None));
        assert_eq!(parse_filter("cache:"), Filter::new("cache", None));
    }

    #[test]
    fn ack_requires_resource_and_definition() {
        assert!(Cli::try_parse_from(["driftd", "ack", "--resource", "1"]).is_err());
        let cli = Cli::try_parse_from([
            "driftd", "ack", "--resource", "1", "--definition", "conf", "--token", "t",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Ack(AckArgs { token: Some(_), .. })));
    }

    #[test]
    fn verbosity_counts_and_conflicts() {
        let cli = Cli::try_parse_from(["driftd", "-vv", "status"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(Cli::try_parse_from(["driftd", "-v", "-q", "status"]).is_err());
    }

    #[test]
    fn output_mode_resolution() {
        assert_eq!(resolve_output_mode(true, Some("human")), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, Some(" JSON ")), OutputMode::Json);
        assert_eq!(resolve_output_mode(false, None), OutputMode::Human);
        assert_eq!(resolve_output_mode(false, Some("other")), OutputMode::Human);
    }

    #[test]
    fn exit_codes_split_user_and_runtime_errors() {
        assert_eq!(CliError::User("x".into()).exit_code(), 1);
        let missing = CliError::Drift(DriftError::MissingConfig { path: "/x".into() });
        assert_eq!(missing.exit_code(), 1);
        let io = CliError::Drift(DriftError::Transport { details: "down".into() });
        assert_eq!(io.exit_code(), 2);
    }

    #[test]
    fn clap_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
