use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use wikisync_core::config::{WikiConfig, load_config, normalize_space_url};
use wikisync_core::download::{DownloadOptions, DownloadReport, download_wiki, missing_attachments};
use wikisync_core::error::{FailureKind, ItemFailure, SyncError};
use wikisync_core::flatten::{FlattenOptions, FlattenReport, flatten_wiki};
use wikisync_core::memo::page_id_from_url;
use wikisync_core::remote::{BacklogClient, BacklogClientConfig};
use wikisync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, resolve_paths,
};
use wikisync_core::tree::PageTree;
use wikisync_core::upload::{PlannedAction, UploadOptions, UploadReport, upload_wiki};

#[derive(Debug, Parser)]
#[command(
    name = "wikisync",
    version,
    about = "Sync a Backlog wiki with local Markdown and rebuild it as a GitHub wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Print the run report as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create .wikisync/config.toml and the Wiki/ directory
    Init(InitArgs),
    /// Mirror remote wiki pages into the local tree
    Download(DownloadArgs),
    /// Push local pages back to the remote wiki
    Upload(UploadArgs),
    /// Rebuild the local tree as flat GitHub wiki pages
    Flatten(FlattenArgs),
    /// Show the local page tree and its sync state
    Tree(TreeArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct DownloadArgs {
    #[arg(long, value_name = "URL", help = "Backlog space URL or a page URL inside it")]
    url: Option<String>,
    #[arg(long, value_name = "KEY", help = "Backlog project key")]
    project: Option<String>,
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,
    #[arg(long, value_name = "NAME|URL", help = "Only download this page and its children")]
    prefix: Option<String>,
    #[arg(long, value_name = "PATH", help = "Local wiki directory")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(long, value_name = "KEY")]
    api_key: Option<String>,
    #[arg(long, value_name = "URL", help = "Upload only the page with this URL")]
    target_url: Option<String>,
    #[arg(long, help = "Resolve and plan without writing to the remote wiki")]
    dry_run: bool,
    #[arg(long, value_name = "PATH", help = "Local wiki directory")]
    input: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct FlattenArgs {
    #[arg(long, value_name = "PATH", help = "Local wiki directory")]
    input: Option<PathBuf>,
    #[arg(long, value_name = "PATH", help = "GitHub wiki checkout")]
    output: Option<PathBuf>,
    #[arg(long, value_name = "TEXT")]
    separator: Option<String>,
    #[arg(long, value_name = "N", help = "Sidebar depth rendered expanded")]
    expand_level: Option<usize>,
    #[arg(long, help = "Remove previously generated files first")]
    clean: bool,
}

#[derive(Debug, Args)]
struct TreeArgs {
    #[arg(long, value_name = "PATH", help = "Local wiki directory")]
    input: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    let result = match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Download(args)) => run_download(&runtime, args),
        Some(Commands::Upload(args)) => run_upload(&runtime, args),
        Some(Commands::Flatten(args)) => run_flatten(&runtime, args),
        Some(Commands::Tree(args)) => run_tree(&runtime, args),
        None => {
            let mut command = Cli::command();
            command
                .print_help()
                .map(|()| {
                    println!();
                    true
                })
                .map_err(Into::into)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            eprintln!("error: {error:#}");
            match FailureKind::classify(&error) {
                FailureKind::Configuration => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<bool> {
    let (paths, _) = resolve_runtime(runtime)?;
    let report = init_layout(&paths, &InitOptions { force: args.force })?;

    println!("Initialized wikisync project");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("config_path: {}", normalize_path(&paths.config_path));
    for dir in &report.created_dirs {
        println!("created: {}", normalize_path(dir));
    }
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(true)
}

fn run_download(runtime: &RuntimeOptions, args: DownloadArgs) -> Result<bool> {
    let (paths, config) = resolve_runtime(runtime)?;
    let project_key = args
        .project
        .clone()
        .or_else(|| config.project_key())
        .ok_or_else(|| {
            SyncError::Configuration(
                "Backlog project key is not set (--project, BACKLOG_PROJECT_KEY or remote.project_key)"
                    .to_string(),
            )
        })?;
    // A page URL passed as --url doubles as the prefix.
    let prefix = args.prefix.clone().or_else(|| config.wiki_prefix()).or_else(|| {
        args.url
            .as_deref()
            .filter(|url| page_id_from_url(url).is_some())
            .map(ToString::to_string)
    });
    let wiki_dir = args
        .output
        .as_deref()
        .map(|path| paths.resolve(path))
        .unwrap_or_else(|| paths.wiki_dir(&config));

    let client_config =
        BacklogClientConfig::from_config(&config, args.url.as_deref(), args.api_key.as_deref())?;
    debug!(space_url = %client_config.space_url, "using Backlog space");
    let mut client = BacklogClient::new(client_config)?;
    let options = DownloadOptions {
        project_key,
        prefix,
        wiki_dir,
    };
    let report = download_wiki(&mut client, &options)?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_download_report(&options, &report);
    }
    print_diagnostics(runtime, &paths);
    Ok(report.success)
}

fn run_upload(runtime: &RuntimeOptions, args: UploadArgs) -> Result<bool> {
    let (paths, config) = resolve_runtime(runtime)?;
    let wiki_dir = args
        .input
        .as_deref()
        .map(|path| paths.resolve(path))
        .unwrap_or_else(|| paths.wiki_dir(&config));

    // Without a configured space, the target URL or any memo names it.
    let space_url = config
        .space_url()
        .or_else(|| args.target_url.as_deref().map(normalize_space_url))
        .or_else(|| space_url_from_memos(&wiki_dir));
    let client_config =
        BacklogClientConfig::from_config(&config, space_url.as_deref(), args.api_key.as_deref())?;
    let mut client = BacklogClient::new(client_config)?;
    let options = UploadOptions {
        wiki_dir,
        target_url: args.target_url.clone(),
        dry_run: args.dry_run,
    };
    let report = upload_wiki(&mut client, &options)?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_upload_report(&options, &report);
    }
    print_diagnostics(runtime, &paths);
    Ok(report.success)
}

fn run_flatten(runtime: &RuntimeOptions, args: FlattenArgs) -> Result<bool> {
    let (paths, config) = resolve_runtime(runtime)?;
    let wiki_dir = args
        .input
        .as_deref()
        .map(|path| paths.resolve(path))
        .unwrap_or_else(|| paths.wiki_dir(&config));
    let output_dir = match args.output.as_deref() {
        Some(path) => paths.resolve(path),
        None => {
            let configured = config.flatten_output_dir().ok_or_else(|| {
                SyncError::Configuration(
                    "flatten output is not set (--output or flatten.output_dir)".to_string(),
                )
            })?;
            paths.resolve(Path::new(&configured))
        }
    };
    let options = FlattenOptions {
        separator: args
            .separator
            .clone()
            .unwrap_or_else(|| config.separator().to_string()),
        expand_level: args.expand_level.unwrap_or_else(|| config.expand_level()),
        clean: args.clean || config.clean(),
    };
    let report = flatten_wiki(&wiki_dir, &output_dir, &options)?;

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_flatten_report(&wiki_dir, &output_dir, &options, &report);
    }
    print_diagnostics(runtime, &paths);
    Ok(report.success)
}

#[derive(Debug, Serialize)]
struct TreeLine {
    path: String,
    title: String,
    depth: usize,
    page_id: Option<i64>,
    has_content: bool,
    memo_error: Option<String>,
    missing_attachments: Vec<String>,
}

fn run_tree(runtime: &RuntimeOptions, args: TreeArgs) -> Result<bool> {
    let (paths, config) = resolve_runtime(runtime)?;
    let wiki_dir = args
        .input
        .as_deref()
        .map(|path| paths.resolve(path))
        .unwrap_or_else(|| paths.wiki_dir(&config));
    let tree = PageTree::from_local(&wiki_dir)?;

    let mut lines = Vec::new();
    for (segments, node) in tree.walk() {
        let mut dir = wiki_dir.clone();
        dir.extend(&segments);
        lines.push(TreeLine {
            path: segments.join("/"),
            title: node.display_title(),
            depth: segments.len(),
            page_id: node.memo.as_ref().and_then(|memo| memo.page_id()),
            has_content: node.has_content_file,
            memo_error: node.memo_error.clone(),
            missing_attachments: missing_attachments(&dir)?,
        });
    }

    if runtime.json {
        println!("{}", serde_json::to_string_pretty(&lines)?);
    } else {
        println!("tree");
        println!("wiki_dir: {}", normalize_path(&wiki_dir));
        println!("pages: {}", lines.len());
        for line in &lines {
            let state = match (line.page_id, &line.memo_error) {
                (Some(id), _) => format!("synced #{id}"),
                (None, Some(_)) => "broken memo".to_string(),
                (None, None) if line.has_content => "local only".to_string(),
                (None, None) => "folder".to_string(),
            };
            let mut text = format!("{}{} [{state}]", "  ".repeat(line.depth - 1), line.title);
            if !line.missing_attachments.is_empty() {
                text.push_str(&format!(" missing: {}", line.missing_attachments.join(", ")));
            }
            println!("{text}");
        }
    }
    print_diagnostics(runtime, &paths);
    Ok(true)
}

fn print_download_report(options: &DownloadOptions, report: &DownloadReport) {
    println!("download");
    println!("project: {}", options.project_key);
    println!("prefix: {}", options.prefix.as_deref().unwrap_or("<none>"));
    println!("wiki_dir: {}", normalize_path(&options.wiki_dir));
    println!("requested_pages: {}", report.requested_pages);
    println!("downloaded: {}", report.downloaded);
    println!("skipped: {}", report.skipped);
    println!("attachments_downloaded: {}", report.attachments_downloaded);
    println!("request_count: {}", report.request_count);
    for page in &report.pages {
        let action = serde_json::to_value(page.action)
            .ok()
            .and_then(|value| value.as_str().map(ToString::to_string))
            .unwrap_or_default();
        match &page.detail {
            Some(detail) => println!("page.{action}: {} ({detail})", page.title),
            None => println!("page.{action}: {}", page.title),
        }
    }
    print_failures("warnings", &report.warnings);
    print_failures("failures", &report.failures);
    println!("success: {}", report.success);
}

fn print_upload_report(options: &UploadOptions, report: &UploadReport) {
    println!("upload");
    println!("wiki_dir: {}", normalize_path(&options.wiki_dir));
    println!("target: {}", options.target_url.as_deref().unwrap_or("<all>"));
    println!("dry_run: {}", report.dry_run);
    println!("requested_pages: {}", report.requested_pages);
    println!("updated: {}", report.updated);
    println!("unsyncable: {}", report.unsyncable);
    println!("attachments_uploaded: {}", report.attachments_uploaded);
    println!("attachments_present: {}", report.attachments_present);
    println!("request_count: {}", report.request_count);
    for action in &report.actions {
        match action {
            PlannedAction::UploadAttachment { page_id, filename } => {
                println!("plan.upload_attachment: #{page_id} {filename}");
            }
            PlannedAction::UpdatePage { page_id, name } => {
                println!("plan.update_page: #{page_id} {name}");
            }
        }
    }
    for page in report.pages.iter().filter(|page| page.detail.is_some()) {
        println!(
            "page: {} ({})",
            page.title,
            page.detail.as_deref().unwrap_or_default()
        );
    }
    print_failures("warnings", &report.warnings);
    print_failures("failures", &report.failures);
    println!("success: {}", report.success);
}

fn print_flatten_report(
    wiki_dir: &Path,
    output_dir: &Path,
    options: &FlattenOptions,
    report: &FlattenReport,
) {
    println!("flatten");
    println!("input: {}", normalize_path(wiki_dir));
    println!("output: {}", normalize_path(output_dir));
    println!("separator: {:?}", options.separator);
    println!("expand_level: {}", options.expand_level);
    println!("removed_files: {}", report.removed_files);
    println!("pages_written: {}", report.pages_written);
    println!("attachments_copied: {}", report.attachments_copied);
    for page in report.pages.iter().filter(|page| page.disambiguated) {
        println!("renamed: {} -> {}", page.source, page.target_filename);
    }
    println!("sidebar: {}", report.sidebar_path);
    print_failures("failures", &report.failures);
    println!("success: {}", report.success);
}

fn print_failures(label: &str, failures: &[ItemFailure]) {
    if failures.is_empty() {
        return;
    }
    println!("{label}.count: {}", failures.len());
    for failure in failures {
        println!(
            "{label}: [{}] {}: {}",
            failure.kind.as_str(),
            failure.subject,
            failure.detail
        );
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn space_url_from_memos(wiki_dir: &Path) -> Option<String> {
    let tree = PageTree::from_local(wiki_dir).ok()?;
    tree.walk()
        .into_iter()
        .find_map(|(_, node)| node.memo.as_ref().map(|memo| normalize_space_url(&memo.url)))
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, WikiConfig)> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    let config = load_config(&paths.config_path)?;
    debug!(
        project_root = %normalize_path(&paths.project_root),
        config = %normalize_path(&paths.config_path),
        "resolved runtime"
    );
    Ok((paths, config))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
