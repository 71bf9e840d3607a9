//! sitegraph CLI: incremental site builds and link analysis.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use sitegraph::analysis::{ReportFormat, analyze, render_report, report_json};
use sitegraph::config::{BuildMode, SiteConfig};
use sitegraph::content::DirectorySource;
use sitegraph::engine::{Engine, EngineConfig};
use sitegraph::graph::GraphBuilder;
use sitegraph::resource::{ResourceDescriptor, ResourceKind, TransformParams};

/// Configuration file looked up in the working directory when `--config` is absent.
const DEFAULT_CONFIG: &str = "sitegraph.toml";

#[derive(Parser)]
#[command(name = "sitegraph", version, about = "Incremental static-site build core")]
struct Cli {
    /// Site configuration (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for provenance and the persisted build cache.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze the link graph of a content directory.
    Analyze {
        /// Content root containing markdown pages.
        dir: PathBuf,

        /// Report verbosity: simple or detailed.
        #[arg(long, default_value = "simple")]
        format: ReportFormat,

        /// Emit the report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run an incremental build.
    Build {
        /// Content root containing markdown pages.
        dir: PathBuf,

        /// Directory of static assets (images, stylesheets).
        #[arg(long)]
        assets: Option<PathBuf>,

        /// Failure mode: strict, best-effort or fail-fast.
        #[arg(long)]
        mode: Option<BuildMode>,

        /// Minify stylesheets.
        #[arg(long)]
        minify: bool,

        /// Emit the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show engine info and statistics.
    Info,

    /// Manage the persisted build cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove cached artifacts no recorded build refers to.
    Gc,
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let site = load_site_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze { dir, format, json } => {
            let source = DirectorySource::new(&dir);
            let outcome = GraphBuilder::build(&source);
            for warning in &outcome.warnings {
                tracing::warn!(%warning, "graph");
            }
            let results = analyze(&outcome.graph, &site);
            if json {
                let value = report_json(&results, format);
                println!("{}", serde_json::to_string_pretty(&value).into_diagnostic()?);
            } else {
                print!("{}", render_report(&results, format));
            }
        }

        Commands::Build {
            dir,
            assets,
            mode,
            minify,
            json,
        } => {
            let mut site = site;
            if let Some(mode) = mode {
                site.scheduler.mode = mode;
            }
            let mut engine = Engine::new(EngineConfig {
                site,
                data_dir: cli.data_dir,
                ..Default::default()
            })?;

            let resources = match &assets {
                Some(root) => collect_assets(root, minify)?,
                None => Vec::new(),
            };
            let source = DirectorySource::new(&dir);
            let outcome = engine.build(&source, resources)?;
            engine.save()?;

            for warning in &outcome.graph_warnings {
                tracing::warn!(%warning, "graph");
            }
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&outcome.report).into_diagnostic()?
                );
            } else {
                for failure in &outcome.report.failed {
                    eprintln!("failed: {failure}");
                }
                println!("{}", outcome.report.summary());
            }
            if !outcome.report.is_success() {
                std::process::exit(1);
            }
        }

        Commands::Info => {
            let engine = Engine::new(EngineConfig {
                site,
                data_dir: cli.data_dir,
                ..Default::default()
            })?;
            println!("{}", engine.info());
        }

        Commands::Cache { action } => match action {
            CacheAction::Gc => {
                let Some(data_dir) = cli.data_dir else {
                    miette::bail!("cache gc needs --data-dir");
                };
                let engine = Engine::new(EngineConfig {
                    site,
                    data_dir: Some(data_dir),
                    ..Default::default()
                })?;
                let removed = engine.gc()?;
                println!("Removed {removed} cached artifacts");
            }
        },
    }

    Ok(())
}

/// An explicit `--config` must exist; the default file is optional.
fn load_site_config(path: Option<&Path>) -> Result<SiteConfig> {
    match path {
        Some(path) => Ok(SiteConfig::load(path)?),
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if default.exists() {
                Ok(SiteConfig::load(default)?)
            } else {
                Ok(SiteConfig::default())
            }
        }
    }
}

/// Every file under `root`, keyed by its path relative to `root`.
fn collect_assets(root: &Path, minify: bool) -> Result<Vec<ResourceDescriptor>> {
    let mut resources = Vec::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.into_diagnostic()?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let id = rel.to_string_lossy().replace('\\', "/");
        let bytes = std::fs::read(entry.path()).into_diagnostic()?;
        let kind = ResourceKind::from_path(&id);
        let params = TransformParams {
            minify: minify && kind == ResourceKind::Stylesheet,
            ..TransformParams::default()
        };
        resources.push(ResourceDescriptor::new(id, kind, bytes).with_params(params));
    }
    Ok(resources)
}
