//! SIP Forge CLI - runs one classification rule over a selection and exports
//! the resulting packages.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sipforge_core::{
    config::default_work_dir, ExportEventKind, ForgeSettings, MetadataOption, PackageFormat,
    RuleDefinition, RuleEventKind, RuleState, SchemeNode, SipWorkspace, WalkerKind,
};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sipforge")]
#[command(about = "Classify files into archival SIPs and build packages")]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Work directory (defaults to the platform data directory)
    #[arg(long, global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply one rule to the sources and export every resulting SIP
    Package(PackageArgs),
    /// Print the maximum and suggested per-folder depth of the sources
    Depths {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
    },
    /// List metadata templates in the work directory
    Templates,
    /// Summarize the recovery file without loading it
    InspectRecovery,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum WalkerArg {
    /// Everything in one SIP
    Single,
    /// One SIP per file
    File,
    /// One SIP per directory at --depth
    Folder,
}

#[derive(Args, Debug)]
struct PackageArgs {
    /// Files or directories to classify
    #[arg(required = true)]
    sources: Vec<PathBuf>,

    #[arg(short, long, value_enum, default_value = "folder")]
    walker: WalkerArg,

    /// Folder depth for the folder walker (default: suggested depth)
    #[arg(long)]
    depth: Option<usize>,

    /// Package format: eark or bagit (default: from settings)
    #[arg(short, long)]
    format: Option<PackageFormat>,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Comma-separated ignore patterns, replacing the configured ones
    #[arg(long)]
    ignore: Option<String>,

    /// Title of the classification node receiving the SIPs
    #[arg(long, default_value = "Fonds")]
    title: String,

    /// Metadata type of the entries (dc, ead, ...)
    #[arg(long)]
    metadata_type: Option<String>,

    #[command(flatten)]
    metadata: MetadataArgs,
}

#[derive(Args, Debug)]
#[group(multiple = false)]
struct MetadataArgs {
    /// Instantiate this template for every SIP
    #[arg(long)]
    metadata_template: Option<String>,

    /// Attach this file to every SIP
    #[arg(long)]
    metadata_file: Option<PathBuf>,

    /// Glob matched next to each SIP's source (e.g. "*.xml")
    #[arg(long)]
    metadata_pattern: Option<String>,

    /// Directory mirroring the sources with one metadata file per SIP
    #[arg(long)]
    metadata_dir: Option<PathBuf>,
}

impl MetadataArgs {
    fn option(&self, metadata_type: Option<String>) -> MetadataOption {
        if let Some(name) = &self.metadata_template {
            MetadataOption::Template {
                name: name.clone(),
                version: None,
            }
        } else if let Some(path) = &self.metadata_file {
            MetadataOption::SingleFile {
                path: path.clone(),
                metadata_type,
            }
        } else if let Some(pattern) = &self.metadata_pattern {
            MetadataOption::SameDirectory {
                pattern: pattern.clone(),
                metadata_type,
            }
        } else if let Some(root) = &self.metadata_dir {
            MetadataOption::DiffDirectory {
                root: root.clone(),
                metadata_type,
            }
        } else {
            MetadataOption::NewFile { metadata_type }
        }
    }
}

fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn absolute_sources(sources: &[PathBuf]) -> Result<Vec<PathBuf>> {
    sources
        .iter()
        .map(|p| {
            std::fs::canonicalize(p).with_context(|| format!("Cannot resolve source {}", p.display()))
        })
        .collect()
}

fn open_workspace(work_dir: &Path, ignore: Option<&str>) -> Result<SipWorkspace> {
    let mut settings = ForgeSettings::load(work_dir)?;
    if let Some(ignore) = ignore {
        settings.ignored_files = ignore.to_string();
    }
    let workspace = SipWorkspace::builder(work_dir).settings(settings).build()?;
    Ok(workspace)
}

fn run_package(work_dir: &Path, args: PackageArgs) -> Result<()> {
    let sources = absolute_sources(&args.sources)?;
    let workspace = open_workspace(work_dir, args.ignore.as_deref())?;

    let walker = match args.walker {
        WalkerArg::Single => WalkerKind::SingleSip,
        WalkerArg::File => WalkerKind::PerFile,
        WalkerArg::Folder => {
            let (max, suggested) = workspace.folder_depths(&sources);
            let depth = args.depth.unwrap_or(suggested);
            info!("Folder depth {} (max {})", depth, max);
            WalkerKind::PerFolder { depth }
        }
    };

    let node = workspace.add_node(SchemeNode::new(args.title, None))?;
    let rule = workspace.create_rule(RuleDefinition {
        roots: sources,
        walker,
        metadata: args.metadata.option(args.metadata_type.clone()),
        destination: node,
    })?;
    rule.subscribe(|event| match &event.kind {
        RuleEventKind::Progress(p) => {
            info!(visited = p.visited, files = p.files, previews = p.previews, "Walking")
        }
        RuleEventKind::Error { message } => error!("Walk failed: {}", message),
        _ => {}
    });

    workspace.apply_rule(rule.id())?;
    match rule.wait() {
        RuleState::Applied => {}
        state => bail!("Rule ended {}: {:?}", state, rule.errors()),
    }
    for issue in rule.errors() {
        warn!("{}", issue);
    }

    workspace.subscribe_exports(|event| match &event.kind {
        ExportEventKind::SipStarted { sip_id, index, total } => {
            info!("[{}/{}] Building {}", index + 1, total, sip_id)
        }
        ExportEventKind::SipFailed(failed) => {
            error!(sip_id = %failed.sip_id, "Failed: {}", failed.error)
        }
        _ => {}
    });

    let report = workspace.export(args.format, &args.output)?.wait()?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.failed.is_empty() {
        bail!("{} SIP(s) failed", report.failed.len());
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let work_dir = cli.work_dir.unwrap_or_else(default_work_dir);
    info!("Work directory: {}", work_dir.display());

    match cli.command {
        Command::Package(args) => run_package(&work_dir, args),
        Command::Depths { sources } => {
            let sources = absolute_sources(&sources)?;
            let workspace = open_workspace(&work_dir, None)?;
            let (max, suggested) = workspace.folder_depths(&sources);
            println!("max={} suggested={}", max, suggested);
            Ok(())
        }
        Command::Templates => {
            let workspace = open_workspace(&work_dir, None)?;
            for template in workspace.templates().list()? {
                let schema = if template.has_schema { "" } else { " (no schema)" };
                println!("{}{}", template.name, schema);
            }
            Ok(())
        }
        Command::InspectRecovery => {
            let workspace = open_workspace(&work_dir, None)?;
            match workspace.peek_recovery()? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => println!("No recovery file in {}", work_dir.display()),
            }
            Ok(())
        }
    }
}
