//! Command-line interface for shelf.
//!
//! Provides commands for importing and exporting content archives,
//! deleting content, and inspecting the library.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;

use crate::config;
use crate::core::Orchestrator;
use crate::domain::{
    ContentEventKind, ContentNode, ContentRecord, DeleteRequest, DeleteStatus, ExportRequest,
    ImportRequest, Visibility,
};
use crate::store::ContentFilter;

/// shelf - Offline content library
#[derive(Parser, Debug)]
#[command(name = "shelf")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import a content archive
    Import {
        /// Archive file (.ecar)
        archive: PathBuf,

        /// Storage root for imported content (defaults to the configured root)
        #[arg(short, long)]
        dest: Option<PathBuf>,

        /// Import as child content of an existing collection
        #[arg(long)]
        child: bool,
    },

    /// Export contents into a single archive
    Export {
        /// Content identifiers
        #[arg(required = true)]
        identifiers: Vec<String>,

        /// Directory the archive is written to
        #[arg(short, long)]
        dest: PathBuf,
    },

    /// Delete contents from the library
    Delete {
        /// Content identifiers
        #[arg(required = true)]
        identifiers: Vec<String>,

        /// Delete as child content (keeps root visibility)
        #[arg(long)]
        child: bool,
    },

    /// List contents in the library
    List {
        /// Filter by visibility
        #[arg(short, long, value_enum)]
        visibility: Option<VisibilityArg>,

        /// Maximum number of contents to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show details of a content
    Show {
        /// Content identifier
        identifier: String,

        /// Print the stored metadata document
        #[arg(short, long)]
        full: bool,
    },

    /// Show a content with its children in the library
    Tree {
        /// Content identifier
        identifier: String,

        /// Levels below the content to show (all when omitted)
        #[arg(short, long)]
        depth: Option<usize>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Visibility for CLI (maps to Visibility)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VisibilityArg {
    /// Independently importable roots
    Default,

    /// Collections
    Parent,

    /// Content reachable through a parent
    Visible,
}

impl From<VisibilityArg> for Visibility {
    fn from(v: VisibilityArg) -> Self {
        match v {
            VisibilityArg::Default => Visibility::Default,
            VisibilityArg::Parent => Visibility::Parent,
            VisibilityArg::Visible => Visibility::Visible,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Import {
                archive,
                dest,
                child,
            } => import_archive(archive, dest, child).await,
            Commands::Export { identifiers, dest } => export_content(identifiers, dest).await,
            Commands::Delete { identifiers, child } => delete_content(identifiers, child).await,
            Commands::List { visibility, limit } => list_contents(visibility, limit).await,
            Commands::Show { identifier, full } => show_content(&identifier, full).await,
            Commands::Tree { identifier, depth } => show_tree(&identifier, depth).await,
            Commands::Config => show_config().await,
        }
    }
}

fn open_library() -> Result<Orchestrator> {
    let cfg = config::config()?;
    Orchestrator::from_config(cfg)
}

/// Import an archive, printing progress as items are materialized
async fn import_archive(archive: PathBuf, dest: Option<PathBuf>, child: bool) -> Result<()> {
    let orchestrator = open_library()?;

    let mut request = ImportRequest::new(archive.clone());
    if let Some(dest) = dest {
        request = request.with_destination(dest);
    }
    if child {
        request = request.as_child_content();
    }

    let mut events = orchestrator.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match event.kind {
                    ContentEventKind::ImportProgress { current, total } => {
                        eprint!("\r[{}/{}] items", current, total);
                    }
                    ContentEventKind::ImportCompleted { .. }
                    | ContentEventKind::ImportFailed { .. } => {
                        eprintln!();
                        break;
                    }
                    _ => {}
                },
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = orchestrator.import_archive(request).await;
    let _ = progress.await;

    let outcome = result.with_context(|| format!("Import of {} failed", archive.display()))?;

    match &outcome.root_identifier {
        Some(root) => println!("Imported: {}", root),
        None => println!("Imported: {}", archive.display()),
    }
    println!("  Items written: {}", outcome.imported);
    println!("  Items skipped: {}", outcome.skipped);
    if !outcome.identifiers.is_empty() {
        println!("  Children:      {}", outcome.identifiers.len());
    }

    Ok(())
}

/// Export contents to an archive
async fn export_content(identifiers: Vec<String>, dest: PathBuf) -> Result<()> {
    let orchestrator = open_library()?;

    let outcome = orchestrator
        .export_content(ExportRequest::new(identifiers, dest))
        .await
        .context("Export failed")?;

    println!("Exported: {}", outcome.archive_path.display());
    println!("  Contents: {}", outcome.content_count);
    println!("  Size:     {} bytes", outcome.size_bytes);
    println!("  SHA-256:  {}", outcome.checksum);

    Ok(())
}

async fn delete_content(identifiers: Vec<String>, child: bool) -> Result<()> {
    let orchestrator = open_library()?;

    let requests = identifiers
        .into_iter()
        .map(|id| {
            let request = DeleteRequest::new(id);
            if child {
                request.as_child_content()
            } else {
                request
            }
        })
        .collect();

    for response in orchestrator.delete_content(requests).await? {
        let status = match response.status {
            DeleteStatus::Deleted => "deleted",
            DeleteStatus::Released => "released (still referenced)",
            DeleteStatus::NotFound => "not found",
        };
        println!("{:<30} {}", response.identifier, status);
    }

    Ok(())
}

/// List contents in the library
async fn list_contents(visibility: Option<VisibilityArg>, limit: usize) -> Result<()> {
    let orchestrator = open_library()?;

    let mut filter = ContentFilter::default().with_limit(limit);
    if let Some(v) = visibility {
        filter = filter.with_visibility(v.into());
    }

    let records = orchestrator.list_contents(&filter).await?;
    if records.is_empty() {
        println!("Library is empty. Use 'shelf import <archive>' to add content.");
        return Ok(());
    }

    println!(
        "{:<30} {:<8} {:<18} {:>4} {:>12}",
        "ID", "VIS", "STATE", "REFS", "SIZE"
    );
    println!("{}", "-".repeat(76));

    for record in &records {
        let id = truncate(&record.identifier, 29);
        println!(
            "{:<30} {:<8} {:<18} {:>4} {:>12}",
            id,
            record.visibility.as_str(),
            record.state.to_string(),
            record.reference_count,
            record.size_on_device
        );
    }

    println!("\nShown: {} contents", records.len());

    Ok(())
}

/// Show details of a content
async fn show_content(identifier: &str, full: bool) -> Result<()> {
    let orchestrator = open_library()?;

    let record = orchestrator
        .get_content(identifier)
        .await?
        .with_context(|| format!("Content not found: {}", identifier))?;

    print_record(&record);

    if full {
        println!();
        match record.metadata() {
            Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
            None => println!("{}", record.raw_metadata),
        }
    }

    Ok(())
}

fn print_record(record: &ContentRecord) {
    let name = record
        .metadata()
        .and_then(|doc| doc.get("name").and_then(|n| n.as_str()).map(str::to_string));

    println!("ID:           {}", record.identifier);
    if let Some(name) = name {
        println!("Name:         {}", name);
    }
    println!("MIME type:    {}", record.mime_type);
    println!("Content type: {}", record.content_type);
    println!("State:        {}", record.state);
    println!("Visibility:   {}", record.visibility);
    println!("References:   {}", record.reference_count);
    if let Some(version) = record.package_version {
        println!("Version:      {}", version);
    }
    println!("Size:         {} bytes", record.size_on_device);
    match &record.local_path {
        Some(path) => println!("Path:         {}", path.display()),
        None => println!("Path:         (none)"),
    }
    println!("Updated:      {}", record.last_updated_at);

    let children = record.child_identifiers();
    if !children.is_empty() {
        println!("Children:");
        for child in children {
            println!("  - {}", child);
        }
    }
}

/// Print a content tree, one content per line
async fn show_tree(identifier: &str, depth: Option<usize>) -> Result<()> {
    let orchestrator = open_library()?;

    let tree = orchestrator
        .child_contents(identifier, depth)
        .await?
        .with_context(|| format!("Content not found: {}", identifier))?;

    print_node(&tree, 0);
    println!("\nShown: {} contents", tree.node_count());

    Ok(())
}

fn print_node(node: &ContentNode, indent: usize) {
    println!(
        "{}{} [{}, {}]",
        "  ".repeat(indent),
        node.identifier(),
        node.record.content_type,
        node.record.state
    );
    for child in &node.children {
        print_node(child, indent + 1);
    }
}

fn truncate(value: &str, max: usize) -> String {
    if value.chars().count() > max {
        let cut: String = value.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        value.to_string()
    }
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Shelf Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:         {}", cfg.home.display());
    println!("  Content root: {}", cfg.content_root.display());
    println!("  Database:     {}", cfg.database_path.display());
    println!("  Temp:         {}", cfg.temp_dir.display());
    println!();
    println!("Library settings:");
    println!(
        "  Max compatibility level: {}",
        cfg.library.max_compatibility_level
    );
    println!(
        "  Manifest versions:       {}",
        cfg.library.supported_manifest_versions.join(", ")
    );
    println!(
        "  Extraction failures:     {:?}",
        cfg.library.extraction_failure_policy
    );
    println!(
        "  Space margin:            {} bytes",
        cfg.library.space_margin_bytes
    );

    Ok(())
}
