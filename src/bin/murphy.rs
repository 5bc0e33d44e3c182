//! # Murphy CLI - Incremental backups from the command line
//!
//! Sources and archives are remembered in `~/.murphyconfig.json` (or the
//! file given with `--config`).
//!
//! ## Usage
//! ```bash
//! # Create an archive on an external drive
//! murphy init "USB drive" /media/usb/Backup
//!
//! # Remember which folders to back up
//! murphy source add Documents ~/Documents ~/Pictures
//!
//! # Back up, then look at the history
//! murphy backup Documents "USB drive"
//! murphy list "USB drive"
//!
//! # Restore the newest state into an empty folder
//! murphy restore "USB drive" latest ~/Restored
//! ```

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use colored::*;
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use murphy::utils::format_bytes;
use murphy::{Archive, Config, Engine, FilesystemArchive, MurphyError, ProgressCallback, Snapshot, Source};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Murphy CLI - Incremental, versioned backups of your folders
#[derive(Parser)]
#[command(name = "murphy")]
#[command(version)]
#[command(about = "Incremental, versioned folder backups with human-readable restores")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.murphyconfig.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new archive and remember it
    Init {
        /// Archive name
        name: String,

        /// Folder to create the archive in (must not exist yet)
        path: PathBuf,
    },

    /// Manage backup sources
    Source {
        #[command(subcommand)]
        command: SourceCommands,
    },

    /// Back up a source into an archive
    #[command(alias = "bk")]
    Backup {
        /// Source name
        source: String,

        /// Archive name
        archive: String,
    },

    /// List the versions of an archive
    #[command(alias = "ls")]
    List {
        /// Archive name
        archive: String,
    },

    /// Restore a version into an empty folder
    #[command(alias = "rs")]
    Restore {
        /// Archive name
        archive: String,

        /// Version timestamp as shown by `list`, or `latest`
        version: String,

        /// Destination folder
        destination: PathBuf,
    },

    /// Recreate the Latest folder of an archive
    Rebuild {
        /// Archive name
        archive: String,
    },
}

#[derive(Subcommand)]
enum SourceCommands {
    /// Remember a named set of folders
    Add {
        /// Source name
        name: String,

        /// Folders or files to back up
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Show remembered sources
    #[command(alias = "ls")]
    List,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Set up logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Disable colors if needed
    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli).await {
        let message = match e.downcast_ref::<MurphyError>() {
            Some(murphy_error) => murphy_error.user_message(),
            None => format!("{:#}", e),
        };
        eprintln!("{}: {}", "Error".red().bold(), message);
        std::process::exit(1);
    }
}

/// Main command runner
async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let mut config = Config::load_from(&config_path)?;

    match cli.command {
        Commands::Init { name, path } => cmd_init(&mut config, &config_path, name, path).await,
        Commands::Source { command: SourceCommands::Add { name, paths } } => {
            cmd_source_add(&mut config, &config_path, name, paths)
        }
        Commands::Source { command: SourceCommands::List } => cmd_source_list(&config),
        Commands::Backup { source, archive } => cmd_backup(&config, &source, &archive).await,
        Commands::List { archive } => cmd_list(&config, &archive).await,
        Commands::Restore { archive, version, destination } => {
            cmd_restore(&config, &archive, &version, &destination).await
        }
        Commands::Rebuild { archive } => cmd_rebuild(&config, &archive).await,
    }
}

fn find_archive(config: &Config, name: &str) -> anyhow::Result<Archive> {
    config
        .find_archive(name)
        .cloned()
        .ok_or_else(|| anyhow!("no archive named {:?}, see `murphy init`", name))
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("cannot resolve {}", path.display()))
}

/// Progress bar driven by a job's progress callback
fn progress_bar() -> anyhow::Result<(ProgressBar, ProgressCallback)> {
    let pb = ProgressBar::new(1000);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {percent:>3}% {msg}")?
            .progress_chars("=> "),
    );
    let bar = pb.clone();
    let callback: ProgressCallback = Arc::new(move |value, message| {
        bar.set_position((value * 1000.0).round() as u64);
        bar.set_message(message.to_string());
    });
    Ok((pb, callback))
}

fn elapsed(start: Instant) -> String {
    format_duration(Duration::from_millis(start.elapsed().as_millis() as u64)).to_string()
}

/// Create an archive
async fn cmd_init(config: &mut Config, config_path: &Path, name: String, path: PathBuf) -> anyhow::Result<()> {
    if config.find_archive(&name).is_some() {
        bail!("an archive named {:?} already exists", name);
    }
    let path = absolute(&path)?;

    println!("{}", "Creating archive...".blue().bold());
    let mut archive: Archive = FilesystemArchive::new(name.clone(), path.clone()).into();
    archive.init().await?;
    config.add_archive(archive)?;
    config.save_to(config_path)?;

    println!("{} Created archive {}", "✓".green().bold(), name.yellow().bold());
    println!("  Location: {}", path.display().to_string().cyan());
    println!("\nNext steps:");
    println!("  - Add a source: {}", "murphy source add <name> <folders...>".yellow());
    println!("  - Back it up:   {}", format!("murphy backup <source> {:?}", name).yellow());
    Ok(())
}

/// Remember a source
fn cmd_source_add(config: &mut Config, config_path: &Path, name: String, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let paths = paths
        .iter()
        .map(|p| absolute(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    for path in &paths {
        if !path.exists() {
            bail!("{} does not exist", path.display());
        }
    }

    let source = Source::new(name.clone(), paths);
    let root = source.root_dir().display().to_string();
    config.add_source(source)?;
    config.save_to(config_path)?;

    println!("{} Added source {}", "✓".green().bold(), name.yellow().bold());
    println!("  Root: {}", root.cyan());
    Ok(())
}

/// Show remembered sources
fn cmd_source_list(config: &Config) -> anyhow::Result<()> {
    if config.sources.is_empty() {
        println!("{}", "No sources configured.".yellow());
        return Ok(());
    }

    println!("{}", "Sources:".blue().bold());
    for source in &config.sources {
        println!("  {}", source.name().yellow().bold());
        for path in source.paths() {
            println!("    {}", path.display().to_string().cyan());
        }
    }
    Ok(())
}

/// Run a backup
async fn cmd_backup(config: &Config, source_name: &str, archive_name: &str) -> anyhow::Result<()> {
    let source = config
        .find_source(source_name)
        .ok_or_else(|| anyhow!("no source named {:?}, see `murphy source add`", source_name))?;
    let mut archive = find_archive(config, archive_name)?;
    let engine = Engine::from_config(config)?;

    println!(
        "{} {} {} {}",
        "Backing up".blue().bold(),
        source_name.yellow(),
        "to".blue().bold(),
        archive_name.yellow()
    );
    let start = Instant::now();
    let (pb, callback) = progress_bar()?;
    let result = engine.run_backup(source, &mut archive, Some(callback)).await;
    pb.finish_and_clear();
    let snapshot = result?;

    let counts = snapshot.counts();
    let stored: u64 = snapshot
        .files()
        .iter()
        .filter(|key| snapshot.get_file_status(key).is_some_and(|s| s.has_content()))
        .filter_map(|key| std::fs::metadata(source.file_path(key)).ok())
        .map(|meta| meta.len())
        .sum();
    println!("{} Created version {}", "✓".green().bold(), snapshot.label().yellow().bold());
    println!("  Added: {}", counts.added.to_string().cyan());
    println!("  Modified: {}", counts.modified.to_string().cyan());
    println!("  Deleted: {}", counts.deleted.to_string().yellow());
    println!("  Stored: {}", format_bytes(stored).cyan());
    println!("  Time: {}", elapsed(start).cyan());
    if !counts.has_changes() {
        println!("\n{}", "Nothing changed since the previous backup.".dimmed());
    }
    Ok(())
}

/// List versions
async fn cmd_list(config: &Config, archive_name: &str) -> anyhow::Result<()> {
    let mut archive = find_archive(config, archive_name)?;
    let versions = archive.get_versions().await?;

    if versions.is_empty() {
        println!("{}", "No versions found.".yellow());
        return Ok(());
    }

    println!("{} {}", "Versions of".blue().bold(), archive_name.yellow().bold());
    println!();
    for (i, version) in versions.iter().enumerate() {
        let marker = if i == 0 { "*".green().bold() } else { " ".normal() };
        let counts = version.counts();
        println!(
            "{} {}  {} {} {}  {}",
            marker,
            version.label().yellow().bold(),
            format!("+{}", counts.added).green(),
            format!("~{}", counts.modified).cyan(),
            format!("-{}", counts.deleted).red(),
            version.source_label().unwrap_or_default().dimmed()
        );
    }
    Ok(())
}

fn select_version(versions: &[Snapshot], wanted: &str) -> murphy::Result<Snapshot> {
    let found = if wanted.eq_ignore_ascii_case("latest") {
        versions.first()
    } else {
        versions.iter().find(|v| v.label() == wanted)
    };
    found
        .cloned()
        .ok_or_else(|| MurphyError::SnapshotNotFound(wanted.to_string()))
}

/// Restore a version
async fn cmd_restore(config: &Config, archive_name: &str, wanted: &str, destination: &Path) -> anyhow::Result<()> {
    let mut archive = find_archive(config, archive_name)?;
    let versions = archive.get_versions().await?;
    let snapshot = select_version(&versions, wanted)?;
    let destination = absolute(destination)?;
    let engine = Engine::from_config(config)?;

    println!(
        "{} {}",
        "Restoring version".blue().bold(),
        snapshot.label().yellow().bold()
    );
    let start = Instant::now();
    let (pb, callback) = progress_bar()?;
    let result = engine
        .run_restore(&mut archive, &snapshot, &destination, Some(callback))
        .await;
    pb.finish_and_clear();
    let restored = result?;

    println!("{} Restore complete", "✓".green().bold());
    let bytes: u64 = restored
        .iter()
        .filter_map(|file| std::fs::metadata(destination.join(&file.path)).ok())
        .map(|meta| meta.len())
        .sum();
    println!("  Files restored: {}", restored.len().to_string().cyan());
    println!("  Bytes written: {}", format_bytes(bytes).cyan());
    println!("  Destination: {}", destination.display().to_string().cyan());
    println!("  Time: {}", elapsed(start).cyan());
    Ok(())
}

/// Rebuild the Latest folder
async fn cmd_rebuild(config: &Config, archive_name: &str) -> anyhow::Result<()> {
    let mut archive = find_archive(config, archive_name)?;
    let start = Instant::now();
    archive.rebuild().await?;
    println!("{} Rebuilt latest view of {}", "✓".green().bold(), archive_name.yellow().bold());
    println!("  Time: {}", elapsed(start).cyan());
    Ok(())
}
