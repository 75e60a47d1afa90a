//! shipsync command-line tool.
//!
//! Provides the `sync` subcommand driving one batch sync run, plus
//! `validate` and `init` for working with configuration files.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shipsync_core::config::BaseConfig;
use shipsync_core::sync::{Filter, SyncEngine};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Mirror commit history between two repositories.
#[derive(Parser, Debug)]
#[command(
    name = "shipsync",
    version,
    about = "Mirror commit history between two repositories (git or hg)"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "./shipsync.toml")]
    config: PathBuf,

    /// Dump changeset debug messages while syncing.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync pending commits from the source to the destination repository.
    Sync {
        /// First source commit to sync, overriding resume discovery.
        #[arg(long)]
        first_commit: Option<String>,

        /// Source commit id prefix to skip unconditionally. Repeatable.
        #[arg(long = "skip-source-commit")]
        skip_source_commits: Vec<String>,

        /// Directory to write rendered patches into for debugging.
        #[arg(long)]
        patches_dir: Option<PathBuf>,

        /// File to write the JSON stats record to. A directory gets one
        /// `<branch>.json` file per destination branch.
        #[arg(long)]
        stats_file: Option<PathBuf>,

        /// Extra destination root to search for the tracking footer.
        /// Repeatable.
        #[arg(long = "destination-root")]
        destination_roots: Vec<String>,
    },

    /// Validate a configuration file.
    Validate,

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./shipsync.toml")]
        output: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "info" } else { "warn" })),
        )
        .with_target(false)
        .without_time()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Sync {
            first_commit,
            skip_source_commits,
            patches_dir,
            stats_file,
            destination_roots,
        } => {
            let mut config = BaseConfig::load_and_validate(&cli.config)
                .context("failed to load configuration file")?;
            config.verbose = cli.verbose;
            if first_commit.is_some() {
                config.sync.first_commit = first_commit;
            }
            config.sync.skip_source_commits.extend(skip_source_commits);
            if patches_dir.is_some() {
                config.sync.patches_directory = patches_dir;
            }
            if stats_file.is_some() {
                config.sync.stats_file = stats_file;
            }
            config.destination.roots.extend(destination_roots);

            let engine = SyncEngine::from_config(config, source_roots_filter())
                .context("failed to open repositories")?;
            engine.run().context("sync failed")?;
            Ok(())
        }
    }
}

/// The default filter: keep only diffs under the configured source roots.
/// An empty roots list means the whole tree is in scope.
fn source_roots_filter() -> Filter {
    Box::new(|config, changeset| {
        let roots = &config.source.roots;
        if roots.is_empty() {
            return changeset;
        }
        let diffs = changeset
            .diffs()
            .iter()
            .filter(|diff| roots.iter().any(|root| diff.path.starts_with(root.as_str())))
            .cloned()
            .collect();
        changeset.with_diffs(diffs)
    })
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &PathBuf) -> Result<()> {
    let default_config = r#"# shipsync configuration

[source]
path = "/var/repos/upstream"
branch = "master"
# Path prefixes in scope; commits touching nothing under these are skipped.
roots = ["public/"]

[destination]
path = "/var/repos/mirror"
branch = "main"
roots = []

[sync]
# first_commit = "abc123"
# skip_source_commits = ["deadbeef"]
# patches_directory = "/tmp/shipsync-patches"
# stats_file = "/var/log/shipsync/stats.json"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file with your repository paths and branches");
    println!(
        "  2. Validate with: shipsync validate --config {}",
        output.display()
    );
    println!("  3. Run a sync: shipsync sync --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &PathBuf) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config =
        BaseConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => {
            println!("  [OK] All required fields are valid");
        }
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Source path       : {}", config.source.path.display());
    println!("  Source branch     : {}", config.source.branch);
    println!("  Source roots      : {}", format_roots(&config.source.roots));
    println!(
        "  Destination path  : {}",
        config.destination.path.display()
    );
    println!("  Destination branch: {}", config.destination.branch);
    println!(
        "  Destination roots : {}",
        format_roots(&config.destination.roots)
    );
    println!(
        "  First commit      : {}",
        config.sync.first_commit.as_deref().unwrap_or("(resume)")
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn format_roots(roots: &[String]) -> String {
    if roots.is_empty() {
        "(entire tree)".to_string()
    } else {
        roots.join(", ")
    }
}
