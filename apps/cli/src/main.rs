//! bundlefetch CLI - fetch content bundles into a verified local cache
//!
//! The cache registry lives in memory, so every command that inspects the
//! cache starts by scanning the package directory.

mod commands;
mod output;
mod progress;

use anyhow::{Context, Result};
use bundlefetch_types::{Settings, VerifyLevel};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// bundlefetch - resumable, verified content downloads
#[derive(Parser)]
#[command(name = "bundlefetch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, env = "BUNDLEFETCH_CONFIG")]
    config: Option<PathBuf>,

    /// Cache root, overriding the settings file
    #[arg(long, env = "BUNDLEFETCH_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Package namespace to operate on
    #[arg(short, long, default_value = "main")]
    package: String,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LevelArg {
    Low,
    Middle,
    High,
}

impl From<LevelArg> for VerifyLevel {
    fn from(level: LevelArg) -> Self {
        match level {
            LevelArg::Low => VerifyLevel::Low,
            LevelArg::Middle => VerifyLevel::Middle,
            LevelArg::High => VerifyLevel::High,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download one resource into the cache
    Get {
        /// Primary URL
        url: String,

        /// Cache key
        #[arg(short, long)]
        key: String,

        /// Expected size in bytes
        #[arg(short, long)]
        size: u64,

        /// Expected CRC32 (hex)
        #[arg(short, long)]
        crc: String,

        /// Mirror used on even attempts
        #[arg(long)]
        fallback: Option<String>,

        /// Store as a raw file with this extension
        #[arg(long)]
        raw: Option<String>,

        /// Retries after the first attempt
        #[arg(short, long, default_value_t = 3)]
        retries: u32,

        /// Stall window in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Download every resource listed in a manifest
    Fetch {
        /// JSON array of bundle descriptors
        manifest: PathBuf,

        /// Downloads in flight at once
        #[arg(short = 'j', long, default_value_t = 4)]
        concurrency: usize,

        /// Retries after the first attempt
        #[arg(short, long, default_value_t = 3)]
        retries: u32,

        /// Stall window in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Stop at the first failed download
        #[arg(long)]
        fail_fast: bool,
    },

    /// Scan the package directory and report what verifies
    Scan {
        /// Stricter verification level (never below the configured one)
        #[arg(short, long)]
        level: Option<LevelArg>,
    },

    /// List verified cache entries
    List,

    /// Re-verify cached entries
    Verify {
        /// Keys to check (all entries when empty)
        keys: Vec<String>,

        #[arg(short, long, default_value = "high")]
        level: LevelArg,
    },

    /// Remove entries from the cache
    Evict {
        /// Keys to remove
        #[arg(required = true)]
        keys: Vec<String>,
    },

    /// Clear the package cache
    Clear {
        /// Keep entries listed in this manifest and remove the rest
        #[arg(long)]
        keep: Option<PathBuf>,
    },

    /// Show or save effective settings
    Config {
        /// Write the effective settings to the config file
        #[arg(long)]
        save: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let settings = load_settings(&config_path, cli.cache_dir.clone())?;
    let package = cli.package.as_str();
    let format = cli.output;

    match cli.command {
        Commands::Get {
            url,
            key,
            size,
            crc,
            fallback,
            raw,
            retries,
            timeout,
        } => {
            let request = commands::GetRequest {
                url,
                key,
                size,
                crc,
                fallback,
                raw,
                retries,
                timeout,
            };
            commands::get(settings, package, request, format)?
        }

        Commands::Fetch {
            manifest,
            concurrency,
            retries,
            timeout,
            fail_fast,
        } => {
            let options = commands::fetch_options(concurrency, retries, timeout, fail_fast);
            commands::fetch(settings, &manifest, options, format)?
        }

        Commands::Scan { level } => {
            commands::scan(settings, package, level.map(Into::into), format)?
        }

        Commands::List => commands::list(settings, package, format)?,

        Commands::Verify { keys, level } => {
            commands::verify(settings, package, keys, level.into(), format)?
        }

        Commands::Evict { keys } => commands::evict(settings, package, keys, format)?,

        Commands::Clear { keep } => commands::clear(settings, package, keep, format)?,

        Commands::Config { save } => commands::config(&settings, &config_path, save, format)?,

        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "bundlefetch",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Log to stderr so progress bars and JSON on stdout stay clean.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "bundlefetch_core=debug,bundlefetch=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose),
        )
        .init();
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("bundlefetch").join("settings.json"))
        .unwrap_or_else(|| PathBuf::from(".bundlefetch/settings.json"))
}

fn load_settings(path: &std::path::Path, cache_dir: Option<PathBuf>) -> Result<Settings> {
    let mut settings = if path.is_file() {
        bundlefetch_core::config::load_settings(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?
    } else {
        Settings::default()
    };
    if let Some(dir) = cache_dir {
        settings.cache_root = dir;
    }
    Ok(settings)
}
