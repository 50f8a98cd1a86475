//! tlfcr: conflict resolution operator CLI
//!
//! Commands:
//!   config show                 - display current configuration
//!   attempts show --folder <id> - list recorded resolution attempts
//!   attempts clear --folder <id> - reset a stuck folder's attempt log
//!   demo                        - diverge a scratch folder and resolve it

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use tlfcr_core::config::{expand_tilde, LogFormat, TlfcrConfig};
use tlfcr_resolve::memory::{Edit, MemoryFolder, Node};
use tlfcr_resolve::{AttemptLog, ConflictResolver, RequestContext};
use tlfcr_storage::BlockStore;

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "tlfcr",
    version,
    about = "Folder conflict resolution",
    long_about = "tlfcr: inspect and reset conflict resolution state, or run a scripted resolution"
)]
struct Cli {
    /// Path to tlfcr.toml configuration file
    #[arg(long, short = 'c', env = "TLFCR_CONFIG", default_value = "/etc/tlfcr/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Resolution attempt log
    Attempts {
        #[command(subcommand)]
        action: AttemptsAction,
    },

    /// Diverge an in-memory folder on two devices and resolve it
    Demo {
        /// Print the committed op logs as JSON
        #[arg(long)]
        ops: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration (merged defaults + config file)
    Show,
}

#[derive(Subcommand, Debug)]
enum AttemptsAction {
    /// List a folder's recorded attempts
    Show {
        #[arg(long)]
        folder: String,
    },
    /// Forget a folder's attempts so it is resolved again
    Clear {
        #[arg(long)]
        folder: String,
    },
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    init_logging(&config.logging.level, config.logging.format);

    match cli.command {
        Commands::Config { action: ConfigAction::Show } => cmd_config_show(&config, &cli.config),
        Commands::Attempts { action: AttemptsAction::Show { folder } } => {
            cmd_attempts_show(&config, &folder)
        }
        Commands::Attempts { action: AttemptsAction::Clear { folder } } => {
            cmd_attempts_clear(&config, &folder)
        }
        Commands::Demo { ops } => cmd_demo(&config, ops).await,
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

fn load_config(path: &Path) -> Result<TlfcrConfig> {
    if path.exists() {
        TlfcrConfig::load(path).with_context(|| format!("loading config: {}", path.display()))
    } else {
        Ok(TlfcrConfig::default())
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn open_attempt_log(config: &TlfcrConfig) -> Result<AttemptLog> {
    let path = expand_tilde(&config.attempt_log.path);
    AttemptLog::open(&path, config.resolver.max_attempts)
        .with_context(|| format!("opening attempt log: {}", path.display()))
}

// ── `tlfcr config show` ───────────────────────────────────────────────────────

fn cmd_config_show(config: &TlfcrConfig, config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!("# Configuration from: {}", config_path.display());
    } else {
        println!("# Configuration: defaults (no file at {})", config_path.display());
    }
    println!();
    let rendered = config.to_toml().context("serializing config to TOML")?;
    print!("{rendered}");
    Ok(())
}

// ── `tlfcr attempts` ──────────────────────────────────────────────────────────

fn cmd_attempts_show(config: &TlfcrConfig, folder: &str) -> Result<()> {
    let log = open_attempt_log(config)?;
    let records = log.records(folder)?;
    if records.is_empty() {
        println!("{folder}: no recorded attempts");
        return Ok(());
    }

    let failures = log.failures(folder)?;
    let state = if log.is_stuck(folder)? { "STUCK" } else { "ok" };
    println!(
        "{folder}: {} attempt(s), {failures}/{} failed [{state}]",
        records.len(),
        log.max_attempts()
    );
    for record in &records {
        let result = match (&record.panic_string, &record.error_string) {
            (Some(panic), _) => format!("panicked: {panic}"),
            (None, Some(err)) => format!("failed: {err}"),
            (None, None) => "in progress".to_string(),
        };
        println!(
            "  {:>13}  unmerged={:<6} merged={:<6} {result}",
            record.time, record.unmerged, record.merged
        );
    }
    Ok(())
}

fn cmd_attempts_clear(config: &TlfcrConfig, folder: &str) -> Result<()> {
    let log = open_attempt_log(config)?;
    let was_stuck = log.is_stuck(folder)?;
    log.clear(folder)?;
    if was_stuck {
        println!("{folder}: attempt log cleared, folder is no longer stuck");
    } else {
        println!("{folder}: attempt log cleared");
    }
    Ok(())
}

// ── `tlfcr demo` ──────────────────────────────────────────────────────────────

fn print_tree(title: &str, tree: &BTreeMap<String, Node>) {
    println!("{title}:");
    if tree.is_empty() {
        println!("  (empty)");
    }
    for (path, node) in tree {
        match node {
            Node::Dir => println!("  {path}/"),
            Node::File(data) => println!("  {path}  {:?}", String::from_utf8_lossy(data)),
            Node::Exec(data) => println!("  {path}*  {:?}", String::from_utf8_lossy(data)),
            Node::Symlink(target) => println!("  {path} -> {target}"),
        }
    }
    println!();
}

async fn cmd_demo(config: &TlfcrConfig, show_ops: bool) -> Result<()> {
    let op = tlfcr_storage::build_operator(&config.storage)?;
    tlfcr_storage::check_health(&op).await?;
    let folder = Arc::new(MemoryFolder::with_store("demo", BlockStore::new(op)).await?);

    let create = |path: &str, data: &str| Edit::Create(path.into(), data.as_bytes().to_vec());
    folder
        .merged_edit(
            "alice",
            vec![
                Edit::Mkdir("docs".into()),
                Edit::Mkdir("src".into()),
                create("docs/notes.txt", "draft"),
                create("src/main.rs", "fn main() {}"),
            ],
        )
        .await?;
    folder
        .unmerged_edit(
            "bob",
            vec![
                Edit::Write {
                    path: "docs/notes.txt".into(),
                    offset: 0,
                    data: b"BOB'S".to_vec(),
                },
                create("src/lib.rs", "pub mod x;"),
                Edit::Rename("docs".into(), "src/docs".into()),
            ],
        )
        .await?;
    folder
        .merged_edit(
            "alice",
            vec![
                Edit::Write {
                    path: "docs/notes.txt".into(),
                    offset: 0,
                    data: b"ALICE".to_vec(),
                },
                Edit::SetExec("src/main.rs".into(), true),
                Edit::Rename("src".into(), "docs/src".into()),
            ],
        )
        .await?;

    if let Some(local) = folder.unmerged_snapshot().await? {
        print_tree("local (bob, unmerged)", &local);
    }
    print_tree("server (alice, merged)", &folder.snapshot().await?);

    let attempts = Arc::new(AttemptLog::in_memory(config.resolver.max_attempts));
    let resolver = ConflictResolver::new(folder.clone(), config.resolver.clone(), attempts.clone());
    resolver.resolve(&RequestContext::new(), folder.conflict_input());
    tokio::time::timeout(Duration::from_secs(30), resolver.wait(&RequestContext::new()))
        .await
        .context("resolution timed out")??;

    if let Some(err) = folder.errors().last() {
        anyhow::bail!("resolution failed: {err}");
    }
    print_tree(
        &format!("resolved (revision {})", folder.merged_head()),
        &folder.snapshot().await?,
    );

    if show_ops {
        if let Some(md) = folder.merged_revisions().last() {
            println!("committed ops:");
            println!("{}", serde_json::to_string_pretty(&md.ops)?);
        }
        if let Some(local) = folder.local_ops().last() {
            println!("local notifications:");
            println!("{}", serde_json::to_string_pretty(local)?);
        }
    }
    Ok(())
}
