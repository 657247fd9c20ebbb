//! AIDD CLI
//!
//! Operator command line over the AIDD memory and diagnostics engine.
//!
//! Usage:
//!   aidd [--project DIR] [--db PATH] <COMMAND>
//!
//! Logging goes to stderr and is controlled by `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use aidd_core::{
    categorize_error, parse_stack_trace, BranchStore, EvolutionTracker, HealthScorer, HookBus,
    HookEvent, MemoryContent, MemoryStore, OrderBy, PatternStore, PruneOptions, SearchIndex,
    SearchOptions, SessionOutcome, SessionStore, Storage, StoreConfig,
};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

/// Name of the markdown file refreshed after a session ends.
const EXPORT_FILE_NAME: &str = "memory-export.md";

/// AIDD - persistent memory for AI-assisted development
#[derive(Parser)]
#[command(name = "aidd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and maintain an AIDD project memory database")]
struct Cli {
    /// Project root; the database defaults to <project>/.aidd/memory.db
    #[arg(long, global = true)]
    project: Option<PathBuf>,

    /// Explicit database path (overrides --project and AIDD_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show row counts and evolution/pattern summaries
    Status,

    /// Score project health over recent completed sessions
    Health {
        /// Number of completed sessions to consider
        #[arg(long)]
        window: Option<usize>,
    },

    /// Full-text search over observations and permanent memory
    Search {
        query: String,
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, value_enum, default_value = "relevance")]
        order: SearchOrder,
    },

    /// Show entries recorded around an anchor id
    Timeline {
        id: String,
        #[arg(long, default_value = "3")]
        depth: usize,
    },

    /// Fetch full records by id
    Get {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Export permanent memory
    Export {
        /// Output file; stdout when omitted
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "markdown")]
        format: ExportFormat,
    },

    /// Remove stale detections and observations
    Prune {
        /// Override the detection age limit in days
        #[arg(long)]
        detection_days: Option<i64>,
        /// Override the observation row cap
        #[arg(long)]
        max_observations: Option<usize>,
        /// Override how many recent sessions keep their observations
        #[arg(long)]
        keep_sessions: Option<usize>,
    },

    /// Truncate the write-ahead log
    Checkpoint,

    /// Write a consistent copy of the database
    Backup { output: PathBuf },

    /// Categorize an error message
    Categorize {
        message: String,
        /// File holding a stack trace to parse alongside the message
        #[arg(long)]
        trace: Option<PathBuf>,
    },

    /// Find stored mistakes resembling an error
    Similar {
        error: String,
        #[arg(long, default_value = "0.3")]
        threshold: f64,
        #[arg(long, default_value = "5")]
        limit: usize,
    },

    /// Inspect or merge branch contexts
    Branch {
        #[command(subcommand)]
        action: BranchAction,
    },

    /// Session maintenance
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum BranchAction {
    /// Show one branch context
    Show { branch: String },
    /// Archive a branch context and remove it
    Merge { branch: String },
    /// List live branch contexts
    List {
        /// List archived branches instead
        #[arg(long)]
        archived: bool,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    /// End an active session and notify hook subscribers
    End {
        id: String,
        /// Tests passed at the end of the session
        #[arg(long)]
        tests_passing: bool,
        #[arg(long, default_value = "0")]
        reverts: u32,
        /// Compliance score (0-100); omit to end without an outcome
        #[arg(long)]
        compliance: Option<f64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SearchOrder {
    Relevance,
    Newest,
    Oldest,
}

impl From<SearchOrder> for OrderBy {
    fn from(order: SearchOrder) -> Self {
        match order {
            SearchOrder::Relevance => OrderBy::Relevance,
            SearchOrder::Newest => OrderBy::DateDesc,
            SearchOrder::Oldest => OrderBy::DateAsc,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Markdown,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs to stderr so command output on stdout stays pipeable
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();

    let config = match StoreConfig::resolve(cli.db.clone(), cli.project.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to resolve configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let storage = match Storage::open(&config) {
        Ok(storage) => Arc::new(storage),
        Err(e) if e.is_fatal() => {
            error!("Refusing to start: {}", e);
            eprintln!("{} {}", "fatal:".red().bold(), e);
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("Failed to open database: {}", e);
            eprintln!("{} {}", "error:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    info!("Using database {}", storage.path().display());

    match run(cli.command, &config, storage).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, config: &StoreConfig, storage: Arc<Storage>) -> anyhow::Result<()> {
    match command {
        Commands::Status => run_status(storage),
        Commands::Health { window } => run_health(storage, window.unwrap_or(config.health_window)),
        Commands::Search {
            query,
            limit,
            offset,
            order,
        } => run_search(
            storage,
            &query,
            SearchOptions {
                limit,
                offset,
                order_by: order.into(),
            },
        ),
        Commands::Timeline { id, depth } => run_timeline(storage, &id, depth),
        Commands::Get { ids } => run_get(storage, &ids),
        Commands::Export { output, format } => run_export(storage, output.as_deref(), format),
        Commands::Prune {
            detection_days,
            max_observations,
            keep_sessions,
        } => {
            let mut options = config.prune;
            if let Some(days) = detection_days {
                options.detection_max_age_days = days;
            }
            if let Some(max) = max_observations {
                options.max_observations = max;
            }
            if let Some(keep) = keep_sessions {
                options.keep_recent_sessions = keep;
            }
            run_prune(&storage, &options)
        }
        Commands::Checkpoint => run_checkpoint(&storage),
        Commands::Backup { output } => run_backup(&storage, &output),
        Commands::Categorize { message, trace } => run_categorize(&message, trace.as_deref()),
        Commands::Similar {
            error,
            threshold,
            limit,
        } => run_similar(storage, &error, threshold, limit),
        Commands::Branch { action } => run_branch(storage, action),
        Commands::Session { action } => match action {
            SessionAction::End {
                id,
                tests_passing,
                reverts,
                compliance,
            } => {
                let outcome = compliance.map(|compliance_score| SessionOutcome {
                    tests_passing,
                    revert_count: reverts,
                    compliance_score,
                });
                run_session_end(config, storage, &id, outcome).await
            }
        },
    }
}

fn run_status(storage: Arc<Storage>) -> anyhow::Result<()> {
    let stats = storage.stats()?;

    println!("{}", "=== AIDD Memory Status ===".cyan().bold());
    println!("{}: {}", "Database".white().bold(), storage.path().display());
    println!("{}: v{}", "Schema".white().bold(), stats.schema_version);
    println!();

    println!("{}", "Sessions".yellow().bold());
    println!("  {:22} {}", "total", stats.sessions);
    println!("  {:22} {}", "active", stats.active_sessions);
    println!("  {:22} {}", "observations", stats.observations);
    println!("  {:22} {}", "lifecycle sessions", stats.lifecycle_sessions);
    println!("  {:22} {} ({} archived)", "branches", stats.branches, stats.archived_branches);

    println!("{}", "Permanent memory".yellow().bold());
    println!("  {:22} {}", "decisions", stats.decisions);
    println!("  {:22} {}", "mistakes", stats.mistakes);
    println!("  {:22} {}", "conventions", stats.conventions);

    let evolution = EvolutionTracker::new(Arc::clone(&storage)).status()?;
    println!("{}", "Evolution".yellow().bold());
    println!("  {:22} {}", "pending", evolution.pending);
    println!("  {:22} {}", "approved", evolution.approved);
    println!("  {:22} {}", "applied", evolution.applied);
    println!("  {:22} {}", "auto-applied", evolution.auto_applied);
    println!("  {:22} {}", "rejected", evolution.rejected);
    println!("  {:22} {}", "reverted", evolution.reverted);

    let patterns = PatternStore::new(storage).stats()?;
    println!("{}", "Patterns".yellow().bold());
    println!(
        "  {:22} {} ({} active)",
        "banned patterns", patterns.total_patterns, patterns.active_patterns
    );
    println!(
        "  {:22} {} ({} false positives)",
        "detections", patterns.total_detections, patterns.false_positives
    );
    println!("  {:22} {}", "drafts", stats.drafts);
    println!("  {:22} {}", "artifacts", stats.artifacts);

    Ok(())
}

fn run_health(storage: Arc<Storage>, window: usize) -> anyhow::Result<()> {
    let report = HealthScorer::new(storage).score(window)?;

    println!("{}", "=== AIDD Health ===".cyan().bold());
    println!();

    let score = format!("{}/100", report.score);
    let colored_score = if report.score >= 80 {
        score.green().bold()
    } else if report.score >= 60 {
        score.yellow().bold()
    } else {
        score.red().bold()
    };
    println!("{}: {}", "Score".white().bold(), colored_score);
    println!(
        "{}: {} sessions, {} mistakes",
        "Considered".white(),
        report.sessions_considered,
        report.mistakes_considered
    );
    println!();

    let b = &report.breakdown;
    print_bar("Success rate", b.success_rate);
    print_bar("Compliance", b.compliance);
    print_bar("Non-recurrence", b.non_recurrence);
    print_bar("Consistency", b.consistency);
    print_bar("Utilization", b.utilization);

    if !report.recommendations.is_empty() {
        println!();
        println!("{}", "Recommendations:".cyan().bold());
        for rec in &report.recommendations {
            println!("  {} {}", ">".cyan(), rec);
        }
    }

    Ok(())
}

fn print_bar(label: &str, value: f64) {
    let bar_width: usize = 30;
    let filled = ((value.clamp(0.0, 100.0) / 100.0) * bar_width as f64) as usize;
    let bar = format!("{}{}", "#".repeat(filled), "-".repeat(bar_width - filled));
    let colored_bar = if value >= 80.0 {
        bar.green()
    } else if value >= 60.0 {
        bar.yellow()
    } else {
        bar.red()
    };
    println!("  {:15} [{}] {:>5.1}", label, colored_bar, value);
}

fn run_search(storage: Arc<Storage>, query: &str, options: SearchOptions) -> anyhow::Result<()> {
    let hits = SearchIndex::new(storage).search(query, &options)?;

    if hits.is_empty() {
        println!("{}", "No matches.".dimmed());
        return Ok(());
    }

    for hit in hits {
        println!(
            "{} {:>5.2} {:12} {}",
            hit.id.dimmed(),
            hit.relevance,
            hit.kind.yellow(),
            hit.title
        );
    }
    Ok(())
}

fn run_timeline(storage: Arc<Storage>, id: &str, depth: usize) -> anyhow::Result<()> {
    let timeline = SearchIndex::new(storage).get_timeline(id, depth)?;

    if !timeline.anchor.found {
        println!("{} {}", "Anchor not found:".yellow(), id);
        return Ok(());
    }

    for entry in &timeline.before {
        println!(
            "  {} {:12} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            entry.kind,
            entry.title
        );
    }
    if let Some(anchor) = &timeline.anchor.entry {
        println!(
            "{} {} {:12} {}",
            ">".cyan().bold(),
            anchor.created_at.format("%Y-%m-%d %H:%M:%S"),
            anchor.kind.cyan(),
            anchor.title.bold()
        );
    }
    for entry in &timeline.after {
        println!(
            "  {} {:12} {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            entry.kind,
            entry.title
        );
    }
    Ok(())
}

fn run_get(storage: Arc<Storage>, ids: &[String]) -> anyhow::Result<()> {
    let records = SearchIndex::new(storage).get_by_ids(ids)?;
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(())
}

fn run_export(
    storage: Arc<Storage>,
    output: Option<&Path>,
    format: ExportFormat,
) -> anyhow::Result<()> {
    let export = MemoryStore::new(storage).export()?;
    let rendered = match format {
        ExportFormat::Markdown => export.to_markdown(),
        ExportFormat::Json => serde_json::to_string_pretty(&export)?,
    };

    match output {
        Some(path) => {
            std::fs::write(path, rendered)?;
            println!(
                "{} {} decisions, {} mistakes, {} conventions to {}",
                "Exported".green().bold(),
                export.decisions.len(),
                export.mistakes.len(),
                export.conventions.len(),
                path.display()
            );
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

fn run_prune(storage: &Storage, options: &PruneOptions) -> anyhow::Result<()> {
    let report = storage.prune_stale_data(options)?;

    println!("{}", "=== Prune ===".cyan().bold());
    println!("  {:32} {}", "detections removed", report.detections_removed);
    println!("  {:32} {}", "observations over cap", report.observations_over_cap);
    println!(
        "  {:32} {}",
        "observations of old sessions", report.observations_of_old_sessions
    );
    println!("  {:32} {}", "total".bold(), report.total());
    Ok(())
}

fn run_checkpoint(storage: &Storage) -> anyhow::Result<()> {
    let result = storage.checkpoint()?;
    if result.busy {
        println!(
            "{} {} of {} frames checkpointed",
            "Busy:".yellow().bold(),
            result.checkpointed_frames,
            result.log_frames
        );
    } else {
        println!(
            "{} {} frames",
            "Checkpointed".green().bold(),
            result.checkpointed_frames
        );
    }
    Ok(())
}

fn run_backup(storage: &Storage, output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    storage.backup_to(output)?;
    println!("{} {}", "Backup written to".green().bold(), output.display());
    Ok(())
}

fn run_categorize(message: &str, trace: Option<&Path>) -> anyhow::Result<()> {
    let result = categorize_error(message);

    println!("{}: {}", "Category".white().bold(), result.category.as_str().cyan());
    println!("{}: {:.2}", "Confidence".white().bold(), result.confidence);
    if !result.matched_patterns.is_empty() {
        println!(
            "{}: {}",
            "Matched".white().bold(),
            result.matched_patterns.join(", ")
        );
    }
    println!("{}: {}", "Hint".white().bold(), result.hint);

    if let Some(path) = trace {
        let parsed = parse_stack_trace(&std::fs::read_to_string(path)?);
        println!();
        println!("{} ({} frames)", "Stack trace".yellow().bold(), parsed.frames.len());
        if let Some(frame) = &parsed.primary_frame {
            println!(
                "  {} {}:{} {}",
                "primary".cyan(),
                frame.file,
                frame.line,
                frame.function.as_deref().unwrap_or("<anonymous>")
            );
        }
        if let Some(module) = &parsed.primary_module {
            println!("  {} {}", "module".cyan(), module);
        }
    }
    Ok(())
}

fn run_similar(storage: Arc<Storage>, error: &str, threshold: f64, limit: usize) -> anyhow::Result<()> {
    let matches = MemoryStore::new(storage).find_similar_mistakes(error, threshold, limit)?;

    if matches.is_empty() {
        println!("{}", "No similar mistakes recorded.".dimmed());
        return Ok(());
    }

    for m in matches {
        if let MemoryContent::Mistake(mistake) = &m.entry.content {
            println!("{} {:.2} {}", m.entry.id.dimmed(), m.score, mistake.error.bold());
            println!("    {} {}", "fix:".green(), mistake.fix);
            println!("    {} {}", "prevention:".cyan(), mistake.prevention);
        }
    }
    Ok(())
}

fn run_branch(storage: Arc<Storage>, action: BranchAction) -> anyhow::Result<()> {
    let branches = BranchStore::new(storage);

    match action {
        BranchAction::Show { branch } => {
            let context = branches.get(&branch)?;
            println!("{}", serde_json::to_string_pretty(&context)?);
        }
        BranchAction::Merge { branch } => {
            let archived = branches.merge(&branch)?;
            println!(
                "{} {} as {}",
                "Archived".green().bold(),
                archived.branch,
                archived.archive_name
            );
        }
        BranchAction::List { archived: false } => {
            for context in branches.list()? {
                println!(
                    "{:30} {:>3} sessions {:>4} pending",
                    context.branch,
                    context.sessions_count,
                    context.pending_tasks.len()
                );
            }
        }
        BranchAction::List { archived: true } => {
            for archive in branches.list_archived(None)? {
                println!(
                    "{:40} {}",
                    archive.archive_name,
                    archive.archived_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
                );
            }
        }
    }
    Ok(())
}

async fn run_session_end(
    config: &StoreConfig,
    storage: Arc<Storage>,
    id: &str,
    outcome: Option<SessionOutcome>,
) -> anyhow::Result<()> {
    let session = SessionStore::new(Arc::clone(&storage)).end(id, outcome)?;
    println!(
        "{} {} on {} after {}s",
        "Ended".green().bold(),
        session.id,
        session.branch,
        session.duration_ms() / 1000
    );

    let export_path = storage
        .path()
        .parent()
        .map(|dir| dir.join(EXPORT_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(EXPORT_FILE_NAME));

    let mut bus = HookBus::new(config.hooks.clone());
    let export_storage = Arc::clone(&storage);
    bus.register("memory-export", move |_event: HookEvent| {
        let storage = Arc::clone(&export_storage);
        let path = export_path.clone();
        async move {
            let export = MemoryStore::new(storage)
                .export()
                .map_err(|e| e.to_string())?;
            tokio::fs::write(&path, export.to_markdown())
                .await
                .map_err(|e| format!("{}: {}", path.display(), e))
        }
    });

    let report = bus
        .emit(HookEvent::SessionEnded {
            session_id: session.id.clone(),
        })
        .await;

    for name in &report.failed {
        println!("{} hook {} failed", "warning:".yellow().bold(), name);
    }
    for letter in bus.dead_letters() {
        error!(
            "Hook {} gave up on {} after {} attempts: {}",
            letter.subscriber,
            letter.event.name(),
            letter.attempts,
            letter.error
        );
    }
    Ok(())
}
