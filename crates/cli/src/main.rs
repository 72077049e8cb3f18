use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use keystone_core::{PlanGraph, Technology};
use orchestrator::{
    NextAction, OrchestratorConfig, OrchestratorError, ProgressReporter, ResearchOrchestrator,
    ResearchRequest, ResearchWorker, Scheduler,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

const KEYSTONE_DIR: &str = ".keystone";
const CONFIG_FILE: &str = "config.toml";
const DEFAULT_DB_NAME: &str = "keystone.db";

#[derive(Parser)]
#[command(name = "keystone")]
#[command(about = "Milestone scheduling and technology research", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .keystone/ with a config file and an empty store
    Init,
    /// Show progress for milestones, tasks and research
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Import a milestone/task graph from a JSON or TOML file
    Plan { file: PathBuf },
    /// Claim the next eligible task
    Next,
    /// Mark a dispatched task completed
    Complete { task_id: Uuid },
    /// Return a dispatched task to pending
    Release {
        task_id: Uuid,
        #[arg(short, long, default_value = "released by operator")]
        reason: String,
    },
    /// Release work left in progress by an interrupted run
    Recover,
    /// List the committed technology set
    Technologies,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct KeystoneConfig {
    project: ProjectConfig,
    database: DatabaseConfig,
    #[serde(default)]
    orchestrator: OrchestratorConfig,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct ProjectConfig {
    name: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct DatabaseConfig {
    /// Relative paths resolve against the .keystone directory.
    path: PathBuf,
}

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            project: ProjectConfig {
                name: "my-project".to_string(),
            },
            database: DatabaseConfig {
                path: PathBuf::from(DEFAULT_DB_NAME),
            },
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl KeystoneConfig {
    async fn load(keystone_dir: &Path) -> Result<Self> {
        let config_path = keystone_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid {}", config_path.display()))
    }

    fn database_path(&self, keystone_dir: &Path) -> PathBuf {
        if self.database.path.is_absolute() {
            self.database.path.clone()
        } else {
            keystone_dir.join(&self.database.path)
        }
    }
}

/// The CLI never runs research itself; it only needs an orchestrator to
/// inspect and recover the store.
struct OfflineWorker;

#[async_trait]
impl ResearchWorker for OfflineWorker {
    async fn research(&self, request: &ResearchRequest) -> orchestrator::Result<String> {
        Err(OrchestratorError::Worker(format!(
            "no research worker available for {}",
            request.opportunity_id
        )))
    }
}

struct Project {
    config: KeystoneConfig,
    pool: db::SqlitePool,
}

impl Project {
    async fn open() -> Result<Self> {
        let keystone_dir = std::env::current_dir()?.join(KEYSTONE_DIR);
        if !keystone_dir.exists() {
            bail!("Not a Keystone project. Run 'keystone init' first.");
        }

        let config = KeystoneConfig::load(&keystone_dir).await?;
        let db_path = config.database_path(&keystone_dir);
        let database_url = format!("sqlite:{}", db_path.display());
        tracing::debug!("Database: {}", db_path.display());

        let pool = db::connect(&database_url)
            .await
            .context("Failed to open the state store")?;
        Ok(Self { config, pool })
    }

    fn scheduler(&self) -> Scheduler {
        Scheduler::new(self.pool.clone()).with_config(self.config.orchestrator.scheduler.clone())
    }

    fn research(&self) -> ResearchOrchestrator {
        ResearchOrchestrator::new(self.pool.clone(), Arc::new(OfflineWorker))
            .with_config(self.config.orchestrator.research.clone())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init => init_project().await,
        Commands::Status { json } => status(json).await,
        Commands::Plan { file } => import_plan(&file).await,
        Commands::Next => next().await,
        Commands::Complete { task_id } => complete(task_id).await,
        Commands::Release { task_id, reason } => release(task_id, &reason).await,
        Commands::Recover => recover().await,
        Commands::Technologies => technologies().await,
    }
}

async fn init_project() -> Result<()> {
    let cwd = std::env::current_dir()?;
    let keystone_dir = cwd.join(KEYSTONE_DIR);

    if keystone_dir.join(CONFIG_FILE).exists() {
        println!("Project already initialized at {}", keystone_dir.display());
        return Ok(());
    }

    tokio::fs::create_dir_all(&keystone_dir).await?;

    let project_name = cwd
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("my-project")
        .to_string();
    let config = KeystoneConfig {
        project: ProjectConfig {
            name: project_name.clone(),
        },
        ..Default::default()
    };

    let config_content = toml::to_string_pretty(&config)?;
    tokio::fs::write(keystone_dir.join(CONFIG_FILE), config_content).await?;

    let db_path = config.database_path(&keystone_dir);
    db::connect(&format!("sqlite:{}", db_path.display()))
        .await
        .context("Failed to create the state store")?;

    println!();
    println!("Initialized Keystone for '{}'", project_name.bold());
    println!();
    println!("Created:");
    println!("  {}/", KEYSTONE_DIR);
    println!("  ├── {}", CONFIG_FILE);
    println!("  └── {}", DEFAULT_DB_NAME);
    println!();
    println!("Next: 'keystone plan <file>' to load a milestone graph");

    Ok(())
}

async fn status(json: bool) -> Result<()> {
    let project = Project::open().await?;
    let report = ProgressReporter::new(project.pool.clone()).report().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    println!("Project: {}", project.config.project.name.bold());
    println!();
    println!(
        "Milestones: {}/{} completed",
        report.milestones_completed, report.milestones_total
    );
    match &report.current_milestone {
        Some(current) => println!(
            "Current:    {} {}",
            current.name.cyan(),
            format!("(#{})", current.ordering).dimmed()
        ),
        None => println!("Current:    {}", "none".dimmed()),
    }
    println!(
        "Tasks:      {} pending, {} in progress, {} completed ({:.1}%)",
        report.tasks.pending,
        report.tasks.in_progress.to_string().yellow(),
        report.tasks.completed.to_string().green(),
        report.percent_complete
    );
    if let Some(avg) = report.average_task_duration_secs {
        println!("Avg task:   {:.0}s", avg);
    }
    println!();
    println!("Research:   {}", report.research.phase.as_str().cyan());
    println!(
        "            {} pending, {} in progress, {} completed, {} skipped",
        report.research.pending,
        report.research.in_progress,
        report.research.completed,
        report.research.skipped.to_string().red()
    );
    println!("            {} technologies committed", report.research.technologies);
    println!();

    Ok(())
}

fn parse_plan(path: &Path, content: &str) -> Result<PlanGraph> {
    let graph = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(content)?,
        _ => serde_json::from_str(content)?,
    };
    Ok(graph)
}

async fn import_plan(file: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let graph = parse_plan(file, &content)
        .with_context(|| format!("Invalid plan file {}", file.display()))?;
    let milestones = graph.milestones.len();

    let project = Project::open().await?;
    let tasks = project.scheduler().import_plan(graph).await?;

    println!(
        "{} {} milestone(s), {} task(s)",
        "Imported".green(),
        milestones,
        tasks
    );
    Ok(())
}

async fn next() -> Result<()> {
    let project = Project::open().await?;
    let scheduler = project.scheduler();

    match scheduler.next_action().await? {
        NextAction::Dispatch(task) => {
            let milestone = scheduler.milestone(task.milestone_id).await?;
            println!("{} {}", "Dispatch".green().bold(), task.title.bold());
            println!("  id:        {}", task.id);
            println!("  milestone: {}", milestone.name);
            println!("  attempt:   {}", task.attempts);
            if !task.description.is_empty() {
                println!();
                println!("{}", task.description);
            }
        }
        NextAction::MilestoneCompleted { completed, next } => {
            let completed = scheduler.milestone(completed).await?;
            let next = scheduler.milestone(next).await?;
            println!(
                "{} {} → {}",
                "Milestone completed".green().bold(),
                completed.name,
                next.name.cyan()
            );
        }
        NextAction::AllComplete => println!("{}", "All milestones complete".green().bold()),
        NextAction::Blocked { milestone, reason } => {
            let milestone = scheduler.milestone(milestone).await?;
            println!(
                "{} in {}: {}",
                "Blocked".red().bold(),
                milestone.name,
                reason.describe()
            );
            for id in reason.tasks() {
                println!("  - {}", id);
            }
        }
    }
    Ok(())
}

async fn complete(task_id: Uuid) -> Result<()> {
    let project = Project::open().await?;
    let task = project.scheduler().complete_task(task_id).await?;
    let duration = task
        .duration()
        .map(|d| format!(" in {}s", d.num_seconds()))
        .unwrap_or_default();
    println!("{} {}{}", "Completed".green(), task.title, duration);
    Ok(())
}

async fn release(task_id: Uuid, reason: &str) -> Result<()> {
    let project = Project::open().await?;
    let task = project.scheduler().release_task(task_id, reason).await?;
    println!("{} {} ({})", "Released".yellow(), task.title, reason);
    Ok(())
}

async fn recover() -> Result<()> {
    let project = Project::open().await?;
    let tasks = project.scheduler().recover().await?;
    let research = project.research().recover().await?;

    println!(
        "Released {} task(s), abandoned {} research execution(s), reset {} opportunit{}",
        tasks.released.len(),
        research.abandoned_executions,
        research.reset.len(),
        if research.reset.len() == 1 { "y" } else { "ies" }
    );
    Ok(())
}

async fn technologies() -> Result<()> {
    let project = Project::open().await?;
    let outcome = project.research().committed_outcome().await?;

    if outcome.technologies.is_empty() {
        println!("No technologies committed yet.");
        return Ok(());
    }

    println!();
    for technology in &outcome.technologies {
        print_technology(technology);
    }
    if !outcome.skipped.is_empty() {
        println!("{}", "Skipped research:".red());
        for (opportunity, reason) in &outcome.skipped {
            println!("  {} {}", opportunity, reason.dimmed());
        }
        println!();
    }
    Ok(())
}

fn print_technology(technology: &Technology) {
    println!(
        "{:<20} {} {}",
        technology.category.as_str().cyan(),
        technology.label().bold(),
        format!(
            "[{}, {}]",
            technology.confidence,
            technology.provenance.as_str()
        )
        .dimmed()
    );
    for source in &technology.sources {
        let mark = if source.verified {
            "✓".green()
        } else {
            "?".yellow()
        };
        println!("{:<20} {} {}", "", mark, source.url);
    }
    for note in &technology.compatibility_notes {
        println!("{:<20} {}", "", note.dimmed());
    }
    println!();
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose {
        "keystone=debug,orchestrator=debug,db=debug"
    } else {
        "keystone=info,orchestrator=info,db=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();
}
