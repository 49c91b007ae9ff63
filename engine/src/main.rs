use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use montage_observability::init_logging;
use montage_orchestrator::{MontageConfig, Orchestrator};
use montage_types::{Budget, GlobalSpec, Money, QualityTier, TaskStatus, UserOptions};

#[derive(Parser, Debug)]
#[command(name = "montage-engine")]
#[command(about = "Headless Montage coordination backend")]
struct Cli {
    /// State directory (defaults to MONTAGE_STATE_DIR or .montage)
    #[arg(long, global = true)]
    state_dir: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator service until interrupted.
    Run,
    /// Create a project and publish its root event.
    Create {
        project_id: String,
        title: String,
        #[arg(long, default_value_t = 30.0)]
        duration: f64,
        #[arg(long, default_value_t = 50.0)]
        budget: f64,
        #[arg(long, default_value_t = false)]
        auto: bool,
    },
    /// Show a project's version and status.
    Status { project_id: String },
    /// List all known projects.
    List,
    /// List pending approvals for a project.
    Approvals { project_id: String },
    /// Approve a pending request.
    Approve {
        project_id: String,
        approval_id: String,
    },
    /// Reject a pending request (full redo of the stage).
    Reject {
        project_id: String,
        approval_id: String,
        notes: String,
    },
    /// Request a revision with notes.
    Revise {
        project_id: String,
        approval_id: String,
        notes: String,
    },
    /// List tasks, optionally filtered.
    Tasks {
        project_id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
    },
    /// Re-enqueue a failed task.
    Retry {
        project_id: String,
        task_id: String,
    },
    /// Force-abort a project.
    Abort {
        project_id: String,
        #[arg(long, default_value = "admin_abort")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = MontageConfig::load(cli.state_dir.clone().map(PathBuf::from));

    match cli.command {
        Command::Run => run_service(config).await,
        command => {
            tracing_subscriber::fmt()
                .with_env_filter("warn")
                .with_target(false)
                .init();
            run_admin(config, command).await
        }
    }
}

async fn run_service(config: MontageConfig) -> anyhow::Result<()> {
    let _log = init_logging("engine", &config.logs_dir(), config.retention_days)
        .context("failed to initialize logging")?;
    log_startup(&config);

    let orchestrator = Orchestrator::open(config).context("failed to open stores")?;
    orchestrator.start().await.context("failed to start")?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    orchestrator.stop();
    Ok(())
}

/// What an operator wants to know at boot: which state dir is live,
/// whether this is a resume or a fresh install, and whether the mapping
/// table is the built-in default or an on-disk override.
fn log_startup(config: &MontageConfig) {
    let resuming = config.state_db().exists();
    info!(
        state_dir = %config.state_dir.display(),
        resuming,
        "opening coordination stores"
    );
    if !resuming {
        info!("no existing state database; starting with an empty project set");
    }
    if config.mapper_table_path().exists() {
        info!(
            path = %config.mapper_table_path().display(),
            "mapper table loaded from disk override"
        );
    }
}

async fn run_admin(config: MontageConfig, command: Command) -> anyhow::Result<()> {
    let orchestrator = Orchestrator::open(config).context("failed to open stores")?;
    match command {
        Command::Run => unreachable!("handled in main"),
        Command::Create {
            project_id,
            title,
            duration,
            budget,
            auto,
        } => {
            let spec = GlobalSpec {
                title,
                duration_seconds: duration,
                aspect_ratio: "16:9".to_string(),
                quality_tier: QualityTier::Balanced,
                resolution: "1920x1080".to_string(),
                fps: 24,
                style: Default::default(),
                characters: Vec::new(),
                mood: String::new(),
                user_options: UserOptions {
                    auto_mode: auto,
                    ..UserOptions::default()
                },
            };
            let event_id = orchestrator
                .create_project(&project_id, spec, Budget::new(Money::usd(budget)))
                .await?;
            println!("created {project_id} (root event {event_id})");
        }
        Command::Status { project_id } => {
            let (version, status) = orchestrator.project_status(&project_id).await?;
            println!("{project_id} v{version} {}", status_name(status)?);
        }
        Command::List => {
            for (id, version, status) in orchestrator.state.list_projects().await? {
                println!("{id} v{version} {}", status_name(status)?);
            }
        }
        Command::Approvals { project_id } => {
            let pending = orchestrator.list_pending_approvals(&project_id).await?;
            if pending.is_empty() {
                println!("no pending approvals");
            }
            for approval in pending {
                println!(
                    "{} stage={} created_at={} summary={}",
                    approval.id, approval.stage, approval.created_at, approval.summary
                );
            }
        }
        Command::Approve {
            project_id,
            approval_id,
        } => {
            orchestrator.approve(&project_id, &approval_id).await?;
            println!("approved {approval_id}");
        }
        Command::Reject {
            project_id,
            approval_id,
            notes,
        } => {
            orchestrator.reject(&project_id, &approval_id, notes).await?;
            println!("rejected {approval_id}");
        }
        Command::Revise {
            project_id,
            approval_id,
            notes,
        } => {
            orchestrator.revise(&project_id, &approval_id, notes).await?;
            println!("revision requested for {approval_id}");
        }
        Command::Tasks {
            project_id,
            status,
            assignee,
        } => {
            let status = status
                .map(|s| {
                    serde_json::from_value::<TaskStatus>(serde_json::Value::String(s))
                        .context("unknown task status")
                })
                .transpose()?;
            let tasks = orchestrator
                .list_tasks(&project_id, status, assignee.as_deref())
                .await?;
            for task in tasks {
                println!(
                    "{} {} {:?} assignee={} priority={} retries={}",
                    task.id, task.kind, task.status, task.assignee, task.priority, task.retry_count
                );
            }
        }
        Command::Retry {
            project_id,
            task_id,
        } => {
            orchestrator.force_retry(&project_id, &task_id).await?;
            println!("task {task_id} re-enqueued");
        }
        Command::Abort { project_id, reason } => {
            orchestrator.abort(&project_id, &reason).await?;
            println!("abort requested for {project_id}");
        }
    }
    Ok(())
}

fn status_name(status: montage_types::ProjectStatus) -> anyhow::Result<String> {
    match serde_json::to_value(status)? {
        serde_json::Value::String(s) => Ok(s),
        other => anyhow::bail!("unexpected status encoding: {other}"),
    }
}

