//! # Traq CLI (`traq`)
//!
//! The `traq` binary drives the project-attribution engine: projects,
//! rules, manual assignment, suggestions, backfill and embedding upkeep.
//!
//! ## Usage
//!
//! ```bash
//! traq --config ./config/traq.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `traq init` | Create the SQLite database and run schema migrations |
//! | `traq project add\|list\|update\|delete\|discover` | Manage projects |
//! | `traq rule add\|update\|preview\|list\|delete\|apply` | Manage matching rules |
//! | `traq event add` | Record an activity event |
//! | `traq assign <type> <id> <project>` | Assign an event by hand (and learn from it) |
//! | `traq suggest` | Suggest a project for an event or a set of fields |
//! | `traq backfill <start> <end>` | Suggest (or `--commit`) projects for history |
//! | `traq embed regenerate` | Embed events that have no embedding yet |
//!
//! ## Examples
//!
//! ```bash
//! traq init
//! traq project add Traq --color "#22c55e"
//! traq event add --type focus --app Code --title "main.go - traq" --repo ~/src/traq
//! traq assign focus 1 1
//! traq suggest --app Code --title "app.go - traq"
//! traq backfill 2024-03-01 2024-03-31 --commit
//! ```
//!
//! Logs go to stderr (`RUST_LOG` or `--verbose`); results go to stdout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use traq_attribution::commands::{self, EventFields, RuleFields, SuggestTarget};
use traq_attribution::progress::ProgressMode;
use traq_attribution::{backfill, config, embed_cmd, migrate};

/// Traq: attribute tracked activity to projects with learned rules,
/// keyword detection and embedding similarity.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/traq.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "traq",
    about = "Traq: project attribution for tracked activity",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/traq.toml`. Only `[db]` is required.
    #[arg(long, global = true, default_value = "./config/traq.toml")]
    config: PathBuf,

    /// Log debug output from the engine to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all tables. Idempotent.
    Init,

    /// Manage projects.
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },

    /// Manage matching rules.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Record activity events.
    Event {
        #[command(subcommand)]
        action: EventAction,
    },

    /// Assign an event to a project by hand.
    ///
    /// The engine learns rules from the event's context. Project `0`
    /// clears the assignment without learning.
    Assign {
        /// Event type: focus (or activity), git, browser, screenshot.
        event_type: String,
        event_id: i64,
        project_id: i64,
    },

    /// Suggest a project for a stored event or for the given fields.
    ///
    /// Rules are tried first; embedding similarity is used when no rule
    /// clears the threshold.
    Suggest {
        /// Classify a stored event: `<type>:<id>` (e.g. `focus:12`).
        #[arg(long, value_parser = parse_event_ref, conflicts_with_all = ["app", "title", "url", "domain", "repo", "branch", "file"])]
        event: Option<(String, i64)>,

        #[command(flatten)]
        fields: EventFields,

        /// Minimum confidence (defaults to `[assignment].min_confidence`).
        #[arg(long)]
        min_confidence: Option<f64>,
    },

    /// Apply rules and keyword detection to unassigned history.
    ///
    /// Dates are local `YYYY-MM-DD`, both inclusive. Without `--commit`
    /// nothing is written.
    Backfill {
        start: String,
        end: String,

        /// Write the assignments instead of previewing them.
        #[arg(long)]
        commit: bool,

        /// Minimum rule confidence (defaults to `[assignment].min_confidence`).
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Progress on stderr: off, human or json. Defaults to human on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Manage event embeddings.
    Embed {
        #[command(subcommand)]
        action: EmbedAction,
    },
}

#[derive(Subcommand)]
enum ProjectAction {
    /// Create a project.
    Add {
        name: String,
        /// Hex color (defaults to `#6366f1`).
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// List projects by name.
    List,
    /// Change a project's name, color or description.
    Update {
        id: i64,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Delete a project, its rules and examples, and unassign its events.
    Delete { id: i64 },
    /// Create projects for keywords found in git history.
    Discover {
        /// Only consider commits on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Create a rule for a project.
    Add {
        #[arg(long)]
        project: i64,
        #[command(flatten)]
        fields: RuleFields,
    },
    /// Change a rule; unset fields keep their value.
    Update {
        id: i64,
        #[arg(long)]
        project: Option<i64>,
        #[command(flatten)]
        fields: RuleFields,
    },
    /// Count historical events a rule would match, without saving it.
    Preview {
        #[command(flatten)]
        fields: RuleFields,
    },
    /// List a project's rules.
    List {
        #[arg(long)]
        project: i64,
    },
    /// Delete a rule.
    Delete { id: i64 },
    /// Assign every unassigned historical match of a rule to its project.
    Apply { id: i64 },
}

#[derive(Subcommand)]
enum EventAction {
    /// Insert an event (as a capture process would).
    Add {
        /// Event type: focus (or activity), git, browser, screenshot.
        #[arg(long = "type", default_value = "focus")]
        event_type: String,
        /// Unix seconds (defaults to now).
        #[arg(long)]
        timestamp: Option<i64>,
        #[command(flatten)]
        fields: EventFields,
    },
}

#[derive(Subcommand)]
enum EmbedAction {
    /// Embed every event that has no stored embedding.
    Regenerate {
        /// Only events on or after this date (YYYY-MM-DD).
        #[arg(long)]
        since: Option<String>,
        /// Events per batch (defaults to `[backfill].batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },
}

/// Parse `<type>:<id>` for `--event`.
fn parse_event_ref(s: &str) -> Result<(String, i64), String> {
    let (kind, id) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid event reference '{}': expected <type>:<id>", s))?;
    let id = id
        .parse::<i64>()
        .map_err(|_| format!("invalid event id in '{}'", s))?;
    Ok((kind.to_string(), id))
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "traq_attribution=debug,traq_attribution_core=debug"
    } else {
        "traq_attribution=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Token cancelled on Ctrl-C so batch jobs stop between batches.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping after the current batch");
            on_signal.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Project { action } => match action {
            ProjectAction::Add {
                name,
                color,
                description,
            } => {
                commands::run_project_add(&cfg, &name, color.as_deref(), description.as_deref()).await?;
            }
            ProjectAction::List => {
                commands::run_project_list(&cfg).await?;
            }
            ProjectAction::Update {
                id,
                name,
                color,
                description,
            } => {
                commands::run_project_update(
                    &cfg,
                    id,
                    name.as_deref(),
                    color.as_deref(),
                    description.as_deref(),
                )
                .await?;
            }
            ProjectAction::Delete { id } => {
                commands::run_project_delete(&cfg, id).await?;
            }
            ProjectAction::Discover { since } => {
                commands::run_project_discover(&cfg, since.as_deref()).await?;
            }
        },
        Commands::Rule { action } => match action {
            RuleAction::Add { project, fields } => {
                commands::run_rule_add(&cfg, project, fields).await?;
            }
            RuleAction::Update {
                id,
                project,
                fields,
            } => {
                commands::run_rule_update(&cfg, id, project, fields).await?;
            }
            RuleAction::Preview { fields } => {
                commands::run_rule_preview(&cfg, fields).await?;
            }
            RuleAction::List { project } => {
                commands::run_rule_list(&cfg, project).await?;
            }
            RuleAction::Delete { id } => {
                commands::run_rule_delete(&cfg, id).await?;
            }
            RuleAction::Apply { id } => {
                commands::run_rule_apply(&cfg, id).await?;
            }
        },
        Commands::Event { action } => match action {
            EventAction::Add {
                event_type,
                timestamp,
                fields,
            } => {
                commands::run_event_add(&cfg, &event_type, timestamp, &fields).await?;
            }
        },
        Commands::Assign {
            event_type,
            event_id,
            project_id,
        } => {
            commands::run_assign(&cfg, &event_type, event_id, project_id).await?;
        }
        Commands::Suggest {
            event,
            fields,
            min_confidence,
        } => {
            let target = match event {
                Some((event_type, event_id)) => SuggestTarget::Stored {
                    event_type,
                    event_id,
                },
                None => SuggestTarget::Fields(fields),
            };
            commands::run_suggest(&cfg, target, min_confidence).await?;
        }
        Commands::Backfill {
            start,
            end,
            commit,
            min_confidence,
            progress,
        } => {
            let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let cancel = cancel_on_ctrl_c();
            backfill::run_backfill(&cfg, &start, &end, min_confidence, commit, progress, &cancel).await?;
        }
        Commands::Embed { action } => match action {
            EmbedAction::Regenerate {
                since,
                batch_size,
                progress,
            } => {
                let progress = progress.unwrap_or_else(ProgressMode::default_for_tty);
                let cancel = cancel_on_ctrl_c();
                embed_cmd::run_embed_regenerate(&cfg, since, batch_size, progress, &cancel).await?;
            }
        },
    }

    Ok(())
}
