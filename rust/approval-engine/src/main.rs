//! approvalctl - command line access to the approval engine
//!
//! Operates on the `SQLite` store named in configuration (or `--database`)
//! with workflow definitions from the configured catalog (or
//! `--definitions`).

use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;

use approval_engine::config::{ConfigValidator, StoreBackend};
use approval_engine::context::load_catalog;
use approval_engine::domain::{Actor, EntityKey};
use approval_engine::logging::init_tracing;
use approval_engine::{ActionResult, EngineConfig, EngineContext};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "approvalctl")]
#[command(about = "Approval workflow engine CLI")]
#[command(version)]
struct Cli {
    /// Config file path (without extension).
    #[arg(short, long, env = "APPROVAL_CONFIG")]
    config: Option<String>,

    /// SQLite database file, overriding configuration.
    #[arg(long, env = "APPROVAL_DATABASE")]
    database: Option<String>,

    /// Workflow definitions file, overriding configuration.
    #[arg(long, env = "APPROVAL_DEFINITIONS")]
    definitions: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a workflow to an entity.
    Create {
        #[command(flatten)]
        entity: EntityArgs,
        /// Owner of the entity; barred from approving it.
        #[arg(long)]
        owner: String,
        /// Workflow definition name.
        #[arg(long)]
        workflow: String,
    },
    /// Approve a step.
    Approve {
        #[command(flatten)]
        entity: EntityArgs,
        #[command(flatten)]
        actor: ActorArgs,
        /// Step index (0-based).
        #[arg(long)]
        step: usize,
        /// Comment stored with the approval.
        #[arg(long, default_value = "")]
        comment: String,
    },
    /// Reject a step.
    Reject {
        #[command(flatten)]
        entity: EntityArgs,
        #[command(flatten)]
        actor: ActorArgs,
        /// Step index (0-based).
        #[arg(long)]
        step: usize,
        /// Reason for the rejection.
        #[arg(long)]
        reason: String,
    },
    /// Show the workflow attached to an entity.
    Status {
        #[command(flatten)]
        entity: EntityArgs,
    },
    /// Ping the store and report pool health.
    Health,
}

#[derive(Args, Debug)]
struct EntityArgs {
    /// Entity type (e.g. invoice).
    #[arg(long = "type")]
    entity_type: String,
    /// Entity identifier.
    #[arg(long = "id")]
    entity_id: String,
}

impl EntityArgs {
    fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.entity_id)
    }
}

#[derive(Args, Debug)]
struct ActorArgs {
    /// Acting user id.
    #[arg(long)]
    actor: String,
    /// Roles held by the actor.
    #[arg(long = "role")]
    roles: Vec<String>,
    /// The actor completed multi-factor verification.
    #[arg(long)]
    mfa: bool,
}

impl ActorArgs {
    fn actor(&self) -> Actor {
        let actor = self
            .roles
            .iter()
            .fold(Actor::new(&self.actor), |actor, role| actor.with_role(role));
        if self.mfa { actor.with_mfa() } else { actor }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = EngineConfig::load_from(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.store.backend = StoreBackend::Sqlite;
        config.store.sqlite_path = Some(database);
    }
    if let Some(definitions) = cli.definitions {
        config.catalog.definitions_path = Some(definitions);
    }
    config.logging.json |= cli.json_logs;
    init_tracing(&config.logging);

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;
    if config.store.backend != StoreBackend::Sqlite {
        anyhow::bail!("approvalctl needs the sqlite store; pass --database or set store.backend");
    }

    let catalog = load_catalog(&config)?;
    let context = EngineContext::sqlite(config, catalog).await?;
    let engine = context.engine();

    let output = match cli.command {
        Command::Create {
            entity,
            owner,
            workflow,
        } => {
            let instance = engine
                .create_workflow(&entity.key(), &owner, &workflow)
                .await?;
            serde_json::to_string_pretty(&instance)?
        }
        Command::Approve {
            entity,
            actor,
            step,
            comment,
        } => {
            let result = engine
                .approve(&entity.key(), &actor.actor(), step, &comment)
                .await;
            serde_json::to_string_pretty(&ActionResult::from_result(result))?
        }
        Command::Reject {
            entity,
            actor,
            step,
            reason,
        } => {
            let result = engine
                .reject(&entity.key(), &actor.actor(), step, &reason)
                .await;
            serde_json::to_string_pretty(&ActionResult::from_result(result))?
        }
        Command::Status { entity } => {
            let instance = engine.get_instance(&entity.key()).await?;
            serde_json::to_string_pretty(&instance)?
        }
        Command::Health => serde_json::to_string_pretty(&context.health().await)?,
    };

    println!("{output}");
    Ok(())
}
