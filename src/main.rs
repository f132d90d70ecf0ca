#![allow(missing_docs)]

//! Kokoro — conversational orchestration brain for corporate chat.
//!
//! Single binary: webhook server, Brain pipeline, and the scheduled-job
//! runner for announcements and retention.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use kokoro::announce::executor::ExecutorDeps;
use kokoro::announce::flow::AnnouncementFlow;
use kokoro::brain::decision::DecisionEngine;
use kokoro::brain::execution::ExecutionEngine;
use kokoro::brain::post::PostLayer;
use kokoro::brain::state::StateEngine;
use kokoro::brain::understanding::Understander;
use kokoro::brain::{Brain, BrainDeps};
use kokoro::capability::handlers::{build_registry, HandlerDeps};
use kokoro::capability::CapabilityRegistry;
use kokoro::chat::client::HttpChatClient;
use kokoro::config::Config;
use kokoro::jobs::JobRunner;
use kokoro::knowledge::SqliteKnowledge;
use kokoro::llm::client::HttpLlmClient;
use kokoro::server::{router, AppState};
use kokoro::store::admin::AdminConfigCache;
use kokoro::store::Db;
use kokoro::tracker::TaskTracker;

#[derive(Parser)]
#[command(name = "kokoro", about = "Conversational orchestration brain")]
struct Cli {
    /// Path to kokoro.toml.
    #[arg(long, default_value = "kokoro.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the webhook server and job runner.
    Start {
        /// Directory for rotated JSON logs.
        #[arg(long, default_value = "logs")]
        logs_dir: PathBuf,
    },
    /// Validate the configuration and exit.
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    match cli.command {
        Command::CheckConfig => {
            kokoro::logging::init_cli();
            config.validate()?;
            info!("configuration is valid");
            Ok(())
        }
        Command::Start { logs_dir } => {
            let _guard = kokoro::logging::init_production(&logs_dir)?;
            run(config).await
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "kokoro.db".to_owned());
    let llm_api_key = std::env::var("KOKORO_LLM_API_KEY").unwrap_or_default();
    let chat_api_token = std::env::var("KOKORO_CHAT_API_TOKEN").unwrap_or_default();
    let bot_account_id =
        std::env::var("KOKORO_BOT_ACCOUNT_ID").context("KOKORO_BOT_ACCOUNT_ID is required")?;

    let db = Arc::new(Db::open(&database_url).await?);
    let tracker = Arc::new(TaskTracker::new());

    let llm = Arc::new(HttpLlmClient::new(config.llm.clone(), llm_api_key));
    let chat = Arc::new(HttpChatClient::new(config.chat.clone(), chat_api_token));
    let knowledge = Arc::new(SqliteKnowledge::new(&db));
    let admin_cache = Arc::new(AdminConfigCache::new());

    let announce = Arc::new(AnnouncementFlow::new(
        llm.clone(),
        admin_cache.clone(),
        config.brain.room_match_threshold,
        config.brain.state_timeout_minutes,
    ));

    let registry = Arc::new(CapabilityRegistry::with_defaults());
    let handler_deps = HandlerDeps {
        db: db.clone(),
        chat_tasks: chat.clone(),
        knowledge: knowledge.clone(),
        llm: llm.clone(),
        announce: announce.clone(),
    };
    let handlers = Arc::new(build_registry(&handler_deps));
    registry
        .validate(&handlers)
        .map_err(|violation| anyhow::anyhow!("capability registry invalid: {violation}"))?;

    let brain = Arc::new(Brain::new(BrainDeps {
        db: db.clone(),
        understander: Understander::new(registry.clone(), llm.clone()),
        decision: DecisionEngine::new(
            registry.clone(),
            config.brain.confirmation_threshold,
            config.brain.amount_confirmation_threshold,
        ),
        execution: ExecutionEngine::new(
            registry.clone(),
            handlers.clone(),
            Duration::from_secs(config.brain.handler_deadline_secs),
        ),
        state: StateEngine::new(
            announce.clone(),
            registry.clone(),
            config.brain.state_timeout_minutes,
        ),
        post: PostLayer::new(db.clone(), chat.clone(), llm.clone(), tracker.clone()),
        config: config.brain.clone(),
        bot_account_id,
    }));

    // Job runner: announcements and retention.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = JobRunner::new(
        db.clone(),
        ExecutorDeps {
            messaging: chat.clone(),
            tasks: chat.clone(),
        },
        Duration::from_secs(config.jobs.tick_secs),
        Duration::from_secs(config.jobs.execution_deadline_secs),
    );
    let runner_handle = tokio::spawn(runner.run(shutdown_rx));

    let state = AppState {
        db: db.clone(),
        brain,
    };
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "kokoro listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // Drain in dependency order: stop scheduling, flush background work,
    // close the store.
    let _ = shutdown_tx.send(true);
    let _ = runner_handle.await;
    tracker.drain().await;
    if let Ok(db) = Arc::try_unwrap(db) {
        db.shutdown().await;
    }
    info!("kokoro stopped");
    Ok(())
}
