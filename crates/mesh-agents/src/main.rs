mod config;
mod debaters;
mod llm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use coordination::agents::AgentHost;
use coordination::config::MeshConfig;
use coordination::debate::{DebateOrchestrator, DebateSession, DebateStore, MemoryDebateStore};
use coordination::events::{EventBus, EventBusExt, EventFilter, EventKind};
use coordination::orchestrator::Orchestrator;
use coordination::rate_limit::HierarchicalRateLimiter;
use tracing::{info, warn};

use config::AgentsConfig;
use debaters::{debater_spec, judge_spec, Debater, Judge, ScriptedDebater, ScriptedJudge};
use llm::{LlmClient, LlmDebater, LlmJudge};

const JUDGE_ID: &str = "judge";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Mesh configuration file (TOML); also holds `[llm]` and `[[postures]]`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debate topic
    #[arg(long, default_value = "Should cities make public transit free?")]
    topic: String,

    /// Use scripted debaters even when an LLM endpoint is configured
    #[arg(long, default_value_t = false)]
    offline: bool,

    /// Questions per examiner in each cross-examination round (1 or 2)
    #[arg(long)]
    questions: Option<u32>,

    /// Ask a judge agent for a verdict after the last round
    #[arg(long, default_value_t = false)]
    judge: bool,

    /// Persist transcripts to PostgreSQL instead of memory
    #[cfg(feature = "postgres")]
    #[arg(long)]
    database_url: Option<String>,
}

async fn open_store(args: &Args) -> Result<Arc<dyn DebateStore>> {
    #[cfg(feature = "postgres")]
    if let Some(url) = &args.database_url {
        let store = coordination::debate::PgDebateStore::connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        store.migrate().await.context("Failed to create debate tables")?;
        info!("Persisting debates to PostgreSQL");
        return Ok(Arc::new(store));
    }
    let _ = args;
    Ok(Arc::new(MemoryDebateStore::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let mut mesh_config =
        MeshConfig::resolve(args.config.as_deref()).context("Failed to load mesh config")?;
    if let Some(questions) = args.questions {
        mesh_config.debate.questions_per_examiner = questions;
    }
    if args.judge {
        mesh_config.debate.judge_id = Some(JUDGE_ID.to_string());
    }
    mesh_config.validate().context("Invalid mesh config")?;
    let agents_config =
        AgentsConfig::load(args.config.as_deref()).context("Failed to load agents config")?;

    let bus = EventBus::with_history_capacity(mesh_config.events.history_capacity).shared();
    let limiter = Arc::new(HierarchicalRateLimiter::new(mesh_config.rate_limits));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&bus),
        limiter,
        mesh_config.orchestrator.clone(),
    ));
    let host = AgentHost::current(Arc::clone(&bus));

    let llm = match (&agents_config.llm, args.offline) {
        (Some(endpoint), false) => {
            info!(url = %endpoint.url, model = %endpoint.model, "Using LLM debaters");
            Some(Arc::new(
                LlmClient::new(endpoint.clone()).context("Failed to build HTTP client")?,
            ))
        }
        _ => {
            info!("Using scripted debaters");
            None
        }
    };

    for posture in &agents_config.postures {
        let debater: Arc<dyn Debater> = match &llm {
            Some(client) => Arc::new(LlmDebater::new(Arc::clone(client))),
            None => Arc::new(ScriptedDebater),
        };
        host.register_agent(debater_spec(&posture.debater_id, debater));
    }
    if let Some(judge_id) = &mesh_config.debate.judge_id {
        let judge: Arc<dyn Judge> = match &llm {
            Some(client) => Arc::new(LlmJudge::new(Arc::clone(client))),
            None => Arc::new(ScriptedJudge),
        };
        host.register_agent(judge_spec(judge_id, judge));
    }

    let mut progress = bus.subscribe_filtered(
        EventFilter::new().kinds(vec![EventKind::Broadcast, EventKind::Error]),
    );
    tokio::spawn(async move {
        while let Ok(event) = progress.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => info!(event = %line, "Mesh event"),
                Err(e) => warn!(error = %e, "Unserialisable event"),
            }
        }
    });

    let store = open_store(&args).await?;
    let debate = DebateOrchestrator::new(orchestrator, store, mesh_config.debate.clone());
    let session_id = uuid::Uuid::new_v4().to_string();
    let mut session = DebateSession::new(&session_id, &args.topic, agents_config.postures.clone());
    info!(session_id = %session_id, topic = %args.topic, "Debate starting");

    let outcome = debate.run(&mut session).await;
    let stats = bus.stats();
    info!(
        events = stats.total_events,
        history = stats.history_len,
        "Event bus totals"
    );

    match outcome {
        Ok(transcript) => {
            println!("{}", serde_json::to_string_pretty(&transcript)?);
            if let Some(verdict) = &session.verdict {
                println!("{}", serde_json::to_string_pretty(verdict)?);
            }
            println!("{}", transcript.summary_line());
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = &session.transcript {
                println!("{}", serde_json::to_string_pretty(partial)?);
                println!("{}", partial.summary_line());
            }
            Err(e).with_context(|| format!("Debate {} failed", session.status_line()))
        }
    }
}
