use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use switchyard_core::config::{self, Config};
use switchyard_core::health::persist::{load_snapshot, spawn_persistence, SnapshotWriter};
use switchyard_core::provider::openai_compat::OpenAiCompatBackend;
use switchyard_core::types::{CompletionRequest, Message, StreamEvent};
use switchyard_core::{
    normalize, BackendPool, EquivalenceResolver, EventBus, HealthTracker, ModelRef, ModelRegistry, NormalizeOptions,
    ReasoningEffort, ResilienceEvent, StaticRegistry, StreamOrchestrator, StreamRequest,
};

#[derive(Parser)]
#[command(
    name = "switchyard",
    about = "Multi-backend request resilience layer",
    version = switchyard_core::VERSION,
)]
struct Cli {
    /// Model registry file (JSON array of model descriptors)
    #[arg(long, global = true)]
    models: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and state locations
    Status,
    /// Inspect or reset circuit breakers
    Health {
        #[command(subcommand)]
        command: HealthCommands,
    },
    /// Show the capability tier of a model and its first fallback
    Tier {
        /// Model reference, e.g. anthropic/claude-opus-4-5
        model: ModelRef,
    },
    /// Print the request a backend would receive
    Normalize {
        /// Request JSON file
        #[arg(long)]
        request: PathBuf,
        #[arg(long)]
        model: ModelRef,
        #[arg(long)]
        effort: Option<ReasoningEffort>,
        /// Treat as a background small-model call
        #[arg(long)]
        small: bool,
    },
    /// Stream a completion through the resilience layer
    Stream {
        #[arg(short, long)]
        model: ModelRef,
        #[arg(short, long, default_value = "cli:default")]
        session: String,
        message: Vec<String>,
    },
}

#[derive(Subcommand)]
enum HealthCommands {
    /// Show persisted breaker state
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Close one circuit, or all of them
    Reset { backend: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config_from_env();

    match cli.command {
        Commands::Status => cmd_status(&cfg, cli.models.as_deref()).await?,
        Commands::Health { command } => match command {
            HealthCommands::Show { json } => cmd_health_show(&cfg, json).await?,
            HealthCommands::Reset { backend } => cmd_health_reset(&cfg, backend).await?,
        },
        Commands::Tier { model } => cmd_tier(&cfg, cli.models.as_deref(), model).await?,
        Commands::Normalize {
            request,
            model,
            effort,
            small,
        } => cmd_normalize(&cfg, cli.models.as_deref(), &request, model, effort, small).await?,
        Commands::Stream {
            model,
            session,
            message,
        } => cmd_stream(&cfg, cli.models.as_deref(), model, session, message.join(" ")).await?,
    }

    Ok(())
}

// ====== Helpers ======

fn default_models_path() -> PathBuf {
    config::get_data_dir().join("models.json")
}

/// Registry from `--models`, else `~/.switchyard/models.json` when present.
fn load_registry(path: Option<&Path>) -> Result<StaticRegistry> {
    match path {
        Some(p) => StaticRegistry::from_file(p).with_context(|| format!("loading {}", p.display())),
        None => {
            let p = default_models_path();
            if p.exists() {
                StaticRegistry::from_file(&p).with_context(|| format!("loading {}", p.display()))
            } else {
                Ok(StaticRegistry::new())
            }
        }
    }
}

async fn load_tracker(cfg: &Config) -> Arc<HealthTracker> {
    let tracker = Arc::new(HealthTracker::new(cfg.resilience.clone()));
    load_snapshot(&tracker, &cfg.health_snapshot_path()).await;
    tracker
}

// ====== Commands ======

async fn cmd_status(cfg: &Config, models: Option<&Path>) -> Result<()> {
    let config_path = config::get_config_path();
    let registry = load_registry(models)?;

    println!("switchyard {}\n", switchyard_core::VERSION);
    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() { "✓" } else { "✗" }
    );
    let snapshot = cfg.health_snapshot_path();
    println!(
        "Breaker snapshot: {} {}",
        snapshot.display(),
        if snapshot.exists() { "✓" } else { "✗" }
    );

    let r = &cfg.resilience;
    println!("Fallback: {}", if r.enabled { "enabled" } else { "disabled" });
    println!("Max attempts: {}", r.max_attempts);
    println!(
        "Breaker: open after {} failures, close after {} successes, cooldown {}ms",
        r.failure_threshold, r.success_threshold, r.cooldown_ms
    );
    if !r.preferred_backends.is_empty() {
        println!("Preferred backends: {}", r.preferred_backends.join(", "));
    }
    println!(
        "Tiers: {}",
        if cfg.tiers.is_empty() { "built-in" } else { "custom" }
    );

    let backends = registry.list().await;
    println!("Backends: {}", backends.len());
    for b in backends {
        println!("  {} ({} models)", b.id, b.models.len());
    }
    Ok(())
}

async fn cmd_health_show(cfg: &Config, json: bool) -> Result<()> {
    let tracker = load_tracker(cfg).await;
    let snapshot = tracker.snapshot().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }
    if snapshot.is_empty() {
        println!("All circuits closed.");
        return Ok(());
    }
    for (id, h) in snapshot {
        println!(
            "{:<20} {:<10} failures={} successes={} probes={}",
            id,
            h.state.to_string(),
            h.failures,
            h.successes,
            h.half_open_probes_in_flight
        );
        if let Some(err) = h.last_error {
            println!("{:<20} last error: {}", "", err);
        }
    }
    Ok(())
}

async fn cmd_health_reset(cfg: &Config, backend: Option<String>) -> Result<()> {
    let tracker = load_tracker(cfg).await;
    tracker.reset(backend.as_deref()).await;

    let mut writer = SnapshotWriter::new(tracker, cfg.health_snapshot_path());
    writer.flush().await;
    match backend {
        Some(id) => println!("✓ Reset circuit for {}", id),
        None => println!("✓ Reset all circuits"),
    }
    Ok(())
}

async fn cmd_tier(cfg: &Config, models: Option<&Path>, model: ModelRef) -> Result<()> {
    let registry: Arc<dyn ModelRegistry> = Arc::new(load_registry(models)?);
    let resolver = EquivalenceResolver::new(registry);
    if !cfg.tiers.is_empty() {
        resolver.configure(cfg.tiers.clone());
    }

    let Some(tier) = resolver.get_tier(&model) else {
        println!("{}: no tier", model);
        return Ok(());
    };
    println!("{}: {}", model, tier.name);

    let exclude = vec![model.backend_id.clone()];
    match resolver
        .find_fallback(&model, &exclude, &cfg.resilience.preferred_backends)
        .await
    {
        Some(fb) => println!("fallback: {}", fb),
        None => println!("fallback: none registered"),
    }
    Ok(())
}

async fn cmd_normalize(
    cfg: &Config,
    models: Option<&Path>,
    request: &Path,
    model: ModelRef,
    effort: Option<ReasoningEffort>,
    small: bool,
) -> Result<()> {
    let registry = load_registry(models)?;
    let descriptor = registry.get_model(&model.backend_id, &model.model_id).await?;
    let content = std::fs::read_to_string(request).with_context(|| format!("reading {}", request.display()))?;
    let req: CompletionRequest = serde_json::from_str(&content)?;

    let options = NormalizeOptions {
        session_id: "cli".to_string(),
        reasoning_effort: effort,
        small,
        output_token_max: cfg.output_token_max,
    };
    let normalized = normalize(&req, &descriptor, &options);
    println!("{}", serde_json::to_string_pretty(&normalized)?);
    Ok(())
}

async fn cmd_stream(
    cfg: &Config,
    models: Option<&Path>,
    model: ModelRef,
    session: String,
    message: String,
) -> Result<()> {
    if message.is_empty() {
        anyhow::bail!("no message given");
    }

    let registry = Arc::new(load_registry(models)?);
    let backends = BackendPool::new();
    for info in registry.list().await {
        match OpenAiCompatBackend::from_env(&info.id) {
            Ok(b) => backends.register(Arc::new(b)),
            Err(e) => tracing::warn!("Skipping backend {}: {}", info.id, e),
        }
    }

    let tracker = load_tracker(cfg).await;
    let shutdown = CancellationToken::new();
    let persistence = spawn_persistence(
        tracker.clone(),
        cfg.health_snapshot_path(),
        Duration::from_millis(cfg.resilience.persist_interval_ms),
        shutdown.clone(),
    );

    let bus = EventBus::default();
    let orchestrator = StreamOrchestrator::new(registry, backends, tracker, bus.clone(), cfg.resilience.clone());
    if !cfg.tiers.is_empty() {
        orchestrator.resolver().configure(cfg.tiers.clone());
    }

    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                ResilienceEvent::FallbackUsed(e) => eprintln!(
                    "\n[switched {}/{} -> {}/{}: {}]",
                    e.original_backend, e.original_model, e.fallback_backend, e.fallback_model, e.reason
                ),
                ResilienceEvent::FallbackExhausted(e) => {
                    eprintln!("\n[all attempts failed: {}]", e.attempted.join(", "))
                }
            }
        }
    });

    let mut req = StreamRequest::new(
        session,
        model,
        CompletionRequest {
            messages: vec![Message::user(message)],
            ..Default::default()
        },
    );
    req.options.output_token_max = cfg.output_token_max;
    let cancel = req.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = async {
        let mut stream = orchestrator.stream(req).await?;
        let mut out = std::io::stdout();
        while let Some(ev) = stream.next().await {
            match ev? {
                StreamEvent::TextDelta { text } => {
                    print!("{}", text);
                    out.flush()?;
                }
                StreamEvent::ToolCall { name, input, .. } => println!("\n[tool call {} {}]", name, input),
                StreamEvent::Finish { usage, .. } => {
                    println!();
                    tracing::debug!("Usage: {:?}", usage);
                }
                StreamEvent::ReasoningDelta { .. } => {}
            }
        }
        tracing::debug!("Attempts: {}", stream.attempt_trail().join(" -> "));
        anyhow::Ok(())
    }
    .await;

    shutdown.cancel();
    let _ = persistence.await;
    result
}
