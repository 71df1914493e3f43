use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use std::{fs, io::Read};

use anyhow::Context;
use clap::{Parser, Subcommand};
use crucible_core::{
    ActiveRunRegistry, AppConfig, ConfigStore, EventBus, JsonFileRepository, Repository,
};
use crucible_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, read_trace_log,
    render_trace_event, EngineEvent, LogStream, TraceLog,
};
use crucible_orchestrator::{
    AgentLoopFactory, ArenaTaskExecutor, Assessor, BanditSelector, DirectiveRunner,
    EvolutionEngine, ExperimentStatus, HeuristicAssessor, LlmAssessor, ModelSelector,
};
use crucible_providers::{CompletionClient, ProviderRegistry, RetryPolicy};
use crucible_runtime::IsolationArena;
use crucible_tools::{SafeCodeInterpreter, ToolContext, ToolRegistry};
use crucible_types::{DirectiveSpec, JobRecord, Role, Task};
use tracing::{info, warn};
use uuid::Uuid;

const SUPPORTED_PROVIDER_IDS: [&str; 6] =
    ["ollama", "openai", "openrouter", "groq", "mistral", "together"];

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "crucible-engine")]
#[command(about = "Task orchestration and evolution engine")]
struct Cli {
    #[arg(long, global = true, env = "CRUCIBLE_STATE_DIR")]
    state_dir: Option<String>,
    #[arg(long, global = true)]
    config: Option<String>,
    #[arg(long, global = true)]
    api_key: Option<String>,
    #[arg(long, global = true)]
    provider: Option<String>,
    #[arg(long, global = true)]
    model: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Runs a directive file (JSON or YAML) to completion.
    Run {
        #[arg(long)]
        directive: String,
        #[arg(long, default_value_t = 6)]
        max_turns: usize,
        #[arg(long, default_value_t = false)]
        keep_workspaces: bool,
    },
    /// Races a baseline and a challenger variant of a role.
    Evolve {
        #[arg(long)]
        role: String,
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "general")]
        domain: String,
        /// Creates or replaces the role with this system prompt first.
        #[arg(long)]
        system_prompt: Option<String>,
        #[arg(long)]
        judge_model: Option<String>,
    },
    /// Pretty-prints a trace log.
    Replay {
        path: PathBuf,
        /// Only events whose type starts with this prefix, e.g. `task.`.
        #[arg(long)]
        filter: Option<String>,
    },
    /// Runs tool-call source against the built-in tools in the current directory.
    Tool {
        #[arg(long)]
        source: String,
    },
    /// Lists the models the configured providers offer.
    Models {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn log_stream(command: &Command) -> LogStream {
    match command {
        Command::Run { .. } => LogStream::Run,
        Command::Evolve { .. } => LogStream::Evolve,
        Command::Replay { .. } => LogStream::Replay,
        Command::Tool { .. } => LogStream::Tool,
        Command::Models { .. } => LogStream::Models,
    }
}

struct Runtime {
    config: AppConfig,
    state_dir: PathBuf,
    events: EventBus,
    providers: ProviderRegistry,
    client: CompletionClient,
    tools: ToolRegistry,
    runs: ActiveRunRegistry,
    bandit: Arc<BanditSelector>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);
    let logs_dir = canonical_logs_dir_from_root(&state_dir);
    let stream = log_stream(&cli.command);
    let (_log_guard, log_info) = init_process_logging(stream, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::DEBUG,
        EngineEvent {
            event: "logging.initialized",
            component: "engine.main",
            status: Some("ok"),
            detail: Some(stream.as_str()),
            ..Default::default()
        },
    );
    if log_info.pruned_files > 0 {
        info!(
            pruned = log_info.pruned_files,
            retention_days = log_info.retention_days,
            "pruned expired {} logs",
            stream.as_str()
        );
    }

    match cli.command {
        Command::Run {
            directive,
            max_turns,
            keep_workspaces,
        } => {
            let overrides = build_cli_overrides(cli.api_key, cli.provider, cli.model)?;
            let runtime =
                build_runtime(&state_dir, overrides, cli.config.map(PathBuf::from)).await?;
            let mut spec = read_directive(&directive)?;
            let directive_id = spec
                .id
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone();
            let runner = build_directive_runner(&runtime, max_turns, keep_workspaces).await?;

            let work = runner.run(spec);
            tokio::pin!(work);
            let result = tokio::select! {
                result = &mut work => result?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("interrupt received, cancelling directive {}", directive_id);
                    runner.cancel(&directive_id).await;
                    work.await?
                }
            };
            for arm in runner.bandit().snapshot() {
                info!(
                    "bandit arm {} pulls={} mean={:.3}",
                    arm.id,
                    arm.pulls,
                    arm.mean().unwrap_or(0.0)
                );
            }
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.succeeded() {
                let reason = result
                    .failure
                    .map(|f| format!("task `{}` failed: {}", f.task_id, f.error))
                    .unwrap_or_else(|| "directive failed".to_string());
                anyhow::bail!(reason);
            }
        }
        Command::Evolve {
            role,
            prompt,
            domain,
            system_prompt,
            judge_model,
        } => {
            let model = cli.model.clone();
            let overrides = build_cli_overrides(cli.api_key, cli.provider, cli.model)?;
            let runtime =
                build_runtime(&state_dir, overrides, cli.config.map(PathBuf::from)).await?;
            let roles = Arc::new(
                JsonFileRepository::<Role>::open(records_dir(&runtime.state_dir)).await?,
            );
            if let Some(system_prompt) = system_prompt {
                roles.save(Role::new(role.clone(), system_prompt)).await?;
            }
            let requirements = roles
                .find(&role)
                .await?
                .map(|r| r.requirements)
                .unwrap_or_default();
            let model_id = match model {
                Some(model) => model,
                None => {
                    let catalog = runtime.providers.models().await;
                    ModelSelector::new(catalog, runtime.config.selector.clone())
                        .resolve(&requirements, &[], &[])
                        .context("no model available for evolution")?
                }
            };
            info!("evolving role {} on model {}", role, model_id);

            let assessor: Arc<dyn Assessor> = match judge_model {
                Some(judge) => Arc::new(LlmAssessor::new(runtime.client.clone(), judge)),
                None => Arc::new(HeuristicAssessor),
            };
            let factory = AgentLoopFactory::new(runtime.client.clone(), model_id)
                .with_events(runtime.events.clone());
            let engine = EvolutionEngine::new(
                build_arena(&runtime)?,
                Arc::new(factory),
                assessor,
                roles,
                runtime.bandit.clone(),
                runtime.events.clone(),
                runtime.runs.clone(),
            );
            let experiment_id = engine.evolve(&role, &prompt, &domain).await?;
            let experiment = engine
                .get_experiment(&experiment_id)
                .await
                .with_context(|| format!("experiment `{experiment_id}` vanished"))?;
            println!("{}", serde_json::to_string_pretty(&experiment)?);
            if experiment.status == ExperimentStatus::Failed {
                anyhow::bail!(experiment
                    .error
                    .unwrap_or_else(|| "experiment failed".to_string()));
            }
        }
        Command::Replay { path, filter } => {
            let events = read_trace_log(&path)
                .with_context(|| format!("reading trace log {}", path.display()))?;
            for event in events
                .iter()
                .filter(|e| filter.as_deref().map_or(true, |p| e.event_type.starts_with(p)))
            {
                println!("{}", render_trace_event(event));
            }
        }
        Command::Tool { source } => {
            let source = read_input(&source)?;
            let interpreter = SafeCodeInterpreter::new(ToolRegistry::with_builtin_tools());
            let ctx = ToolContext::new(std::env::current_dir()?);
            let outcomes = interpreter.extract_and_run(&source, &ctx).await?;
            if outcomes.is_empty() {
                warn!("no tool calls found in source");
            }
            println!("{}", serde_json::to_string_pretty(&outcomes)?);
        }
        Command::Models { json } => {
            let overrides = build_cli_overrides(cli.api_key, cli.provider, cli.model)?;
            let runtime =
                build_runtime(&state_dir, overrides, cli.config.map(PathBuf::from)).await?;
            let models = runtime.providers.models().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&models)?);
            } else {
                for model in models {
                    println!(
                        "{:<40} {:<12} {:<12} ctx={:<8} cost/1k={}",
                        model.id,
                        model.provider_id,
                        model.group_id.as_deref().unwrap_or("-"),
                        model.context_window,
                        model.cost_per_1k
                    );
                }
            }
        }
    }

    Ok(())
}

fn build_cli_overrides(
    api_key: Option<String>,
    provider: Option<String>,
    model: Option<String>,
) -> anyhow::Result<Option<serde_json::Value>> {
    let provider = normalize_and_validate_provider(provider)?;

    if api_key.is_none() && provider.is_none() && model.is_none() {
        return Ok(None);
    }
    let mut root = serde_json::Map::new();

    if let Some(p) = &provider {
        root.insert(
            "default_provider".to_string(),
            serde_json::Value::String(p.clone()),
        );
    }

    // api_key/model land on the chosen provider, or openai when none is given
    let target_provider = provider.as_deref().unwrap_or("openai");

    if api_key.is_some() || model.is_some() {
        let mut provider_config = serde_json::Map::new();
        if let Some(k) = api_key {
            provider_config.insert("api_key".to_string(), serde_json::Value::String(k));
        }
        if let Some(m) = model {
            provider_config.insert("default_model".to_string(), serde_json::Value::String(m));
        }

        let mut providers = serde_json::Map::new();
        providers.insert(
            target_provider.to_string(),
            serde_json::Value::Object(provider_config),
        );
        root.insert(
            "providers".to_string(),
            serde_json::Value::Object(providers),
        );
    }

    Ok(Some(serde_json::Value::Object(root)))
}

fn normalize_and_validate_provider(provider: Option<String>) -> anyhow::Result<Option<String>> {
    let Some(provider) = provider else {
        return Ok(None);
    };
    let normalized = provider.trim().to_lowercase();
    if normalized.is_empty() {
        anyhow::bail!(
            "provider cannot be empty. supported providers: {}",
            SUPPORTED_PROVIDER_IDS.join(", ")
        );
    }
    if SUPPORTED_PROVIDER_IDS.contains(&normalized.as_str()) {
        return Ok(Some(normalized));
    }
    anyhow::bail!(
        "unsupported provider `{}`. supported providers: {}",
        provider,
        SUPPORTED_PROVIDER_IDS.join(", ")
    );
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("crucible"))
        .unwrap_or_else(|| PathBuf::from(".crucible"))
}

fn records_dir(state_dir: &Path) -> PathBuf {
    state_dir.join("records")
}

/// `-` reads stdin, `@path` reads a file, anything else is taken literally.
fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return fs::read_to_string(path).with_context(|| format!("reading {path}"));
    }
    Ok(input.to_string())
}

fn read_directive(path: &str) -> anyhow::Result<DirectiveSpec> {
    let raw = if path.trim() == "-" {
        read_input(path)?
    } else {
        fs::read_to_string(path).with_context(|| format!("reading directive {path}"))?
    };
    parse_directive(&raw, Path::new(path))
}

fn parse_directive(raw: &str, path: &Path) -> anyhow::Result<DirectiveSpec> {
    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let spec: DirectiveSpec = if is_json {
        serde_json::from_str(raw).context("invalid directive json")?
    } else {
        // YAML also accepts JSON documents, which covers stdin
        serde_yaml::from_str(raw).context("invalid directive yaml")?
    };
    if spec.objective.trim().is_empty() && spec.tasks.is_empty() {
        anyhow::bail!("directive needs an objective or at least one task");
    }
    Ok(spec)
}

async fn build_runtime(
    state_dir: &Path,
    cli_overrides: Option<serde_json::Value>,
    override_config_path: Option<PathBuf>,
) -> anyhow::Result<Runtime> {
    let startup = Instant::now();
    let phase_start = Instant::now();
    let config_path = override_config_path.unwrap_or_else(|| state_dir.join("config.json"));
    let store = ConfigStore::new(&config_path, cli_overrides).await?;
    let config = store.get().await;
    info!(
        "engine.startup.phase config_init elapsed_ms={} config_path={}",
        phase_start.elapsed().as_millis(),
        config_path.display()
    );

    let phase_start = Instant::now();
    let trace_path = config
        .trace_log
        .clone()
        .unwrap_or_else(|| state_dir.join("trace.jsonl"));
    let trace_log = TraceLog::open(&trace_path)
        .with_context(|| format!("opening trace log {}", trace_path.display()))?;
    let events = EventBus::with_trace_log(Arc::new(trace_log));
    let providers = ProviderRegistry::new(&config);
    let client = CompletionClient::new(
        Arc::new(providers.clone()),
        RetryPolicy::from(&config.retry),
    );
    let bandit = Arc::new(BanditSelector::new(config.bandit.clone()));
    info!(
        "engine.startup.phase registry_init elapsed_ms={} trace_log={}",
        phase_start.elapsed().as_millis(),
        trace_path.display()
    );
    for provider in providers.list().await {
        info!("provider available: {} ({})", provider.id, provider.name);
    }
    info!(
        "engine.startup.phase runtime_build_complete elapsed_ms={}",
        startup.elapsed().as_millis()
    );

    Ok(Runtime {
        config,
        state_dir: state_dir.to_path_buf(),
        events,
        providers,
        client,
        tools: ToolRegistry::with_builtin_tools(),
        runs: ActiveRunRegistry::new(),
        bandit,
    })
}

fn build_arena(runtime: &Runtime) -> anyhow::Result<Arc<IsolationArena>> {
    let arena = IsolationArena::from_config(
        &runtime.config.arena,
        &runtime.state_dir,
        runtime.tools.clone(),
    )
    .context("building isolation arena")?;
    info!(
        "isolation arena ready: root={} backend={}",
        arena.root().display(),
        arena.backend_name()
    );
    Ok(Arc::new(arena))
}

async fn build_directive_runner(
    runtime: &Runtime,
    max_turns: usize,
    keep_workspaces: bool,
) -> anyhow::Result<DirectiveRunner> {
    let records = records_dir(&runtime.state_dir);
    let roles = Arc::new(JsonFileRepository::<Role>::open(&records).await?);
    let tasks = Arc::new(JsonFileRepository::<Task>::open(&records).await?);
    let jobs = Arc::new(JsonFileRepository::<JobRecord>::open(&records).await?);

    let executor = ArenaTaskExecutor::new(build_arena(runtime)?, runtime.client.clone(), roles)
        .with_events(runtime.events.clone())
        .with_max_turns(max_turns)
        .keep_workspaces(keep_workspaces);
    let selector = ModelSelector::new(
        runtime.providers.models().await,
        runtime.config.selector.clone(),
    );

    Ok(DirectiveRunner::new(
        runtime.events.clone(),
        Arc::new(executor),
        Arc::new(selector),
        runtime.bandit.clone(),
        runtime.runs.clone(),
    )
    .with_limits(&runtime.config.orchestrator)
    .with_task_repository(tasks)
    .with_job_repository(jobs))
}
