//! ParallelChat - parallel research chat
//!
//! CLI entry point: serve the chat API, ask one question, run evals.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};
use colored::Colorize;
use eyre::{Context, Result, eyre};
use tracing::{debug, info};

use parallelchat::cli::{Cli, Command, generate_after_help, get_log_path};
use parallelchat::config::Config;
use parallelchat::eval::{EvalRunner, builtin_questions, load_questions};
use parallelchat::events::{EventEnvelope, TurnEvent, channel};
use parallelchat::llm::{Message, create_client};
use parallelchat::orchestrator::Orchestrator;
use parallelchat::prompts::{PromptLoader, embedded};
use parallelchat::server::{self, AppState};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    let log_dir = log_path.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Determine log level with priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Cli::command().after_help(generate_after_help());
    let cli = Cli::from_arg_matches(&cmd.get_matches())?;

    // Setup logging with priority: CLI > config > INFO default
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(provider = %config.llm.provider, model = %config.llm.model, "ParallelChat loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Serve { bind } => cmd_serve(&config, bind).await,
        Command::Ask { query, raw } => cmd_ask(&config, &query, raw).await,
        Command::Eval {
            questions,
            generate,
            output,
        } => cmd_eval(&config, questions, generate, output).await,
        Command::Prompts { name } => cmd_prompts(&config, name.as_deref()),
    }
}

fn prompt_loader(config: &Config) -> Result<Arc<PromptLoader>> {
    let loader = PromptLoader::new(config.orchestrator.expanded_prompts_dir());
    loader.verify().context("Prompt templates failed to render")?;
    Ok(Arc::new(loader))
}

fn build_orchestrator(config: &Config, prompts: Arc<PromptLoader>) -> Result<Arc<Orchestrator>> {
    config.validate()?;
    let llm = create_client(&config.llm).context("Failed to create LLM client")?;
    Ok(Arc::new(Orchestrator::new(llm, prompts, &config.orchestrator)))
}

/// Serve the chat API
async fn cmd_serve(config: &Config, bind: Option<String>) -> Result<()> {
    debug!(?bind, "cmd_serve: called");
    let orchestrator = build_orchestrator(config, prompt_loader(config)?)?;
    let addr = bind.unwrap_or_else(|| config.server.bind.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind {}", addr))?;
    println!("ParallelChat listening on http://{}", addr);

    server::serve(listener, AppState::new(orchestrator, &config.server)).await
}

/// Run one turn and print its events
async fn cmd_ask(config: &Config, query: &str, raw: bool) -> Result<()> {
    debug!(%query, raw, "cmd_ask: called");
    let orchestrator = build_orchestrator(config, prompt_loader(config)?)?;
    let (emitter, mut rx) = channel(config.server.event_buffer);

    let conversation = vec![Message::user(query)];
    let turn = tokio::spawn(async move { orchestrator.run_turn(conversation, &emitter).await });

    let mut streamed_final = false;
    while let Some(envelope) = rx.recv().await {
        if raw {
            println!("{}", envelope.to_json()?);
        } else {
            render(&envelope, &mut streamed_final);
        }
    }

    let summary = turn.await.context("Turn task panicked")??;
    match summary.error {
        Some(error) => Err(eyre!(error)),
        None => Ok(()),
    }
}

fn render(envelope: &EventEnvelope, streamed_final: &mut bool) {
    match &envelope.event {
        TurnEvent::ThinkingStart { content, .. } => println!("{}", content.dimmed()),
        TurnEvent::ThinkingEnd { content, metadata } => {
            println!("{}", content);
            for (i, subject) in metadata.task_subjects.iter().enumerate() {
                println!("  {} {}", format!("[{}]", i).cyan(), subject);
            }
        }
        TurnEvent::RebranchStart { content, metadata } => {
            println!("{} {}", format!("Round {}:", metadata.rebranch_iteration).yellow(), content);
            for path in &metadata.promising_paths {
                println!("  - {}", path);
            }
        }
        TurnEvent::RebranchEnd { content, .. } => println!("{}", content.yellow()),
        TurnEvent::StreamStart { metadata } => {
            let label = format!("[{}.{}] started", metadata.rebranch_iteration, metadata.task_index);
            println!("{} {}", label.cyan(), metadata.subject);
        }
        TurnEvent::ContentChunk { content, metadata } => {
            if metadata.is_final_response {
                if !*streamed_final {
                    println!();
                    *streamed_final = true;
                }
                print!("{}", content);
                let _ = std::io::stdout().flush();
            }
        }
        TurnEvent::StreamEnd { content, metadata } => {
            let label = format!("[{}.{}] done", metadata.rebranch_iteration, metadata.task_index);
            println!("{} {} ({} chars)", label.green(), metadata.subject, content.len());
        }
        TurnEvent::FinalResponse { content } => {
            if *streamed_final {
                println!();
            } else {
                println!("\n{}", content);
            }
        }
        TurnEvent::Metadata { metadata } => {
            println!("{}", format!("Complete: {} tasks", metadata.task_count).bold());
        }
        TurnEvent::Error { content, .. } => eprintln!("{}", content.red()),
    }
}

/// Run the evaluation harness
async fn cmd_eval(
    config: &Config,
    questions: Option<PathBuf>,
    generate: Option<usize>,
    output: Option<PathBuf>,
) -> Result<()> {
    debug!(?questions, ?generate, ?output, "cmd_eval: called");
    let prompts = prompt_loader(config)?;
    let orchestrator = build_orchestrator(config, prompts.clone())?;
    let runner = EvalRunner::new(
        orchestrator,
        prompts,
        config.orchestrator.synthesis_timeout(),
        config.orchestrator.control_max_tokens,
    );

    let questions = match (questions, generate) {
        (Some(path), _) => load_questions(&path)?,
        (None, Some(0)) => return Err(eyre!("--generate needs at least one question")),
        (None, Some(count)) => {
            println!("Generating {} questions...", count);
            runner.generate_questions(count).await?
        }
        (None, None) => builtin_questions(),
    };

    println!("Evaluating {} questions...", questions.len());
    let session = runner.run(&questions).await;
    let json = serde_json::to_string_pretty(&session)?;

    if let Some(path) = output {
        fs::write(&path, &json).context(format!("Failed to write {}", path.display()))?;
        println!("Results written to {}", path.display());
    }

    let s = &session.summary;
    println!("Questions: {}", s.total_questions);
    println!("Better:    A={}  B={}  tie={}", s.model_a_better_count, s.model_b_better_count, s.tie_count);
    println!("Faster:    A={}  B={}", s.model_a_faster_count, s.model_b_faster_count);
    println!("Latency:   A={:.0}ms  B={:.0}ms", s.average_latency_a, s.average_latency_b);
    Ok(())
}

/// Print prompt templates
fn cmd_prompts(config: &Config, name: Option<&str>) -> Result<()> {
    debug!(?name, "cmd_prompts: called");
    let loader = PromptLoader::new(config.orchestrator.expanded_prompts_dir());
    match name {
        Some(name) => print!("{}", loader.load_template(name)?),
        None => {
            for name in embedded::NAMES {
                println!("{}", format!("=== {} ===", name).bold());
                println!("{}", loader.load_template(name)?);
            }
        }
    }
    Ok(())
}
