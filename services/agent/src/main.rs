mod config;
mod console;
mod prompt_loader;

use crate::config::Config;
use crate::console::Input;
use anyhow::{Context, Result};
use clap::Parser;
use interview_core::{
    Command, InterviewConfig, Orchestrator, OrchestratorOutcome, RedisStore, ScriptedStageHandler,
    Stage, StageMachine, StageStore,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(version, about = "Runs one staged interview on the console")]
struct Cli {
    /// Room the interview runs in
    room: String,
    /// Stage settings file; overrides INTERVIEW_SETTINGS
    #[arg(long)]
    settings: Option<PathBuf>,
    /// Directory of `<stage>.md` opening lines
    #[arg(long, default_value = "prompts")]
    prompts: PathBuf,
}

type Handlers = Arc<HashMap<Stage, Arc<ScriptedStageHandler>>>;

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let args = Cli::parse();
    let settings_path = args.settings.unwrap_or(config.settings_path.clone());
    let interview_config = Arc::new(InterviewConfig::load_or_default(&settings_path));
    tracing::info!("Configuration loaded. Starting interview in room {}", args.room);

    // --- 3. Load Prompts ---
    let openings = prompt_loader::load_openings(&args.prompts).unwrap_or_else(|e| {
        tracing::warn!("Using built-in opening lines: {:#}", e);
        HashMap::new()
    });

    // --- 4. Shared Store ---
    let store = match &config.redis_url {
        Some(url) => {
            let backend = RedisStore::open(url, config.store_timeout)
                .context("Failed to configure the shared store")?;
            Some(StageStore::new(Arc::new(backend)))
        }
        None => {
            tracing::info!("No shared store configured; running on local state only");
            None
        }
    };
    if let Some(store) = &store {
        if !store.is_healthy().await {
            tracing::warn!("Shared store is not reachable yet; continuing on local state");
        }
    }

    // --- 5. Stage Machine and Handlers ---
    let machine = StageMachine::new(interview_config, store);
    let (command_tx, command_rx) = mpsc::channel::<Command>(32);

    let handlers: Handlers = Arc::new(
        [Stage::SelfIntro, Stage::Experience]
            .into_iter()
            .map(|stage| {
                let opening = prompt_loader::opening_for(&openings, stage);
                let handler = ScriptedStageHandler::new(stage, opening, command_tx.clone());
                (stage, Arc::new(handler))
            })
            .collect(),
    );
    drop(command_tx);

    let mut orchestrator = Orchestrator::new(machine.clone());
    for (stage, handler) in handlers.iter() {
        orchestrator = orchestrator.register(*stage, handler.clone());
    }
    let cancel = orchestrator.cancellation_token();

    machine.initialize(args.room.as_str()).await;
    machine
        .transition_to_next()
        .await
        .context("Failed to open the interview")?;

    let mut run = tokio::spawn(orchestrator.run());
    let command_handler = tokio::spawn(handle_commands(command_rx, handlers.clone()));
    let mut operator = tokio::spawn(handle_operator(machine.clone(), handlers));

    // --- 6. Run until the interview ends, the operator quits, or Ctrl-C ---
    let finished = tokio::select! {
        outcome = &mut run => Some(outcome),
        _ = &mut operator => None,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received Ctrl-C, shutting down...");
            None
        }
    };
    let outcome = match finished {
        Some(outcome) => outcome,
        None => {
            cancel.cancel();
            run.await
        }
    }
    .context("Orchestrator task failed")?;

    if outcome == OrchestratorOutcome::Completed {
        println!("Interviewer: {}", prompt_loader::default_opening(Stage::End));
    }

    machine.cleanup().await;
    command_handler.abort();
    operator.abort();
    tracing::info!("Shutting down...");
    Ok(())
}

/// Executes handler commands. Without a language model the interviewer's
/// replies are canned follow-up questions.
async fn handle_commands(mut command_rx: mpsc::Receiver<Command>, handlers: Handlers) {
    while let Some(command) = command_rx.recv().await {
        match command {
            Command::Speak { stage, text } => {
                println!("[{stage}] Interviewer: {text}");
            }
            Command::Reply { stage, user_text } => {
                tracing::debug!("Replying in {} to: {}", stage, user_text);
                let reply = console::follow_up_line(stage);
                println!("[{stage}] Interviewer: {reply}");
                if let Some(handler) = handlers.get(&stage) {
                    if let Err(e) = handler.on_agent_turn(reply).await {
                        tracing::error!("Failed to record interviewer turn: {:?}", e);
                    }
                }
            }
        }
    }
}

/// Reads the console until `/quit` or end of input.
async fn handle_operator(machine: StageMachine, handlers: Handlers) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(16);

    // A plain thread: a blocked stdin read must not hold up runtime shutdown.
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            let Ok(line) = line else { break };
            if line_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = line_rx.recv().await {
        match Input::parse(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Next => match machine.transition_to_next().await {
                Ok(true) => {}
                Ok(false) => println!("The interview is already over."),
                Err(e) => println!("Cannot advance: {e}"),
            },
            Input::Stage(name) => {
                let result = match name.parse::<Stage>() {
                    Ok(stage) => machine.transition_to_stage(stage).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    println!("Cannot change stage: {e}");
                }
            }
            Input::Status => match machine.snapshot().await {
                Ok(status) => match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::error!("Failed to encode status: {}", e),
                },
                Err(e) => println!("No status: {e}"),
            },
            Input::Say(text) => {
                for handler in handlers.values() {
                    if let Err(e) = handler.on_user_turn(&text).await {
                        tracing::error!("{} handler failed on candidate turn: {:?}", handler.stage(), e);
                    }
                }
            }
        }
    }
}
