//! Terminal front-end for the orchestrator.
//!
//! Stands in for the chat surface: a rustyline REPL submits prompts, loop
//! events are logged as they stream, and heartbeat proposals are printed
//! between turns. Runs against the in-process mock backend; an embedding
//! application injects its real session factory through
//! [`switchboard::RuntimeDeps`] instead.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing_subscriber::EnvFilter;

use switchboard::agent::spawn_heartbeat;
use switchboard::auth::StaticAuth;
use switchboard::backend::SessionFactory;
use switchboard::backend::mock::MockSessionFactory;
use switchboard::config::Config;
use switchboard::protocol::LoopEvent;
use switchboard::providers::StaticSettings;
use switchboard::{AgentRuntime, RuntimeDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();
    let workspace_dir = config.workspace_dir();
    std::fs::create_dir_all(&workspace_dir)
        .with_context(|| format!("creating workspace dir {}", workspace_dir.display()))?;

    let auth = match &config.api_key {
        Some(key) => StaticAuth::authenticated(key.clone()),
        None => StaticAuth::authenticated("mock-api-key"),
    };

    let runtime = Arc::new(AgentRuntime::new(RuntimeDeps {
        factory: Arc::new(MockSessionFactory) as Arc<dyn SessionFactory>,
        auth: Arc::new(auth),
        settings: Arc::new(StaticSettings(config.provider_settings())),
        known_capabilities: Vec::new(),
        config: config.runtime_config(),
    }));

    // Log the loop event stream the way an attached surface would fold it.
    let mut events = Box::pin(runtime.events());
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match &event {
                LoopEvent::ToolExecutionStart { tool_name, .. } => {
                    tracing::info!(tool = %tool_name, "tool started");
                }
                LoopEvent::ToolExecutionEnd {
                    tool_name,
                    is_error,
                    ..
                } => {
                    tracing::info!(tool = %tool_name, is_error, "tool finished");
                }
                LoopEvent::RunEnd { status, .. } => {
                    tracing::info!(?status, "run finished");
                }
                _ => {}
            }
        }
    });

    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::channel(8);
    spawn_heartbeat(config.heartbeat_config(), Arc::clone(&runtime), Some(notify_tx));
    tokio::spawn(async move {
        while let Some(confirmation) = notify_rx.recv().await {
            println!("\n{confirmation}");
        }
    });

    run_repl(runtime).await
}

/// Read prompts until EOF/interrupt, printing each structured result.
async fn run_repl(runtime: Arc<AgentRuntime>) -> anyhow::Result<()> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut editor = DefaultEditor::new().context("initializing line editor")?;
        loop {
            match editor.readline("you> ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = editor.add_history_entry(line.as_str());
                    match handle.block_on(runtime.submit_prompt(&line)) {
                        Ok(reply) => println!("{reply}"),
                        Err(err) => {
                            let payload = err.payload();
                            eprintln!("[{}] {}", payload.code, payload.message);
                        }
                    }
                }
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
                Err(err) => return Err(err).context("reading input"),
            }
        }
        Ok(())
    })
    .await
    .context("REPL task panicked")?
}
