//! `devassist ask`: interactive or single-message questions about a trace.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use devassist_agent::{ConversationAgent, ResponseData, RunOptions, TurnOutcome};
use devassist_config::AppConfig;
use devassist_core::context::ConversationContext;
use devassist_core::event::EventBus;
use devassist_core::message::{ConversationId, ErrorKind};
use devassist_performance::{PerformanceContext, Selection, TraceModel};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Map the focus flags to a selection. clap keeps them exclusive.
pub fn selection(event: Option<String>, call_tree: Option<String>, insight: Option<String>) -> Selection {
    match (event, call_tree, insight) {
        (Some(key), _, _) => Selection::Event(key),
        (_, Some(key), _) => Selection::CallTree(key),
        (_, _, Some(id)) => Selection::Insight(id),
        _ => Selection::None,
    }
}

pub async fn run(
    trace_path: PathBuf,
    selection: Selection,
    message: Option<String>,
    resume: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = super::load_config()?;

    // Check for API key early, with a clear error
    if !config.has_api_key() && !matches!(config.provider.name.as_str(), "ollama" | "vllm") {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    DEVASSIST_API_KEY = 'sk-...'   (generic)");
        eprintln!("    OPENAI_API_KEY    = 'sk-...'   (for OpenAI direct)");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
        eprintln!();
        return Err("No API key found. See above for setup instructions.".into());
    }

    let provider = devassist_providers::build_from_config(&config)
        .map_err(|e| format!("Failed to set up the model provider: {e}"))?;

    let trace = TraceModel::load(&trace_path)
        .await
        .map_err(|e| format!("Failed to load trace {}: {e}", trace_path.display()))?;
    let context: Arc<dyn ConversationContext> =
        Arc::new(PerformanceContext::new(Arc::new(trace), selection)?);

    let history = super::history_store(&config);
    let event_bus = Arc::new(EventBus::default());
    let mut agent = ConversationAgent::from_config(provider, &config, event_bus).with_history(history);

    if let Some(id) = resume {
        let restored = agent.resume(ConversationId::from(&id)).await?;
        println!("  Resumed conversation {id} ({restored} messages)");
    }

    match message {
        Some(message) => {
            ask_once(&mut agent, &message, &context).await;
        }
        None => interactive(&mut agent, &context, &config).await?,
    }

    println!("  Conversation: {}", agent.conversation_id());
    Ok(())
}

/// Run one turn, printing events as they arrive. Ctrl+C cancels the turn.
async fn ask_once(
    agent: &mut ConversationAgent,
    query: &str,
    context: &Arc<dyn ConversationContext>,
) -> TurnOutcome {
    let (tx, rx) = mpsc::channel(64);
    let printer = tokio::spawn(print_events(rx));

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let options = RunOptions::new()
        .with_context(context.clone())
        .with_cancel(cancel);
    let outcome = agent.run(query, options, &tx).await;

    interrupt.abort();
    drop(tx);
    let _ = printer.await;
    debug!(?outcome, "Turn finished");
    outcome
}

async fn interactive(
    agent: &mut ConversationAgent,
    context: &Arc<dyn ConversationContext>,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        DevAssist: Performance Assistant      ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.provider.name);
    println!("  Model:     {}", config.default_model);
    println!("  Focus:     {}", context.title());
    println!();
    println!("  Type your question and press Enter.");
    println!("  Ctrl+C cancels the current answer, '/new' starts a new chat,");
    println!("  'exit' or Ctrl+C at the prompt quits.");
    println!();

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        // Ctrl+C at the prompt quits; during a turn it only cancels the turn
        let Some(line) = read_query(&mut lines, tokio::signal::ctrl_c()).await? else {
            println!();
            break;
        };
        let query = line.trim();
        match query {
            "" => continue,
            "exit" | "quit" => break,
            "/new" => {
                agent.reset();
                println!("  Started a new chat.");
                println!();
                continue;
            }
            _ => {}
        }

        ask_once(agent, query, context).await;
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

/// Read the next query line. `None` on end of input or when `interrupt`
/// completes first.
async fn read_query<R, F>(
    lines: &mut tokio::io::Lines<R>,
    interrupt: F,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
    F: std::future::Future,
{
    tokio::select! {
        biased;
        _ = interrupt => {
            debug!("Interrupted at the prompt");
            Ok(None)
        }
        line = lines.next_line() => line,
    }
}

async fn print_events(mut rx: mpsc::Receiver<ResponseData>) {
    while let Some(event) = rx.recv().await {
        match event {
            ResponseData::Context { title, details } => {
                println!("  Context: {title}");
                for detail in details {
                    let first = detail.text.lines().next().unwrap_or_default();
                    println!("    {}: {first}", detail.title);
                }
                println!();
            }
            ResponseData::Querying { step } => {
                debug!(step, "Waiting for the model");
            }
            ResponseData::Action { title, action, .. } => {
                clear_status();
                println!("  · {title}");
                println!("    {action}");
            }
            ResponseData::Answer {
                text,
                complete: false,
                ..
            } => {
                eprint!("\r  Thinking... ({} chars)", text.len());
            }
            ResponseData::Answer {
                text,
                complete: true,
                suggestions,
            } => {
                clear_status();
                println!();
                for line in text.lines() {
                    println!("  Assistant > {line}");
                }
                if !suggestions.is_empty() {
                    println!();
                    println!("  Suggestions:");
                    for suggestion in suggestions {
                        println!("    - {suggestion}");
                    }
                }
                println!();
            }
            ResponseData::Error { kind } => {
                clear_status();
                eprintln!("  [Error] {}", describe_error(kind));
                println!();
            }
        }
    }
}

fn clear_status() {
    eprint!("\r{}\r", " ".repeat(40));
}

fn describe_error(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Unknown => "Something went wrong. Try again.",
        ErrorKind::Abort => "Cancelled.",
        ErrorKind::MaxSteps => "The assistant could not finish its investigation.",
        ErrorKind::Block => "The model service declined to answer this question.",
    }
}
