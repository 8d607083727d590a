//! DevAssist CLI: the main entry point.
//!
//! Commands:
//! - `ask`     : ask questions about a recorded performance trace
//! - `history` : list or print stored conversations
//! - `config`  : show the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "devassist",
    about = "DevAssist: ask an AI assistant about performance traces",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask about a performance trace
    Ask {
        /// Path to the trace JSON file
        #[arg(short, long)]
        trace: PathBuf,

        /// Focus on a single event (e.g. r-3)
        #[arg(long, conflicts_with_all = ["call_tree", "insight"])]
        event: Option<String>,

        /// Focus on the call tree below a main-thread event (e.g. e-12)
        #[arg(long, conflicts_with = "insight")]
        call_tree: Option<String>,

        /// Focus on an insight by id
        #[arg(long)]
        insight: Option<String>,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Continue a stored conversation
        #[arg(long)]
        resume: Option<String>,
    },

    /// List stored conversations or print one
    History {
        /// Conversation id to print
        #[arg(short, long)]
        conversation: Option<String>,

        /// Delete the given conversation
        #[arg(long, requires = "conversation")]
        clear: bool,
    },

    /// Show the effective configuration (API key redacted)
    Config {
        /// Print the config file path instead
        #[arg(long)]
        path: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Ask {
            trace,
            event,
            call_tree,
            insight,
            message,
            resume,
        } => {
            let selection = commands::ask::selection(event, call_tree, insight);
            commands::ask::run(trace, selection, message, resume).await?
        }
        Commands::History {
            conversation,
            clear,
        } => commands::history::run(conversation, clear).await?,
        Commands::Config { path } => {
            if path {
                commands::config_cmd::path()?
            } else {
                commands::config_cmd::show()?
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn focus_flags_are_exclusive() {
        let parsed = Cli::try_parse_from([
            "devassist", "ask", "--trace", "t.json", "--event", "r-1", "--call-tree", "e-1",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parses_ask_with_message() {
        let cli = Cli::try_parse_from([
            "devassist", "-v", "ask", "-t", "t.json", "--insight", "LCPBreakdown", "-m", "Why?",
        ])
        .unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Ask {
                insight, message, ..
            } => {
                assert_eq!(insight.as_deref(), Some("LCPBreakdown"));
                assert_eq!(message.as_deref(), Some("Why?"));
            }
            _ => panic!("expected ask"),
        }
    }

    #[test]
    fn clear_requires_conversation() {
        assert!(Cli::try_parse_from(["devassist", "history", "--clear"]).is_err());
    }
}
