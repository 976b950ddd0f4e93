//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// ParallelChat - parallel research chat
#[derive(Parser)]
#[command(
    name = "pc",
    about = "Decompose a question, research it in parallel branches, stream one synthesized answer",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve the chat API over HTTP (SSE) and WebSocket
    Serve {
        /// Address to bind, overrides server.bind
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run one turn locally and print its events
    Ask {
        /// The question to research
        query: String,

        /// Print raw JSON events instead of rendered output
        #[arg(long)]
        raw: bool,
    },

    /// Compare orchestrated answers against direct model answers
    Eval {
        /// YAML file with questions (id, category, question)
        #[arg(short, long, conflicts_with = "generate")]
        questions: Option<PathBuf>,

        /// Have the model write this many business questions instead
        #[arg(short, long)]
        generate: Option<usize>,

        /// Write the evaluation session as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the effective prompt templates
    Prompts {
        /// Template name (decompose, branch, evaluate, rebranch, synthesize, judge, generate)
        name: Option<String>,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("parallelchat")
        .join("logs")
        .join("parallelchat.log");
    debug!(?path, "get_log_path: returning path");
    path
}

/// Generate the after_help text with config locations and the log path
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let mut help = String::new();

    help.push_str("Config files (first found wins):\n");
    help.push_str("  --config PATH\n");
    help.push_str("  ./.parallelchat.yml\n");
    if let Some(dir) = dirs::config_dir() {
        help.push_str(&format!("  {}\n", dir.join("parallelchat").join("parallelchat.yml").display()));
    }

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", get_log_path().display()));
    help
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_ask_with_globals() {
        let cli = Cli::try_parse_from(["pc", "-l", "debug", "ask", "Compare X and Y", "--raw"]).unwrap();
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Ask { query, raw } => {
                assert_eq!(query, "Compare X and Y");
                assert!(raw);
            }
            other => panic!("Expected ask, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_serve_bind() {
        let cli = Cli::try_parse_from(["pc", "serve", "--bind", "0.0.0.0:9000"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { bind: Some(ref b) } if b == "0.0.0.0:9000"));
    }

    #[test]
    fn test_log_path_under_parallelchat() {
        let path = get_log_path();
        assert!(path.ends_with("parallelchat/logs/parallelchat.log"));
    }
}
