//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - chat: run one agent session against a provider
//! - config: print the effective configuration

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::ProviderKind;

/// relay - stream a conversation through an LLM provider
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send a prompt and stream the reply
    Chat {
        /// Prompt text
        prompt: String,

        /// Provider to use (overrides config)
        #[arg(short, long, value_enum)]
        provider: Option<ProviderKind>,

        /// Model name (overrides config)
        #[arg(short, long)]
        model: Option<String>,

        /// Maximum model turns (overrides config)
        #[arg(long)]
        max_turns: Option<u32>,

        /// System prompt (overrides config)
        #[arg(short, long)]
        system: Option<String>,
    },

    /// Print the effective configuration as YAML
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse_no_args() {
        let cli = Cli::try_parse_from(["relay"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.verbose);
        assert!(cli.config.is_none());
    }

    #[test]
    fn test_cli_verbose_flag() {
        let cli = Cli::try_parse_from(["relay", "-v"]).unwrap();
        assert!(cli.is_verbose());
    }

    #[test]
    fn test_cli_config_option() {
        let cli = Cli::try_parse_from(["relay", "-c", "/path/to/relay.yml"]).unwrap();
        assert_eq!(cli.config.as_ref(), Some(&PathBuf::from("/path/to/relay.yml")));
    }

    #[test]
    fn test_chat_command() {
        let cli = Cli::try_parse_from(["relay", "chat", "What is 2+2?"]).unwrap();
        match cli.command {
            Some(Commands::Chat {
                prompt,
                provider,
                model,
                max_turns,
                system,
            }) => {
                assert_eq!(prompt, "What is 2+2?");
                assert!(provider.is_none());
                assert!(model.is_none());
                assert!(max_turns.is_none());
                assert!(system.is_none());
            }
            _ => panic!("Expected chat command"),
        }
    }

    #[test]
    fn test_chat_with_overrides() {
        let cli = Cli::try_parse_from([
            "relay",
            "chat",
            "hi",
            "--provider",
            "gemini",
            "-m",
            "gemini-2.5-pro",
            "--max-turns",
            "3",
            "-s",
            "be brief",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Chat {
                provider,
                model,
                max_turns,
                system,
                ..
            }) => {
                assert_eq!(provider, Some(ProviderKind::Gemini));
                assert_eq!(model.as_deref(), Some("gemini-2.5-pro"));
                assert_eq!(max_turns, Some(3));
                assert_eq!(system.as_deref(), Some("be brief"));
            }
            _ => panic!("Expected chat command"),
        }
    }

    #[test]
    fn test_chat_rejects_unknown_provider() {
        assert!(Cli::try_parse_from(["relay", "chat", "hi", "--provider", "openai"]).is_err());
    }

    #[test]
    fn test_chat_requires_prompt() {
        assert!(Cli::try_parse_from(["relay", "chat"]).is_err());
    }

    #[test]
    fn test_config_command() {
        let cli = Cli::try_parse_from(["relay", "config", "-c", "relay.yml"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Config)));
        assert_eq!(cli.config, Some(PathBuf::from("relay.yml")));
    }

    #[test]
    fn test_help_works() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_version_flag() {
        let result = Cli::try_parse_from(["relay", "--version"]);
        assert!(result.is_err());
    }
}
