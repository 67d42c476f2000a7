use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use llm_relay::agent::{AgentLoop, Observer, RunOptions};
use llm_relay::llm::{
    AnthropicConfig, AnthropicProvider, Event, GeminiConfig, GeminiProvider, Message, Provider, Session,
};
use llm_relay::tools::UnavailableExecutor;

mod cli;
mod config;

use cli::Cli;
use cli::commands::Commands;
use config::{Config, ProviderConfig, ProviderKind};

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("llm-relay")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("llm-relay.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    let key_env = config.api_key_env();
    let api_key = std::env::var(key_env).context(format!("Environment variable {} is not set", key_env))?;

    let provider: Arc<dyn Provider> = match config.kind {
        ProviderKind::Anthropic => {
            let mut anthropic = AnthropicConfig {
                max_tokens: config.max_tokens,
                timeout: config.timeout(),
                ..Default::default()
            };
            if let Some(url) = &config.base_url {
                anthropic.api_url = url.clone();
            }
            Arc::new(AnthropicProvider::with_api_key(api_key, anthropic)?)
        }
        ProviderKind::Gemini => {
            let mut gemini = GeminiConfig {
                timeout: config.timeout(),
                ..Default::default()
            };
            if let Some(url) = &config.base_url {
                gemini.api_base = url.clone();
            }
            Arc::new(GeminiProvider::with_api_key(api_key, gemini)?)
        }
    };
    Ok(provider)
}

/// Print text as it streams; tool activity and reasoning go to stderr
fn console_observer(verbose: bool) -> Observer {
    Arc::new(move |event: &Event| {
        match event {
            Event::TextDelta { delta, .. } => {
                print!("{}", delta);
                let _ = io::stdout().flush();
            }
            Event::ThinkingDelta { delta, .. } if verbose => {
                eprint!("{}", delta.dimmed());
            }
            Event::ToolCallBegin { name, .. } => {
                eprintln!("\n{} {}", "tool:".cyan(), name.cyan().bold());
            }
            Event::ToolCallEnd { call } if verbose => {
                eprintln!("  {}", call.arguments.dimmed());
            }
            _ => {}
        }
    })
}

async fn handle_chat_command(
    prompt: &str,
    provider_kind: Option<ProviderKind>,
    model: Option<&str>,
    max_turns: Option<u32>,
    system: Option<&str>,
    verbose: bool,
    config: &Config,
) -> Result<()> {
    let mut provider_config = config.provider.clone();
    if let Some(kind) = provider_kind
        && kind != provider_config.kind
    {
        provider_config.kind = kind;
        provider_config.model = None;
        provider_config.api_key_env = None;
    }
    if let Some(model) = model {
        provider_config.model = Some(model.to_string());
    }

    let provider = build_provider(&provider_config)?;
    info!("Chatting via {} with model {}", provider.name(), provider_config.model());

    let mut options = RunOptions::new(provider_config.model()).with_observer(console_observer(verbose));
    options.max_tokens = provider_config.max_tokens;
    options.temperature = provider_config.temperature;
    options.max_turns = max_turns.or(config.agent.max_turns);

    let mut session = Session::new(system.unwrap_or(&config.agent.system_prompt));
    session.push(Message::user(prompt));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let agent = AgentLoop::new(provider, Arc::new(UnavailableExecutor));
    let result = agent.run(&cancel, &mut session, &[], &options).await;
    println!();

    if verbose {
        let usage = session.total_usage();
        eprintln!(
            "{} {} in / {} out ({} cached)",
            "usage:".yellow(),
            usage.total_input(),
            usage.output_tokens,
            usage.cache_read_tokens
        );
    }

    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_cancelled() => {
            eprintln!("{}", "Interrupted".yellow());
            Ok(())
        }
        Err(e) => Err(e).context("Chat failed"),
    }
}

fn handle_config_command(config: &Config) -> Result<()> {
    print!("{}", config.to_yaml()?);
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        eprintln!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        None => {
            println!("{}", "No command given; try `relay chat <prompt>` or `relay --help`".yellow());
            Ok(())
        }
        Some(Commands::Chat {
            prompt,
            provider,
            model,
            max_turns,
            system,
        }) => {
            handle_chat_command(
                prompt,
                *provider,
                model.as_deref(),
                *max_turns,
                system.as_deref(),
                cli.is_verbose(),
                config,
            )
            .await
        }
        Some(Commands::Config) => handle_config_command(config),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
