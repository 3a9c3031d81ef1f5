use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use llm_relay::app::config::LoggingConfig;
use llm_relay::app::{AppConfig, AppState};
use llm_relay::cli::{Cli, Commands, GenerationArgs};
use llm_relay::models::registry::KNOWN_PROVIDERS;
use llm_relay::models::{ChatStream, GenerationOptions};
use llm_relay::platform::{AppPaths, SecureStorageManager};

fn init_logging(debug: bool, config: &LoggingConfig, log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let directive = if debug {
        "llm_relay=debug".to_string()
    } else {
        format!("llm_relay={}", config.level)
    };
    let filter = EnvFilter::from_default_env().add_directive(directive.parse()?);

    // stdout carries generated text, logs go to stderr
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, "llm-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

fn read_prompt(prompt: Option<String>) -> anyhow::Result<String> {
    match prompt {
        Some(prompt) => Ok(prompt),
        None => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer).context("Failed to read prompt from stdin")?;
            Ok(buffer)
        }
    }
}

fn generation_options(config: &AppConfig, args: &GenerationArgs) -> GenerationOptions {
    let mut options = config.to_generation_options();
    if let Some(model) = &args.model {
        options.model_name = model.clone();
    }
    if let Some(temperature) = args.temperature {
        options.temperature = temperature;
    }
    if let Some(max_tokens) = args.max_tokens {
        options.max_tokens = max_tokens;
    }
    options
}

async fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists, pass --force to overwrite", path.display());
    }
    AppConfig::default().save(path).await?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn run(cli: Cli, config: AppConfig, config_path: &Path) -> anyhow::Result<()> {
    let state = AppState::new(config.clone(), SecureStorageManager::new());

    match cli.command {
        Commands::Generate { args, report } => {
            let orchestrator = state.build_orchestrator().await?;
            let prompt = read_prompt(args.prompt.clone())?;
            let options = generation_options(&config, &args);

            let result = orchestrator.generate_with_report(&prompt, &options).await;
            println!("{}", result.text);

            if report {
                eprintln!("outcome: {:?}", result.outcome);
                for attempt in &result.attempts {
                    eprintln!(
                        "  #{} {} ({}) {}ms {}",
                        attempt.attempt_number,
                        attempt.provider_name,
                        attempt.model_name,
                        attempt.response_time_ms,
                        attempt.error.as_deref().unwrap_or("ok"),
                    );
                }
            }
        }
        Commands::Stream { args } => {
            let orchestrator = state.build_orchestrator().await?;
            let prompt = read_prompt(args.prompt.clone())?;
            let mut stream = orchestrator.stream(&prompt, generation_options(&config, &args));
            let mut stdout = std::io::stdout();

            loop {
                tokio::select! {
                    chunk = stream.next_chunk() => match chunk? {
                        Some(chunk) => {
                            print!("{}", chunk.delta);
                            stdout.flush()?;
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        warn!("Interrupted, closing stream");
                        break;
                    }
                }
            }
            println!();
        }
        Commands::Providers => {
            let orchestrator = state.build_orchestrator().await?;
            let registry = orchestrator.registry();

            if registry.is_empty() {
                println!("No providers configured. Set an API key with `llm-relay api-key <provider> --set <key>`.");
            }
            for provider in registry.providers() {
                println!(
                    "{:>4}  {:<10} {}",
                    provider.priority,
                    provider.name,
                    orchestrator.breaker().state(&provider.name)
                );
            }
        }
        Commands::ApiKey { provider, set, remove, .. } => {
            if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
                bail!("Unknown provider '{}', expected one of: {}", provider, KNOWN_PROVIDERS.join(", "));
            }

            if let Some(key) = set {
                state.set_api_key(&provider, key.trim()).await?;
                println!("API key stored for {}", provider);
            } else if remove {
                state.remove_api_key(&provider).await?;
                println!("API key removed for {}", provider);
            } else {
                let stored = state.get_api_key(&provider).await?.is_some();
                println!("{}: {}", provider, if stored { "stored in keyring" } else { "not set" });
            }
        }
        Commands::InitConfig { force } => init_config(config_path, force).await?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new().ok();
    let config_path = match (&cli.config, &paths) {
        (Some(path), _) => PathBuf::from(path),
        (None, Some(paths)) => paths.config_file(),
        (None, None) => bail!("Could not determine a configuration directory, pass --config"),
    };

    if let Commands::InitConfig { force } = cli.command {
        return init_config(&config_path, force).await;
    }

    let config = AppConfig::load(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    let log_dir = (cli.log_file || config.logging.log_to_file)
        .then(|| paths.as_ref().map(AppPaths::logs_dir))
        .flatten();
    let _guard = init_logging(cli.debug, &config.logging, log_dir.as_deref())?;

    info!("Starting llm-relay {}", env!("CARGO_PKG_VERSION"));
    run(cli, config, &config_path).await
}
