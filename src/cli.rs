use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "llm-relay")]
#[command(about = "Route prompts across LLM providers with automatic fallback")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Also write logs to a daily rolling file
    #[arg(long, global = true)]
    pub log_file: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GenerationArgs {
    /// Prompt text (read from stdin when omitted)
    pub prompt: Option<String>,

    /// Model to request from the provider
    #[arg(short, long)]
    pub model: Option<String>,

    /// Sampling temperature, clamped to 0..=1
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate, capped at 4000
    #[arg(long)]
    pub max_tokens: Option<u32>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a complete response
    Generate {
        #[command(flatten)]
        args: GenerationArgs,

        /// Print which providers were tried
        #[arg(long)]
        report: bool,
    },

    /// Stream a response chunk by chunk
    Stream {
        #[command(flatten)]
        args: GenerationArgs,
    },

    /// List registered providers in fallback order
    Providers,

    /// Manage API keys stored in the OS keyring
    ApiKey {
        /// Provider name (openai, anthropic, gemini)
        provider: String,

        /// Set API key for provider
        #[arg(short, long, conflicts_with_all = ["remove", "status"])]
        set: Option<String>,

        /// Remove API key for provider
        #[arg(short, long, conflicts_with = "status")]
        remove: bool,

        /// Show current API key status
        #[arg(long)]
        status: bool,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_generate() {
        let cli = Cli::try_parse_from([
            "llm-relay", "generate", "hello there", "--model", "gpt-4", "-t", "0.2", "--report",
        ]).unwrap();

        match cli.command {
            Commands::Generate { args, report } => {
                assert_eq!(args.prompt.as_deref(), Some("hello there"));
                assert_eq!(args.model.as_deref(), Some("gpt-4"));
                assert_eq!(args.temperature, Some(0.2));
                assert!(report);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["llm-relay", "providers", "--debug", "--config", "x.toml"]).unwrap();
        assert!(cli.debug);
        assert_eq!(cli.config.as_deref(), Some("x.toml"));
        assert!(matches!(cli.command, Commands::Providers));
    }

    #[test]
    fn test_api_key_flags_conflict() {
        let result = Cli::try_parse_from(["llm-relay", "api-key", "openai", "--set", "k", "--remove"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_stream_without_prompt() {
        let cli = Cli::try_parse_from(["llm-relay", "stream"]).unwrap();
        match cli.command {
            Commands::Stream { args } => assert!(args.prompt.is_none()),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
