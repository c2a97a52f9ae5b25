mod describe;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};

use amelie_config::AmelieConfig;
use amelie_gateway::ChannelFactory;
use amelie_media::GeminiEngine;
use amelie_types::{DetailLevel, VideoMode};

#[derive(Parser)]
#[command(name = "amelie", about = "Accessibility bot describing media for blind users")]
struct Cli {
    /// Config file (defaults to ~/.amelie/config.json5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Detail {
    Short,
    Long,
}

#[derive(Clone, Copy, ValueEnum)]
enum Video {
    Caption,
    Full,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bot until Ctrl-C
    Run,
    /// Describe a local file and print the reply
    Describe {
        /// File to describe
        file: PathBuf,

        /// MIME type override (detected from name and content otherwise)
        #[arg(short, long)]
        mime: Option<String>,

        /// Image description length
        #[arg(long, value_enum, default_value = "short")]
        detail: Detail,

        /// Video description granularity
        #[arg(long, value_enum, default_value = "caption")]
        video: Video,

        /// Caption to pass along with the media
        #[arg(long)]
        caption: Option<String>,
    },
    /// Check configuration
    Health,
    /// Show or create the config file
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load(path: Option<&std::path::Path>) -> anyhow::Result<AmelieConfig> {
    amelie_config::load_config(path).context("failed to load config")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run => {
            let config = load(cli.config.as_deref())?;
            config.validate()?;
            tracing::info!(
                version = env!("CARGO_PKG_VERSION"),
                model = %config.engine.model,
                "Starting amelie"
            );

            let api_key = config.engine.api_key.clone().unwrap_or_default();
            let engine = GeminiEngine::new(
                api_key,
                config.engine.model.clone(),
                config.engine.language.clone(),
            );

            let mut channel_factories: HashMap<String, ChannelFactory> = HashMap::new();
            channel_factories.insert(
                "telegram".into(),
                Box::new(amelie_channel_telegram::create_telegram_channel),
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(amelie_gateway::start_gateway(
                config,
                Arc::new(engine),
                channel_factories,
            ))?;
        }
        Commands::Describe {
            file,
            mime,
            detail,
            video,
            caption,
        } => {
            let config = load(cli.config.as_deref())?;
            let detail = match detail {
                Detail::Short => DetailLevel::Short,
                Detail::Long => DetailLevel::Long,
            };
            let video = match video {
                Video::Caption => VideoMode::CaptionOnly,
                Video::Full => VideoMode::Full,
            };
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(describe::run_describe(
                config, &file, mime, detail, video, caption, cli.json,
            ))?;
        }
        Commands::Health => {
            let config = load(cli.config.as_deref())?;
            println!("amelie {}", env!("CARGO_PKG_VERSION"));
            println!("  model: {}", config.engine.model);
            println!("  language: {}", config.engine.language);
            println!(
                "  engine key: {}",
                if config.engine.api_key.is_some() { "set" } else { "missing" }
            );
            println!("  channels configured: {}", config.channels.len());
            println!("  database: {}", config.db_path()?.display());
            println!("  spool: {}", config.spool_dir()?.display());
            match config.validate() {
                Ok(()) => println!("ready"),
                Err(e) => println!("not ready: {e}"),
            }
        }
        Commands::Config { init } => {
            let path = match cli.config {
                Some(path) => path,
                None => amelie_config::config_file_path()?,
            };
            if init && !path.exists() {
                amelie_config::save_config_to(&AmelieConfig::default(), &path)?;
                println!("Wrote {}", path.display());
            } else {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}
