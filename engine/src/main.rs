// Flowbot conversation flow engine
// Main entry point for the flowbot binary

use clap::Parser;
use flowbot_engine::cli::{Cli, Command, ConfigAction};
use flowbot_engine::config::Config;
use flowbot_engine::handlers::{
    handle_config_show, handle_credential, handle_import, handle_keygen, handle_send,
    OutputFormat, SendArgs,
};
use flowbot_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Key generation needs neither config nor logging
    if matches!(cli.command, Command::Keygen) {
        return handle_keygen(format);
    }

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the configured level; RUST_LOG wins over both
    match cli.log.as_deref() {
        Some(level) => init_telemetry_with_level(level),
        None if config.core.log_level.is_empty() => init_telemetry(),
        None => init_telemetry_with_level(&config.core.log_level),
    }

    tracing::debug!(
        "Flowbot v{} ({} - {})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_COMMIT_HASH"),
        env!("BUILD_TIMESTAMP")
    );

    // Handle commands
    match cli.command {
        Command::Keygen => handle_keygen(format),

        Command::Import { path } => {
            tracing::info!("Importing flow from {}", path.display());
            handle_import(&path, &config, format).await
        }

        Command::Send {
            bot,
            subscriber,
            channel,
            flow,
            text,
        } => {
            let args = SendArgs {
                bot,
                subscriber,
                channel,
                flow,
                text,
            };
            handle_send(args, &config, format).await
        }

        Command::Serve => {
            tracing::info!("Starting engine...");
            flowbot_engine::daemon::serve(&config).await
        }

        Command::Credential { action } => handle_credential(action, &config, format).await,

        Command::Config { action } => match action {
            ConfigAction::Show => handle_config_show(&config, format),
        },
    }
}
