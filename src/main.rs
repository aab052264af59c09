use clap::{Parser, Subcommand};
use cursorbot::config::Config;
use cursorbot::{db, logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "cursorbot",
    version = VERSION,
    about = "Telegram bot that runs Cursor background agents from chat"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the bot (default)
    Start,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(MainCommand::Version) = cli.command {
        println!("cursorbot {VERSION}");
        return Ok(());
    }

    let config = Config::load()?;

    if std::env::var("CURSORBOT_LOG_TO_FILE").is_ok() {
        logging::init_logging(&config.data_dir().to_string_lossy())?;
    } else {
        logging::init_console_logging();
    }
    info!("Starting cursorbot v{VERSION}...");

    let db = db::Database::new(&config.database_path)?;
    info!("Database initialized at {}", config.database_path);

    runtime::run(config, db).await
}
