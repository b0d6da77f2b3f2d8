//! Gantry CLI entrypoint.

use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod loader;


use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Run CI workflows locally", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = CliConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Ignoring unreadable configuration");
        CliConfig::default()
    });

    let exit_code = match cli.command {
        Commands::Init { force } => handlers::init(&config, force)?,
        Commands::Validate { paths } => handlers::validate(&config, &paths)?,
        Commands::Plan { trigger } => handlers::plan(&config, &trigger)?,
        Commands::Run {
            trigger,
            keep_workspace,
            in_place,
        } => handlers::run(&config, &trigger, keep_workspace, in_place).await?,
        Commands::Schema { output } => handlers::schema(output.as_deref())?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    };

    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
