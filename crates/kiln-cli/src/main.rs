//! kiln CLI entrypoint.

use clap::Parser;
use console::style;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;
mod local;
mod report;


use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Run CI pipelines locally", long_about = None)]
struct Cli {
    /// Log more (-v info, -vv debug). RUST_LOG applies when not given.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    // Logs go to stderr so reports on stdout stay machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = CliConfig::load().unwrap_or_default();

    let result = match cli.command {
        Commands::Run(args) => handlers::run(&config, args).await,
        Commands::Validate { file } => handlers::validate(file).await,
        Commands::Plan { file, event } => handlers::plan(file, event).await,
        Commands::Init { path, force } => handlers::init(&path, force).await,
        Commands::Schema => handlers::schema(),
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config),
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value),
        },
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            eprintln!("{} {}", style("✗").red(), e);
            ExitCode::from(handlers::error_exit_code(e.as_ref()) as u8)
        }
    }
}
