use clap::Parser;
use snafu::prelude::*;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

use cmd::{handle_run, handle_serve, handle_validate, RunArgs, ServeArgs, ValidateArgs};
use rook::config::RookConfig;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Run error: {source}"))]
    Run { source: cmd::run::Error },

    #[snafu(display("Validate error: {source}"))]
    Validate { source: cmd::validate::Error },

    #[snafu(display("Serve error: {source}"))]
    Serve { source: cmd::serve::Error },
}

#[derive(Parser, Debug)]
#[command(name = "rook")]
#[command(version)]
#[command(about = "A durable, distributed execution engine for Serverless Workflows", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Execute a workflow to completion in-process
    Run(RunArgs),
    /// Validate workflow document(s) without executing
    Validate(ValidateArgs),
    /// Run the consumer and outbox processors over the loopback channels
    Serve(ServeArgs),
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    let config = RookConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Run(args) => {
            init_tracing(args.verbose);
            handle_run(args).await.context(RunSnafu)
        }
        Commands::Validate(args) => {
            init_tracing(args.verbose);
            handle_validate(args).await.context(ValidateSnafu)
        }
        Commands::Serve(args) => {
            init_tracing(args.verbose);
            handle_serve(args, config).await.context(ServeSnafu)
        }
    }
}
