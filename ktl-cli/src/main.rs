mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

use commands::StackArgs;

/// ktl: Kubernetes ops from the terminal
#[derive(Parser, Debug)]
#[command(name = "ktl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan, apply and delete stacks of helm releases
    Stack(StackArgs),
}

fn init_tracing(level: &str) {
    // RUST_LOG wins over --log-level; stdout is reserved for command output
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Stack(args) => {
            init_tracing(&args.context.log_level);
            commands::execute(args).await
        }
    }
}
