mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::KJob::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.verbosity)
        .init();

    if let cli::Commands::Completions { shell } = args.command {
        let mut cmd = cli::KJob::command();
        return kubejobs::utils::generate_to_stdout(shell, &mut cmd, "kjob");
    }

    let config = kubejobs::config::load_config(args.config.as_ref())?;
    commands::handle_commands(&config, args.command).await
}
