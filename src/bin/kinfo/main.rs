mod cli;
mod commands;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use kubejobs::cluster::KubeCluster;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::KInfo::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(args.verbosity)
        .init();

    if let cli::Commands::Completions { shell } = args.command {
        let mut cmd = cli::KInfo::command();
        return kubejobs::utils::generate_to_stdout(shell, &mut cmd, "kinfo");
    }

    let mut config = kubejobs::config::load_config(args.config.as_ref())?;
    if let Some(namespace) = args.namespace {
        config.cluster.namespace = namespace;
    }

    let cluster = KubeCluster::connect(&config.cluster, &config.job.gpu_resource)
        .await
        .context("Failed to connect to the Kubernetes API")?;

    commands::handle_commands(&config, &cluster, args.command).await
}
