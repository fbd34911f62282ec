use crate::cli::Commands;
use anyhow::Result;
use kubejobs::cluster::ClusterClient;
use kubejobs::config::Config;

pub mod gpus;
pub mod jobs;
pub mod pvcs;

pub async fn handle_commands<C: ClusterClient>(
    config: &Config,
    cluster: &C,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Gpus(args) => gpus::handle_gpus(config, cluster, &args).await,
        Commands::Pvcs(args) => pvcs::handle_pvcs(cluster, &args).await,
        Commands::Jobs(args) => jobs::handle_jobs(cluster, &args).await,
        Commands::Completions { .. } => Ok(()),
    }
}
