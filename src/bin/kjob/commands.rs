use crate::cli::Commands;
use anyhow::Result;
use kubejobs::config::Config;

pub mod render;
pub mod secret;
pub mod submit;

pub async fn handle_commands(config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Render(args) => render::handle_render(config, &args),
        Commands::Submit(args) => submit::handle_submit(config, &args).await,
        Commands::Secret(args) => secret::handle_secret(config, &args).await,
        // handled before the config is loaded
        Commands::Completions { .. } => Ok(()),
    }
}
