pub mod dispatcher;
pub mod experiment;
pub mod gpu;
pub mod manifest;
pub mod pvc;
pub mod retry;
pub mod secret;
pub mod user;

use std::path::PathBuf;

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "\
{}
Authors: {author}",
        env!("CARGO_PKG_VERSION")
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("kubejobs"))
}

pub fn get_data_dir() -> anyhow::Result<PathBuf> {
    dirs::data_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get data directory"))
        .map(|p| p.join("kubejobs"))
}

pub fn get_log_dir() -> anyhow::Result<PathBuf> {
    let log_dir = get_data_dir()?.join("logs");
    if !log_dir.exists() {
        std::fs::create_dir_all(&log_dir)?;
    }
    Ok(log_dir)
}
