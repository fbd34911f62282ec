mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::KBatch::parse();

    if let Some(cli::Commands::Completions { shell }) = args.command {
        let mut cmd = cli::KBatch::command();
        return kubejobs::utils::generate_to_stdout(shell, &mut cmd, "kbatch");
    }

    let _guard = init_tracing(&args)?;

    let mut config = kubejobs::config::load_config(args.config.as_ref())?;
    args.dispatch.apply(&mut config);

    commands::dispatch::handle_dispatch(config, &args.dispatch).await
}

/// Console (stderr) plus a daily rolling file under the data directory
fn init_tracing(args: &cli::KBatch) -> Result<WorkerGuard> {
    let log_dir = kubejobs::core::get_log_dir()?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("kbatch")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::from(
            args.verbosity,
        ))
        .with(console_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}
