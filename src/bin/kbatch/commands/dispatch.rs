use std::io::{IsTerminal, Read};

use anyhow::{bail, Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cli::DispatchArgs;
use kubejobs::cluster::KubeCluster;
use kubejobs::config::Config;
use kubejobs::core::dispatcher::{DispatchReport, Dispatcher};
use kubejobs::core::experiment::{parse_commands_input, Experiment, InputError};
use kubejobs::core::pvc::ensure_pvcs;
use kubejobs::utils::format_duration;

pub async fn handle_dispatch(config: Config, args: &DispatchArgs) -> Result<()> {
    let experiments = read_experiments()?;
    info!(count = experiments.len(), "Loaded experiments");

    let cluster = KubeCluster::connect(&config.cluster, &config.job.gpu_resource)
        .await
        .context("Failed to connect to the Kubernetes API")?;
    info!(namespace = %cluster.namespace(), "Connected to cluster");

    if args.skip_pvc_setup {
        info!("Skipping PVC setup");
    } else {
        ensure_pvcs(&cluster, &config.pvc)
            .await
            .context("Failed to create PVCs")?;
    }

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };
    let mut dispatcher = Dispatcher::new(cluster, config, rng);

    let started = Instant::now();
    let outcome = tokio::select! {
        report = dispatcher.run(&experiments) => Some(report),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(report) = outcome else {
        warn!("Interrupted, jobs already submitted keep running");
        for (pvc, times) in dispatcher.usage().iter() {
            info!(pvc, times, "PVC usage");
        }
        bail!("interrupted");
    };
    let report = report?;

    summarize(&report, started.elapsed());
    if !report.is_success() {
        bail!("{} experiment(s) could not be submitted", report.failed.len());
    }
    Ok(())
}

fn read_experiments() -> Result<Vec<Experiment>> {
    let mut stdin = std::io::stdin();
    if stdin.is_terminal() {
        error!("No commands provided to run; pipe them in on stdin");
        bail!("stdin is a terminal");
    }

    let mut input = String::new();
    stdin
        .read_to_string(&mut input)
        .context("Failed to read commands from stdin")?;

    match parse_commands_input(&input) {
        Ok(experiments) => Ok(experiments),
        Err(e @ InputError::Empty) => {
            error!("No commands provided to run");
            Err(e.into())
        }
        Err(e) => Err(e).context("Invalid experiment input"),
    }
}

fn summarize(report: &DispatchReport, elapsed: std::time::Duration) {
    for submission in &report.submitted {
        info!(
            experiment = %submission.experiment,
            job = %submission.job_name,
            pvc = %submission.pvc,
            gpu_type = %submission.gpu_type,
            attempts = submission.attempts,
            "Submitted"
        );
    }
    for failure in &report.failed {
        error!(
            experiment = %failure.experiment,
            attempts = failure.attempts,
            reason = %failure.reason,
            "Failed"
        );
    }
    info!(
        submitted = report.submitted.len(),
        failed = report.failed.len(),
        elapsed = %format_duration(elapsed),
        "All experiments processed"
    );
}
