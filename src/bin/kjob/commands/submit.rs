use anyhow::{Context, Result};
use kubejobs::cluster::{ClusterClient, KubeCluster};
use kubejobs::config::Config;
use kubejobs::core::manifest::JobManifest;
use kubejobs::core::user::SubmitterInfo;

use super::render::build_manifest;
use crate::cli::JobArgs;

pub async fn handle_submit(config: &Config, args: &JobArgs) -> Result<()> {
    let submitter = SubmitterInfo::detect(config.job.user_email.clone());
    let manifest = build_manifest(config, args, &submitter, |name| std::env::var(name).ok())?;

    let mut cluster_config = config.cluster.clone();
    if let Some(namespace) = &args.namespace {
        cluster_config.namespace = namespace.clone();
    }
    let cluster = KubeCluster::connect(&cluster_config, &config.job.gpu_resource)
        .await
        .context("Failed to connect to the Kubernetes API")?;

    let summary = describe(&manifest, args.pod);
    if args.pod {
        cluster.submit_pod(&manifest.into_pod()).await?;
    } else {
        cluster.submit_job(&manifest.into_job()).await?;
    }
    println!("{summary} submitted to namespace '{}'", cluster.namespace());
    Ok(())
}

/// e.g. `Job 'train-1' (2x NVIDIA-A100-SXM4-80GB)`
pub fn describe(manifest: &JobManifest, pod: bool) -> String {
    let kind = if pod { "Pod" } else { "Job" };
    match manifest.gpu() {
        Some(gpu) if gpu.count > 0 => {
            format!("{kind} '{}' ({}x {})", manifest.name(), gpu.count, gpu.product)
        }
        _ => format!("{kind} '{}'", manifest.name()),
    }
}
