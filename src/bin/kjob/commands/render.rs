use anyhow::{Context, Result};
use chrono::Utc;
use kubejobs::config::Config;
use kubejobs::core::manifest::{GpuRequest, JobManifest};
use kubejobs::core::user::SubmitterInfo;

use crate::cli::JobArgs;

pub fn handle_render(config: &Config, args: &JobArgs) -> Result<()> {
    let submitter = SubmitterInfo::detect(config.job.user_email.clone());
    let manifest = build_manifest(config, args, &submitter, |name| std::env::var(name).ok())?;

    let yaml = if args.pod {
        manifest.to_pod_yaml()?
    } else {
        manifest.to_yaml()?
    };
    print!("{yaml}");
    Ok(())
}

/// Combine the `[job]` defaults with the command-line overrides.
pub fn build_manifest(
    config: &Config,
    args: &JobArgs,
    submitter: &SubmitterInfo,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<JobManifest> {
    let job = &config.job;
    let mut builder = JobManifest::from_job_config(&args.name, job, lookup)
        .args(vec![args.command.join(" ")])
        .namespace(args.namespace.as_ref().unwrap_or(&config.cluster.namespace))
        .labels(submitter.labels(&job.user_label))
        .annotations(submitter.annotations(Utc::now()))
        .privileged(args.privileged);

    if let Some(image) = &args.image {
        builder = builder.image(image);
    }
    if let Some(product) = &args.gpu_product {
        builder = builder.gpu(GpuRequest {
            resource: job.gpu_resource.clone(),
            product: product.clone(),
            count: args.gpus.unwrap_or(job.gpu_limit),
        });
    }
    if let Some(cpu) = &args.cpu {
        builder = builder.cpu(cpu);
    }
    if let Some(memory) = &args.memory {
        builder = builder.memory(memory);
    }
    if let Some(shm) = &args.shm {
        builder = builder.shm_size(shm);
    }
    if let Some(limit) = args.backoff_limit {
        builder = builder.backoff_limit(limit);
    }
    if let Some(deadline) = args.deadline {
        builder = builder.active_deadline_seconds(Some(deadline));
    }
    for (key, value) in &args.env {
        builder = builder.env(key, value);
    }
    for volume in args.pvc.iter().chain(&args.nfs) {
        builder = builder.volume(volume.clone());
    }

    builder
        .build()
        .with_context(|| format!("Invalid job '{}'", args.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Commands, KJob};
    use clap::Parser;
    use k8s_openapi::api::batch::v1::Job;

    fn job_args(extra: &[&str]) -> JobArgs {
        let mut argv = vec!["kjob", "render", "--name", "train-1"];
        argv.extend_from_slice(extra);
        argv.extend_from_slice(&["--", "python", "train.py", "--lr", "0.1"]);
        match KJob::parse_from(argv).command {
            Commands::Render(args) => args,
            _ => unreachable!(),
        }
    }

    fn submitter() -> SubmitterInfo {
        SubmitterInfo {
            user: "tester".to_string(),
            home: None,
            shell: None,
            groups: vec![],
            email: None,
        }
    }

    #[test]
    fn test_command_is_passed_to_entrypoint() {
        let args = job_args(&[]);
        let manifest = build_manifest(&Config::default(), &args, &submitter(), |_| None).unwrap();
        let job = manifest.into_job();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec!["/bin/bash".to_string(), "-c".to_string(), "--".to_string()]
        );
        assert_eq!(
            container.args.as_ref().unwrap(),
            &vec!["python train.py --lr 0.1".to_string()]
        );
    }

    #[test]
    fn test_overrides_apply() {
        let args = job_args(&[
            "--image",
            "busybox",
            "--gpu-product",
            "NVIDIA-A100-SXM4-40GB",
            "--gpus",
            "2",
            "--memory",
            "16Gi",
            "--deadline",
            "600",
            "--nfs",
            "nfs:10.0.0.1:/export:/nfs",
        ]);
        let manifest = build_manifest(&Config::default(), &args, &submitter(), |_| None).unwrap();
        let yaml = manifest.to_yaml().unwrap();
        let job: Job = serde_yaml::from_str(&yaml).unwrap();

        let spec = job.spec.unwrap();
        assert_eq!(spec.active_deadline_seconds, Some(600));
        let pod = spec.template.spec.unwrap();
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("busybox"));
        let limits = container.resources.as_ref().unwrap().limits.as_ref().unwrap();
        assert_eq!(limits["nvidia.com/gpu"].0, "2");
        assert_eq!(limits["memory"].0, "16Gi");
        assert_eq!(
            pod.node_selector.unwrap()["nvidia.com/gpu.product"],
            "NVIDIA-A100-SXM4-40GB"
        );
    }

    #[test]
    fn test_invalid_name_is_reported() {
        let mut args = job_args(&[]);
        args.name = "Train_1".to_string();
        let err = build_manifest(&Config::default(), &args, &submitter(), |_| None).unwrap_err();
        assert!(err.to_string().contains("Train_1"));
    }

    #[test]
    fn test_submit_summary_names_gpus() {
        let args = job_args(&["--gpu-product", "NVIDIA-H100-80GB-HBM3", "--gpus", "4"]);
        let manifest = build_manifest(&Config::default(), &args, &submitter(), |_| None).unwrap();
        assert_eq!(
            crate::commands::submit::describe(&manifest, false),
            "Job 'train-1' (4x NVIDIA-H100-80GB-HBM3)"
        );

        let args = job_args(&[]);
        let manifest = build_manifest(&Config::default(), &args, &submitter(), |_| None).unwrap();
        assert_eq!(crate::commands::submit::describe(&manifest, true), "Pod 'train-1'");
    }
}
