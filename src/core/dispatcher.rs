//! Round-robin dispatch of experiments onto PVCs and GPU products
//!
//! Each experiment goes through `SELECT_PVC -> SELECT_GPU -> SUBMIT`. PVC and
//! GPU selection wait (with backoff) until the cluster has room; a rejected
//! submission either starts over from `SELECT_PVC` or is recorded as failed,
//! depending on [`SubmitFailurePolicy`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};

use crate::cluster::{ClusterClient, ClusterError, WorkloadKind};
use crate::config::{Config, SubmitFailurePolicy};
use crate::core::experiment::Experiment;
use crate::core::gpu::{cluster_gpu_usage, select_gpu_type};
use crate::core::manifest::{GpuRequest, JobManifest, ManifestError, VolumeSpec};
use crate::core::pvc::{get_pvc_status, PvcUsageCounter};
use crate::core::retry::{RetryConfig, WaitError, WaitPolicy, wait_for};
use crate::core::user::SubmitterInfo;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("gave up after {waited:?} waiting for {what}")]
    CapacityTimeout { what: String, waited: Duration },

    #[error("no GPU types configured")]
    NoGpuTypes,
}

impl From<WaitError<ClusterError>> for DispatchError {
    fn from(err: WaitError<ClusterError>) -> Self {
        match err {
            WaitError::TimedOut { what, waited } => DispatchError::CapacityTimeout { what, waited },
            WaitError::Probe(e) => DispatchError::Cluster(e),
        }
    }
}

/// An experiment the API server accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub experiment: String,
    pub job_name: String,
    pub pvc: String,
    pub gpu_type: String,
    pub attempts: u32,
}

/// An experiment that was given up on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub experiment: String,
    pub reason: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub submitted: Vec<Submission>,
    pub failed: Vec<Failure>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Submitted(Submission),
    Failed(Failure),
}

/// Owns everything a dispatch run needs; nothing is process-global.
pub struct Dispatcher<C, R> {
    cluster: C,
    config: Config,
    usage: PvcUsageCounter,
    rng: R,
    submitter: SubmitterInfo,
    env: BTreeMap<String, String>,
}

impl<C, R> Dispatcher<C, R>
where
    C: ClusterClient,
    R: Rng,
{
    /// Create a dispatcher, snapshotting the submitting user and the
    /// variables named in `job.forward_env`.
    pub fn new(cluster: C, config: Config, rng: R) -> Self {
        let submitter = SubmitterInfo::detect(config.job.user_email.clone());
        let env = config
            .job
            .forward_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();

        Self {
            cluster,
            config,
            usage: PvcUsageCounter::new(),
            rng,
            submitter,
            env,
        }
    }

    pub fn with_submitter(mut self, submitter: SubmitterInfo) -> Self {
        self.submitter = submitter;
        self
    }

    /// Replace the forwarded environment snapshot
    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn usage(&self) -> &PvcUsageCounter {
        &self.usage
    }

    fn wait_policy(&self) -> WaitPolicy {
        let dispatch = &self.config.dispatch;
        WaitPolicy {
            initial_delay: dispatch.poll_interval(),
            max_delay: dispatch.max_poll_interval(),
            backoff_multiplier: 2.0,
            max_wait: dispatch.max_wait(),
        }
    }

    fn submit_retry(&self) -> RetryConfig {
        let dispatch = &self.config.dispatch;
        let max_attempts = match dispatch.on_submit_failure {
            SubmitFailurePolicy::Retry => dispatch.max_submit_attempts,
            SubmitFailurePolicy::Skip => 1,
        };
        RetryConfig {
            max_attempts,
            initial_delay: dispatch.poll_interval(),
            max_delay: dispatch.max_poll_interval(),
            backoff_multiplier: 2.0,
        }
    }

    /// Submit every experiment in order.
    ///
    /// Cluster query failures and capacity timeouts abort the run; rejected
    /// submissions and invalid manifests end up in [`DispatchReport::failed`].
    pub async fn run(&mut self, experiments: &[Experiment]) -> Result<DispatchReport, DispatchError> {
        if self.config.gpu.requested_types().is_empty() {
            return Err(DispatchError::NoGpuTypes);
        }

        let mut report = DispatchReport::default();
        let total = experiments.len();
        for (index, experiment) in experiments.iter().enumerate() {
            match self.dispatch(experiment).await? {
                Outcome::Submitted(submission) => {
                    info!(
                        experiment = %submission.experiment,
                        pvc = %submission.pvc,
                        gpu_type = %submission.gpu_type,
                        progress = %format!("{}/{total}", index + 1),
                        "Job submitted"
                    );
                    report.submitted.push(submission);
                }
                Outcome::Failed(failure) => {
                    error!(
                        experiment = %failure.experiment,
                        attempts = failure.attempts,
                        reason = %failure.reason,
                        "Giving up on experiment"
                    );
                    report.failed.push(failure);
                }
            }

            if index + 1 < total {
                tokio::time::sleep(self.config.dispatch.submit_delay()).await;
            }
        }

        info!(
            submitted = report.submitted.len(),
            failed = report.failed.len(),
            "Dispatch finished"
        );
        Ok(report)
    }

    async fn dispatch(&mut self, experiment: &Experiment) -> Result<Outcome, DispatchError> {
        let retry = self.submit_retry();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let pvc = self.select_pvc().await?;
            let gpu_type = self.select_gpu().await?;

            let manifest = match self.manifest_for(experiment, &pvc, &gpu_type) {
                Ok(manifest) => manifest,
                Err(e) => {
                    return Ok(Outcome::Failed(Failure {
                        experiment: experiment.name.clone(),
                        reason: e.to_string(),
                        attempts: attempt,
                    }));
                }
            };

            let job_name = manifest.name().to_string();
            match self.cluster.submit_job(&manifest.into_job()).await {
                Ok(()) => {
                    return Ok(Outcome::Submitted(Submission {
                        experiment: experiment.name.clone(),
                        job_name,
                        pvc,
                        gpu_type,
                        attempts: attempt,
                    }));
                }
                Err(e) if retry.exhausted(attempt) => {
                    return Ok(Outcome::Failed(Failure {
                        experiment: experiment.name.clone(),
                        reason: e.to_string(),
                        attempts: attempt,
                    }));
                }
                Err(e) => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        experiment = %experiment.name,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis(),
                        "Submission failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Wait for a free PVC under the concurrency ceiling and take the least used one.
    async fn select_pvc(&mut self) -> Result<String, DispatchError> {
        let policy = self.wait_policy();
        let cluster = &self.cluster;
        let usage = &self.usage;
        let kind = WorkloadKind::from(self.config.dispatch.workload_source);
        let prefix = self.config.pvc.prefix.as_str();
        let max_concurrent = self.config.dispatch.max_concurrent_jobs;

        let (pvc, mut status) = wait_for(&policy, "a free PVC", || async move {
            let status = get_pvc_status(cluster, kind, Some(prefix)).await?;
            if status.in_use.len() >= max_concurrent {
                info!(
                    in_use = status.in_use.len(),
                    max_concurrent, "Concurrency limit reached, waiting"
                );
                return Ok(None);
            }
            let choice = status.least_used(usage).map(String::from);
            if choice.is_none() {
                info!(in_use = status.in_use.len(), "No PVC available, waiting");
            }
            Ok::<_, ClusterError>(choice.map(|pvc| (pvc, status)))
        })
        .await?;

        let times = self.usage.record(&pvc);
        status.claim(&pvc);
        info!(
            pvc = %pvc,
            times_used = times,
            available = status.available.len(),
            in_use = status.in_use.len(),
            "Selected PVC"
        );
        Ok(pvc)
    }

    /// Wait until a requested GPU product has a free slot and pick one at random.
    async fn select_gpu(&mut self) -> Result<String, DispatchError> {
        let policy = self.wait_policy();
        let requested = self.config.gpu.requested_types();
        let capacity = &self.config.gpu.capacity;

        loop {
            let cluster = &self.cluster;
            let requested_ref = &requested;
            let usage = wait_for(&policy, "GPU capacity", || async move {
                let usage = cluster_gpu_usage(cluster).await?;
                if !usage.has_free_slot(requested_ref, capacity) {
                    info!(requested = ?requested_ref, "All requested GPU types are saturated, waiting");
                    return Ok(None);
                }
                Ok::<_, ClusterError>(Some(usage))
            })
            .await?;

            if let Some(gpu_type) = select_gpu_type(&requested, capacity, &usage, &mut self.rng) {
                info!(
                    gpu_type = %gpu_type,
                    remaining = ?usage.remaining(capacity),
                    "Selected GPU type"
                );
                return Ok(gpu_type);
            }
        }
    }

    fn manifest_for(
        &self,
        experiment: &Experiment,
        pvc: &str,
        gpu_type: &str,
    ) -> Result<JobManifest, ManifestError> {
        let job = &self.config.job;
        JobManifest::from_job_config(experiment.job_name(), job, |name| self.env.get(name).cloned())
            .args(vec![experiment.command.clone()])
            .namespace(&self.config.cluster.namespace)
            .gpu(GpuRequest {
                resource: job.gpu_resource.clone(),
                product: gpu_type.to_string(),
                count: job.gpu_limit,
            })
            .volume(VolumeSpec::pvc(&job.volume_name, pvc, &job.mount_path))
            .labels(self.submitter.labels(&job.user_label))
            .annotations(self.submitter.annotations(Utc::now()))
            .annotation("kubejobs/experiment", &experiment.name)
            .annotation("kubejobs/pvc", pvc)
            .build()
    }
}
