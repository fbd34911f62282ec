use crate::core::get_config_dir;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub pvc: PvcConfig,
    #[serde(default)]
    pub gpu: GpuConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    /// Namespace every query and submission is scoped to
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Field manager name used for server-side apply
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            field_manager: default_field_manager(),
        }
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_field_manager() -> String {
    "kubejobs".to_string()
}

/// A container env var sourced from a Kubernetes secret
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SecretEnvRef {
    pub secret_name: String,
    pub key: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct JobConfig {
    #[serde(default = "default_image")]
    pub image: String,
    /// Entrypoint; the experiment command is passed as its only argument
    #[serde(default = "default_entrypoint")]
    pub entrypoint: Vec<String>,
    /// Extended resource name GPUs are requested under
    #[serde(default = "default_gpu_resource")]
    pub gpu_resource: String,
    #[serde(default = "default_gpu_limit")]
    pub gpu_limit: u32,
    /// Pod restart policy, `Never` or `OnFailure`
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit: i32,
    /// Max runtime of each job in seconds (None = unlimited)
    #[serde(default = "default_active_deadline_seconds")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default = "default_cpu_request")]
    pub cpu_request: Option<String>,
    #[serde(default = "default_memory_request")]
    pub memory_request: Option<String>,
    /// Size of the memory-backed `/dev/shm` (defaults to the memory request)
    #[serde(default)]
    pub shm_size: Option<String>,
    /// Volume name the selected PVC is mounted under
    #[serde(default = "default_volume_name")]
    pub volume_name: String,
    #[serde(default = "default_mount_path")]
    pub mount_path: String,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
    /// Names of variables copied from the submitting environment
    #[serde(default = "default_forward_env")]
    pub forward_env: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub secret_env: BTreeMap<String, SecretEnvRef>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Label key carrying the submitting user's name
    #[serde(default = "default_user_label")]
    pub user_label: String,
    #[serde(default)]
    pub user_email: Option<String>,
    /// Kueue queue to label jobs with
    #[serde(default)]
    pub queue_name: Option<String>,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            entrypoint: default_entrypoint(),
            gpu_resource: default_gpu_resource(),
            gpu_limit: default_gpu_limit(),
            restart_policy: default_restart_policy(),
            backoff_limit: default_backoff_limit(),
            active_deadline_seconds: default_active_deadline_seconds(),
            cpu_request: default_cpu_request(),
            memory_request: default_memory_request(),
            shm_size: None,
            volume_name: default_volume_name(),
            mount_path: default_mount_path(),
            image_pull_secret: None,
            forward_env: default_forward_env(),
            env: BTreeMap::new(),
            secret_env: BTreeMap::new(),
            labels: BTreeMap::new(),
            user_label: default_user_label(),
            user_email: None,
            queue_name: None,
        }
    }
}

fn default_image() -> String {
    "ghcr.io/antreasantoniou/gate:latest".to_string()
}

fn default_entrypoint() -> Vec<String> {
    vec!["/bin/bash".to_string(), "-c".to_string(), "--".to_string()]
}

fn default_gpu_resource() -> String {
    "nvidia.com/gpu".to_string()
}

fn default_gpu_limit() -> u32 {
    1
}

fn default_restart_policy() -> String {
    "Never".to_string()
}

fn default_backoff_limit() -> i32 {
    4
}

fn default_active_deadline_seconds() -> Option<i64> {
    Some(7200)
}

fn default_cpu_request() -> Option<String> {
    Some("16".to_string())
}

fn default_memory_request() -> Option<String> {
    Some("80G".to_string())
}

fn default_volume_name() -> String {
    "gate-disk".to_string()
}

fn default_mount_path() -> String {
    "/data/".to_string()
}

fn default_user_label() -> String {
    "eidf/user".to_string()
}

fn default_forward_env() -> Vec<String> {
    [
        "NEPTUNE_API_TOKEN",
        "NEPTUNE_PROJECT",
        "NEPTUNE_ALLOW_SELF_SIGNED_CERTIFICATE",
        "WANDB_API_KEY",
        "WANDB_ENTITY",
        "WANDB_PROJECT",
        "KAGGLE_USERNAME",
        "KAGGLE_KEY",
        "HF_USERNAME",
        "HF_TOKEN",
        "HF_CACHE_DIR",
        "PYTEST_DIR",
        "TOKENIZERS_PARALLELISM",
        "CODE_DIR",
        "PROJECT_DIR",
        "EXPERIMENT_NAME",
        "EXPERIMENT_NAME_PREFIX",
        "EXPERIMENTS_DIR",
        "EXPERIMENT_DIR",
        "DATASET_DIR",
        "MODEL_DIR",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

#[derive(Deserialize, Debug, Clone)]
pub struct PvcConfig {
    /// PVCs are named `<prefix>-<index>`; status polls only look at names containing it
    #[serde(default = "default_pvc_prefix")]
    pub prefix: String,
    #[serde(default = "default_pvc_count")]
    pub count: u32,
    #[serde(default = "default_pvc_storage")]
    pub storage: String,
    #[serde(default = "default_pvc_access_mode")]
    pub access_mode: String,
    #[serde(default)]
    pub storage_class: Option<String>,
}

impl Default for PvcConfig {
    fn default() -> Self {
        Self {
            prefix: default_pvc_prefix(),
            count: default_pvc_count(),
            storage: default_pvc_storage(),
            access_mode: default_pvc_access_mode(),
            storage_class: None,
        }
    }
}

fn default_pvc_prefix() -> String {
    "gate-pvc".to_string()
}

fn default_pvc_count() -> u32 {
    50
}

fn default_pvc_storage() -> String {
    "4Ti".to_string()
}

fn default_pvc_access_mode() -> String {
    "ReadWriteOnce".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct GpuConfig {
    /// Total slots per GPU product in the cluster
    #[serde(default = "default_gpu_capacity")]
    pub capacity: BTreeMap<String, u32>,
    /// Products the dispatcher may pick from (empty = every product in `capacity`)
    #[serde(default = "default_gpu_types")]
    pub types: Vec<String>,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            capacity: default_gpu_capacity(),
            types: default_gpu_types(),
        }
    }
}

fn default_gpu_capacity() -> BTreeMap<String, u32> {
    BTreeMap::from([
        ("NVIDIA-A100-SXM4-80GB".to_string(), 32),
        ("NVIDIA-A100-SXM4-40GB".to_string(), 88),
        ("NVIDIA-A100-SXM4-40GB-MIG-3g.20gb".to_string(), 28),
        ("NVIDIA-A100-SXM4-40GB-MIG-1g.5gb".to_string(), 140),
    ])
}

fn default_gpu_types() -> Vec<String> {
    vec![
        "NVIDIA-A100-SXM4-80GB".to_string(),
        "NVIDIA-A100-SXM4-40GB".to_string(),
    ]
}

impl GpuConfig {
    /// Products the dispatcher is allowed to request
    pub fn requested_types(&self) -> Vec<String> {
        if self.types.is_empty() {
            self.capacity.keys().cloned().collect()
        } else {
            self.types.clone()
        }
    }
}

/// Which workload objects the PVC poller inspects for claim usage
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadSource {
    #[default]
    Pods,
    Jobs,
}

/// What the dispatcher does after a rejected submission
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubmitFailurePolicy {
    /// Retry the same experiment before moving on
    #[default]
    Retry,
    /// Log and move on to the next experiment
    Skip,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DispatchConfig {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default)]
    pub workload_source: WorkloadSource,
    /// First delay between capacity polls, in seconds
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound of the backoff between capacity polls, in seconds
    #[serde(default = "default_max_poll_interval_secs")]
    pub max_poll_interval_secs: u64,
    /// Give up waiting for a PVC or GPU after this many seconds (0 = never)
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Delay between consecutive submissions, in seconds
    #[serde(default = "default_submit_delay_secs")]
    pub submit_delay_secs: u64,
    #[serde(default)]
    pub on_submit_failure: SubmitFailurePolicy,
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            workload_source: WorkloadSource::default(),
            poll_interval_secs: default_poll_interval_secs(),
            max_poll_interval_secs: default_max_poll_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
            submit_delay_secs: default_submit_delay_secs(),
            on_submit_failure: SubmitFailurePolicy::default(),
            max_submit_attempts: default_max_submit_attempts(),
        }
    }
}

fn default_max_concurrent_jobs() -> usize {
    10
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_max_poll_interval_secs() -> u64 {
    60
}

fn default_max_wait_secs() -> u64 {
    24 * 60 * 60
}

fn default_submit_delay_secs() -> u64 {
    2
}

fn default_max_submit_attempts() -> u32 {
    3
}

/// Floor for the capacity poll interval so the API server is never polled in a tight loop
const MIN_POLL_INTERVAL_SECS: u64 = 1;

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs).max(self.poll_interval())
    }

    pub fn max_wait(&self) -> Option<Duration> {
        (self.max_wait_secs > 0).then(|| Duration::from_secs(self.max_wait_secs))
    }

    pub fn submit_delay(&self) -> Duration {
        Duration::from_secs(self.submit_delay_secs)
    }
}

pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut config_vec = vec![];

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found.");
        }
    }

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("kubejobs.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    // Later sources win, so the explicit file goes last
    let settings = config::Config::builder();
    let settings = config_vec.iter().rev().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("KUBEJOBS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("job.entrypoint")
                .with_list_parse_key("job.forward_env")
                .with_list_parse_key("gpu.types"),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_any_source() {
        let config = Config::default();
        assert_eq!(config.cluster.namespace, "default");
        assert_eq!(config.job.gpu_resource, "nvidia.com/gpu");
        assert_eq!(config.job.mount_path, "/data/");
        assert_eq!(config.pvc.prefix, "gate-pvc");
        assert_eq!(config.dispatch.max_concurrent_jobs, 10);
        assert_eq!(config.dispatch.submit_delay(), Duration::from_secs(2));
        assert_eq!(config.gpu.capacity["NVIDIA-A100-SXM4-40GB"], 88);
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[cluster]
namespace = "informatics"

[pvc]
count = 4
storage = "2Ti"

[gpu]
types = ["X"]

[gpu.capacity]
X = 1

[dispatch]
max_concurrent_jobs = 3
on_submit_failure = "skip"
workload_source = "jobs"
"#
        )
        .unwrap();

        let path = file.path().to_path_buf();
        let config = load_config(Some(&path)).unwrap();

        assert_eq!(config.cluster.namespace, "informatics");
        assert_eq!(config.pvc.count, 4);
        assert_eq!(config.pvc.storage, "2Ti");
        assert_eq!(config.pvc.prefix, "gate-pvc");
        assert_eq!(config.gpu.capacity, BTreeMap::from([("X".to_string(), 1)]));
        assert_eq!(config.gpu.requested_types(), vec!["X".to_string()]);
        assert_eq!(config.dispatch.max_concurrent_jobs, 3);
        assert_eq!(config.dispatch.on_submit_failure, SubmitFailurePolicy::Skip);
        assert_eq!(config.dispatch.workload_source, WorkloadSource::Jobs);
    }

    #[test]
    fn test_requested_types_fall_back_to_capacity_table() {
        let gpu = GpuConfig {
            capacity: BTreeMap::from([("A".to_string(), 2), ("B".to_string(), 1)]),
            types: vec![],
        };
        assert_eq!(gpu.requested_types(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_max_wait_zero_means_unbounded() {
        let dispatch = DispatchConfig {
            max_wait_secs: 0,
            ..Default::default()
        };
        assert_eq!(dispatch.max_wait(), None);
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let dispatch = DispatchConfig {
            poll_interval_secs: 0,
            max_poll_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(dispatch.poll_interval(), Duration::from_secs(1));
        assert_eq!(dispatch.max_poll_interval(), Duration::from_secs(1));
    }
}
