//! Typed Job and Pod manifests
//!
//! [`JobManifest::builder`] collects everything a GPU experiment needs and
//! [`JobManifestBuilder::build`] validates it before anything is serialized,
//! so a manifest that reaches the API server is at least well formed.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, LocalObjectReference,
    NFSVolumeSource, ObjectFieldSelector, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretKeySelector, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;

use crate::cluster::product_selector_key;
use crate::config::JobConfig;

static DNS_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));

const MAX_NAME_LEN: usize = 63;
const SHM_VOLUME: &str = "dshm";
const SHM_PATH: &str = "/dev/shm";
const KUEUE_QUEUE_LABEL: &str = "kueue.x-k8s.io/queue-name";

/// Lowercase DNS-1123 label of at most 63 characters
pub fn is_dns1123_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && DNS_LABEL.is_match(name)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("invalid name '{0}': must be a lowercase DNS-1123 label of at most 63 characters")]
    InvalidName(String),

    #[error("container image must not be empty")]
    EmptyImage,

    #[error("{count} GPU(s) requested without a product or resource name")]
    GpuWithoutProduct { count: u32 },

    #[error("volume '{0}' is defined more than once")]
    DuplicateVolume(String),

    #[error("volume name 'dshm' is reserved for shared memory")]
    ReservedVolume,

    #[error("mount path '{path}' of volume '{volume}' is not absolute")]
    RelativeMountPath { volume: String, path: String },

    #[error("NFS volume '{0}' needs both a server and a path")]
    IncompleteNfs(String),

    #[error("restart policy '{0}' is not one of Never, OnFailure")]
    InvalidRestartPolicy(String),

    #[error("failed to render YAML: {0}")]
    Yaml(String),
}

/// GPUs to request and the product to pin the workload to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuRequest {
    /// Extended resource name, e.g. `nvidia.com/gpu`
    pub resource: String,
    /// Value of the `<resource>.product` node label
    pub product: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    Pvc { claim_name: String },
    EmptyDir,
    Nfs { server: String, path: String },
}

/// A volume together with where the container mounts it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
    pub mount_path: String,
}

impl VolumeSpec {
    pub fn pvc(name: impl Into<String>, claim_name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::Pvc {
                claim_name: claim_name.into(),
            },
            mount_path: mount_path.into(),
        }
    }

    pub fn nfs(
        name: impl Into<String>,
        server: impl Into<String>,
        path: impl Into<String>,
        mount_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::Nfs {
                server: server.into(),
                path: path.into(),
            },
            mount_path: mount_path.into(),
        }
    }

    pub fn empty_dir(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::EmptyDir,
            mount_path: mount_path.into(),
        }
    }

    fn to_volume(&self) -> Volume {
        let mut volume = Volume {
            name: self.name.clone(),
            ..Default::default()
        };
        match &self.source {
            VolumeSource::Pvc { claim_name } => {
                volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.clone(),
                    read_only: None,
                });
            }
            VolumeSource::EmptyDir => {
                volume.empty_dir = Some(EmptyDirVolumeSource::default());
            }
            VolumeSource::Nfs { server, path } => {
                volume.nfs = Some(NFSVolumeSource {
                    server: server.clone(),
                    path: path.clone(),
                    read_only: None,
                });
            }
        }
        volume
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvValue {
    Plain(String),
    Secret { secret_name: String, key: String },
}

/// A validated Job or Pod description, ready to render
#[derive(Debug, Clone)]
pub struct JobManifest {
    name: String,
    image: String,
    command: Vec<String>,
    args: Vec<String>,
    cpu: Option<String>,
    memory: Option<String>,
    gpu: Option<GpuRequest>,
    shm_size: Option<String>,
    env: Vec<(String, EnvValue)>,
    volumes: Vec<VolumeSpec>,
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    namespace: Option<String>,
    backoff_limit: i32,
    active_deadline_seconds: Option<i64>,
    restart_policy: String,
    image_pull_secret: Option<String>,
    privileged: bool,
}

#[derive(Debug, Clone)]
pub struct JobManifestBuilder {
    manifest: JobManifest,
    shm_explicit: bool,
}

impl JobManifest {
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> JobManifestBuilder {
        JobManifestBuilder::new(name.into(), image.into())
    }

    /// Builder pre-filled from the `[job]` settings.
    ///
    /// `lookup` resolves the names in `forward_env`; unset ones are skipped.
    pub fn from_job_config(
        name: impl Into<String>,
        job: &JobConfig,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> JobManifestBuilder {
        let mut builder = Self::builder(name, job.image.clone())
            .command(job.entrypoint.clone())
            .restart_policy(&job.restart_policy)
            .backoff_limit(job.backoff_limit)
            .active_deadline_seconds(job.active_deadline_seconds)
            .labels(job.labels.clone());

        if let Some(cpu) = &job.cpu_request {
            builder = builder.cpu(cpu);
        }
        if let Some(memory) = &job.memory_request {
            builder = builder.memory(memory);
        }
        if let Some(shm) = &job.shm_size {
            builder = builder.shm_size(shm);
        }
        if let Some(secret) = &job.image_pull_secret {
            builder = builder.image_pull_secret(secret);
        }
        if let Some(queue) = &job.queue_name {
            builder = builder.label(KUEUE_QUEUE_LABEL, queue);
        }
        for name in &job.forward_env {
            if let Some(value) = lookup(name) {
                builder = builder.env(name, value);
            }
        }
        for (name, value) in &job.env {
            builder = builder.env(name, value);
        }
        for (name, secret) in &job.secret_env {
            builder = builder.secret_env(name, &secret.secret_name, &secret.key);
        }
        builder
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gpu(&self) -> Option<&GpuRequest> {
        self.gpu.as_ref()
    }

    /// Claim names of every PVC volume
    pub fn claim_names(&self) -> Vec<&str> {
        self.volumes
            .iter()
            .filter_map(|v| match &v.source {
                VolumeSource::Pvc { claim_name } => Some(claim_name.as_str()),
                _ => None,
            })
            .collect()
    }

    fn metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            annotations: (!self.annotations.is_empty()).then(|| self.annotations.clone()),
            ..Default::default()
        }
    }

    fn resources(&self) -> ResourceRequirements {
        let mut quantities = BTreeMap::new();
        if let Some(cpu) = &self.cpu {
            quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
        }
        if let Some(memory) = &self.memory {
            quantities.insert("memory".to_string(), Quantity(memory.clone()));
        }

        let mut limits = quantities.clone();
        if let Some(gpu) = self.gpu.as_ref().filter(|g| g.count > 0) {
            limits.insert(gpu.resource.clone(), Quantity(gpu.count.to_string()));
        }

        ResourceRequirements {
            requests: (!quantities.is_empty()).then_some(quantities),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        }
    }

    fn env_vars(&self) -> Vec<EnvVar> {
        let mut vars: Vec<EnvVar> = self
            .env
            .iter()
            .map(|(name, value)| match value {
                EnvValue::Plain(value) => EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    value_from: None,
                },
                EnvValue::Secret { secret_name, key } => EnvVar {
                    name: name.clone(),
                    value: None,
                    value_from: Some(EnvVarSource {
                        secret_key_ref: Some(SecretKeySelector {
                            name: secret_name.clone(),
                            key: key.clone(),
                            optional: None,
                        }),
                        ..Default::default()
                    }),
                },
            })
            .collect();

        vars.push(EnvVar {
            name: "POD_NAME".to_string(),
            value: None,
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    api_version: None,
                    field_path: "metadata.name".to_string(),
                }),
                ..Default::default()
            }),
        });
        vars
    }

    fn pod_spec(&self) -> PodSpec {
        let mut mounts = Vec::new();
        let mut volumes = Vec::new();

        if let Some(shm) = &self.shm_size {
            mounts.push(VolumeMount {
                name: SHM_VOLUME.to_string(),
                mount_path: SHM_PATH.to_string(),
                ..Default::default()
            });
            volumes.push(Volume {
                name: SHM_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    size_limit: Some(Quantity(shm.clone())),
                }),
                ..Default::default()
            });
        }
        for spec in &self.volumes {
            mounts.push(VolumeMount {
                name: spec.name.clone(),
                mount_path: spec.mount_path.clone(),
                ..Default::default()
            });
            volumes.push(spec.to_volume());
        }

        let container = Container {
            name: self.name.clone(),
            image: Some(self.image.clone()),
            image_pull_policy: Some("Always".to_string()),
            command: (!self.command.is_empty()).then(|| self.command.clone()),
            args: (!self.args.is_empty()).then(|| self.args.clone()),
            resources: Some(self.resources()),
            env: Some(self.env_vars()),
            volume_mounts: (!mounts.is_empty()).then_some(mounts),
            security_context: self.privileged.then(|| SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let node_selector = self
            .gpu
            .as_ref()
            .filter(|g| g.count > 0)
            .map(|g| BTreeMap::from([(product_selector_key(&g.resource), g.product.clone())]));

        PodSpec {
            containers: vec![container],
            restart_policy: Some(self.restart_policy.clone()),
            node_selector,
            volumes: (!volumes.is_empty()).then_some(volumes),
            image_pull_secrets: self.image_pull_secret.as_ref().map(|name| {
                vec![LocalObjectReference { name: name.clone() }]
            }),
            ..Default::default()
        }
    }

    pub fn into_job(self) -> Job {
        let metadata = self.metadata();
        Job {
            metadata: metadata.clone(),
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: metadata.labels,
                        annotations: metadata.annotations,
                        ..Default::default()
                    }),
                    spec: Some(self.pod_spec()),
                },
                backoff_limit: Some(self.backoff_limit),
                active_deadline_seconds: self.active_deadline_seconds,
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn into_pod(self) -> Pod {
        Pod {
            metadata: self.metadata(),
            spec: Some(self.pod_spec()),
            status: None,
        }
    }

    /// Render the `batch/v1` Job as YAML
    pub fn to_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml::to_string(&self.clone().into_job()).map_err(|e| ManifestError::Yaml(e.to_string()))
    }

    /// Render the bare Pod as YAML
    pub fn to_pod_yaml(&self) -> Result<String, ManifestError> {
        serde_yaml::to_string(&self.clone().into_pod()).map_err(|e| ManifestError::Yaml(e.to_string()))
    }
}

impl JobManifestBuilder {
    fn new(name: String, image: String) -> Self {
        Self {
            manifest: JobManifest {
                name,
                image,
                command: Vec::new(),
                args: Vec::new(),
                cpu: None,
                memory: None,
                gpu: None,
                shm_size: None,
                env: Vec::new(),
                volumes: Vec::new(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                namespace: None,
                backoff_limit: 0,
                active_deadline_seconds: None,
                restart_policy: "Never".to_string(),
                image_pull_secret: None,
                privileged: false,
            },
            shm_explicit: false,
        }
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.manifest.image = image.into();
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.manifest.command = command;
        self
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.manifest.args = args;
        self
    }

    pub fn cpu(mut self, cpu: impl Into<String>) -> Self {
        self.manifest.cpu = Some(cpu.into());
        self
    }

    pub fn memory(mut self, memory: impl Into<String>) -> Self {
        self.manifest.memory = Some(memory.into());
        self
    }

    pub fn gpu(mut self, gpu: GpuRequest) -> Self {
        self.manifest.gpu = Some(gpu);
        self
    }

    pub fn shm_size(mut self, size: impl Into<String>) -> Self {
        self.manifest.shm_size = Some(size.into());
        self.shm_explicit = true;
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_env(name.into(), EnvValue::Plain(value.into()));
        self
    }

    pub fn secret_env(
        mut self,
        name: impl Into<String>,
        secret_name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        self.set_env(
            name.into(),
            EnvValue::Secret {
                secret_name: secret_name.into(),
                key: key.into(),
            },
        );
        self
    }

    // Later definitions of a variable replace earlier ones in place
    fn set_env(&mut self, name: String, value: EnvValue) {
        match self.manifest.env.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.manifest.env.push((name, value)),
        }
    }

    pub fn volume(mut self, volume: VolumeSpec) -> Self {
        self.manifest.volumes.push(volume);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.labels.insert(key.into(), value.into());
        self
    }

    pub fn labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.manifest.labels.extend(labels);
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.manifest.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotations(mut self, annotations: BTreeMap<String, String>) -> Self {
        self.manifest.annotations.extend(annotations);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.manifest.namespace = Some(namespace.into());
        self
    }

    pub fn backoff_limit(mut self, limit: i32) -> Self {
        self.manifest.backoff_limit = limit;
        self
    }

    pub fn active_deadline_seconds(mut self, seconds: Option<i64>) -> Self {
        self.manifest.active_deadline_seconds = seconds;
        self
    }

    pub fn restart_policy(mut self, policy: impl Into<String>) -> Self {
        self.manifest.restart_policy = policy.into();
        self
    }

    pub fn image_pull_secret(mut self, secret: impl Into<String>) -> Self {
        self.manifest.image_pull_secret = Some(secret.into());
        self
    }

    pub fn privileged(mut self, privileged: bool) -> Self {
        self.manifest.privileged = privileged;
        self
    }

    pub fn build(self) -> Result<JobManifest, ManifestError> {
        let mut manifest = self.manifest;

        if !is_dns1123_name(&manifest.name) {
            return Err(ManifestError::InvalidName(manifest.name));
        }
        if manifest.image.trim().is_empty() {
            return Err(ManifestError::EmptyImage);
        }
        if !matches!(manifest.restart_policy.as_str(), "Never" | "OnFailure") {
            return Err(ManifestError::InvalidRestartPolicy(manifest.restart_policy));
        }
        if let Some(gpu) = &manifest.gpu {
            if gpu.count > 0 && (gpu.product.is_empty() || gpu.resource.is_empty()) {
                return Err(ManifestError::GpuWithoutProduct { count: gpu.count });
            }
        }

        if !self.shm_explicit {
            manifest.shm_size = manifest.memory.clone();
        }

        let mut seen = HashSet::new();
        for volume in &manifest.volumes {
            if volume.name == SHM_VOLUME && manifest.shm_size.is_some() {
                return Err(ManifestError::ReservedVolume);
            }
            if !seen.insert(volume.name.as_str()) {
                return Err(ManifestError::DuplicateVolume(volume.name.clone()));
            }
            if !volume.mount_path.starts_with('/') {
                return Err(ManifestError::RelativeMountPath {
                    volume: volume.name.clone(),
                    path: volume.mount_path.clone(),
                });
            }
            if let VolumeSource::Nfs { server, path } = &volume.source {
                if server.is_empty() || path.is_empty() {
                    return Err(ManifestError::IncompleteNfs(volume.name.clone()));
                }
            }
        }

        Ok(manifest)
    }
}
