//! Access to the Kubernetes API
//!
//! [`ClusterClient`] is the seam the poller, GPU selector and dispatcher are
//! written against. [`KubeCluster`] implements it over `kube::Client`, scoped to
//! a single namespace.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodSpec, Secret};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use strum::{Display, EnumString};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::{ClusterConfig, PvcConfig, WorkloadSource};
use crate::core::user::submitted_by;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to load kubeconfig: {0}")]
    Config(String),

    #[error("{0} manifest has no name")]
    Unnamed(&'static str),

    #[error("submission of '{name}' rejected: {reason}")]
    Rejected { name: String, reason: String },
}

/// Kind of workload object inspected for PVC and GPU usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum WorkloadKind {
    Pod,
    Job,
}

impl From<WorkloadSource> for WorkloadKind {
    fn from(source: WorkloadSource) -> Self {
        match source {
            WorkloadSource::Pods => WorkloadKind::Pod,
            WorkloadSource::Jobs => WorkloadKind::Job,
        }
    }
}

/// The parts of a Pod or Job that PVC and GPU bookkeeping look at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub name: String,
    pub kind: WorkloadKind,
    /// Pod phase, or `Active`/`Complete`/`Failed` for Jobs
    pub phase: String,
    pub claim_names: Vec<String>,
    pub gpu_product: Option<String>,
    pub gpu_count: u32,
    /// User recorded in the submitter annotations
    pub submitted_by: Option<String>,
}

impl Workload {
    /// Whether the workload still holds its volumes
    pub fn is_live(&self) -> bool {
        matches!(self.phase.as_str(), "Pending" | "Running" | "Active")
    }

    pub fn from_pod(pod: &Pod, gpu_resource: &str) -> Self {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string());
        let (claim_names, gpu_product, gpu_count) = pod
            .spec
            .as_ref()
            .map(|spec| inspect_pod_spec(spec, gpu_resource))
            .unwrap_or_default();

        Self {
            name: pod.name_any(),
            kind: WorkloadKind::Pod,
            phase,
            claim_names,
            gpu_product,
            gpu_count,
            submitted_by: submitted_by(pod.annotations()).map(String::from),
        }
    }

    pub fn from_job(job: &Job, gpu_resource: &str) -> Self {
        let (claim_names, gpu_product, gpu_count) = job
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|spec| inspect_pod_spec(spec, gpu_resource))
            .unwrap_or_default();

        Self {
            name: job.name_any(),
            kind: WorkloadKind::Job,
            phase: job_phase(job).to_string(),
            claim_names,
            gpu_product,
            gpu_count,
            submitted_by: submitted_by(job.annotations()).map(String::from),
        }
    }
}

fn job_phase(job: &Job) -> &'static str {
    let finished = |type_: &str| {
        job.status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == type_ && c.status == "True")
            })
            .unwrap_or(false)
    };

    if finished("Complete") {
        "Complete"
    } else if finished("Failed") {
        "Failed"
    } else {
        "Active"
    }
}

/// Node-selector key pinning a workload to one GPU product
pub fn product_selector_key(gpu_resource: &str) -> String {
    format!("{gpu_resource}.product")
}

fn inspect_pod_spec(spec: &PodSpec, gpu_resource: &str) -> (Vec<String>, Option<String>, u32) {
    let claim_names = spec
        .volumes
        .iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|pvc| pvc.claim_name.clone())
        .collect();

    let gpu_product = spec
        .node_selector
        .as_ref()
        .and_then(|selector| selector.get(&product_selector_key(gpu_resource)))
        .cloned();

    let gpu_count = spec
        .containers
        .iter()
        .filter_map(|c| c.resources.as_ref())
        .filter_map(|r| r.limits.as_ref())
        .filter_map(|limits| limits.get(gpu_resource))
        .filter_map(|q| q.0.parse::<u32>().ok())
        .sum();

    (claim_names, gpu_product, gpu_count)
}

/// A PersistentVolumeClaim to create if missing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvcRequest {
    pub name: String,
    pub storage: String,
    pub access_mode: String,
    pub storage_class: Option<String>,
}

impl PvcRequest {
    /// The `<prefix>-<i>` claims described by the PVC settings
    pub fn from_config(pvc: &PvcConfig) -> Vec<Self> {
        (0..pvc.count)
            .map(|i| Self {
                name: format!("{}-{i}", pvc.prefix),
                storage: pvc.storage.clone(),
                access_mode: pvc.access_mode.clone(),
                storage_class: pvc.storage_class.clone(),
            })
            .collect()
    }

    fn to_manifest(&self, namespace: &str) -> serde_json::Value {
        let mut pvc = serde_json::json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": self.name,
                "namespace": namespace,
            },
            "spec": {
                "accessModes": [self.access_mode],
                "resources": {
                    "requests": {
                        "storage": self.storage,
                    }
                },
            }
        });

        // Leaving storageClassName out selects the cluster default
        if let Some(sc) = &self.storage_class {
            pvc["spec"]["storageClassName"] = serde_json::json!(sc);
        }
        pvc
    }
}

/// Kubernetes operations needed by the dispatcher and reports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Names of every PVC in the namespace
    async fn list_pvc_names(&self) -> Result<Vec<String>, ClusterError>;

    /// Every Pod or Job in the namespace, reduced to a [`Workload`]
    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<Workload>, ClusterError>;

    /// Create the PVC if it does not exist yet
    async fn ensure_pvc(&self, pvc: &PvcRequest) -> Result<(), ClusterError>;

    /// Apply a Job manifest
    async fn submit_job(&self, job: &Job) -> Result<(), ClusterError>;

    /// Apply a bare Pod manifest
    async fn submit_pod(&self, pod: &Pod) -> Result<(), ClusterError>;

    /// Create or update a Secret
    async fn apply_secret(&self, secret: &Secret) -> Result<(), ClusterError>;
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeCluster {
    client: Client,
    namespace: String,
    field_manager: String,
    gpu_resource: String,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig or in-cluster service account
    pub async fn connect(cluster: &ClusterConfig, gpu_resource: &str) -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Config(e.to_string()))?;
        Ok(Self::new(client, cluster, gpu_resource))
    }

    pub fn new(client: Client, cluster: &ClusterConfig, gpu_resource: &str) -> Self {
        Self {
            client,
            namespace: cluster.namespace.clone(),
            field_manager: cluster.field_manager.clone(),
            gpu_resource: gpu_resource.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn list_pvc_names(&self) -> Result<Vec<String>, ClusterError> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = pvcs.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(|pvc| pvc.name_any()).collect())
    }

    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<Workload>, ClusterError> {
        let workloads = match kind {
            WorkloadKind::Pod => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                pods.list(&ListParams::default())
                    .await?
                    .items
                    .iter()
                    .map(|pod| Workload::from_pod(pod, &self.gpu_resource))
                    .collect()
            }
            WorkloadKind::Job => {
                let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
                jobs.list(&ListParams::default())
                    .await?
                    .items
                    .iter()
                    .map(|job| Workload::from_job(job, &self.gpu_resource))
                    .collect()
            }
        };
        Ok(workloads)
    }

    async fn ensure_pvc(&self, pvc: &PvcRequest) -> Result<(), ClusterError> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &self.namespace);
        if pvcs.get_opt(&pvc.name).await?.is_some() {
            debug!(pvc = %pvc.name, "PVC already exists");
            return Ok(());
        }

        let manifest = pvc.to_manifest(&self.namespace);
        pvcs.patch(&pvc.name, &self.apply_params(), &Patch::Apply(&manifest))
            .await?;
        debug!(pvc = %pvc.name, storage = %pvc.storage, "PVC created via SSA");
        Ok(())
    }

    async fn submit_job(&self, job: &Job) -> Result<(), ClusterError> {
        let name = job.metadata.name.clone().ok_or(ClusterError::Unnamed("Job"))?;
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &self.namespace);
        jobs.patch(&name, &self.apply_params(), &Patch::Apply(job))
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) => ClusterError::Rejected {
                    name: name.clone(),
                    reason: resp.message,
                },
                other => ClusterError::Kube(other),
            })?;
        debug!(job = %name, namespace = %self.namespace, "Job applied");
        Ok(())
    }

    async fn submit_pod(&self, pod: &Pod) -> Result<(), ClusterError> {
        let name = pod.metadata.name.clone().ok_or(ClusterError::Unnamed("Pod"))?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        pods.patch(&name, &self.apply_params(), &Patch::Apply(pod))
            .await
            .map_err(|e| match e {
                kube::Error::Api(resp) => ClusterError::Rejected {
                    name: name.clone(),
                    reason: resp.message,
                },
                other => ClusterError::Kube(other),
            })?;
        debug!(pod = %name, namespace = %self.namespace, "Pod applied");
        Ok(())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), ClusterError> {
        let name = secret.metadata.name.clone().ok_or(ClusterError::Unnamed("Secret"))?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        secrets
            .patch(&name, &self.apply_params(), &Patch::Apply(secret))
            .await?;
        debug!(secret = %name, namespace = %self.namespace, "Secret applied via SSA");
        Ok(())
    }
}

/// Claim name → names of live workloads mounting it
pub fn claims_in_use(workloads: &[Workload]) -> BTreeMap<String, Vec<String>> {
    let mut claims: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for workload in workloads.iter().filter(|w| w.is_live()) {
        for claim in &workload.claim_names {
            claims
                .entry(claim.clone())
                .or_default()
                .push(workload.name.clone());
        }
    }
    claims
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobSpec, JobStatus};
    use k8s_openapi::api::core::v1::{
        Container, PersistentVolumeClaimVolumeSource, PodStatus, PodTemplateSpec,
        ResourceRequirements, Volume,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn gpu_pod_spec(claim: &str, product: &str, gpus: &str) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        "nvidia.com/gpu".to_string(),
                        Quantity(gpus.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            node_selector: Some(BTreeMap::from([(
                "nvidia.com/gpu.product".to_string(),
                product.to_string(),
            )])),
            volumes: Some(vec![Volume {
                name: "disk".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    #[test]
    fn test_workload_from_pod() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("exp-1-abcde".to_string()),
                annotations: Some(BTreeMap::from([(
                    "username".to_string(),
                    "s1234567".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(gpu_pod_spec("gate-pvc-3", "NVIDIA-A100-SXM4-80GB", "2")),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };

        let workload = Workload::from_pod(&pod, "nvidia.com/gpu");
        assert_eq!(workload.name, "exp-1-abcde");
        assert_eq!(workload.kind, WorkloadKind::Pod);
        assert_eq!(workload.claim_names, vec!["gate-pvc-3".to_string()]);
        assert_eq!(workload.gpu_product.as_deref(), Some("NVIDIA-A100-SXM4-80GB"));
        assert_eq!(workload.gpu_count, 2);
        assert_eq!(workload.submitted_by.as_deref(), Some("s1234567"));
        assert!(workload.is_live());
    }

    #[test]
    fn test_workload_from_pod_with_other_gpu_resource() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                ..Default::default()
            },
            spec: Some(gpu_pod_spec("c", "X", "1")),
            status: None,
        };

        let workload = Workload::from_pod(&pod, "amd.com/gpu");
        assert_eq!(workload.gpu_product, None);
        assert_eq!(workload.gpu_count, 0);
        assert_eq!(workload.phase, "Unknown");
        assert!(!workload.is_live());
    }

    #[test]
    fn test_workload_from_finished_job() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("exp-2".to_string()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: None,
                    spec: Some(gpu_pod_spec("gate-pvc-0", "X", "1")),
                },
                ..Default::default()
            }),
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Complete".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        };

        let workload = Workload::from_job(&job, "nvidia.com/gpu");
        assert_eq!(workload.phase, "Complete");
        assert!(!workload.is_live());
        assert_eq!(workload.claim_names, vec!["gate-pvc-0".to_string()]);
    }

    #[test]
    fn test_job_without_status_is_active() {
        let job = Job {
            metadata: ObjectMeta {
                name: Some("exp-3".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let workload = Workload::from_job(&job, "nvidia.com/gpu");
        assert_eq!(workload.phase, "Active");
        assert!(workload.is_live());
    }

    #[test]
    fn test_claims_in_use_ignores_finished_workloads() {
        let live = Workload {
            name: "a".to_string(),
            kind: WorkloadKind::Pod,
            phase: "Running".to_string(),
            claim_names: vec!["p0".to_string()],
            gpu_product: None,
            gpu_count: 0,
            submitted_by: None,
        };
        let done = Workload {
            name: "b".to_string(),
            phase: "Succeeded".to_string(),
            claim_names: vec!["p1".to_string()],
            ..live.clone()
        };

        let claims = claims_in_use(&[live, done]);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims["p0"], vec!["a".to_string()]);
    }

    #[test]
    fn test_pvc_requests_from_config() {
        let config = PvcConfig {
            prefix: "gate-pvc".to_string(),
            count: 3,
            storage: "2Ti".to_string(),
            access_mode: "ReadWriteOnce".to_string(),
            storage_class: None,
        };
        let requests = PvcRequest::from_config(&config);
        let names: Vec<_> = requests.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["gate-pvc-0", "gate-pvc-1", "gate-pvc-2"]);
    }

    #[test]
    fn test_pvc_manifest_omits_unset_storage_class() {
        let request = PvcRequest {
            name: "gate-pvc-0".to_string(),
            storage: "4Ti".to_string(),
            access_mode: "ReadWriteOnce".to_string(),
            storage_class: None,
        };
        let manifest = request.to_manifest("default");
        assert!(manifest["spec"].get("storageClassName").is_none());
        assert_eq!(manifest["spec"]["resources"]["requests"]["storage"], "4Ti");

        let with_class = PvcRequest {
            storage_class: Some("csi-rbd-sc".to_string()),
            ..request
        };
        assert_eq!(
            with_class.to_manifest("default")["spec"]["storageClassName"],
            "csi-rbd-sc"
        );
    }
}
