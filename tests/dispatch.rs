//! Drives the dispatcher against an in-memory cluster whose jobs finish over time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kubejobs::cluster::{ClusterClient, ClusterError, PvcRequest, Workload, WorkloadKind};
use kubejobs::config::{Config, WorkloadSource};
use kubejobs::core::dispatcher::{DispatchError, Dispatcher};
use kubejobs::core::experiment::parse_commands_input;
use kubejobs::core::pvc::ensure_pvcs;
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Default)]
struct State {
    pvcs: Vec<String>,
    workloads: Vec<Workload>,
    submitted: Vec<(String, String)>,
    max_running: usize,
    double_bookings: Vec<String>,
}

#[derive(Clone, Default)]
struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    fn running(state: &State) -> impl Iterator<Item = &Workload> {
        state.workloads.iter().filter(|w| w.is_live())
    }

    /// Mark the oldest live workload as finished
    fn finish_oldest(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(workload) = state.workloads.iter_mut().find(|w| w.is_live()) {
            workload.phase = match workload.kind {
                WorkloadKind::Pod => "Succeeded".to_string(),
                WorkloadKind::Job => "Complete".to_string(),
            };
        }
    }

    fn hold(&self, name: &str, kind: WorkloadKind, claim: &str) {
        self.state.lock().unwrap().workloads.push(Workload {
            name: name.to_string(),
            kind,
            phase: match kind {
                WorkloadKind::Pod => "Running".to_string(),
                WorkloadKind::Job => "Active".to_string(),
            },
            claim_names: vec![claim.to_string()],
            gpu_product: None,
            gpu_count: 0,
            submitted_by: None,
        });
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_pvc_names(&self) -> Result<Vec<String>, ClusterError> {
        Ok(self.state.lock().unwrap().pvcs.clone())
    }

    async fn list_workloads(&self, kind: WorkloadKind) -> Result<Vec<Workload>, ClusterError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workloads
            .iter()
            .filter(|w| w.kind == kind)
            .cloned()
            .collect())
    }

    async fn ensure_pvc(&self, pvc: &PvcRequest) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        if !state.pvcs.contains(&pvc.name) {
            state.pvcs.push(pvc.name.clone());
        }
        Ok(())
    }

    async fn submit_job(&self, job: &Job) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap();
        let mut pod = Workload::from_job(job, "nvidia.com/gpu");

        for claim in &pod.claim_names {
            let held = Self::running(&state).any(|w| w.claim_names.contains(claim));
            if held {
                state.double_bookings.push(claim.clone());
            }
        }

        // the job's pod starts right away
        pod.kind = WorkloadKind::Pod;
        pod.phase = "Running".to_string();
        let claim = pod.claim_names.first().cloned().unwrap_or_default();
        state.submitted.push((pod.name.clone(), claim));
        state.workloads.push(pod);

        let running = Self::running(&state).count();
        state.max_running = state.max_running.max(running);
        Ok(())
    }

    async fn submit_pod(&self, _pod: &Pod) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn apply_secret(&self, _secret: &Secret) -> Result<(), ClusterError> {
        Ok(())
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.pvc.count = 3;
    config.gpu.capacity = BTreeMap::from([("NVIDIA-A100-SXM4-80GB".to_string(), 8)]);
    config.gpu.types = vec![];
    config.job.forward_env = vec![];
    config.dispatch.max_concurrent_jobs = 2;
    config.dispatch.poll_interval_secs = 5;
    config.dispatch.max_poll_interval_secs = 20;
    config.dispatch.max_wait_secs = 3600;
    config
}

#[tokio::test(start_paused = true)]
async fn test_dispatch_respects_concurrency_and_pvc_exclusivity() {
    let cluster = FakeCluster::default();
    let config = config();
    ensure_pvcs(&cluster, &config.pvc).await.unwrap();

    let finisher = cluster.clone();
    let ticker = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            finisher.finish_oldest();
        }
    });

    let experiments = parse_commands_input(
        "python train.py --seed 1\npython train.py --seed 2\npython train.py --seed 3\n\
         python train.py --seed 4\npython train.py --seed 5\n",
    )
    .unwrap();

    let mut dispatcher = Dispatcher::new(cluster.clone(), config, StdRng::seed_from_u64(11));
    let report = dispatcher.run(&experiments).await.unwrap();
    ticker.abort();

    assert!(report.is_success());
    assert_eq!(report.submitted.len(), 5);

    let state = cluster.state.lock().unwrap();
    assert!(state.double_bookings.is_empty(), "{:?}", state.double_bookings);
    assert!(state.max_running <= 2);

    let names: Vec<_> = state.submitted.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(names, vec!["exp-001", "exp-002", "exp-003", "exp-004", "exp-005"]);

    // every PVC got used and none more than twice
    for pvc in ["gate-pvc-0", "gate-pvc-1", "gate-pvc-2"] {
        let times = dispatcher.usage().count(pvc);
        assert!((1..=2).contains(&times), "{pvc} used {times} times");
    }
}

#[tokio::test(start_paused = true)]
async fn test_job_workload_source_sees_active_jobs() {
    let cluster = FakeCluster::default();
    let mut config = config();
    config.pvc.count = 2;
    config.dispatch.workload_source = WorkloadSource::Jobs;
    ensure_pvcs(&cluster, &config.pvc).await.unwrap();
    cluster.hold("long-running", WorkloadKind::Job, "gate-pvc-0");

    let experiments = parse_commands_input(r#"{"probe": "nvidia-smi"}"#).unwrap();
    let mut dispatcher = Dispatcher::new(cluster.clone(), config, StdRng::seed_from_u64(1));
    let report = dispatcher.run(&experiments).await.unwrap();

    assert_eq!(report.submitted[0].pvc, "gate-pvc-1");
}

#[tokio::test(start_paused = true)]
async fn test_times_out_when_every_pvc_stays_busy() {
    let cluster = FakeCluster::default();
    let mut config = config();
    config.pvc.count = 1;
    config.dispatch.max_wait_secs = 120;
    ensure_pvcs(&cluster, &config.pvc).await.unwrap();
    cluster.hold("forever", WorkloadKind::Pod, "gate-pvc-0");

    let experiments = parse_commands_input("sleep 1").unwrap();
    let mut dispatcher = Dispatcher::new(cluster.clone(), config, StdRng::seed_from_u64(1));
    let result = dispatcher.run(&experiments).await;

    assert!(matches!(result, Err(DispatchError::CapacityTimeout { .. })));
    assert!(cluster.state.lock().unwrap().submitted.is_empty());
}
