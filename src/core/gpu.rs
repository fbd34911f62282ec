use std::collections::{BTreeMap, BTreeSet};

use rand::seq::IndexedRandom;
use rand::Rng;
use tracing::debug;

use crate::cluster::{ClusterClient, ClusterError, Workload, WorkloadKind};

/// Phase whose GPU requests count against capacity
pub const ACTIVE_PHASE: &str = "Running";

/// Product name → total slots in the cluster
pub type GpuCapacityTable = BTreeMap<String, u32>;

/// GPUs requested by workloads, grouped by phase then product
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuUsage {
    by_phase: BTreeMap<String, BTreeMap<String, u32>>,
}

impl GpuUsage {
    pub fn from_workloads(workloads: &[Workload]) -> Self {
        let mut by_phase: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
        for workload in workloads {
            let Some(product) = workload.gpu_product.as_ref() else {
                continue;
            };
            if workload.gpu_count == 0 {
                continue;
            }
            *by_phase
                .entry(workload.phase.clone())
                .or_default()
                .entry(product.clone())
                .or_insert(0) += workload.gpu_count;
        }
        Self { by_phase }
    }

    /// GPUs of `product` held by running workloads
    pub fn active(&self, product: &str) -> u32 {
        self.count(ACTIVE_PHASE, product)
    }

    pub fn count(&self, phase: &str, product: &str) -> u32 {
        self.by_phase
            .get(phase)
            .and_then(|products| products.get(product))
            .copied()
            .unwrap_or(0)
    }

    pub fn phases(&self) -> impl Iterator<Item = &str> {
        self.by_phase.keys().map(String::as_str)
    }

    /// Every product seen in any phase, sorted
    pub fn products(&self) -> BTreeSet<&str> {
        self.by_phase
            .values()
            .flat_map(|products| products.keys().map(String::as_str))
            .collect()
    }

    /// Whether any of `requested` has a free slot
    pub fn has_free_slot(&self, requested: &[String], capacity: &GpuCapacityTable) -> bool {
        requested.iter().any(|product| {
            capacity
                .get(product)
                .is_some_and(|total| self.active(product) < *total)
        })
    }

    /// `capacity - active` per product in the table; negative when oversubscribed
    pub fn remaining(&self, capacity: &GpuCapacityTable) -> BTreeMap<String, i64> {
        capacity
            .iter()
            .map(|(product, total)| {
                (
                    product.clone(),
                    i64::from(*total) - i64::from(self.active(product)),
                )
            })
            .collect()
    }
}

/// GPUs held by live workloads, grouped by submitting user then product.
///
/// Workloads without a recorded user are listed under their own name.
pub fn gpu_usage_by_owner(workloads: &[Workload]) -> BTreeMap<String, BTreeMap<String, u32>> {
    let mut owners: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
    for workload in workloads.iter().filter(|w| w.is_live() && w.gpu_count > 0) {
        let Some(product) = workload.gpu_product.as_ref() else {
            continue;
        };
        let owner = workload
            .submitted_by
            .clone()
            .unwrap_or_else(|| workload.name.clone());
        *owners
            .entry(owner)
            .or_default()
            .entry(product.clone())
            .or_insert(0) += workload.gpu_count;
    }
    owners
}

/// Pick a requested GPU product that still has free slots.
///
/// Products absent from `capacity` have no slots. Among the rest, one with
/// `capacity - active > 0` is chosen uniformly at random; `None` means every
/// requested product is saturated.
pub fn select_gpu_type<R: Rng + ?Sized>(
    requested: &[String],
    capacity: &GpuCapacityTable,
    usage: &GpuUsage,
    rng: &mut R,
) -> Option<String> {
    let remaining = usage.remaining(capacity);
    let candidates: Vec<&String> = requested
        .iter()
        .filter(|product| remaining.get(product.as_str()).copied().unwrap_or(0) > 0)
        .collect();

    candidates.choose(rng).map(|product| (*product).clone())
}

/// Lists pods and tallies the GPUs they request.
pub async fn cluster_gpu_usage<C>(cluster: &C) -> Result<GpuUsage, ClusterError>
where
    C: ClusterClient + ?Sized,
{
    let pods = cluster.list_workloads(WorkloadKind::Pod).await?;
    let usage = GpuUsage::from_workloads(&pods);
    debug!(phases = ?usage.phases().collect::<Vec<_>>(), "GPU usage collected");
    Ok(usage)
}
