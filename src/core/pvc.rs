use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use crate::cluster::{claims_in_use, ClusterClient, ClusterError, PvcRequest, WorkloadKind};
use crate::config::PvcConfig;
use crate::core::retry::{retry_with_backoff, RetryConfig};

static INDEXED_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^([a-z-]+)-([0-9]+)").expect("valid regex"));

/// Sort key putting `foo-2` before `foo-10`.
///
/// Names starting with `<letters-and-dashes>-<digits>` sort by that prefix and
/// the numeric index; everything else sorts by the full name with index 0.
/// The raw name breaks remaining ties.
pub fn natural_sort_key(name: &str) -> (&str, u64, &str) {
    INDEXED_NAME
        .captures(name)
        .and_then(|caps| {
            let prefix = caps.get(1)?.as_str();
            let index = caps.get(2)?.as_str().parse::<u64>().ok()?;
            Some((prefix, index, name))
        })
        .unwrap_or((name, 0, name))
}

pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    natural_sort_key(a).cmp(&natural_sort_key(b))
}

/// PVCs split by whether a live workload mounts them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvcStatus {
    pub available: Vec<String>,
    pub in_use: Vec<String>,
}

impl PvcStatus {
    /// Partition `pvc_names` given the set of claims currently mounted.
    pub fn partition<S: AsRef<str>>(
        pvc_names: &[S],
        used: impl Fn(&str) -> bool,
        prefix: Option<&str>,
    ) -> Self {
        let mut usage: HashMap<&str, bool> = pvc_names
            .iter()
            .map(|name| (name.as_ref(), false))
            .collect();
        for (name, in_use) in usage.iter_mut() {
            *in_use = used(name);
        }

        let mut names: Vec<&str> = usage
            .keys()
            .copied()
            .filter(|name| prefix.is_none_or(|p| name.contains(p)))
            .collect();
        names.sort_by(|a, b| natural_cmp(a, b));

        let (in_use, available): (Vec<&str>, Vec<&str>) =
            names.into_iter().partition(|name| usage[name]);

        Self {
            available: available.into_iter().map(String::from).collect(),
            in_use: in_use.into_iter().map(String::from).collect(),
        }
    }

    /// Move `name` from `available` to `in_use`. Returns false if it was not available.
    pub fn claim(&mut self, name: &str) -> bool {
        match self.available.iter().position(|p| p == name) {
            Some(pos) => {
                let pvc = self.available.remove(pos);
                self.in_use.push(pvc);
                true
            }
            None => false,
        }
    }

    /// The available PVC picked the fewest times so far; the first one wins ties.
    pub fn least_used(&self, usage: &PvcUsageCounter) -> Option<&str> {
        self.available
            .iter()
            .min_by_key(|pvc| usage.count(pvc))
            .map(String::as_str)
    }

    pub fn total(&self) -> usize {
        self.available.len() + self.in_use.len()
    }
}

/// How many times this process has handed out each PVC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PvcUsageCounter {
    counts: BTreeMap<String, u64>,
}

impl PvcUsageCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, pvc: &str) -> u64 {
        self.counts.get(pvc).copied().unwrap_or(0)
    }

    pub fn record(&mut self, pvc: &str) -> u64 {
        let count = self.counts.entry(pvc.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for PvcUsageCounter {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        Self {
            counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Query the cluster and partition its PVCs into available and in-use.
pub async fn get_pvc_status<C: ClusterClient + ?Sized>(
    cluster: &C,
    kind: WorkloadKind,
    prefix: Option<&str>,
) -> Result<PvcStatus, ClusterError> {
    let pvc_names = cluster.list_pvc_names().await?;
    if pvc_names.is_empty() {
        return Ok(PvcStatus::default());
    }

    let workloads = cluster.list_workloads(kind).await?;
    let claims = claims_in_use(&workloads);
    let status = PvcStatus::partition(&pvc_names, |name| claims.contains_key(name), prefix);

    debug!(
        available = status.available.len(),
        in_use = status.in_use.len(),
        ?prefix,
        "Polled PVC status"
    );
    Ok(status)
}

/// Create every PVC the settings describe that does not exist yet.
pub async fn ensure_pvcs<C: ClusterClient + ?Sized>(
    cluster: &C,
    pvc: &PvcConfig,
) -> Result<(), ClusterError> {
    let requests = PvcRequest::from_config(pvc);
    let retry = RetryConfig::with_max_attempts(3);
    for request in &requests {
        retry_with_backoff(&retry, "ensure_pvc", || cluster.ensure_pvc(request)).await?;
    }
    info!(
        count = requests.len(),
        storage = %pvc.storage,
        access_mode = %pvc.access_mode,
        "PVCs ensured"
    );
    Ok(())
}
