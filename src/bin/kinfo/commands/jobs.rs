use anyhow::{Context, Result};
use kubejobs::cluster::{ClusterClient, Workload, WorkloadKind};
use kubejobs::core::user::SubmitterInfo;
use owo_colors::OwoColorize;
use tabled::{settings::Style, Table, Tabled};

use crate::cli::JobsArgs;

#[derive(Tabled)]
struct WorkloadRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "KIND")]
    kind: String,
    #[tabled(rename = "PHASE")]
    phase: String,
    #[tabled(rename = "USER")]
    user: String,
    #[tabled(rename = "GPUS")]
    gpus: String,
    #[tabled(rename = "PVC")]
    pvc: String,
}

pub async fn handle_jobs<C: ClusterClient>(cluster: &C, args: &JobsArgs) -> Result<()> {
    let mut workloads = Vec::new();
    for kind in [WorkloadKind::Job, WorkloadKind::Pod] {
        workloads.extend(
            cluster
                .list_workloads(kind)
                .await
                .with_context(|| format!("Failed to list {kind}s"))?,
        );
    }

    let user = match (&args.user, args.all) {
        (_, true) => None,
        (Some(user), false) => Some(user.clone()),
        (None, false) => Some(SubmitterInfo::detect(None).user),
    };
    let shown = filter_workloads(&workloads, user.as_deref(), args.live);

    if shown.is_empty() {
        match &user {
            Some(user) => println!("No workloads submitted by {user}"),
            None => println!("No workloads found"),
        }
        return Ok(());
    }
    println!("{}", workload_table(&shown));
    Ok(())
}

fn filter_workloads<'a>(workloads: &'a [Workload], user: Option<&str>, live_only: bool) -> Vec<&'a Workload> {
    workloads
        .iter()
        .filter(|w| user.is_none_or(|user| w.submitted_by.as_deref() == Some(user)))
        .filter(|w| !live_only || w.is_live())
        .collect()
}

fn workload_table(workloads: &[&Workload]) -> String {
    let rows: Vec<WorkloadRow> = workloads
        .iter()
        .map(|w| WorkloadRow {
            name: w.name.clone(),
            kind: w.kind.to_string(),
            phase: colored_phase(&w.phase),
            user: w.submitted_by.clone().unwrap_or_else(|| "-".to_string()),
            gpus: match &w.gpu_product {
                Some(product) if w.gpu_count > 0 => format!("{}x {product}", w.gpu_count),
                _ => "-".to_string(),
            },
            pvc: if w.claim_names.is_empty() {
                "-".to_string()
            } else {
                w.claim_names.join(",")
            },
        })
        .collect();

    Table::new(&rows).with(Style::empty()).to_string()
}

fn colored_phase(phase: &str) -> String {
    match phase {
        "Running" | "Active" => phase.green().to_string(),
        "Pending" => phase.yellow().to_string(),
        "Failed" => phase.red().to_string(),
        _ => phase.to_string(),
    }
}
