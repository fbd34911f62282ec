use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use kubejobs::cluster::{ClusterClient, WorkloadKind};
use kubejobs::config::Config;
use kubejobs::core::gpu::{gpu_usage_by_owner, GpuCapacityTable, GpuUsage};
use owo_colors::OwoColorize;
use tabled::{builder::Builder, settings::Style};

use crate::cli::GpusArgs;

pub async fn handle_gpus<C: ClusterClient>(config: &Config, cluster: &C, args: &GpusArgs) -> Result<()> {
    let pods = cluster
        .list_workloads(WorkloadKind::Pod)
        .await
        .context("Failed to list pods")?;

    if args.by_user {
        let owners = gpu_usage_by_owner(&pods);
        if owners.is_empty() {
            println!("No GPUs in use");
        } else {
            println!("{}", owner_table(&owners));
        }
        return Ok(());
    }

    let usage = GpuUsage::from_workloads(&pods);
    println!("{}", gpu_table(&usage, &config.gpu.capacity));
    Ok(())
}

/// One row per user, one column per product, plus a total
fn owner_table(owners: &BTreeMap<String, BTreeMap<String, u32>>) -> String {
    let products: BTreeSet<&str> = owners
        .values()
        .flat_map(|products| products.keys().map(String::as_str))
        .collect();

    let mut builder = Builder::default();
    builder.push_record(
        std::iter::once("USER".to_string())
            .chain(products.iter().map(|p| p.to_string()))
            .chain(std::iter::once("TOTAL".to_string())),
    );
    for (owner, held) in owners {
        let total: u32 = held.values().sum();
        builder.push_record(
            std::iter::once(owner.clone())
                .chain(products.iter().map(|p| held.get(*p).copied().unwrap_or(0).to_string()))
                .chain(std::iter::once(total.bold().to_string())),
        );
    }

    builder.build().with(Style::rounded()).to_string()
}

/// One row per pod phase plus `Capacity` and `Available`, one column per product
fn gpu_table(usage: &GpuUsage, capacity: &GpuCapacityTable) -> String {
    let products: BTreeSet<&str> = usage
        .products()
        .into_iter()
        .chain(capacity.keys().map(String::as_str))
        .collect();

    let mut builder = Builder::default();
    builder.push_record(std::iter::once("PHASE".to_string()).chain(products.iter().map(|p| p.to_string())));

    for phase in usage.phases() {
        builder.push_record(
            std::iter::once(phase.to_string())
                .chain(products.iter().map(|p| usage.count(phase, p).to_string())),
        );
    }

    builder.push_record(std::iter::once("Capacity".to_string()).chain(
        products.iter().map(|p| {
            capacity
                .get(*p)
                .map(|total| total.to_string())
                .unwrap_or_else(|| "-".to_string())
        }),
    ));

    let remaining = usage.remaining(capacity);
    builder.push_record(std::iter::once("Available".bold().to_string()).chain(
        products.iter().map(|p| match remaining.get(*p) {
            Some(free) if *free > 0 => free.green().to_string(),
            Some(free) => free.red().to_string(),
            None => "-".to_string(),
        }),
    ));

    builder.build().with(Style::rounded()).to_string()
}
