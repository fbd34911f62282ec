use std::collections::BTreeMap;

use anyhow::{Context, Result};
use kubejobs::cluster::{claims_in_use, ClusterClient, WorkloadKind};
use kubejobs::core::pvc::{get_pvc_status, PvcStatus};
use owo_colors::OwoColorize;
use tabled::{settings::Style, Table, Tabled};

use crate::cli::PvcsArgs;

#[derive(Tabled)]
struct PvcRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "USED BY")]
    used_by: String,
}

pub async fn handle_pvcs<C: ClusterClient>(cluster: &C, args: &PvcsArgs) -> Result<()> {
    let kind = if args.jobs {
        WorkloadKind::Job
    } else {
        WorkloadKind::Pod
    };

    let status = get_pvc_status(cluster, kind, args.prefix.as_deref())
        .await
        .context("Failed to get PVC status")?;
    let workloads = cluster
        .list_workloads(kind)
        .await
        .with_context(|| format!("Failed to list {kind}s"))?;
    let users = claims_in_use(&workloads);

    if status.total() == 0 {
        println!("No PVCs found");
        return Ok(());
    }
    println!("{}", pvc_table(&status, &users));
    println!(
        "{} available, {} in use",
        status.available.len().green(),
        status.in_use.len().yellow()
    );
    Ok(())
}

fn pvc_table(status: &PvcStatus, users: &BTreeMap<String, Vec<String>>) -> String {
    let mut rows: Vec<PvcRow> = status
        .available
        .iter()
        .map(|name| PvcRow {
            name: name.clone(),
            status: "available".green().to_string(),
            used_by: "-".to_string(),
        })
        .collect();

    rows.extend(status.in_use.iter().map(|name| PvcRow {
        name: name.clone(),
        status: "in use".yellow().to_string(),
        used_by: users
            .get(name)
            .map(|names| names.join(","))
            .unwrap_or_else(|| "-".to_string()),
    }));

    Table::new(&rows).with(Style::empty()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pvc_table_shows_users() {
        let status = PvcStatus {
            available: vec!["gate-pvc-1".to_string()],
            in_use: vec!["gate-pvc-0".to_string()],
        };
        let users = BTreeMap::from([(
            "gate-pvc-0".to_string(),
            vec!["exp-001-x7k2p".to_string()],
        )]);
        let table = pvc_table(&status, &users);

        assert!(table.contains("gate-pvc-1"));
        assert!(table.contains("exp-001-x7k2p"));
        assert!(table.contains("USED BY"));
    }
}
