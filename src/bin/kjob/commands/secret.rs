use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kubejobs::cluster::{ClusterClient, KubeCluster};
use kubejobs::config::Config;
use kubejobs::core::secret::{read_env_file, secret_manifest};

use crate::cli::SecretArgs;

pub async fn handle_secret(config: &Config, args: &SecretArgs) -> Result<()> {
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| config.cluster.namespace.clone());
    let secret = build_secret(args, &namespace)?;
    let keys = secret_keys(&secret);

    if args.dry_run {
        println!("Secret '{}' in '{namespace}' would hold: {}", args.name, keys.join(", "));
        return Ok(());
    }

    let mut cluster_config = config.cluster.clone();
    cluster_config.namespace = namespace.clone();
    let cluster = KubeCluster::connect(&cluster_config, &config.job.gpu_resource)
        .await
        .context("Failed to connect to the Kubernetes API")?;
    cluster
        .apply_secret(&secret)
        .await
        .with_context(|| format!("Failed to apply secret '{}'", args.name))?;

    println!(
        "Secret '{}' created/updated in namespace '{namespace}' with {} key(s)",
        args.name,
        keys.len()
    );
    Ok(())
}

fn build_secret(args: &SecretArgs, namespace: &str) -> Result<Secret> {
    let vars = read_env_file(&args.env_file)
        .with_context(|| format!("Failed to load {}", args.env_file.display()))?;
    Ok(secret_manifest(&args.name, namespace, vars)?)
}

fn secret_keys(secret: &Secret) -> Vec<&str> {
    secret
        .string_data
        .iter()
        .flat_map(|data| data.keys().map(String::as_str))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(env_file: &std::path::Path, name: &str) -> SecretArgs {
        SecretArgs {
            name: name.to_string(),
            env_file: env_file.to_path_buf(),
            namespace: None,
            dry_run: true,
        }
    }

    #[test]
    fn test_build_secret_from_env_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# keys\nWANDB_API_KEY=abc\nHF_TOKEN=hf").unwrap();

        let secret = build_secret(&args(file.path(), "train-env"), "team-ns").unwrap();
        assert_eq!(secret.metadata.namespace.as_deref(), Some("team-ns"));
        assert_eq!(secret_keys(&secret), vec!["HF_TOKEN", "WANDB_API_KEY"]);
    }

    #[test]
    fn test_missing_env_file_is_reported() {
        let err = build_secret(&args(std::path::Path::new("/nonexistent/.env"), "x"), "ns").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/.env"));
    }
}
