use clap::Parser;
use clap_complete::Shell;
use clap_verbosity_flag::Verbosity;
use kubejobs::core::manifest::VolumeSpec;
use kubejobs::core::version;
use kubejobs::utils::{parse_key_value, parse_nfs_mount, parse_pvc_mount};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kjob", author, version = version(), about = "Renders or submits a single Kubernetes GPU job.")]
#[command(styles = kubejobs::utils::STYLES)]
pub struct KJob {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Print the manifest as YAML without submitting it
    Render(JobArgs),
    /// Submit the job to the cluster
    Submit(JobArgs),
    /// Create or update a Secret from a .env file
    Secret(SecretArgs),
    /// Generate tab-completion scripts for your shell
    #[command(arg_required_else_help = true)]
    Completions {
        /// The shell to generate the completions for
        shell: Shell,
    },
}

#[derive(Debug, Parser, Clone)]
pub struct JobArgs {
    /// Job name (lowercase letters, digits and '-')
    #[arg(long)]
    pub name: String,

    /// Container image (defaults to the configured image)
    #[arg(long)]
    pub image: Option<String>,

    /// GPU product to pin the job to
    #[arg(long)]
    pub gpu_product: Option<String>,

    /// Number of GPUs to request
    #[arg(long, requires = "gpu_product")]
    pub gpus: Option<u32>,

    /// Mount a PVC, as CLAIM:MOUNT_PATH
    #[arg(long, value_parser = parse_pvc_mount)]
    pub pvc: Vec<VolumeSpec>,

    /// Mount an NFS export, as NAME:SERVER:EXPORT_PATH:MOUNT_PATH
    #[arg(long, value_parser = parse_nfs_mount)]
    pub nfs: Vec<VolumeSpec>,

    /// Set an environment variable, as KEY=VALUE
    #[arg(short, long, value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// CPU request
    #[arg(long)]
    pub cpu: Option<String>,

    /// Memory request
    #[arg(long)]
    pub memory: Option<String>,

    /// Size of /dev/shm (defaults to the memory request)
    #[arg(long)]
    pub shm: Option<String>,

    #[arg(long)]
    pub backoff_limit: Option<i32>,

    /// Maximum runtime in seconds
    #[arg(long)]
    pub deadline: Option<i64>,

    /// Namespace to submit into
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Create a bare Pod instead of a Job
    #[arg(long)]
    pub pod: bool,

    /// Run the container privileged
    #[arg(long)]
    pub privileged: bool,

    /// The command to run, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Parser, Clone)]
pub struct SecretArgs {
    /// Secret name, as referenced by `job.secret_env`
    #[arg(long)]
    pub name: String,

    /// File of KEY=VALUE lines
    #[arg(long, default_value = ".env")]
    pub env_file: PathBuf,

    /// Namespace to create the secret in
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Print the secret keys without applying anything
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        KJob::command().debug_assert();
    }

    #[test]
    fn test_parse_submit() {
        let args = KJob::parse_from([
            "kjob",
            "submit",
            "--name",
            "train-1",
            "--gpu-product",
            "NVIDIA-A100-SXM4-80GB",
            "--gpus",
            "2",
            "--pvc",
            "gate-pvc-0:/data",
            "--env",
            "WANDB_MODE=offline",
            "--",
            "python",
            "train.py",
        ]);
        let Commands::Submit(job) = args.command else {
            panic!("expected submit");
        };
        assert_eq!(job.gpus, Some(2));
        assert_eq!(job.pvc[0].mount_path, "/data");
        assert_eq!(job.env, vec![("WANDB_MODE".to_string(), "offline".to_string())]);
        assert_eq!(job.command, vec!["python", "train.py"]);
    }

    #[test]
    fn test_parse_secret() {
        let args = KJob::parse_from(["kjob", "secret", "--name", "my-env", "--env-file", "prod.env"]);
        let Commands::Secret(secret) = args.command else {
            panic!("expected secret");
        };
        assert_eq!(secret.name, "my-env");
        assert_eq!(secret.env_file, PathBuf::from("prod.env"));
        assert!(!secret.dry_run);
    }

    #[test]
    fn test_gpus_require_product() {
        let result = KJob::try_parse_from(["kjob", "render", "--name", "x", "--gpus", "1", "--", "true"]);
        assert!(result.is_err());
    }
}
