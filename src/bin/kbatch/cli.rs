use clap::Parser;
use clap_complete::Shell;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use kubejobs::config::Config;
use kubejobs::core::version;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "kbatch",
    author,
    version = version(),
    about = "Dispatches experiments read from stdin as Kubernetes Jobs, one free PVC and GPU each."
)]
#[command(styles = kubejobs::utils::STYLES)]
pub struct KBatch {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub dispatch: DispatchArgs,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// Generate tab-completion scripts for your shell
    #[command(arg_required_else_help = true)]
    Completions {
        /// The shell to generate the completions for
        shell: Shell,
    },
}

#[derive(Debug, Parser, Clone, Default)]
pub struct DispatchArgs {
    /// Number of PVCs to create before dispatching
    #[arg(long)]
    pub num_pvcs: Option<u32>,

    /// Storage size of each created PVC (e.g. 4Ti)
    #[arg(long)]
    pub pvc_storage: Option<String>,

    /// Access mode of each created PVC
    #[arg(long)]
    pub pvc_access_mode: Option<String>,

    /// Maximum number of PVCs in use before new submissions wait
    #[arg(long)]
    pub max_concurrent_jobs: Option<usize>,

    /// GPU product to choose from; repeat for several
    #[arg(long = "gpu-type")]
    pub gpu_types: Vec<String>,

    /// Container image for every job
    #[arg(long)]
    pub image: Option<String>,

    /// Namespace to submit into
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Do not create missing PVCs
    #[arg(long)]
    pub skip_pvc_setup: bool,

    /// Seed for GPU type selection
    #[arg(long, hide = true)]
    pub seed: Option<u64>,
}

impl DispatchArgs {
    /// CLI flags override config values
    pub fn apply(&self, config: &mut Config) {
        if let Some(count) = self.num_pvcs {
            config.pvc.count = count;
        }
        if let Some(storage) = &self.pvc_storage {
            config.pvc.storage = storage.clone();
        }
        if let Some(mode) = &self.pvc_access_mode {
            config.pvc.access_mode = mode.clone();
        }
        if let Some(max) = self.max_concurrent_jobs {
            config.dispatch.max_concurrent_jobs = max;
        }
        if !self.gpu_types.is_empty() {
            config.gpu.types = self.gpu_types.clone();
        }
        if let Some(image) = &self.image {
            config.job.image = image.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.cluster.namespace = namespace.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        KBatch::command().debug_assert();
    }

    #[test]
    fn test_flags_override_config() {
        let args = KBatch::parse_from([
            "kbatch",
            "--num-pvcs",
            "4",
            "--max-concurrent-jobs",
            "2",
            "--gpu-type",
            "NVIDIA-A100-SXM4-80GB",
            "--gpu-type",
            "NVIDIA-H100-80GB-HBM3",
            "--image",
            "pytorch/pytorch:latest",
        ]);
        let mut config = Config::default();
        args.dispatch.apply(&mut config);

        assert_eq!(config.pvc.count, 4);
        assert_eq!(config.dispatch.max_concurrent_jobs, 2);
        assert_eq!(config.gpu.types.len(), 2);
        assert_eq!(config.job.image, "pytorch/pytorch:latest");
        // untouched values keep their defaults
        assert_eq!(config.pvc.storage, "4Ti");
    }

    #[test]
    fn test_no_flags_keep_config() {
        let args = KBatch::parse_from(["kbatch"]);
        let mut config = Config::default();
        args.dispatch.apply(&mut config);
        assert_eq!(config.gpu.types, Config::default().gpu.types);
        assert!(!args.dispatch.skip_pvc_setup);
    }
}
