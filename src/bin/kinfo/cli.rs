use clap::Parser;
use clap_complete::Shell;
use clap_verbosity_flag::Verbosity;
use kubejobs::core::version;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kinfo", author, version = version(), about = "Display GPU, PVC and job usage in the namespace.")]
#[command(styles = kubejobs::utils::STYLES)]
pub struct KInfo {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Namespace to inspect
    #[arg(short, long, global = true)]
    pub namespace: Option<String>,

    #[command(flatten)]
    pub verbosity: Verbosity,
}

#[derive(Debug, Parser)]
pub enum Commands {
    /// GPUs requested by pods, by phase and product
    Gpus(GpusArgs),
    /// Which PVCs are free and which are mounted
    Pvcs(PvcsArgs),
    /// Pods and Jobs submitted by a user
    Jobs(JobsArgs),
    /// Generate tab-completion scripts for your shell
    #[command(arg_required_else_help = true)]
    Completions {
        /// The shell to generate the completions for
        shell: Shell,
    },
}

#[derive(Debug, Parser)]
pub struct GpusArgs {
    /// Break live GPU usage down by submitting user
    #[arg(long)]
    pub by_user: bool,
}

#[derive(Debug, Parser)]
pub struct JobsArgs {
    /// Show workloads of this user [default: current user]
    #[arg(short, long, conflicts_with = "all")]
    pub user: Option<String>,

    /// Show workloads of every user
    #[arg(short, long)]
    pub all: bool,

    /// Hide finished workloads
    #[arg(long)]
    pub live: bool,
}

#[derive(Debug, Parser)]
pub struct PvcsArgs {
    /// Only show PVCs whose name contains this
    #[arg(long)]
    pub prefix: Option<String>,

    /// Decide usage from Jobs instead of Pods
    #[arg(long)]
    pub jobs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        KInfo::command().debug_assert();
    }

    #[test]
    fn test_jobs_user_conflicts_with_all() {
        let args = KInfo::try_parse_from(["kinfo", "jobs", "--user", "alice"]).unwrap();
        match args.command {
            Commands::Jobs(jobs) => assert_eq!(jobs.user.as_deref(), Some("alice")),
            other => panic!("unexpected command {other:?}"),
        }
        assert!(KInfo::try_parse_from(["kinfo", "jobs", "--user", "alice", "--all"]).is_err());
    }
}
