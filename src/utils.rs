use anyhow::{anyhow, Result};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use std::io::Write;
use std::time::Duration;

use crate::core::manifest::VolumeSpec;

/// Parse a `KEY=VALUE` pair.
///
/// # Examples
///
/// ```
/// use kubejobs::utils::parse_key_value;
///
/// assert_eq!(
///     parse_key_value("WANDB_MODE=offline").unwrap(),
///     ("WANDB_MODE".to_string(), "offline".to_string())
/// );
/// assert_eq!(parse_key_value("A=b=c").unwrap().1, "b=c");
/// ```
pub fn parse_key_value(s: &str) -> Result<(String, String)> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid KEY=VALUE pair '{s}': no '=' found"))?;
    if key.is_empty() {
        return Err(anyhow!("Invalid KEY=VALUE pair '{s}': empty key"));
    }
    Ok((key.to_string(), value.to_string()))
}

/// Parse a PVC mount given as `CLAIM:MOUNT_PATH`.
///
/// The volume is named after the claim.
pub fn parse_pvc_mount(s: &str) -> Result<VolumeSpec> {
    let (claim, mount_path) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid PVC mount '{s}'. Expected CLAIM:MOUNT_PATH"))?;
    if claim.is_empty() || mount_path.is_empty() {
        return Err(anyhow!("Invalid PVC mount '{s}'. Expected CLAIM:MOUNT_PATH"));
    }
    Ok(VolumeSpec::pvc(claim, claim, mount_path))
}

/// Parse an NFS mount given as `NAME:SERVER:EXPORT_PATH:MOUNT_PATH`.
pub fn parse_nfs_mount(s: &str) -> Result<VolumeSpec> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [name, server, path, mount_path] => Ok(VolumeSpec::nfs(*name, *server, *path, *mount_path)),
        _ => Err(anyhow!(
            "Invalid NFS mount '{s}'. Expected NAME:SERVER:EXPORT_PATH:MOUNT_PATH"
        )),
    }
}

/// Format duration for display in HH:MM:SS format.
///
/// Hours are the largest unit and can exceed 24.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kubejobs::utils::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(45)), "00:00:45");
/// assert_eq!(format_duration(Duration::from_secs(9045)), "02:30:45");
/// assert_eq!(format_duration(Duration::from_secs(90000)), "25:00:00");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Write a completion script for `cmd` to stdout, ignoring a closed pipe.
pub fn generate_to_stdout(
    shell: clap_complete::Shell,
    cmd: &mut clap::Command,
    bin_name: &str,
) -> Result<()> {
    let mut buf = Vec::<u8>::new();
    clap_complete::generate(shell, cmd, bin_name, &mut buf);

    match std::io::stdout().write_all(&buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());
