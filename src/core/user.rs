use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

const ANNOTATION_PREFIX: &str = "kubejobs";
/// Bare user annotation read by older cluster tooling
const LEGACY_USER_ANNOTATION: &str = "username";
const MAX_LABEL_VALUE_LEN: usize = 63;

/// Who submitted a workload, attached to every manifest as labels and annotations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitterInfo {
    pub user: String,
    pub home: Option<PathBuf>,
    pub shell: Option<String>,
    pub groups: Vec<String>,
    pub email: Option<String>,
}

impl SubmitterInfo {
    /// Collect details about the local user. Nothing here fails; missing
    /// values are left empty.
    pub fn detect(email: Option<String>) -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            user,
            home: dirs::home_dir(),
            shell: std::env::var("SHELL").ok(),
            groups: detect_groups(),
            email,
        }
    }

    /// Labels identifying the submitter, keyed by `user_label`
    pub fn labels(&self, user_label: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(user_label.to_string(), label_value(&self.user))])
    }

    pub fn annotations(&self, submitted_at: DateTime<Utc>) -> BTreeMap<String, String> {
        let key = |name: &str| format!("{ANNOTATION_PREFIX}/{name}");

        let mut annotations = BTreeMap::new();
        annotations.insert(key("user"), self.user.clone());
        annotations.insert(LEGACY_USER_ANNOTATION.to_string(), self.user.clone());
        if let Some(home) = &self.home {
            annotations.insert(key("home"), home.display().to_string());
        }
        if let Some(shell) = &self.shell {
            annotations.insert(key("shell"), shell.clone());
        }
        if !self.groups.is_empty() {
            annotations.insert(key("groups"), self.groups.join(","));
        }
        if let Some(email) = &self.email {
            annotations.insert(key("email"), email.clone());
        }
        annotations.insert(
            key("submitted-at"),
            submitted_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        annotations
    }
}

/// The submitting user recorded in a workload's annotations, if any
pub fn submitted_by(annotations: &BTreeMap<String, String>) -> Option<&str> {
    annotations
        .get(&format!("{ANNOTATION_PREFIX}/user"))
        .or_else(|| annotations.get(LEGACY_USER_ANNOTATION))
        .map(String::as_str)
}

fn detect_groups() -> Vec<String> {
    match Command::new("id").arg("-Gn").output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(String::from)
            .collect(),
        Ok(output) => {
            debug!(status = %output.status, "`id -Gn` failed, submitting without groups");
            Vec::new()
        }
        Err(e) => {
            debug!(error = %e, "Could not run `id`, submitting without groups");
            Vec::new()
        }
    }
}

/// Coerce `value` into a valid label value: alphanumerics plus `-`, `_` and
/// `.`, starting and ending alphanumeric, at most 63 characters.
fn label_value(value: &str) -> String {
    let replaced: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(MAX_LABEL_VALUE_LEN)
        .collect();
    replaced
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
