use serde::{Deserialize, Serialize};
use std::fmt;

/// One stored revision of a tracked file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BackupInfo {
    pub identifier: String,
    /// Creation time encoded in the identifier, `YYYY-MM-DD HH:MM:SS`.
    pub timestamp: String,

    #[serde(default)]
    pub size: u64,

    /// Filesystem modification time, seconds since the epoch.
    #[serde(default)]
    pub modified: u64,

    #[serde(default)]
    pub sha256: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RestartPhase {
    Stop,
    Start,
}

impl fmt::Display for RestartPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPhase::Stop => f.write_str("stop"),
            RestartPhase::Start => f.write_str("start"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PhaseFailure {
    pub phase: RestartPhase,
    pub reason: String,
}

/// Combined output of a stop/start cycle and where it broke, if it did.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RestartOutcome {
    pub output: String,
    pub failure: Option<PhaseFailure>,
}

impl RestartOutcome {
    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failed_at(&self) -> Option<RestartPhase> {
        self.failure.as_ref().map(|f| f.phase)
    }

    pub fn summary(&self) -> String {
        match &self.failure {
            None => "restart completed".into(),
            Some(f) => format!("restart failed in {} phase: {}", f.phase, f.reason),
        }
    }
}

#[derive(Serialize, Debug, Clone)]
pub struct SaveResult {
    pub backup: String,
    pub message: String,
    pub restart: Option<RestartOutcome>,
}

#[derive(Serialize, Debug, Clone)]
pub struct RollbackResult {
    /// Safety copy of the state that was replaced.
    pub pre_rollback_backup: String,
    pub restored_from: String,
    pub message: String,
    pub restart: RestartOutcome,
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_summary_names_phase() {
        let outcome = RestartOutcome {
            output: "boom".into(),
            failure: Some(PhaseFailure {
                phase: RestartPhase::Start,
                reason: "exit status 2".into(),
            }),
        };
        assert!(!outcome.is_ok());
        assert_eq!(outcome.failed_at(), Some(RestartPhase::Start));
        assert_eq!(
            outcome.summary(),
            "restart failed in start phase: exit status 2"
        );
    }

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }
}
