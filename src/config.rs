//* The explicit, passed-by-value configuration threaded through every
//* component, plus the CLI-facing enums that describe policy choices. No
//* global/module-level constants are read by the Planner, Orchestrator, or
//* Orphan Manager — everything comes from a `RunConfig` instance so tests
//* can build synthetic ones.
use clap::ValueEnum;
use std::fmt::{Display, Formatter};

pub const DEFAULT_SNAPSHOT_PREFIX: &str = "zfs-pbs-backup_";
pub const DEFAULT_HOLD_NAME: &str = "zfs-pbs-backup";
pub const DEFAULT_INCLUDE_PROPERTY: &str = "zfs-pbs-backup:include";
pub const DEFAULT_TIMESTAMP_PROPERTY: &str = "zfs-pbs-backup:unix_timestamp";

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ConfigError {
    MissingDatastore,
    MissingSecret,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingDatastore => {
                write!(f, "a PBS datastore is required (pass --pbs-repository or --pbs-datastore)")
            }
            ConfigError::MissingSecret => write!(
                f,
                "no PBS password available: pass --pbs-password, set PBS_PASSWORD, or run interactively"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// `--remove-orphans` policy. See the Orphan Manager for the behavior each
/// variant drives.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum RemoveOrphans {
    False,
    True,
    Ask,
    Only,
    ForceRelease,
}

impl Display for RemoveOrphans {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoveOrphans::False => write!(f, "false"),
            RemoveOrphans::True => write!(f, "true"),
            RemoveOrphans::Ask => write!(f, "ask"),
            RemoveOrphans::Only => write!(f, "only"),
            RemoveOrphans::ForceRelease => write!(f, "force-release"),
        }
    }
}

/// `--change-detection-mode`, passed through verbatim to
/// `proxmox-backup-client backup`.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[value(rename_all = "kebab-case")]
pub enum ChangeDetectionMode {
    Legacy,
    Data,
    Metadata,
}

impl ChangeDetectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeDetectionMode::Legacy => "legacy",
            ChangeDetectionMode::Data => "data",
            ChangeDetectionMode::Metadata => "metadata",
        }
    }
}

impl Display for ChangeDetectionMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Every tunable a run needs, threaded explicitly rather than read from
/// globals.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub roots: Vec<String>,
    pub include_property: String,
    pub timestamp_property: String,
    pub snapshot_prefix: String,
    pub hold_name: String,
    pub hold_enabled: bool,
    pub exclude_empty_parents: bool,
    pub remove_orphans: RemoveOrphans,
    pub resume: bool,
    pub execute: bool,
    pub repository: String,
    pub secret: String,
    pub backup_id: String,
    pub namespace: Option<String>,
    pub change_detection_mode: ChangeDetectionMode,
    pub archive_name_prefix: Option<String>,
    pub encryption_password: Option<String>,
    pub fingerprint: Option<String>,
}

impl RunConfig {
    /// Whether mutating ZFS/teardown calls should be stubbed by the Command
    /// Runner (true unless `--execute` was given).
    pub fn dry_run(&self) -> bool {
        !self.execute
    }

    pub fn force_release(&self) -> bool {
        self.remove_orphans == RemoveOrphans::ForceRelease
    }
}

#[cfg(test)]
mod test_config {
    use super::*;

    fn sample() -> RunConfig {
        RunConfig {
            roots: vec!["tank".into()],
            include_property: DEFAULT_INCLUDE_PROPERTY.into(),
            timestamp_property: DEFAULT_TIMESTAMP_PROPERTY.into(),
            snapshot_prefix: DEFAULT_SNAPSHOT_PREFIX.into(),
            hold_name: DEFAULT_HOLD_NAME.into(),
            hold_enabled: false,
            exclude_empty_parents: false,
            remove_orphans: RemoveOrphans::False,
            resume: false,
            execute: false,
            repository: "store".into(),
            secret: "secret".into(),
            backup_id: "host".into(),
            namespace: None,
            change_detection_mode: ChangeDetectionMode::Metadata,
            archive_name_prefix: None,
            encryption_password: None,
            fingerprint: None,
        }
    }

    #[test]
    fn dry_run_is_inverse_of_execute() {
        let mut cfg = sample();
        assert!(cfg.dry_run());
        cfg.execute = true;
        assert!(!cfg.dry_run());
    }

    #[test]
    fn force_release_tracks_remove_orphans_variant() {
        let mut cfg = sample();
        assert!(!cfg.force_release());
        cfg.remove_orphans = RemoveOrphans::ForceRelease;
        assert!(cfg.force_release());
    }
}
