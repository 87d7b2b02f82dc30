//* Enumerates prior-run snapshots matching the configured prefix, decides
//* which ones are orphans relative to the current run's timestamp, and
//* destroys them under the selected `--remove-orphans` policy.
use crate::command::CommandRunner;
use crate::config::{RemoveOrphans, RunConfig};
use crate::planner::DatasetPlan;
use crate::zfs::{zfs_destroy_snapshots, zfs_holds, zfs_list, zfs_release_snapshots, ZfsError};
use std::collections::HashMap;

#[derive(Debug)]
pub enum OrphanError {
    Zfs(ZfsError),
    PromptFailed(String),
}

impl std::fmt::Display for OrphanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrphanError::Zfs(e) => write!(f, "{e}"),
            OrphanError::PromptFailed(msg) => write!(f, "failed to read confirmation: {msg}"),
        }
    }
}

impl std::error::Error for OrphanError {}

impl From<ZfsError> for OrphanError {
    fn from(e: ZfsError) -> Self {
        OrphanError::Zfs(e)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanSnapshot {
    pub dataset: String,
    pub snapname: String,
}

impl OrphanSnapshot {
    pub fn full_name(&self) -> String {
        format!("{}{}{}", self.dataset, crate::zfs::SNAPSHOT_SEPARATOR, self.snapname)
    }
}

/// Decimal suffix of `snapname` after `prefix`, if `snapname` actually starts
/// with `prefix` and the remainder parses as an unsigned decimal integer.
fn prefix_suffix_timestamp(snapname: &str, prefix: &str) -> Option<String> {
    let suffix = snapname.strip_prefix(prefix)?;
    if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
        Some(suffix.to_string())
    } else {
        None
    }
}

/// The effective timestamp of a snapshot: the timestamp property if it
/// parses as a decimal integer, else the decimal suffix of its name, else
/// `None` (no timestamp — still an orphan if it carries our prefix).
fn effective_timestamp(snapname: &str, prefix: &str, property_value: Option<&str>) -> Option<String> {
    if let Some(v) = property_value {
        if !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()) {
            return Some(v.to_string());
        }
    }
    prefix_suffix_timestamp(snapname, prefix)
}

/// `true` iff `snapname` carries our prefix and its effective timestamp
/// differs from (or is absent, or doesn't match) `timestamp_current`.
pub fn is_orphan(
    snapname: &str,
    prefix: &str,
    property_value: Option<&str>,
    timestamp_current: &str,
) -> bool {
    if !snapname.starts_with(prefix) {
        return false;
    }
    match effective_timestamp(snapname, prefix, property_value) {
        Some(ts) => ts != timestamp_current,
        None => true,
    }
}

/// Lists every snapshot under the plans' datasets whose name carries our
/// prefix, and returns the ones that are orphans relative to
/// `timestamp_current`.
pub async fn find_orphans<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    config: &RunConfig,
    timestamp_current: &str,
) -> Result<Vec<OrphanSnapshot>, OrphanError> {
    let mut orphans = Vec::new();
    for plan in plans {
        let rows = zfs_list(
            runner,
            Some(&plan.dataset),
            false,
            &["name", config.timestamp_property.as_str()],
            &["snapshot"],
        )
        .await?;
        for row in rows {
            let [full_name, prop_value] = row.as_slice() else {
                continue;
            };
            let Some((dataset, snapname)) = full_name.split_once(crate::zfs::SNAPSHOT_SEPARATOR) else {
                continue;
            };
            if dataset != plan.dataset {
                continue;
            }
            let prop = if prop_value == "-" { None } else { Some(prop_value.as_str()) };
            if is_orphan(snapname, &config.snapshot_prefix, prop, timestamp_current) {
                orphans.push(OrphanSnapshot {
                    dataset: dataset.to_string(),
                    snapname: snapname.to_string(),
                });
            }
        }
    }
    Ok(orphans)
}

/// Releases and destroys the given orphans. Under `force_release`, every
/// hold tag present is released (each logged with how many snapshots carry
/// it) before destruction; otherwise only our own hold is released and a
/// snapshot carrying any other tag is skipped with a warning naming every
/// holder.
pub async fn destroy_orphans<R: CommandRunner>(
    runner: &R,
    orphans: &[OrphanSnapshot],
    hold_name: &str,
    force_release: bool,
    dry_run: bool,
) -> Result<(), OrphanError> {
    if orphans.is_empty() {
        return Ok(());
    }
    let targets: Vec<String> = orphans.iter().map(OrphanSnapshot::full_name).collect();
    let holds = zfs_holds(runner, &targets, false).await?;

    let mut to_destroy: Vec<String> = Vec::new();

    if force_release {
        let mut by_tag: HashMap<String, Vec<String>> = HashMap::new();
        for target in &targets {
            for tag in holds.get(target).cloned().unwrap_or_default() {
                by_tag.entry(tag).or_default().push(target.clone());
            }
        }
        for (tag, snaps) in &by_tag {
            log::warn!(
                "force-release: releasing orphan hold '{tag}' from {} snapshot(s)",
                snaps.len()
            );
            zfs_release_snapshots(runner, snaps, tag, false, dry_run).await?;
        }
        to_destroy = targets;
    } else {
        let mut to_release = Vec::new();
        for target in &targets {
            let tags = holds.get(target).cloned().unwrap_or_default();
            if tags.is_empty() {
                to_destroy.push(target.clone());
            } else if tags.len() == 1 && tags[0] == hold_name {
                to_release.push(target.clone());
                to_destroy.push(target.clone());
            } else {
                log::warn!("skipping orphan '{target}': held by {}", tags.join(", "));
            }
        }
        if !to_release.is_empty() {
            zfs_release_snapshots(runner, &to_release, hold_name, false, dry_run).await?;
        }
    }

    zfs_destroy_snapshots(runner, &to_destroy, false, dry_run).await?;
    Ok(())
}

/// Interactive `[y/N]` confirmation for `RemoveOrphans::Ask`. Any answer
/// other than yes cancels removal.
pub fn confirm_removal(count: usize) -> Result<bool, OrphanError> {
    inquire::Confirm::new(&format!("Remove {count} orphaned snapshot(s)?"))
        .with_default(false)
        .prompt()
        .map_err(|e| OrphanError::PromptFailed(e.to_string()))
}

/// Runs the orphan-cleanup phase per the configured policy. Returns the
/// number of orphans found (for logging by the caller) regardless of
/// whether any were actually removed.
pub async fn run<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    config: &RunConfig,
    timestamp_current: &str,
) -> Result<usize, OrphanError> {
    let orphans = find_orphans(runner, plans, config, timestamp_current).await?;
    let count = orphans.len();

    match config.remove_orphans {
        RemoveOrphans::False => {
            log::info!("{count} orphaned snapshot(s) found, not removing (--remove-orphans=false)");
        }
        RemoveOrphans::True => {
            log::info!("removing {count} orphaned snapshot(s)");
            destroy_orphans(runner, &orphans, &config.hold_name, false, config.dry_run()).await?;
        }
        RemoveOrphans::Ask => {
            if count > 0 && confirm_removal(count)? {
                destroy_orphans(runner, &orphans, &config.hold_name, false, config.dry_run()).await?;
            } else if count > 0 {
                log::info!("orphan removal cancelled by operator");
            }
        }
        RemoveOrphans::Only => {
            log::info!("removing {count} orphaned snapshot(s) (--remove-orphans=only)");
            destroy_orphans(runner, &orphans, &config.hold_name, false, config.dry_run()).await?;
        }
        RemoveOrphans::ForceRelease => {
            log::info!("force-releasing and removing {count} orphaned snapshot(s)");
            destroy_orphans(runner, &orphans, &config.hold_name, true, config.dry_run()).await?;
        }
    }

    Ok(count)
}
