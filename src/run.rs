//* Top-level state machine: selects or resumes a timestamp, sequences
//* discovery, orphan cleanup, snapshot creation, backup, and teardown, and
//* honors dry-run vs `--execute`.
use crate::command::CommandRunner;
use crate::config::{RemoveOrphans, RunConfig};
use crate::orchestrator;
use crate::orphan;
use crate::pbs::{self, PbsError};
use crate::planner::{self, DatasetPlan};
use crate::zfs::{zfs_list, ZfsError};
use chrono::Utc;

#[derive(Debug)]
pub enum RunError {
    Zfs(ZfsError),
    Orphan(orphan::OrphanError),
    Pbs(PbsError),
    NoResumeCandidate,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Zfs(e) => write!(f, "{e}"),
            RunError::Orphan(e) => write!(f, "{e}"),
            RunError::Pbs(e) => write!(f, "{e}"),
            RunError::NoResumeCandidate => {
                write!(f, "--resume given but no prior run's snapshots were found")
            }
        }
    }
}

impl std::error::Error for RunError {}

impl From<ZfsError> for RunError {
    fn from(e: ZfsError) -> Self {
        RunError::Zfs(e)
    }
}
impl From<orphan::OrphanError> for RunError {
    fn from(e: orphan::OrphanError) -> Self {
        RunError::Orphan(e)
    }
}
impl From<PbsError> for RunError {
    fn from(e: PbsError) -> Self {
        RunError::Pbs(e)
    }
}

/// What the caller should do once `execute` returns successfully.
#[derive(Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Plans were empty, or `--remove-orphans only` handled everything.
    NothingToDo,
    /// Full pipeline ran: snapshots (or resumed ones) were backed up and torn down.
    BackedUp { snapshot_name: String, datasets: usize },
}

/// Scans every plan's dataset for snapshots carrying our prefix and returns
/// the snapshot name with the maximum effective timestamp across all of
/// them, per the resume-mode contract in §4.7.
async fn select_resume_timestamp<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    config: &RunConfig,
) -> Result<Option<String>, RunError> {
    let mut best: Option<u64> = None;
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
            let [full_name, prop_value] = row.as_slice() else { continue };
            let Some((dataset, snapname)) = full_name.split_once(crate::zfs::SNAPSHOT_SEPARATOR) else {
                continue;
            };
            if dataset != plan.dataset || !snapname.starts_with(&config.snapshot_prefix) {
                continue;
            }
            let prop = if prop_value == "-" { None } else { Some(prop_value.as_str()) };
            let candidate = prop
                .filter(|v| !v.is_empty() && v.chars().all(|c| c.is_ascii_digit()))
                .or_else(|| {
                    let suffix = snapname.strip_prefix(config.snapshot_prefix.as_str())?;
                    (!suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit())).then_some(suffix)
                });
            if let Some(ts) = candidate.and_then(|s| s.parse::<u64>().ok()) {
                best = Some(best.map_or(ts, |b| b.max(ts)));
            }
        }
    }
    Ok(best.map(|ts| ts.to_string()))
}

pub async fn execute<R: CommandRunner>(runner: &R, config: &RunConfig) -> Result<RunOutcome, RunError> {
    // DISCOVER_PLANS
    let plans = planner::build_plans(runner, config).await?;
    let backup_plans: Vec<DatasetPlan> = plans.iter().filter(|p| p.process_self).cloned().collect();
    if plans.is_empty() {
        log::info!("no datasets matched the include property under the given root(s)");
        return Ok(RunOutcome::NothingToDo);
    }

    // SELECT_TIMESTAMP
    let timestamp_current = if config.resume {
        match select_resume_timestamp(runner, &plans, config).await? {
            Some(ts) => {
                log::info!("resuming run with timestamp '{ts}'");
                ts
            }
            None => return Err(RunError::NoResumeCandidate),
        }
    } else {
        Utc::now().timestamp().to_string()
    };
    let snapshot_name = format!("{}{timestamp_current}", config.snapshot_prefix);

    // CLEAN_ORPHANS
    let orphan_count = orphan::run(runner, &plans, config, &timestamp_current).await?;
    if config.remove_orphans == RemoveOrphans::Only {
        return Ok(RunOutcome::NothingToDo);
    }
    let _ = orphan_count;

    // CREATE_SNAPSHOTS / STAMP_TIMESTAMP (skipped entirely on resume)
    if !config.resume {
        orchestrator::create_snapshots(runner, &plans, &snapshot_name, config.dry_run()).await?;
        if config.hold_enabled {
            orchestrator::hold_snapshots(runner, &plans, &snapshot_name, &config.hold_name, config.dry_run())
                .await?;
        }
        orchestrator::stamp_timestamp(
            runner,
            &plans,
            &snapshot_name,
            &config.timestamp_property,
            &timestamp_current,
            config.dry_run(),
        )
        .await?;
    }

    // PBS_STATUS
    let secret = config.secret.clone();
    pbs::pbs_status(runner, &config.repository, &secret, config.dry_run()).await?;

    // PBS_BACKUP
    let backup_result = pbs::pbs_backup(
        runner,
        &backup_plans,
        &snapshot_name,
        &config.repository,
        &secret,
        config.namespace.as_deref(),
        &config.backup_id,
        &timestamp_current,
        config.archive_name_prefix.as_deref(),
        config.encryption_password.as_deref(),
        config.fingerprint.as_deref(),
        config.change_detection_mode,
        config.dry_run(),
    )
    .await;

    // On backup failure, skip teardown so `--resume` can continue (§9 open
    // question, decided in DESIGN.md): snapshots and holds are left intact.
    backup_result?;

    // TEARDOWN
    orchestrator::teardown(
        runner,
        &plans,
        &snapshot_name,
        &config.hold_name,
        config.hold_enabled,
        config.force_release(),
        config.dry_run(),
    )
    .await?;

    Ok(RunOutcome::BackedUp {
        snapshot_name,
        datasets: backup_plans.len(),
    })
}
