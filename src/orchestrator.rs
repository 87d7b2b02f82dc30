//* Minimizes recursive roots, batches snapshot creation/holding/stamping,
//* and releases+destroys snapshots at teardown, respecting existing holds.
use crate::command::CommandRunner;
use crate::planner::DatasetPlan;
use crate::zfs::{
    zfs_create_snapshots, zfs_destroy_snapshots, zfs_hold_snapshots, zfs_holds,
    zfs_release_snapshots, zfs_set, ZfsError, SNAPSHOT_SEPARATOR,
};
use std::collections::HashMap;

fn covered_by(roots: &[String], dataset: &str) -> bool {
    roots.iter().any(|r| dataset == r || dataset.starts_with(&format!("{r}/")))
}

/// Drops any dataset already covered by an earlier (lexicographically
/// smaller) entry, so a single `-r` snapshot on the ancestor suffices.
/// Idempotent and invariant under input permutation.
pub fn minimize_roots(roots: &[String]) -> Vec<String> {
    let mut sorted: Vec<String> = roots.to_vec();
    sorted.sort();
    let mut minimized: Vec<String> = Vec::new();
    for d in sorted {
        if !covered_by(&minimized, &d) {
            minimized.push(d);
        }
    }
    minimized
}

/// Splits a plan list into `(minimized recursive roots, remaining
/// non-recursive datasets)`, the partition creation/holding/teardown all
/// share.
pub fn partition_targets(plans: &[DatasetPlan]) -> (Vec<String>, Vec<String>) {
    let recursive_roots: Vec<String> = plans
        .iter()
        .filter(|p| p.recursive_for_snapshot)
        .map(|p| p.dataset.clone())
        .collect();
    let r_star = minimize_roots(&recursive_roots);

    let n: Vec<String> = plans
        .iter()
        .filter(|p| !p.recursive_for_snapshot)
        .map(|p| p.dataset.clone())
        .filter(|d| !covered_by(&r_star, d))
        .collect();

    (r_star, n)
}

pub async fn create_snapshots<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    snapname: &str,
    dry_run: bool,
) -> Result<Vec<String>, ZfsError> {
    let (r_star, n) = partition_targets(plans);
    let mut created = Vec::new();
    if !r_star.is_empty() {
        created.extend(zfs_create_snapshots(runner, &r_star, snapname, true, dry_run).await?);
    }
    if !n.is_empty() {
        created.extend(zfs_create_snapshots(runner, &n, snapname, false, dry_run).await?);
    }
    Ok(created)
}

pub async fn hold_snapshots<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    snapname: &str,
    hold_name: &str,
    dry_run: bool,
) -> Result<(), ZfsError> {
    let (r_star, n) = partition_targets(plans);
    if !r_star.is_empty() {
        let targets: Vec<String> = r_star.iter().map(|d| format!("{d}{SNAPSHOT_SEPARATOR}{snapname}")).collect();
        zfs_hold_snapshots(runner, &targets, hold_name, true, dry_run).await?;
    }
    if !n.is_empty() {
        let targets: Vec<String> = n.iter().map(|d| format!("{d}{SNAPSHOT_SEPARATOR}{snapname}")).collect();
        zfs_hold_snapshots(runner, &targets, hold_name, false, dry_run).await?;
    }
    Ok(())
}

/// Stamps the timestamp property on every plan dataset's snapshot, including
/// ones only snapshotted implicitly via an ancestor's `-r`.
pub async fn stamp_timestamp<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    snapname: &str,
    timestamp_property: &str,
    timestamp: &str,
    dry_run: bool,
) -> Result<(), ZfsError> {
    let targets: Vec<String> = plans
        .iter()
        .map(|p| format!("{}{SNAPSHOT_SEPARATOR}{snapname}", p.dataset))
        .collect();
    if targets.is_empty() {
        return Ok(());
    }
    let mut props = HashMap::new();
    props.insert(timestamp_property.to_string(), timestamp.to_string());
    zfs_set(runner, &targets, &props, dry_run).await
}

/// Releases and destroys every plan dataset's snapshot for this run,
/// respecting whichever holds are present.
///
/// Under `force_release`, every hold tag seen is released (each logged with
/// its count) before destruction; otherwise only our own hold is released,
/// and snapshots carrying any other tag are left in place with a warning.
pub async fn teardown<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    snapname: &str,
    hold_name: &str,
    hold_enabled: bool,
    force_release: bool,
    dry_run: bool,
) -> Result<(), ZfsError> {
    let (r_star, _n) = partition_targets(plans);
    let all_datasets: Vec<String> = plans.iter().map(|p| p.dataset.clone()).collect();
    if all_datasets.is_empty() {
        return Ok(());
    }
    let targets: Vec<String> = all_datasets
        .iter()
        .map(|d| format!("{d}{SNAPSHOT_SEPARATOR}{snapname}"))
        .collect();

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
            log::warn!("force-release: releasing hold '{tag}' from {} snapshot(s)", snaps.len());
            zfs_release_snapshots(runner, snaps, tag, false, dry_run).await?;
        }
        to_destroy = targets;
    } else {
        let mut to_release: Vec<String> = Vec::new();
        for target in &targets {
            let tags = holds.get(target).cloned().unwrap_or_default();
            if tags.is_empty() {
                to_destroy.push(target.clone());
            } else if hold_enabled && tags.len() == 1 && tags[0] == hold_name {
                to_release.push(target.clone());
                to_destroy.push(target.clone());
            } else {
                log::warn!("skipping destruction of '{target}': held by {}", tags.join(", "));
            }
        }
        if !to_release.is_empty() {
            zfs_release_snapshots(runner, &to_release, hold_name, false, dry_run).await?;
        }
    }

    let (destroy_recursive, destroy_plain): (Vec<String>, Vec<String>) =
        to_destroy.into_iter().partition(|target| {
            let dataset = target.split(SNAPSHOT_SEPARATOR).next().unwrap_or(target);
            covered_by(&r_star, dataset)
        });

    if !destroy_recursive.is_empty() {
        zfs_destroy_snapshots(runner, &destroy_recursive, true, dry_run).await?;
    }
    if !destroy_plain.is_empty() {
        zfs_destroy_snapshots(runner, &destroy_plain, false, dry_run).await?;
    }
    Ok(())
}

#[cfg(test)]
mod test_orchestrator {
    use super::*;
    use crate::command::fake::FakeRunner;
    use crate::planner::IncludeMode;

    fn plan(dataset: &str, mode: IncludeMode) -> DatasetPlan {
        let recursive_for_snapshot = matches!(mode, IncludeMode::Recursive | IncludeMode::Children);
        let process_self = matches!(mode, IncludeMode::True | IncludeMode::Recursive);
        DatasetPlan {
            dataset: dataset.to_string(),
            mountpoint: format!("/{dataset}"),
            include_mode: mode,
            recursive_for_snapshot,
            process_self,
        }
    }

    #[test]
    fn minimize_is_idempotent_and_permutation_invariant() {
        let a = vec!["tank/b".to_string(), "tank".to_string(), "tank/a".to_string()];
        let once = minimize_roots(&a);
        let twice = minimize_roots(&once);
        assert_eq!(once, vec!["tank".to_string()]);
        assert_eq!(once, twice);

        let shuffled = vec!["tank/a".to_string(), "tank/b".to_string(), "tank".to_string()];
        assert_eq!(minimize_roots(&shuffled), once);
    }

    #[test]
    fn partition_separates_recursive_roots_from_remainder() {
        let plans = vec![
            plan("tank", IncludeMode::Recursive),
            plan("tank/a", IncludeMode::True),
            plan("tank/b", IncludeMode::Children),
            plan("tank/b/x", IncludeMode::True),
            plan("other", IncludeMode::True),
        ];
        let (r_star, n) = partition_targets(&plans);
        assert_eq!(r_star, vec!["tank".to_string()]);
        assert_eq!(n, vec!["other".to_string()]);
    }

    #[tokio::test]
    async fn create_issues_one_recursive_and_one_plain_call() {
        let runner = FakeRunner::new();
        let plans = vec![
            plan("tank", IncludeMode::Recursive),
            plan("other", IncludeMode::True),
        ];
        runner.script_ok(&["zfs", "snapshot", "-r", "tank@s1"], "");
        runner.script_ok(&["zfs", "snapshot", "other@s1"], "");

        let created = create_snapshots(&runner, &plans, "s1", false).await.unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(runner.executed().len(), 2);
    }

    #[tokio::test]
    async fn teardown_destroys_snapshots_with_no_holds() {
        let runner = FakeRunner::new();
        let plans = vec![plan("tank/a", IncludeMode::True)];
        runner.script_ok(&["zfs", "holds", "-H", "tank/a@s1"], "");
        runner.script_ok(&["zfs", "destroy", "tank/a@s1"], "");

        teardown(&runner, &plans, "s1", "zfs-pbs-backup", false, false, false)
            .await
            .unwrap();
        assert!(runner.executed().iter().any(|c| c.contains(&"destroy".to_string())));
        assert!(!runner.executed().iter().any(|c| c.contains(&"release".to_string())));
    }

    #[tokio::test]
    async fn teardown_skips_snapshot_with_foreign_hold() {
        let runner = FakeRunner::new();
        let plans = vec![plan("tank/a", IncludeMode::True)];
        runner.script_ok(
            &["zfs", "holds", "-H", "tank/a@s1"],
            "tank/a@s1\tzfs-pbs-backup\t1\ntank/a@s1\tother-tool\t1\n",
        );

        teardown(&runner, &plans, "s1", "zfs-pbs-backup", true, false, false)
            .await
            .unwrap();
        assert!(runner.executed().iter().all(|c| c[0] != "zfs" || c[1] != "destroy"));
    }

    #[tokio::test]
    async fn force_release_releases_every_tag_then_destroys() {
        let runner = FakeRunner::new();
        let plans = vec![plan("tank/a", IncludeMode::True)];
        runner.script_ok(
            &["zfs", "holds", "-H", "tank/a@s1"],
            "tank/a@s1\tzfs-pbs-backup\t1\ntank/a@s1\tother-tool\t1\n",
        );
        runner.script_ok(&["zfs", "release", "zfs-pbs-backup", "tank/a@s1"], "");
        runner.script_ok(&["zfs", "release", "other-tool", "tank/a@s1"], "");
        runner.script_ok(&["zfs", "destroy", "tank/a@s1"], "");

        teardown(&runner, &plans, "s1", "zfs-pbs-backup", true, true, false)
            .await
            .unwrap();
        let executed = runner.executed();
        assert!(executed.iter().any(|c| c == &vec!["zfs", "release", "zfs-pbs-backup", "tank/a@s1"]));
        assert!(executed.iter().any(|c| c == &vec!["zfs", "release", "other-tool", "tank/a@s1"]));
        assert!(executed.iter().any(|c| c == &vec!["zfs", "destroy", "tank/a@s1"]));
    }

    #[tokio::test]
    async fn dry_run_records_argv_but_executes_nothing_mutating() {
        let runner = FakeRunner::new();
        let plans = vec![plan("tank/a", IncludeMode::True)];
        create_snapshots(&runner, &plans, "s1", true).await.unwrap();
        assert_eq!(runner.calls().len(), 1);
        assert!(runner.executed().is_empty());
    }
}
