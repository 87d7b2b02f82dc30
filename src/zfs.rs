//* Typed operations over `zfs list/get/set/snapshot/hold/holds/release/destroy`.
//* This is the only module that builds `zfs` argv; everything else talks to
//* it through these functions.
use crate::command::{CommandRunner, Invocation, ProcessError};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub const SNAPSHOT_SEPARATOR: char = '@';

#[derive(Debug)]
pub enum ZfsError {
    DatasetMissing(String),
    InsufficientPrivilege { argv: Vec<String>, stderr: String },
    CommandFailed { argv: Vec<String>, stderr: String },
    UnsafeDestroyTarget(String),
}

impl Display for ZfsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ZfsError::DatasetMissing(d) => write!(f, "dataset or snapshot missing: '{d}'"),
            ZfsError::InsufficientPrivilege { argv, stderr } => write!(
                f,
                "insufficient privilege running '{}': {}",
                shell_words::join(argv),
                stderr.trim()
            ),
            ZfsError::CommandFailed { argv, stderr } => write!(
                f,
                "zfs command failed '{}': {}",
                shell_words::join(argv),
                stderr.trim()
            ),
            ZfsError::UnsafeDestroyTarget(name) => write!(
                f,
                "refusing to destroy '{name}': not a snapshot name (missing '@')"
            ),
        }
    }
}

impl std::error::Error for ZfsError {}

fn looks_privileged_failure(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("permission denied") || lower.contains("must be root")
}

/// Re-verify dataset existence with a read-only probe to distinguish
/// `DatasetMissing` from `InsufficientPrivilege`/`CommandFailed`.
async fn classify_mutation_failure<R: CommandRunner>(
    runner: &R,
    targets: &[String],
    err: ProcessError,
) -> ZfsError {
    for target in targets {
        let dataset = target.split(SNAPSHOT_SEPARATOR).next().unwrap_or(target);
        if !zfs_dataset_exists(runner, dataset, &[]).await {
            return ZfsError::DatasetMissing(target.clone());
        }
    }

    match &err {
        ProcessError::CommandFailed { argv, stderr, .. } if looks_privileged_failure(stderr) => {
            ZfsError::InsufficientPrivilege {
                argv: argv.clone(),
                stderr: stderr.clone(),
            }
        }
        ProcessError::CommandFailed { argv, stderr, .. } => ZfsError::CommandFailed {
            argv: argv.clone(),
            stderr: stderr.clone(),
        },
        other => ZfsError::CommandFailed {
            argv: other.argv().to_vec(),
            stderr: other.to_string(),
        },
    }
}

fn parse_rows(stdout: &str) -> Vec<Vec<String>> {
    stdout
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.split('\t').map(str::to_string).collect())
        .collect()
}

pub async fn zfs_list<R: CommandRunner>(
    runner: &R,
    dataset: Option<&str>,
    recursive: bool,
    columns: &[&str],
    types: &[&str],
) -> Result<Vec<Vec<String>>, ZfsError> {
    let mut argv = vec!["zfs".to_string(), "list".to_string(), "-H".to_string(), "-p".to_string()];
    argv.push("-o".to_string());
    argv.push(columns.join(","));
    if !types.is_empty() {
        argv.push("-t".to_string());
        argv.push(types.join(","));
    }
    if recursive {
        argv.push("-r".to_string());
    }
    if let Some(d) = dataset {
        argv.push(d.to_string());
    }
    let message = match dataset {
        Some(d) => format!("Listing datasets under '{d}'"),
        None => "Listing datasets".to_string(),
    };
    let invocation = Invocation::new(argv, message).read_only(true).check(true);
    let out = runner
        .run(invocation)
        .await
        .map_err(|e| ZfsError::CommandFailed {
            argv: e.argv().to_vec(),
            stderr: e.to_string(),
        })?;
    Ok(parse_rows(&out.stdout))
}

pub async fn zfs_dataset_exists<R: CommandRunner>(
    runner: &R,
    dataset: &str,
    types: &[&str],
) -> bool {
    let mut argv = vec![
        "zfs".to_string(),
        "list".to_string(),
        "-H".to_string(),
        "-o".to_string(),
        "name".to_string(),
    ];
    if !types.is_empty() {
        argv.push("-t".to_string());
        argv.push(types.join(","));
    }
    argv.push(dataset.to_string());
    let invocation = Invocation::new(argv, format!("Checking existence of '{dataset}'"))
        .read_only(true)
        .check(false);
    match runner.run(invocation).await {
        Ok(cp) => cp.success(),
        Err(_) => false,
    }
}

pub async fn zfs_get<R: CommandRunner>(
    runner: &R,
    datasets: &[String],
    properties: &[String],
    source_order: Option<&[&str]>,
) -> Result<HashMap<String, HashMap<String, String>>, ZfsError> {
    let mut map: HashMap<String, HashMap<String, String>> = HashMap::new();
    if datasets.is_empty() || properties.is_empty() {
        return Ok(map);
    }

    let sources = source_order.unwrap_or(&["local", "received", "default", "inherited"]);
    let mut argv = vec!["zfs".to_string(), "get".to_string(), "-H".to_string(), "-p".to_string()];
    argv.push("-o".to_string());
    argv.push("name,property,value".to_string());
    argv.push("-s".to_string());
    argv.push(sources.join(","));
    argv.push(properties.join(","));
    argv.extend(datasets.iter().cloned());

    let message = format!(
        "Reading {} propert{} on {} dataset(s)",
        properties.len(),
        if properties.len() == 1 { "y" } else { "ies" },
        datasets.len()
    );
    let invocation = Invocation::new(argv, message).read_only(true).check(true);
    let out = runner
        .run(invocation)
        .await
        .map_err(|e| ZfsError::CommandFailed {
            argv: e.argv().to_vec(),
            stderr: e.to_string(),
        })?;

    for row in parse_rows(&out.stdout) {
        if let [name, prop, value] = row.as_slice() {
            map.entry(name.clone()).or_default().insert(prop.clone(), value.clone());
        }
    }
    Ok(map)
}

pub async fn zfs_set<R: CommandRunner>(
    runner: &R,
    datasets: &[String],
    properties: &HashMap<String, String>,
    dry_run: bool,
) -> Result<(), ZfsError> {
    if datasets.is_empty() || properties.is_empty() {
        return Ok(());
    }

    let mut assignments: Vec<String> = properties.iter().map(|(k, v)| format!("{k}={v}")).collect();
    assignments.sort();

    let mut argv = vec!["zfs".to_string(), "set".to_string()];
    argv.extend(assignments);
    argv.extend(datasets.iter().cloned());

    let message = format!(
        "Setting {} propert{} on {} dataset(s)",
        properties.len(),
        if properties.len() == 1 { "y" } else { "ies" },
        datasets.len()
    );
    let invocation = Invocation::new(argv, message).dry_run(dry_run).check(true);
    match runner.run(invocation).await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify_mutation_failure(runner, datasets, e).await),
    }
}

pub async fn zfs_create_snapshots<R: CommandRunner>(
    runner: &R,
    datasets: &[String],
    snapname: &str,
    recursive: bool,
    dry_run: bool,
) -> Result<Vec<String>, ZfsError> {
    if datasets.is_empty() {
        return Ok(Vec::new());
    }

    let targets: Vec<String> = datasets
        .iter()
        .map(|d| format!("{d}{SNAPSHOT_SEPARATOR}{snapname}"))
        .collect();
    let mut argv = vec!["zfs".to_string(), "snapshot".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    argv.extend(targets.clone());

    let message = format!(
        "Creating {}snapshot '{snapname}' on {} dataset(s)",
        if recursive { "recursive " } else { "" },
        datasets.len()
    );
    let invocation = Invocation::new(argv, message).dry_run(dry_run).check(true);
    match runner.run(invocation).await {
        Ok(_) => Ok(targets),
        Err(e) => Err(classify_mutation_failure(runner, &targets, e).await),
    }
}

pub async fn zfs_hold_snapshots<R: CommandRunner>(
    runner: &R,
    snapshots: &[String],
    hold_name: &str,
    recursive: bool,
    dry_run: bool,
) -> Result<(), ZfsError> {
    if snapshots.is_empty() {
        return Ok(());
    }

    let mut argv = vec!["zfs".to_string(), "hold".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    argv.push(hold_name.to_string());
    argv.extend(snapshots.iter().cloned());

    let message = format!(
        "Holding {} snapshot(s) with tag '{hold_name}'",
        snapshots.len()
    );
    let invocation = Invocation::new(argv, message).dry_run(dry_run).check(true);
    match runner.run(invocation).await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify_mutation_failure(runner, snapshots, e).await),
    }
}

pub async fn zfs_holds<R: CommandRunner>(
    runner: &R,
    snapshots: &[String],
    recursive: bool,
) -> Result<HashMap<String, Vec<String>>, ZfsError> {
    let mut map: HashMap<String, Vec<String>> = snapshots.iter().cloned().map(|s| (s, Vec::new())).collect();
    if snapshots.is_empty() {
        return Ok(map);
    }

    let mut argv = vec!["zfs".to_string(), "holds".to_string(), "-H".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    argv.extend(snapshots.iter().cloned());

    let invocation = Invocation::new(argv, format!("Reading holds on {} snapshot(s)", snapshots.len()))
        .read_only(true)
        .check(true);
    let out = runner
        .run(invocation)
        .await
        .map_err(|e| ZfsError::CommandFailed {
            argv: e.argv().to_vec(),
            stderr: e.to_string(),
        })?;

    for row in parse_rows(&out.stdout) {
        if let [name, tag, ..] = row.as_slice() {
            map.entry(name.clone()).or_default().push(tag.clone());
        }
    }
    Ok(map)
}

pub async fn zfs_release_snapshots<R: CommandRunner>(
    runner: &R,
    snapshots: &[String],
    hold_name: &str,
    recursive: bool,
    dry_run: bool,
) -> Result<(), ZfsError> {
    if snapshots.is_empty() {
        return Ok(());
    }

    let mut argv = vec!["zfs".to_string(), "release".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    argv.push(hold_name.to_string());
    argv.extend(snapshots.iter().cloned());

    let message = format!(
        "Releasing hold '{hold_name}' from {} snapshot(s)",
        snapshots.len()
    );
    let invocation = Invocation::new(argv, message).dry_run(dry_run).check(true);
    match runner.run(invocation).await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify_mutation_failure(runner, snapshots, e).await),
    }
}

pub async fn zfs_destroy_snapshots<R: CommandRunner>(
    runner: &R,
    snapshots: &[String],
    recursive: bool,
    dry_run: bool,
) -> Result<(), ZfsError> {
    if snapshots.is_empty() {
        return Ok(());
    }

    for name in snapshots {
        if !name.contains(SNAPSHOT_SEPARATOR) {
            return Err(ZfsError::UnsafeDestroyTarget(name.clone()));
        }
    }

    let mut argv = vec!["zfs".to_string(), "destroy".to_string()];
    if recursive {
        argv.push("-r".to_string());
    }
    argv.extend(snapshots.iter().cloned());

    let message = format!("Destroying {} snapshot(s)", snapshots.len());
    let invocation = Invocation::new(argv, message).dry_run(dry_run).check(true);
    match runner.run(invocation).await {
        Ok(_) => Ok(()),
        Err(e) => Err(classify_mutation_failure(runner, snapshots, e).await),
    }
}

#[cfg(test)]
mod test_zfs {
    use super::*;
    use crate::command::fake::FakeRunner;

    #[tokio::test]
    async fn list_parses_tab_separated_rows() {
        let runner = FakeRunner::new();
        runner.script_ok(
            &["zfs", "list", "-H", "-p", "-o", "name,mountpoint", "-r", "tank"],
            "tank\t/tank\ntank/a\t/tank/a\n",
        );
        let rows = zfs_list(&runner, Some("tank"), true, &["name", "mountpoint"], &[])
            .await
            .unwrap();
        assert_eq!(rows, vec![
            vec!["tank".to_string(), "/tank".to_string()],
            vec!["tank/a".to_string(), "/tank/a".to_string()],
        ]);
    }

    #[tokio::test]
    async fn dataset_exists_false_on_nonzero_exit() {
        let runner = FakeRunner::new();
        runner.script_failure(
            &["zfs", "list", "-H", "-o", "name", "tank/missing"],
            1,
            "dataset does not exist",
        );
        assert!(!zfs_dataset_exists(&runner, "tank/missing", &[]).await);
    }

    #[tokio::test]
    async fn holds_includes_snapshots_with_no_holds() {
        let runner = FakeRunner::new();
        runner.script_ok(
            &["zfs", "holds", "-H", "tank/a@s1", "tank/b@s1"],
            "tank/a@s1\tzfs-pbs-backup\t1700000000\n",
        );
        let holds = zfs_holds(&runner, &["tank/a@s1".into(), "tank/b@s1".into()], false)
            .await
            .unwrap();
        assert_eq!(holds["tank/a@s1"], vec!["zfs-pbs-backup".to_string()]);
        assert_eq!(holds["tank/b@s1"], Vec::<String>::new());
    }

    #[tokio::test]
    async fn destroy_refuses_name_without_at() {
        let runner = FakeRunner::new();
        let err = zfs_destroy_snapshots(&runner, &["tank/a".into()], false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ZfsError::UnsafeDestroyTarget(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn destroy_dry_run_does_not_execute() {
        let runner = FakeRunner::new();
        zfs_destroy_snapshots(&runner, &["tank/a@s1".into()], false, true)
            .await
            .unwrap();
        assert!(runner.executed().is_empty());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn set_batches_multiple_properties_into_one_call() {
        let runner = FakeRunner::new();
        let mut props = HashMap::new();
        props.insert("a:one".to_string(), "1".to_string());
        props.insert("a:two".to_string(), "2".to_string());
        zfs_set(&runner, &["tank/a".into()], &props, false).await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0][0], "zfs");
        assert_eq!(calls[0][1], "set");
    }

    #[tokio::test]
    async fn mutation_failure_classifies_dataset_missing() {
        let runner = FakeRunner::new();
        runner.script_failure(
            &["zfs", "snapshot", "tank/gone@s1"],
            1,
            "cannot open 'tank/gone': dataset does not exist",
        );
        runner.script_failure(
            &["zfs", "list", "-H", "-o", "name", "tank/gone"],
            1,
            "dataset does not exist",
        );
        let err = zfs_create_snapshots(&runner, &["tank/gone".into()], "s1", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ZfsError::DatasetMissing(d) if d == "tank/gone@s1"));
    }

    #[tokio::test]
    async fn mutation_failure_classifies_insufficient_privilege() {
        let runner = FakeRunner::new();
        runner.script_failure(
            &["zfs", "snapshot", "tank/a@s1"],
            1,
            "cannot create snapshot 'tank/a@s1': permission denied",
        );
        runner.script_ok(&["zfs", "list", "-H", "-o", "name", "tank/a"], "tank/a\n");
        let err = zfs_create_snapshots(&runner, &["tank/a".into()], "s1", false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ZfsError::InsufficientPrivilege { .. }));
    }
}
