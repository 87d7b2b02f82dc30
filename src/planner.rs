//* Walks each root dataset recursively, reads the include-mode property on
//* every descendant, applies the "exclude empty parents" rule, and emits the
//* work plan the rest of the pipeline operates on.
use crate::command::CommandRunner;
use crate::config::RunConfig;
use crate::zfs::{zfs_get, zfs_list, ZfsError};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeMode {
    False,
    True,
    Recursive,
    Children,
}

impl IncludeMode {
    fn parse(raw: &str, dataset: &str) -> IncludeMode {
        match raw.trim().to_lowercase().as_str() {
            "true" => IncludeMode::True,
            "false" => IncludeMode::False,
            "recursive" => IncludeMode::Recursive,
            "children" => IncludeMode::Children,
            "" => IncludeMode::False,
            other => {
                log::warn!("dataset '{dataset}' has unknown include mode '{other}', treating as false");
                IncludeMode::False
            }
        }
    }
}

impl Display for IncludeMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IncludeMode::False => write!(f, "false"),
            IncludeMode::True => write!(f, "true"),
            IncludeMode::Recursive => write!(f, "recursive"),
            IncludeMode::Children => write!(f, "children"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetPlan {
    pub dataset: String,
    pub mountpoint: String,
    pub include_mode: IncludeMode,
    pub recursive_for_snapshot: bool,
    pub process_self: bool,
}

fn immediate_children<'a>(dataset: &str, all_names: &'a [String]) -> Vec<&'a str> {
    let prefix = format!("{dataset}/");
    all_names
        .iter()
        .filter_map(|n| {
            let rest = n.strip_prefix(&prefix)?;
            if rest.contains('/') { None } else { Some(n.as_str()) }
        })
        .collect()
}

/// `true` iff every entry directly inside `mountpoint` is a child dataset's
/// mountpoint (or the directory has no entries at all). An unreadable
/// mountpoint is conservatively treated as *not* empty.
fn parent_is_empty(mountpoint: &str, child_mountpoints: &[String]) -> bool {
    let entries = match std::fs::read_dir(mountpoint) {
        Ok(entries) => entries,
        Err(_) => return false,
    };

    for entry in entries {
        let Ok(entry) = entry else { return false };
        let path = entry.path().to_string_lossy().to_string();
        if !child_mountpoints.iter().any(|cm| cm == &path) {
            return false;
        }
    }
    true
}

pub async fn build_plans<R: CommandRunner>(
    runner: &R,
    config: &RunConfig,
) -> Result<Vec<DatasetPlan>, ZfsError> {
    let mut mountpoints: HashMap<String, String> = HashMap::new();

    for root in &config.roots {
        let rows = zfs_list(
            runner,
            Some(root),
            true,
            &["name", "mountpoint"],
            &["filesystem"],
        )
        .await?;
        for row in rows {
            if let [name, mountpoint] = row.as_slice() {
                mountpoints.entry(name.clone()).or_insert_with(|| mountpoint.clone());
            }
        }
    }

    let mut names: Vec<String> = mountpoints.keys().cloned().collect();
    names.sort();

    let modes_raw = zfs_get(runner, &names, &[config.include_property.clone()], None).await?;

    let mut plans = Vec::new();
    for name in &names {
        let raw = modes_raw
            .get(name)
            .and_then(|props| props.get(&config.include_property))
            .map(String::as_str)
            .unwrap_or("");
        let include_mode = IncludeMode::parse(raw, name);
        if include_mode == IncludeMode::False {
            continue;
        }

        let recursive_for_snapshot = matches!(include_mode, IncludeMode::Recursive | IncludeMode::Children);
        let mut process_self = matches!(include_mode, IncludeMode::True | IncludeMode::Recursive);

        if process_self && config.exclude_empty_parents {
            let children = immediate_children(name, &names);
            if !children.is_empty() {
                let child_mountpoints: Vec<String> = children
                    .iter()
                    .filter_map(|c| mountpoints.get(*c).cloned())
                    .collect();
                let mountpoint = mountpoints.get(name).map(String::as_str).unwrap_or("");
                if parent_is_empty(mountpoint, &child_mountpoints) {
                    log::info!(
                        "dataset '{name}' has no content outside of child mountpoints; skipping backup of the parent itself"
                    );
                    process_self = false;
                }
            }
        }

        plans.push(DatasetPlan {
            dataset: name.clone(),
            mountpoint: mountpoints.get(name).cloned().unwrap_or_default(),
            include_mode,
            recursive_for_snapshot,
            process_self,
        });
    }

    Ok(plans)
}

#[cfg(test)]
mod test_planner {
    use super::*;
    use crate::command::fake::FakeRunner;

    fn list_line(name: &str, mountpoint: &str) -> String {
        format!("{name}\t{mountpoint}\n")
    }

    fn get_line(name: &str, value: &str) -> String {
        format!("{name}\t{}\t{value}\n", crate::config::DEFAULT_INCLUDE_PROPERTY)
    }

    fn sample_config() -> RunConfig {
        RunConfig {
            roots: vec!["tank".into()],
            include_property: crate::config::DEFAULT_INCLUDE_PROPERTY.into(),
            timestamp_property: crate::config::DEFAULT_TIMESTAMP_PROPERTY.into(),
            snapshot_prefix: crate::config::DEFAULT_SNAPSHOT_PREFIX.into(),
            hold_name: crate::config::DEFAULT_HOLD_NAME.into(),
            hold_enabled: false,
            exclude_empty_parents: false,
            remove_orphans: crate::config::RemoveOrphans::False,
            resume: false,
            execute: false,
            repository: "store".into(),
            secret: "secret".into(),
            backup_id: "host".into(),
            namespace: None,
            change_detection_mode: crate::config::ChangeDetectionMode::Metadata,
            archive_name_prefix: None,
            encryption_password: None,
            fingerprint: None,
        }
    }

    #[tokio::test]
    async fn mixed_modes_tree_scenario() {
        let runner = FakeRunner::new();
        let names = ["tank", "tank/a", "tank/b", "tank/b/x", "tank/b/y"];
        let list_stdout: String = names
            .iter()
            .map(|n| list_line(n, &format!("/{}", n.replace('/', "/"))))
            .collect();
        runner.script_ok(
            &["zfs", "list", "-H", "-p", "-o", "name,mountpoint", "-t", "filesystem", "-r", "tank"],
            &list_stdout,
        );

        let mut get_argv = vec![
            "zfs".to_string(), "get".to_string(), "-H".to_string(), "-p".to_string(),
            "-o".to_string(), "name,property,value".to_string(),
            "-s".to_string(), "local,received,default,inherited".to_string(),
            crate::config::DEFAULT_INCLUDE_PROPERTY.to_string(),
        ];
        let mut sorted_names: Vec<&str> = names.to_vec();
        sorted_names.sort();
        get_argv.extend(sorted_names.iter().map(|s| s.to_string()));
        let get_argv_refs: Vec<&str> = get_argv.iter().map(String::as_str).collect();

        let get_stdout = format!(
            "{}{}{}{}{}",
            get_line("tank", "recursive"),
            get_line("tank/a", "true"),
            get_line("tank/b", "children"),
            get_line("tank/b/x", "true"),
            get_line("tank/b/y", "false"),
        );
        runner.script_ok(&get_argv_refs, &get_stdout);

        let config = sample_config();
        let plans = build_plans(&runner, &config).await.unwrap();

        let process_self: std::collections::HashSet<&str> = plans
            .iter()
            .filter(|p| p.process_self)
            .map(|p| p.dataset.as_str())
            .collect();
        assert_eq!(
            process_self,
            ["tank", "tank/a", "tank/b/x"].into_iter().collect()
        );

        let recursive: std::collections::HashSet<&str> = plans
            .iter()
            .filter(|p| p.recursive_for_snapshot)
            .map(|p| p.dataset.as_str())
            .collect();
        assert_eq!(recursive, ["tank", "tank/b"].into_iter().collect());

        assert!(plans.iter().all(|p| !p.process_self || matches!(p.include_mode, IncludeMode::True | IncludeMode::Recursive)));
    }

    #[test]
    fn unknown_mode_normalizes_to_false() {
        assert_eq!(IncludeMode::parse("Recursive", "x"), IncludeMode::Recursive);
        assert_eq!(IncludeMode::parse("  TRUE ", "x"), IncludeMode::True);
        assert_eq!(IncludeMode::parse("bogus", "x"), IncludeMode::False);
        assert_eq!(IncludeMode::parse("", "x"), IncludeMode::False);
    }

    #[test]
    fn empty_parent_suppression_toggles_with_flag() {
        let tmp = std::env::temp_dir().join("zfs-pbs-backup-planner-test");
        let parent = tmp.join("media");
        let child = parent.join("movies");
        std::fs::create_dir_all(&child).unwrap();

        let child_path = child.to_string_lossy().to_string();
        assert!(parent_is_empty(&parent.to_string_lossy(), &[child_path.clone()]));

        std::fs::write(parent.join("extra-file"), b"x").unwrap();
        assert!(!parent_is_empty(&parent.to_string_lossy(), &[child_path]));

        std::fs::remove_dir_all(&tmp).ok();
    }

    #[test]
    fn unreadable_mountpoint_is_treated_as_not_empty() {
        assert!(!parent_is_empty("/nonexistent-for-test-zfs-pbs-backup", &[]));
    }
}
