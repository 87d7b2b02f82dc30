//* Repository-string assembly and the two proxmox-backup-client subcommands
//* this orchestrator needs: `status` (reachability probe) and `backup`
//* (the actual archive submission).
use crate::command::{CommandRunner, Invocation};
use crate::config::ChangeDetectionMode;
use crate::planner::DatasetPlan;
use std::fmt::{Display, Formatter};
use std::path::Path;

#[derive(Debug)]
pub enum PbsError {
    PermissionCheckFailed(String),
    RepositoryUnreachable(String),
    AccessError(String),
    SnapshotDirectoryMissing(String),
    BackupFailed(String),
}

impl Display for PbsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PbsError::PermissionCheckFailed(msg) => write!(f, "PBS permission check failed: {msg}"),
            PbsError::RepositoryUnreachable(msg) => write!(f, "unable to reach PBS repository: {msg}"),
            PbsError::AccessError(msg) => write!(f, "PBS status probe failed: {msg}"),
            PbsError::SnapshotDirectoryMissing(path) => {
                write!(f, "snapshot directory does not exist: '{path}'")
            }
            PbsError::BackupFailed(msg) => write!(f, "PBS backup failed: {msg}"),
        }
    }
}

impl std::error::Error for PbsError {}

/// `[username[!token]@][server[:port]:]datastore`
pub fn build_repository(
    username: Option<&str>,
    token_name: Option<&str>,
    server: Option<&str>,
    port: Option<u16>,
    datastore: &str,
) -> Result<String, crate::config::ConfigError> {
    if datastore.is_empty() {
        return Err(crate::config::ConfigError::MissingDatastore);
    }

    let mut repo = String::new();
    if let Some(user) = username {
        repo.push_str(user);
        if let Some(token) = token_name {
            repo.push('!');
            repo.push_str(token);
        }
        repo.push('@');
    }
    if let Some(host) = server {
        repo.push_str(host);
        if let Some(p) = port {
            repo.push(':');
            repo.push_str(&p.to_string());
        }
        repo.push(':');
    }
    repo.push_str(datastore);
    Ok(repo)
}

fn pbs_env(repository: &str, secret: &str) -> Vec<(String, String)> {
    vec![
        ("PBS_REPOSITORY".to_string(), repository.to_string()),
        ("PBS_PASSWORD".to_string(), secret.to_string()),
    ]
}

pub async fn pbs_status<R: CommandRunner>(
    runner: &R,
    repository: &str,
    secret: &str,
    dry_run: bool,
) -> Result<(), PbsError> {
    let argv = vec![
        "proxmox-backup-client".to_string(),
        "status".to_string(),
    ];
    let invocation = Invocation::new(argv, format!("Checking PBS repository '{repository}'"))
        .env("PBS_REPOSITORY", repository)
        .env("PBS_PASSWORD", secret)
        .dry_run(dry_run)
        .check(false);

    let out = runner
        .run(invocation)
        .await
        .map_err(|e| PbsError::AccessError(e.to_string()))?;

    if out.success() {
        return Ok(());
    }

    let lower = out.stderr.to_lowercase();
    if lower.contains("permission check failed") {
        log::error!("PBS permission check failed: {}", out.stderr.trim());
        return Err(PbsError::PermissionCheckFailed(out.stderr.trim().to_string()));
    }
    if lower.contains("unable to get repository") {
        log::error!("Unable to get PBS repository '{repository}': {}", out.stderr.trim());
        return Err(PbsError::RepositoryUnreachable(out.stderr.trim().to_string()));
    }

    log::error!("PBS status probe failed: {}", out.stderr.trim());
    Err(PbsError::AccessError(out.stderr.trim().to_string()))
}

fn sanitize_label(dataset: &str) -> String {
    dataset.replace('/', "_")
}

pub fn pbs_archive_spec(
    dataset: &str,
    mountpoint: &str,
    snapname: &str,
    archive_name_prefix: Option<&str>,
    dry_run: bool,
) -> Result<String, PbsError> {
    let label = format!(
        "{}{}.pxar",
        archive_name_prefix.unwrap_or(""),
        sanitize_label(dataset)
    );
    let path = format!("{mountpoint}/.zfs/snapshot/{snapname}");
    let snapshot_dir = Path::new(&path);

    if !snapshot_dir.exists() {
        if dry_run {
            // The snapshot that would supply this directory is itself stubbed
            // by the Command Runner in dry-run mode, so it never exists yet.
            log::warn!("[dry-run] snapshot directory '{path}' does not exist yet; proceeding anyway");
        } else {
            return Err(PbsError::SnapshotDirectoryMissing(path));
        }
    } else {
        match snapshot_dir.read_dir() {
            Ok(_) if snapshot_dir.is_dir() => {}
            Ok(_) => log::warn!("snapshot path '{path}' exists but is not a directory; proceeding anyway"),
            Err(e) => log::warn!("snapshot directory '{path}' is not readable ({e}); proceeding anyway"),
        }
    }

    Ok(format!("{label}:{path}"))
}

#[allow(clippy::too_many_arguments)]
pub async fn pbs_backup<R: CommandRunner>(
    runner: &R,
    plans: &[DatasetPlan],
    snapshot_name: &str,
    repository: &str,
    secret: &str,
    namespace: Option<&str>,
    backup_id: &str,
    backup_time: &str,
    archive_name_prefix: Option<&str>,
    encryption_password: Option<&str>,
    fingerprint: Option<&str>,
    change_detection_mode: ChangeDetectionMode,
    dry_run: bool,
) -> Result<(), PbsError> {
    let mut specs = Vec::with_capacity(plans.len());
    for plan in plans {
        let spec = pbs_archive_spec(&plan.dataset, &plan.mountpoint, snapshot_name, archive_name_prefix, dry_run)?;
        specs.push(spec);
    }
    if specs.is_empty() {
        return Ok(());
    }

    let mut argv = vec!["proxmox-backup-client".to_string(), "backup".to_string()];
    argv.extend(specs);
    argv.push("--backup-type".to_string());
    argv.push("host".to_string());
    argv.push("--backup-id".to_string());
    argv.push(backup_id.to_string());
    argv.push("--backup-time".to_string());
    argv.push(backup_time.to_string());
    if let Some(ns) = namespace {
        argv.push("--ns".to_string());
        argv.push(ns.to_string());
    }
    if change_detection_mode != ChangeDetectionMode::Metadata {
        argv.push("--change-detection-mode".to_string());
        argv.push(change_detection_mode.as_str().to_string());
    }
    if dry_run {
        argv.push("--dry-run".to_string());
    }

    let mut env = pbs_env(repository, secret);
    if let Some(enc) = encryption_password {
        env.push(("PBS_ENCRYPTION_PASSWORD".to_string(), enc.to_string()));
    }
    if let Some(fp) = fingerprint {
        env.push(("PBS_FINGERPRINT".to_string(), fp.to_string()));
    }

    let message = format!("Backing up {} dataset(s) to '{repository}'", plans.len());
    // Always actually invoked: the client's own --dry-run flag carries the
    // dry-run semantics here, so this call is never routed through the
    // runner's generic mutating-call stub.
    let mut invocation = Invocation::new(argv, message).read_only(true).check(false);
    for (k, v) in env {
        invocation = invocation.env(k, v);
    }

    let out = runner
        .run(invocation)
        .await
        .map_err(|e| PbsError::BackupFailed(e.to_string()))?;

    if out.success() {
        Ok(())
    } else {
        Err(PbsError::BackupFailed(out.stderr.trim().to_string()))
    }
}
