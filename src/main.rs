use clap::Parser;
use std::io::IsTerminal;
use std::process::ExitCode;
use zfs_pbs_backup::config::{ChangeDetectionMode, ConfigError, RemoveOrphans, RunConfig};
use zfs_pbs_backup::pbs::build_repository;
use zfs_pbs_backup::run::{self, RunOutcome};

/// Create (and optionally hold) ZFS snapshots and back them up to Proxmox
/// Backup Server, one archive per dataset. Dry-run by default — pass
/// `--execute` to perform changes.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = concat!("v", env!("CARGO_PKG_VERSION"), "+", env!("GIT_SHA")))]
struct Args {
    /// Root dataset(s) to walk
    #[arg(required = true)]
    roots: Vec<String>,

    /// Property controlling per-dataset inclusion
    #[arg(long, default_value_t = zfs_pbs_backup::config::DEFAULT_INCLUDE_PROPERTY.to_string())]
    include_property: String,

    /// Property stamped with this run's unix timestamp
    #[arg(long, default_value_t = zfs_pbs_backup::config::DEFAULT_TIMESTAMP_PROPERTY.to_string())]
    timestamp_property: String,

    /// Prefix prepended to the decimal unix timestamp to form a snapshot name
    #[arg(long, default_value_t = zfs_pbs_backup::config::DEFAULT_SNAPSHOT_PREFIX.to_string())]
    snapshot_prefix: String,

    /// Hold tag applied to snapshots created this run
    #[arg(long, default_value_t = zfs_pbs_backup::config::DEFAULT_HOLD_NAME.to_string())]
    hold_name: String,

    /// Hold snapshots so nothing can reap them mid-run
    #[arg(long)]
    hold_snapshots: bool,

    /// Skip backing up a parent dataset whose mountpoint holds nothing but child mountpoints
    #[arg(long)]
    exclude_empty_parents: bool,

    /// Policy for cleaning up prior-run snapshots that don't belong to this run
    #[arg(long, value_enum, default_value_t = RemoveOrphans::False)]
    remove_orphans: RemoveOrphans,

    /// Skip snapshot creation and continue from the newest previously-stamped run
    #[arg(long)]
    resume: bool,

    /// Pre-built PBS repository string; overrides --pbs-username/--pbs-server/--pbs-datastore/etc
    #[arg(long)]
    pbs_repository: Option<String>,

    #[arg(long)]
    pbs_username: Option<String>,

    #[arg(long)]
    pbs_token_name: Option<String>,

    #[arg(long)]
    pbs_server: Option<String>,

    #[arg(long)]
    pbs_port: Option<u16>,

    /// Required unless --pbs-repository is given
    #[arg(long)]
    pbs_datastore: Option<String>,

    #[arg(long, env = "PBS_PASSWORD")]
    pbs_password: Option<String>,

    #[arg(long)]
    pbs_namespace: Option<String>,

    #[arg(long, env = "PBS_ENCRYPTION_PASSWORD")]
    pbs_encryption_password: Option<String>,

    #[arg(long, env = "PBS_FINGERPRINT")]
    pbs_fingerprint: Option<String>,

    /// Defaults to the local hostname
    #[arg(long)]
    pbs_backup_id: Option<String>,

    #[arg(long, value_enum, default_value_t = ChangeDetectionMode::Metadata)]
    change_detection_mode: ChangeDetectionMode,

    #[arg(long)]
    archive_name_prefix: Option<String>,

    /// Leave dry-run mode and perform real changes
    #[arg(long)]
    execute: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        log::LevelFilter::Error
    } else {
        match verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    };
    env_logger::Builder::new().filter_level(level).init();
}

/// CLI flag, then env (handled declaratively by `clap`'s `env = "PBS_PASSWORD"`),
/// then an interactive prompt when stdin is a terminal.
fn resolve_secret(flag: Option<String>) -> Result<String, ConfigError> {
    if let Some(secret) = flag {
        return Ok(secret);
    }
    if std::io::stdin().is_terminal() {
        return rpassword::prompt_password("PBS password: ").map_err(|_| ConfigError::MissingSecret);
    }
    Err(ConfigError::MissingSecret)
}

fn build_config(args: Args) -> Result<RunConfig, ConfigError> {
    let repository = match args.pbs_repository {
        Some(repo) => repo,
        None => build_repository(
            args.pbs_username.as_deref(),
            args.pbs_token_name.as_deref(),
            args.pbs_server.as_deref(),
            args.pbs_port,
            args.pbs_datastore.as_deref().unwrap_or(""),
        )?,
    };

    let secret = resolve_secret(args.pbs_password)?;

    let backup_id = args.pbs_backup_id.unwrap_or_else(|| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    });

    Ok(RunConfig {
        roots: args.roots,
        include_property: args.include_property,
        timestamp_property: args.timestamp_property,
        snapshot_prefix: args.snapshot_prefix,
        hold_name: args.hold_name,
        hold_enabled: args.hold_snapshots,
        exclude_empty_parents: args.exclude_empty_parents,
        remove_orphans: args.remove_orphans,
        resume: args.resume,
        execute: args.execute,
        repository,
        secret,
        backup_id,
        namespace: args.pbs_namespace,
        change_detection_mode: args.change_detection_mode,
        archive_name_prefix: args.archive_name_prefix,
        encryption_password: args.pbs_encryption_password,
        fingerprint: args.pbs_fingerprint,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    for tool in ["zfs", "proxmox-backup-client"] {
        if !zfs_pbs_backup::command::tool_on_path(tool) {
            log::error!("required tool '{tool}' is not on PATH or not executable");
            return ExitCode::from(2);
        }
    }

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::from(1);
        }
    };

    if config.dry_run() {
        log::info!("running in dry-run mode; pass --execute to perform changes");
    }

    let runner = zfs_pbs_backup::command::TokioRunner;
    let outcome = tokio::select! {
        result = run::execute(&runner, &config) => result,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("interrupted; leaving holds and snapshots in place for the next run");
            return ExitCode::from(130);
        }
    };

    match outcome {
        Ok(RunOutcome::NothingToDo) => ExitCode::SUCCESS,
        Ok(RunOutcome::BackedUp { snapshot_name, datasets }) => {
            log::info!("backed up {datasets} dataset(s) under snapshot '{snapshot_name}'");
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
    }
}
