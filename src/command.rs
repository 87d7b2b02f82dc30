//! Single chokepoint for invoking external tools (`zfs`, `proxmox-backup-client`).
//!
//! Every adapter depends on the [`CommandRunner`] trait rather than on
//! `tokio::process::Command` directly, so tests can swap in [`FakeRunner`]
//! and assert on the exact argv/env sequence a run would have produced.

use std::fmt::{Display, Formatter};
use std::time::Instant;

/// One external-tool invocation, built up via the builder methods below.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub message: String,
    pub dry_run: bool,
    pub read_only: Option<bool>,
    pub env: Vec<(String, String)>,
    pub check: bool,
}

impl Invocation {
    pub fn new(argv: Vec<String>, message: impl Into<String>) -> Self {
        Invocation {
            argv,
            message: message.into(),
            dry_run: false,
            read_only: None,
            env: Vec::new(),
            check: true,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Infer read-only-ness from argv when the caller hasn't pinned it down.
    ///
    /// `zfs list`, `zfs get`, `zfs holds`, and any `proxmox-backup-client`
    /// invocation that doesn't contain `backup` are read-only; everything
    /// else is assumed to mutate state.
    fn is_read_only(&self) -> bool {
        if let Some(v) = self.read_only {
            return v;
        }
        match self.argv.first().map(String::as_str) {
            Some("zfs") => matches!(
                self.argv.get(1).map(String::as_str),
                Some("list") | Some("get") | Some("holds")
            ),
            Some("proxmox-backup-client") => {
                !self.argv.iter().any(|a| a == "backup")
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedProcess {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CompletedProcess {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    fn synthetic_success() -> Self {
        CompletedProcess {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

#[derive(Debug)]
pub enum ProcessError {
    SpawnFailed {
        argv: Vec<String>,
        source: std::io::Error,
    },
    CommandFailed {
        argv: Vec<String>,
        code: i32,
        stderr: String,
    },
}

impl ProcessError {
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ProcessError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }

    pub fn argv(&self) -> &[String] {
        match self {
            ProcessError::SpawnFailed { argv, .. } => argv,
            ProcessError::CommandFailed { argv, .. } => argv,
        }
    }
}

impl Display for ProcessError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::SpawnFailed { argv, source } => {
                write!(f, "failed to spawn '{}': {}", shell_words::join(argv), source)
            }
            ProcessError::CommandFailed { argv, code, stderr } => {
                write!(
                    f,
                    "'{}' exited with status {code}: {}",
                    shell_words::join(argv),
                    stderr.trim()
                )
            }
        }
    }
}

impl std::error::Error for ProcessError {}

/// The seam every adapter calls through instead of touching `tokio::process`.
pub trait CommandRunner {
    fn run(
        &self,
        invocation: Invocation,
    ) -> impl std::future::Future<Output = Result<CompletedProcess, ProcessError>> + Send;
}

/// Shells out via `tokio::process::Command`, honoring the dry-run and
/// read-only rules documented on [`Invocation`].
pub struct TokioRunner;

impl CommandRunner for TokioRunner {
    async fn run(&self, invocation: Invocation) -> Result<CompletedProcess, ProcessError> {
        let read_only = invocation.is_read_only();

        if invocation.dry_run && !read_only {
            log::info!("[dry-run] {}", invocation.message);
            return Ok(CompletedProcess::synthetic_success());
        }

        let (program, args) = invocation
            .argv
            .split_first()
            .expect("invocation argv must not be empty");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        log::info!("{}", invocation.message);
        let started = Instant::now();
        let output = cmd
            .output()
            .await
            .map_err(|source| ProcessError::SpawnFailed {
                argv: invocation.argv.clone(),
                source,
            })?;
        let elapsed = started.elapsed();

        log::debug!(
            "ran '{}' in {:.3}s (status {})",
            shell_words::join(&invocation.argv),
            elapsed.as_secs_f64(),
            output.status.code().unwrap_or(-1)
        );

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            return Ok(CompletedProcess { status: code, stdout, stderr });
        }

        if !invocation.check {
            return Ok(CompletedProcess { status: code, stdout, stderr });
        }

        Err(ProcessError::CommandFailed {
            argv: invocation.argv.clone(),
            code,
            stderr,
        })
    }
}

/// Scans `PATH` for an executable file named `tool`, without spawning a
/// shell. Used at startup to surface `ToolingError` before any ZFS/PBS call.
pub fn tool_on_path(tool: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        let candidate = dir.join(tool);
        is_executable_file(&candidate)
    })
}

#[cfg(unix)]
fn is_executable_file(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable_file(path: &std::path::Path) -> bool {
    path.is_file()
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    struct Call {
        argv: Vec<String>,
        executed: bool,
    }

    /// Records every invocation it receives and returns scripted responses
    /// keyed by the exact argv. Unscripted argv falls back to a synthetic
    /// success so tests only need to script the calls they care about.
    #[derive(Default)]
    pub struct FakeRunner {
        calls: Mutex<Vec<Call>>,
        scripted: Mutex<std::collections::HashMap<Vec<String>, CompletedProcess>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            FakeRunner::default()
        }

        pub fn script_ok(&self, argv: &[&str], stdout: &str) {
            let key: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            self.scripted.lock().unwrap().insert(
                key,
                CompletedProcess {
                    status: 0,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
        }

        pub fn script_failure(&self, argv: &[&str], status: i32, stderr: &str) {
            let key: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
            self.scripted.lock().unwrap().insert(
                key,
                CompletedProcess {
                    status,
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                },
            );
        }

        /// argv of every invocation the runner saw, in call order.
        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().iter().map(|c| c.argv.clone()).collect()
        }

        /// argv of calls that actually executed (i.e. weren't skipped by dry-run).
        pub fn executed(&self) -> Vec<Vec<String>> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.executed)
                .map(|c| c.argv.clone())
                .collect()
        }
    }

    impl CommandRunner for FakeRunner {
        async fn run(&self, invocation: Invocation) -> Result<CompletedProcess, ProcessError> {
            let read_only = invocation.is_read_only();
            let skip = invocation.dry_run && !read_only;

            self.calls.lock().unwrap().push(Call {
                argv: invocation.argv.clone(),
                executed: !skip,
            });

            if skip {
                log::info!("[dry-run] {}", invocation.message);
                return Ok(CompletedProcess::synthetic_success());
            }

            let completed = self
                .scripted
                .lock()
                .unwrap()
                .get(&invocation.argv)
                .cloned()
                .unwrap_or_else(CompletedProcess::synthetic_success);

            if completed.success() || !invocation.check {
                return Ok(completed);
            }

            Err(ProcessError::CommandFailed {
                argv: invocation.argv.clone(),
                code: completed.status,
                stderr: completed.stderr,
            })
        }
    }
}
