use std::{
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use tokio::{process::Command, time::Instant};

use crate::support::read_tail;

const OUTPUT_TAIL_BYTES: usize = 16 * 1024;
const PIPE_DRAIN_WAIT: Duration = Duration::from_millis(500);

/// A program invocation produced by a runtime backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A tokio command in its own session, with no stdin.
    pub(crate) fn to_command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, the child goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// The external "create runtime / install / launch" capability. The core
/// never installs anything itself; it only runs what the backend describes.
pub trait RuntimeBackend: Send + Sync + std::fmt::Debug {
    /// File name searched for when the manifest declares no dependency file.
    fn dependency_manifest_name(&self) -> &str;

    /// Environment variable extended with the entry point's directory.
    fn search_path_var(&self) -> &str;

    fn baseline_package(&self) -> &str;

    fn create_command(&self, env_dir: &Path) -> CommandSpec;

    fn install_manifest_command(&self, env_dir: &Path, manifest: &Path) -> CommandSpec;

    fn install_package_command(&self, env_dir: &Path, package: &str, upgrade: bool)
    -> CommandSpec;

    fn launch_command(&self, env_dir: &Path, entry: &Path, port: u16) -> CommandSpec;
}

/// `python -m venv` environments serving a Streamlit-style entry point.
#[derive(Debug, Clone)]
pub struct PythonVenvRuntime {
    python: String,
    baseline_package: String,
}

impl PythonVenvRuntime {
    pub fn new(python: impl Into<String>, baseline_package: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            baseline_package: baseline_package.into(),
        }
    }

    fn env_python(env_dir: &Path) -> String {
        env_dir.join("bin").join("python").to_string_lossy().into_owned()
    }

    /// `streamlit==1.31` launches as `-m streamlit`.
    fn launcher_module(&self) -> &str {
        let pkg = self.baseline_package.trim();
        let end = pkg
            .find(|c: char| matches!(c, '=' | '<' | '>' | '~' | '!' | '[' | ';' | ' '))
            .unwrap_or(pkg.len());
        &pkg[..end]
    }

    fn pip(env_dir: &Path) -> CommandSpec {
        CommandSpec::new(Self::env_python(env_dir))
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg("--disable-pip-version-check")
            .arg("--no-input")
            .env("PIP_NO_CACHE_DIR", "1")
    }
}

impl RuntimeBackend for PythonVenvRuntime {
    fn dependency_manifest_name(&self) -> &str {
        "requirements.txt"
    }

    fn search_path_var(&self) -> &str {
        "PYTHONPATH"
    }

    fn baseline_package(&self) -> &str {
        &self.baseline_package
    }

    fn create_command(&self, env_dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.python)
            .arg("-m")
            .arg("venv")
            .arg(env_dir.to_string_lossy())
    }

    fn install_manifest_command(&self, env_dir: &Path, manifest: &Path) -> CommandSpec {
        Self::pip(env_dir).arg("-r").arg(manifest.to_string_lossy())
    }

    fn install_package_command(
        &self,
        env_dir: &Path,
        package: &str,
        upgrade: bool,
    ) -> CommandSpec {
        let spec = Self::pip(env_dir);
        let spec = if upgrade { spec.arg("--upgrade") } else { spec };
        spec.arg(package)
    }

    fn launch_command(&self, env_dir: &Path, entry: &Path, port: u16) -> CommandSpec {
        CommandSpec::new(Self::env_python(env_dir))
            .arg("-m")
            .arg(self.launcher_module())
            .arg("run")
            .arg(entry.to_string_lossy())
            .arg("--server.port")
            .arg(port.to_string())
            .arg("--server.address")
            .arg("0.0.0.0")
            .arg("--server.headless")
            .arg("true")
            .arg("--browser.gatherUsageStats")
            .arg("false")
            .env("PYTHONUNBUFFERED", "1")
    }
}

/// Requirement lines worth installing one by one: blanks, comments and
/// pip options (`-r`, `--index-url`, ...) are skipped; inline comments are
/// stripped.
pub fn parse_manifest_entries(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.find(" #") {
            Some(i) => &line[..i],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('-'))
        .map(str::to_string)
        .collect()
}

#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("`{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed ({status})")]
    Failed {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    /// Message plus the tail of stderr, for provisioning failure reasons.
    pub fn summary(&self) -> String {
        match self {
            CommandError::Failed { stderr, stdout, .. } => {
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                let tail: Vec<&str> = detail.trim().lines().rev().take(5).collect();
                let tail: Vec<&str> = tail.into_iter().rev().collect();
                if tail.is_empty() {
                    self.to_string()
                } else {
                    format!("{self}: {}", tail.join(" | "))
                }
            }
            other => other.to_string(),
        }
    }
}

/// Runs `spec` to completion under `timeout`. The deadline covers the whole
/// call: waiting for the leader and draining its pipes. Once the leader is
/// gone (or the deadline passes) the process group is killed, so background
/// children cannot keep the pipes open.
pub async fn run_command(
    spec: &CommandSpec,
    cwd: &Path,
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    let command = spec.display();
    let deadline = Instant::now() + timeout;
    let mut child = spec
        .to_command(cwd)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            command: command.clone(),
            source,
        })?;
    let pgid = child.id().map(|p| p as i32);

    let stdout_task = child
        .stdout
        .take()
        .map(|s| tokio::spawn(read_tail(s, OUTPUT_TAIL_BYTES)));
    let stderr_task = child
        .stderr
        .take()
        .map(|s| tokio::spawn(read_tail(s, OUTPUT_TAIL_BYTES)));

    let status = match tokio::time::timeout_at(deadline, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            return Err(CommandError::Spawn { command, source });
        }
        Err(_) => {
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            let _ = child.kill().await;
            abort_reader(stdout_task);
            abort_reader(stderr_task);
            tracing::warn!(command = %command, timeout_ms = timeout.as_millis() as u64, "command timed out");
            return Err(CommandError::Timeout {
                command,
                after: timeout,
            });
        }
    };

    // Stragglers left behind by the leader.
    if let Some(pgid) = pgid {
        kill_group(pgid, libc::SIGKILL);
    }
    let drain_until = deadline.min(Instant::now() + PIPE_DRAIN_WAIT);
    let stdout = collect_reader(stdout_task, drain_until).await;
    let stderr = collect_reader(stderr_task, drain_until).await;

    if !status.success() {
        return Err(CommandError::Failed {
            command,
            status,
            stdout,
            stderr,
        });
    }
    Ok(CommandOutput { stdout, stderr })
}

type PipeReader = tokio::task::JoinHandle<std::io::Result<Vec<u8>>>;

async fn collect_reader(task: Option<PipeReader>, until: Instant) -> String {
    let Some(mut handle) = task else {
        return String::new();
    };
    match tokio::time::timeout_at(until, &mut handle).await {
        Ok(Ok(Ok(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(_) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

fn abort_reader(task: Option<PipeReader>) {
    if let Some(handle) = task {
        handle.abort();
    }
}

/// Sends `signal` to every process in the group led by `pgid`.
pub(crate) fn kill_group(pgid: i32, signal: i32) {
    // SAFETY: kill(2) with a negated pid only signals the group; no memory
    // is shared with the callee.
    unsafe {
        libc::kill(-pgid, signal);
    }
}

/// `dir` prepended to an existing `PATH`-style value.
pub(crate) fn prepend_search_path(dir: &Path, existing: Option<String>) -> String {
    let mut parts: Vec<PathBuf> = vec![dir.to_path_buf()];
    if let Some(existing) = existing.filter(|v| !v.is_empty()) {
        parts.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(parts)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| dir.to_string_lossy().into_owned())
}
