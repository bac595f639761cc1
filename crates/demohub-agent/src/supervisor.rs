use std::{
    collections::{BTreeSet, HashMap},
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use demohub_process::{RunningDemo, TenantId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};

use crate::{
    error::DemoError,
    port_alloc::{PortAllocator, PortLease},
    runtime::{RuntimeBackend, kill_group, prepend_search_path},
    support::LineBuffer,
    workspace::{Workspace, resolve_entry},
};

const FAILURE_OUTPUT_LINES: usize = 40;
const OUTPUT_DRAIN_WAIT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: std::os::unix::process::ExitStatusExt::signal(status),
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => f.write_str("exit status unknown"),
        }
    }
}

#[derive(Debug)]
struct DemoEntry {
    port: u16,
    pid: Option<u32>,
    pgid: Option<i32>,
    started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    output: Arc<Mutex<LineBuffer>>,
    stopping: bool,
}

impl DemoEntry {
    fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnOutcome {
    Launched { port: u16, started_at: DateTime<Utc> },
    AlreadyRunning { port: u16, started_at: DateTime<Utc> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoStatus {
    Running {
        port: u16,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { port: u16, forced: bool },
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopAllReport {
    pub stopped: Vec<TenantId>,
    pub ports_freed: usize,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub launch_grace: Duration,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub output_max_lines: usize,
}

/// Owns the registry of live demos. A record exists only while its process
/// is believed alive, and its port stays reserved for exactly that long.
#[derive(Debug)]
pub struct Supervisor {
    cfg: SupervisorConfig,
    ports: Arc<PortAllocator>,
    runtime: Arc<dyn RuntimeBackend>,
    registry: Mutex<HashMap<TenantId, DemoEntry>>,
}

impl Supervisor {
    pub fn new(
        cfg: SupervisorConfig,
        ports: Arc<PortAllocator>,
        runtime: Arc<dyn RuntimeBackend>,
    ) -> Self {
        Self {
            cfg,
            ports,
            runtime,
            registry: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TenantId, DemoEntry>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Removes the record if it still belongs to `pid` and releases its port.
    /// Returns the released port.
    fn deregister(&self, tenant: &TenantId, pid: Option<u32>) -> Option<u16> {
        let mut registry = self.registry();
        if registry.get(tenant).is_none_or(|e| e.pid != pid) {
            return None;
        }
        let entry = registry.remove(tenant)?;
        self.ports.release(entry.port);
        Some(entry.port)
    }

    /// Starts the tenant's entry point on the leased port. The lease is
    /// consumed only when the process survives the grace window and is
    /// registered; every other path drops it, releasing the port.
    pub async fn spawn(
        &self,
        tenant: &TenantId,
        ws: &Workspace,
        entry: &str,
        lease: PortLease,
    ) -> Result<SpawnOutcome, DemoError> {
        if let DemoStatus::Running {
            port, started_at, ..
        } = self.status(tenant)
        {
            return Ok(SpawnOutcome::AlreadyRunning { port, started_at });
        }

        let files = ws.files_dir();
        let resolved = {
            let entry = entry.to_string();
            tokio::task::spawn_blocking(move || resolve_entry(&files, &entry))
                .await
                .map_err(|e| DemoError::Internal(anyhow::anyhow!("join entry resolution: {e}")))??
        };

        let port = lease.port();
        let spec = self
            .runtime
            .launch_command(&ws.env_dir(), &resolved.path, port);
        let search_var = self.runtime.search_path_var().to_string();
        let search_path =
            prepend_search_path(&resolved.working_dir, std::env::var(&search_var).ok());

        let mut cmd = spec.to_command(&resolved.working_dir);
        cmd.env(&search_var, search_path);

        tracing::info!(
            tenant = %tenant,
            port,
            entry = %resolved.relative.display(),
            cwd = %resolved.working_dir.display(),
            "spawning demo"
        );
        let mut child = cmd.spawn().map_err(|e| DemoError::SpawnFailed {
            reason: format!("failed to start `{}`: {e}", spec.display()),
            output: String::new(),
        })?;
        let started_at = Utc::now();
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);

        let output = Arc::new(Mutex::new(LineBuffer::new(self.cfg.output_max_lines)));
        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            let output = output.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_output(&output, format!("[stdout] {line}"));
                }
            }));
        }
        if let Some(err) = child.stderr.take() {
            let output = output.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    push_output(&output, format!("[stderr] {line}"));
                }
            }));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let tenant = tenant.clone();
            tokio::spawn(async move {
                let info = match child.wait().await {
                    Ok(status) => ExitInfo::from_status(&status),
                    Err(e) => {
                        tracing::warn!(tenant = %tenant, error = %e, "wait on demo failed");
                        ExitInfo::unknown()
                    }
                };
                tracing::info!(tenant = %tenant, pid, exit = %info, "demo exited");
                let _ = exit_tx.send(Some(info));
            });
        }

        let mut grace_rx = exit_rx.clone();
        let early_exit = tokio::select! {
            info = wait_exit(&mut grace_rx) => Some(info),
            _ = tokio::time::sleep(self.cfg.launch_grace) => None,
        };

        if let Some(info) = early_exit {
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            let _ = tokio::time::timeout(OUTPUT_DRAIN_WAIT, futures_util::future::join_all(readers)).await;
            let output = lock_output(&output).tail(FAILURE_OUTPUT_LINES).join("\n");
            tracing::warn!(tenant = %tenant, port, exit = %info, "demo exited during startup");
            return Err(DemoError::SpawnFailed {
                reason: format!("process exited during startup ({info})"),
                output,
            });
        }

        let mut registry = self.registry();
        if let Some(existing) = registry.get(tenant)
            && !existing.has_exited()
        {
            // Lost a launch race; keep the first process.
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            tracing::info!(tenant = %tenant, port = existing.port, "demo already registered; discarding duplicate");
            return Ok(SpawnOutcome::AlreadyRunning {
                port: existing.port,
                started_at: existing.started_at,
            });
        }
        if let Some(stale) = registry.remove(tenant) {
            self.ports.release(stale.port);
        }
        let port = lease.keep();
        registry.insert(
            tenant.clone(),
            DemoEntry {
                port,
                pid,
                pgid,
                started_at,
                exit_rx,
                output,
                stopping: false,
            },
        );
        tracing::info!(tenant = %tenant, port, pid, "demo registered");
        Ok(SpawnOutcome::Launched { port, started_at })
    }

    /// Liveness probe. A record whose process has exited is removed and its
    /// port released before answering.
    pub fn status(&self, tenant: &TenantId) -> DemoStatus {
        let mut registry = self.registry();
        let Some(entry) = registry.get(tenant) else {
            return DemoStatus::Stopped;
        };
        if !entry.has_exited() {
            return DemoStatus::Running {
                port: entry.port,
                pid: entry.pid,
                started_at: entry.started_at,
            };
        }
        if entry.stopping {
            // The stopper finishes the removal.
            return DemoStatus::Stopped;
        }
        if let Some(entry) = registry.remove(tenant) {
            self.ports.release(entry.port);
            tracing::info!(tenant = %tenant, port = entry.port, "reaped exited demo");
        }
        DemoStatus::Stopped
    }

    /// Reaps every record whose process has exited. Returns the number reaped.
    pub fn reap_dead(&self) -> usize {
        let mut registry = self.registry();
        let dead: Vec<TenantId> = registry
            .iter()
            .filter(|(_, e)| e.has_exited() && !e.stopping)
            .map(|(t, _)| t.clone())
            .collect();
        for tenant in &dead {
            if let Some(entry) = registry.remove(tenant) {
                self.ports.release(entry.port);
                tracing::info!(tenant = %tenant, port = entry.port, "reaped exited demo");
            }
        }
        dead.len()
    }

    pub fn list_running(&self) -> Vec<RunningDemo> {
        self.reap_dead();
        let registry = self.registry();
        let mut out: Vec<RunningDemo> = registry
            .iter()
            .map(|(tenant, e)| RunningDemo {
                tenant_id: tenant.clone(),
                port: e.port,
                pid: e.pid,
                started_at: e.started_at.to_rfc3339(),
            })
            .collect();
        out.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        out
    }

    pub fn tail_output(&self, tenant: &TenantId, limit: usize) -> Option<Vec<String>> {
        let output = self.registry().get(tenant)?.output.clone();
        let lines = lock_output(&output).tail(limit);
        Some(lines)
    }

    /// SIGTERM to the process group, SIGKILL after the grace period. The port
    /// is released only once the process is gone.
    pub async fn stop(&self, tenant: &TenantId) -> Result<StopOutcome, DemoError> {
        let (port, pid, pgid, mut exit_rx) = {
            let mut registry = self.registry();
            let Some(entry) = registry.get_mut(tenant) else {
                return Ok(StopOutcome::NotRunning);
            };
            if entry.has_exited() && !entry.stopping {
                let port = entry.port;
                registry.remove(tenant);
                self.ports.release(port);
                tracing::info!(tenant = %tenant, port, "reaped exited demo");
                return Ok(StopOutcome::NotRunning);
            }
            entry.stopping = true;
            (entry.port, entry.pid, entry.pgid, entry.exit_rx.clone())
        };

        tracing::info!(tenant = %tenant, port, pid, "stopping demo");
        if let Some(pgid) = pgid {
            kill_group(pgid, libc::SIGTERM);
        }

        let mut forced = false;
        let exited = tokio::time::timeout(self.cfg.stop_grace, wait_exit(&mut exit_rx))
            .await
            .is_ok();
        if !exited {
            forced = true;
            tracing::warn!(tenant = %tenant, pid, grace_ms = self.cfg.stop_grace.as_millis() as u64, "demo ignored SIGTERM; sending SIGKILL");
            if let Some(pgid) = pgid {
                kill_group(pgid, libc::SIGKILL);
            }
            let killed = tokio::time::timeout(self.cfg.kill_wait, wait_exit(&mut exit_rx))
                .await
                .is_ok();
            if !killed {
                if let Some(entry) = self.registry().get_mut(tenant)
                    && entry.pid == pid
                {
                    entry.stopping = false;
                }
                tracing::error!(tenant = %tenant, pid, port, "demo survived SIGKILL");
                return Err(DemoError::StopFailed {
                    tenant: tenant.clone(),
                    reason: format!(
                        "process {} did not exit within {}ms of SIGKILL",
                        pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
                        self.cfg.kill_wait.as_millis()
                    ),
                });
            }
        }

        // Stragglers that outlived the group leader.
        if let Some(pgid) = pgid {
            kill_group(pgid, libc::SIGKILL);
        }

        let released = self.deregister(tenant, pid);
        tracing::info!(tenant = %tenant, port, forced, "demo stopped");
        Ok(match released {
            Some(port) => StopOutcome::Stopped { port, forced },
            None => StopOutcome::NotRunning,
        })
    }

    /// Stops every registered demo concurrently, then sweeps the whole port
    /// range for listeners nobody is tracking.
    pub async fn stop_all(&self) -> StopAllReport {
        let tenants: Vec<TenantId> = self.registry().keys().cloned().collect();
        let results = futures_util::future::join_all(tenants.iter().map(|t| self.stop(t))).await;

        let mut stopped = Vec::new();
        let mut freed: BTreeSet<u16> = BTreeSet::new();
        for (tenant, result) in tenants.into_iter().zip(results) {
            match result {
                Ok(StopOutcome::Stopped { port, .. }) => {
                    freed.insert(port);
                    stopped.push(tenant);
                }
                Ok(StopOutcome::NotRunning) => {}
                Err(e) => tracing::error!(tenant = %tenant, error = %e, "stop_all: failed to stop demo"),
            }
        }

        let keep: Vec<u16> = self.registry().values().map(|e| e.port).collect();
        let ports = self.ports.clone();
        match tokio::task::spawn_blocking(move || ports.reclaim_all(&keep)).await {
            Ok(swept) => freed.extend(swept),
            Err(e) => tracing::error!(error = %e, "stop_all: port sweep panicked"),
        }

        tracing::info!(demos_stopped = stopped.len(), ports_freed = freed.len(), "stop_all finished");
        StopAllReport {
            stopped,
            ports_freed: freed.len(),
        }
    }
}

fn lock_output(output: &Mutex<LineBuffer>) -> std::sync::MutexGuard<'_, LineBuffer> {
    output.lock().unwrap_or_else(|e| e.into_inner())
}

fn push_output(output: &Mutex<LineBuffer>, line: String) {
    lock_output(output).push_line(line);
}

/// Resolves once the watched process has exited.
async fn wait_exit(rx: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        let current = rx.borrow_and_update().clone();
        if let Some(info) = current {
            return info;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or_else(ExitInfo::unknown);
        }
    }
}
