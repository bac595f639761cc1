use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use demohub_process::{BundleManifest, EnvironmentState, EnvironmentStatusResponse, PrepareState, TenantId};

use crate::{
    error::{DemoError, ProvisionStage},
    object_store::{ObjectStore, tenant_prefix},
    runtime::{CommandError, RuntimeBackend, parse_manifest_entries, run_command},
    support::{KeyedLocks, format_error_chain},
    workspace::{self, Workspace, normalize_rel_path},
};

#[derive(Debug, Clone)]
enum ProvisionState {
    NotStarted,
    InProgress { stage: ProvisionStage, message: String },
    Ready { notes: Vec<String> },
    Failed { stage: ProvisionStage, reason: String },
}

#[derive(Debug)]
struct TenantProvision {
    state: ProvisionState,
    /// Bumped by cleanup so a pipeline that outlives its workspace does not
    /// mark the wiped workspace ready.
    epoch: u64,
}

impl Default for TenantProvision {
    fn default() -> Self {
        Self {
            state: ProvisionState::NotStarted,
            epoch: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub workspaces_root: PathBuf,
    pub install_timeout: Duration,
    pub install_attempts: usize,
}

/// Stages a tenant's bundle and builds its runtime. At most one pipeline
/// runs per tenant; a ready workspace is reused as-is.
#[derive(Debug)]
pub struct Provisioner {
    cfg: ProvisionerConfig,
    store: Arc<dyn ObjectStore>,
    runtime: Arc<dyn RuntimeBackend>,
    states: Mutex<HashMap<TenantId, TenantProvision>>,
    locks: KeyedLocks,
}

impl Provisioner {
    pub fn new(
        cfg: ProvisionerConfig,
        store: Arc<dyn ObjectStore>,
        runtime: Arc<dyn RuntimeBackend>,
    ) -> Self {
        Self {
            cfg,
            store,
            runtime,
            states: Mutex::new(HashMap::new()),
            locks: KeyedLocks::default(),
        }
    }

    pub fn workspace(&self, tenant: &TenantId) -> Workspace {
        Workspace::new(&self.cfg.workspaces_root, tenant)
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<TenantId, TenantProvision>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn epoch(&self, tenant: &TenantId) -> u64 {
        self.states().get(tenant).map(|t| t.epoch).unwrap_or(0)
    }

    /// Updates the state unless a cleanup happened since `epoch`.
    fn set_state(&self, tenant: &TenantId, epoch: u64, state: ProvisionState) -> bool {
        let mut states = self.states();
        let entry = states.entry(tenant.clone()).or_default();
        if entry.epoch != epoch {
            return false;
        }
        entry.state = state;
        true
    }

    fn enter(&self, tenant: &TenantId, epoch: u64, stage: ProvisionStage, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(tenant = %tenant, stage = %stage, "{message}");
        self.set_state(tenant, epoch, ProvisionState::InProgress { stage, message });
    }

    /// Waits for any running pipeline for this tenant, then runs one unless
    /// the workspace is already ready.
    pub async fn provision(
        &self,
        tenant: &TenantId,
        manifest: &BundleManifest,
    ) -> Result<Workspace, DemoError> {
        let ws = self.workspace(tenant);
        if ws.is_ready() {
            return Ok(ws);
        }

        let lock = self.locks.lock_for(tenant.as_str());
        let _guard = lock.lock().await;

        // Check again after lock.
        if ws.is_ready() {
            return Ok(ws);
        }

        let epoch = self.epoch(tenant);
        self.run_pipeline(tenant, manifest, &ws, epoch).await?;
        Ok(ws)
    }

    /// Starts provisioning on a background task unless it is already running
    /// or done. Never waits for the pipeline.
    pub fn prepare_in_background(
        self: &Arc<Self>,
        tenant: &TenantId,
        manifest: BundleManifest,
    ) -> PrepareState {
        let ws = self.workspace(tenant);
        if ws.is_ready() {
            return PrepareState::AlreadyReady;
        }

        let lock = self.locks.lock_for(tenant.as_str());
        let Ok(guard) = lock.try_lock_owned() else {
            return PrepareState::AlreadyPreparing;
        };
        if ws.is_ready() {
            return PrepareState::AlreadyReady;
        }

        let epoch = self.epoch(tenant);
        self.enter(tenant, epoch, ProvisionStage::Downloading, "Queued for preparation");

        let this = self.clone();
        let tenant = tenant.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.run_pipeline(&tenant, &manifest, &ws, epoch).await {
                tracing::warn!(tenant = %tenant, error = %e, "background preparation failed");
            }
        });
        PrepareState::Started
    }

    pub async fn status(&self, tenant: &TenantId) -> EnvironmentStatusResponse {
        let state = self
            .states()
            .get(tenant)
            .map(|t| t.state.clone())
            .unwrap_or(ProvisionState::NotStarted);

        if let ProvisionState::InProgress { message, .. } = &state {
            return EnvironmentStatusResponse {
                state: EnvironmentState::Preparing,
                message: message.clone(),
            };
        }

        let ws = self.workspace(tenant);
        if ws.is_ready() {
            let notes = match state {
                ProvisionState::Ready { notes } => notes,
                _ => ws.read_marker().await.map(|m| m.notes).unwrap_or_default(),
            };
            let message = if notes.is_empty() {
                "Environment ready".to_string()
            } else {
                format!("Environment ready ({})", notes.join("; "))
            };
            return EnvironmentStatusResponse {
                state: EnvironmentState::Ready,
                message,
            };
        }

        let message = match state {
            ProvisionState::Failed { stage, reason } => {
                format!("Preparation failed while {stage}: {reason}")
            }
            _ => "Environment not prepared".to_string(),
        };
        EnvironmentStatusResponse {
            state: EnvironmentState::NotPrepared,
            message,
        }
    }

    /// Forgets the tenant's provisioning state and deletes its workspace.
    /// An in-flight pipeline is not cancelled; it just can no longer mark the
    /// workspace ready.
    pub async fn cleanup(&self, tenant: &TenantId) -> Result<bool, DemoError> {
        {
            let mut states = self.states();
            let entry = states.entry(tenant.clone()).or_default();
            entry.epoch += 1;
            entry.state = ProvisionState::NotStarted;
        }
        let ws = self.workspace(tenant);
        let existed = ws.remove().await?;
        if existed {
            tracing::info!(tenant = %tenant, "workspace removed");
        }
        Ok(existed)
    }

    async fn run_pipeline(
        &self,
        tenant: &TenantId,
        manifest: &BundleManifest,
        ws: &Workspace,
        epoch: u64,
    ) -> Result<(), DemoError> {
        match self.pipeline(tenant, manifest, ws, epoch).await {
            Ok(notes) => {
                if !self.set_state(tenant, epoch, ProvisionState::Ready { notes }) {
                    tracing::warn!(tenant = %tenant, "workspace cleaned up during preparation");
                }
                tracing::info!(tenant = %tenant, "environment ready");
                Ok(())
            }
            Err(err) if self.epoch(tenant) != epoch => {
                // Whatever broke, the workspace it was building is gone.
                tracing::warn!(tenant = %tenant, error = %err, "workspace cleaned up during preparation");
                let stage = match &err {
                    DemoError::ProvisionFailed { stage, .. } => *stage,
                    _ => ProvisionStage::Downloading,
                };
                Err(fail(
                    stage,
                    "workspace was cleaned up during preparation".to_string(),
                    true,
                ))
            }
            Err(err) => {
                let (stage, reason) = match &err {
                    DemoError::ProvisionFailed { stage, reason, .. } => (*stage, reason.clone()),
                    other => (ProvisionStage::Downloading, other.to_string()),
                };
                tracing::warn!(tenant = %tenant, stage = %stage, reason = %reason, "provisioning failed");
                self.set_state(tenant, epoch, ProvisionState::Failed { stage, reason });
                Err(err)
            }
        }
    }

    async fn pipeline(
        &self,
        tenant: &TenantId,
        manifest: &BundleManifest,
        ws: &Workspace,
        epoch: u64,
    ) -> Result<Vec<String>, DemoError> {
        let mut notes = Vec::new();
        let files = ws.files_dir();
        let env_dir = ws.env_dir();

        self.enter(tenant, epoch, ProvisionStage::Downloading, "Downloading project files");
        ws.reset()
            .await
            .map_err(|e| fail(ProvisionStage::Downloading, format_error_chain(&e), false))?;
        let prefix = tenant_prefix(tenant);
        let downloaded = self
            .store
            .download_all(&prefix, &files)
            .await
            .map_err(|e| fail(ProvisionStage::Downloading, format_error_chain(&e), true))?;
        if downloaded == 0 {
            return Err(fail(
                ProvisionStage::Downloading,
                format!("no files found under {prefix}"),
                false,
            ));
        }
        tracing::debug!(tenant = %tenant, objects = downloaded, "bundle staged");

        self.enter(tenant, epoch, ProvisionStage::SanitizingFiles, "Cleaning up archive metadata");
        let protected: Vec<PathBuf> = std::iter::once(manifest.entry_path.as_str())
            .chain(manifest.dependency_manifest_path.as_deref())
            .filter_map(|p| normalize_rel_path(p).ok())
            .collect();
        let removed = {
            let files = files.clone();
            tokio::task::spawn_blocking(move || workspace::sanitize(&files, &protected))
                .await
                .map_err(|e| fail(ProvisionStage::SanitizingFiles, e.to_string(), false))?
                .map_err(|e| fail(ProvisionStage::SanitizingFiles, format_error_chain(&e), false))?
        };
        if !removed.is_empty() {
            tracing::info!(tenant = %tenant, removed = removed.len(), "removed metadata artifacts");
        }

        self.enter(tenant, epoch, ProvisionStage::CreatingRuntime, "Creating isolated environment");
        let create = self.runtime.create_command(&env_dir);
        run_command(&create, ws.root(), self.cfg.install_timeout)
            .await
            .map_err(|e| command_failure(ProvisionStage::CreatingRuntime, e))?;

        self.enter(tenant, epoch, ProvisionStage::InstallingDependencies, "Looking for dependencies");
        let manifest_name = self.runtime.dependency_manifest_name().to_string();
        let declared = manifest.dependency_manifest_path.clone();
        let dep_manifest = {
            let files = files.clone();
            tokio::task::spawn_blocking(move || {
                workspace::find_dependency_manifest(&files, declared.as_deref(), &manifest_name)
            })
            .await
            .map_err(|e| fail(ProvisionStage::InstallingDependencies, e.to_string(), false))?
        };
        match dep_manifest {
            Some(rel) => {
                let path = files.join(&rel);
                if let Some(note) = self.install_dependencies(tenant, epoch, &env_dir, &path).await? {
                    notes.push(note);
                }
            }
            None => {
                let note = format!(
                    "no {} found; skipped dependency install",
                    self.runtime.dependency_manifest_name()
                );
                tracing::warn!(tenant = %tenant, "{note}");
                notes.push(note);
            }
        }

        let baseline = self.runtime.baseline_package().to_string();
        self.enter(
            tenant,
            epoch,
            ProvisionStage::InstallingBaseline,
            format!("Installing {baseline}"),
        );
        let install = self.runtime.install_package_command(&env_dir, &baseline, true);
        run_command(&install, ws.root(), self.cfg.install_timeout)
            .await
            .map_err(|e| command_failure(ProvisionStage::InstallingBaseline, e))?;

        if self.epoch(tenant) != epoch {
            return Err(fail(
                ProvisionStage::InstallingBaseline,
                "workspace was cleaned up during preparation".to_string(),
                true,
            ));
        }
        ws.write_marker(&notes)
            .await
            .map_err(|e| fail(ProvisionStage::InstallingBaseline, format_error_chain(&e), false))?;
        Ok(notes)
    }

    /// Manifest-wide install with bounded attempts, then one entry at a time.
    /// Returns a note when the per-entry fallback could not install
    /// everything.
    async fn install_dependencies(
        &self,
        tenant: &TenantId,
        epoch: u64,
        env_dir: &Path,
        manifest: &Path,
    ) -> Result<Option<String>, DemoError> {
        let stage = ProvisionStage::InstallingDependencies;
        let cwd = manifest.parent().unwrap_or(env_dir);
        let attempts = self.cfg.install_attempts.max(1);

        let mut last_error = None;
        for attempt in 1..=attempts {
            self.enter(
                tenant,
                epoch,
                stage,
                format!("Installing dependencies (attempt {attempt}/{attempts})"),
            );
            let cmd = self.runtime.install_manifest_command(env_dir, manifest);
            match run_command(&cmd, cwd, self.cfg.install_timeout).await {
                Ok(_) => return Ok(None),
                Err(e) if e.is_timeout() => return Err(command_failure(stage, e)),
                Err(e) => {
                    tracing::warn!(tenant = %tenant, attempt, error = %e.summary(), "dependency install failed");
                    last_error = Some(e);
                }
            }
        }

        let text = tokio::fs::read_to_string(manifest)
            .await
            .map_err(|e| fail(stage, format!("read {}: {e}", manifest.display()), false))?;
        let entries = parse_manifest_entries(&text);
        if entries.is_empty() {
            // Nothing to retry one by one; the manifest itself is broken.
            let reason = last_error
                .map(|e| e.summary())
                .unwrap_or_else(|| "dependency install failed".to_string());
            return Err(fail(stage, reason, false));
        }

        let total = entries.len();
        let mut failed = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            self.enter(
                tenant,
                epoch,
                stage,
                format!("Installing dependencies one by one ({}/{total})", i + 1),
            );
            let cmd = self.runtime.install_package_command(env_dir, entry, false);
            match run_command(&cmd, cwd, self.cfg.install_timeout).await {
                Ok(_) => {}
                Err(e) if e.is_timeout() => {
                    tracing::warn!(tenant = %tenant, package = %entry, "package install timed out");
                    failed.push(format!("{entry} (timed out)"));
                }
                Err(e) => {
                    tracing::warn!(tenant = %tenant, package = %entry, error = %e.summary(), "package install failed");
                    failed.push(entry.clone());
                }
            }
        }

        if failed.is_empty() {
            return Ok(None);
        }
        let note = format!(
            "partial install: {} of {total} packages failed ({})",
            failed.len(),
            failed.join(", ")
        );
        tracing::warn!(tenant = %tenant, "{note}");
        Ok(Some(note))
    }
}

fn fail(stage: ProvisionStage, reason: String, retryable: bool) -> DemoError {
    DemoError::ProvisionFailed {
        stage,
        reason,
        retryable,
    }
}

fn command_failure(stage: ProvisionStage, err: CommandError) -> DemoError {
    let retryable = err.is_timeout();
    fail(stage, err.summary(), retryable)
}
