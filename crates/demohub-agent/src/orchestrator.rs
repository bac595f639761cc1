use std::sync::Arc;

use demohub_process::{
    BundleManifest, CleanupResponse, DemoState, EnvironmentStatusResponse, LaunchResponse,
    LaunchState, LogsResponse, PrepareResponse, RunningDemo, StatusResponse, StopAllResponse,
    StopResponse, TenantId,
};

use crate::{
    config::DemoConfig,
    error::{DemoError, ProvisionStage},
    object_store::ObjectStore,
    port_alloc::PortAllocator,
    port_inspect::PortInspector,
    provisioner::{Provisioner, ProvisionerConfig},
    runtime::RuntimeBackend,
    supervisor::{DemoStatus, SpawnOutcome, StopOutcome, Supervisor, SupervisorConfig},
    support::KeyedLocks,
    tenants::{ManifestSource, TenantMetadataStore, TenantStatus},
};

/// Collaborators the lifecycle core drives but does not own.
#[derive(Debug, Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ObjectStore>,
    pub runtime: Arc<dyn RuntimeBackend>,
    pub inspector: Arc<dyn PortInspector>,
    pub manifests: Arc<dyn ManifestSource>,
    pub metadata: Arc<dyn TenantMetadataStore>,
}

/// The only entry point for callers. Launch, stop and cleanup for one tenant
/// are serialized; different tenants proceed independently.
#[derive(Debug)]
pub struct DemoOrchestrator {
    cfg: Arc<DemoConfig>,
    ports: Arc<PortAllocator>,
    provisioner: Arc<Provisioner>,
    supervisor: Arc<Supervisor>,
    manifests: Arc<dyn ManifestSource>,
    metadata: Arc<dyn TenantMetadataStore>,
    tenant_locks: KeyedLocks,
}

impl DemoOrchestrator {
    pub fn new(cfg: Arc<DemoConfig>, parts: Collaborators) -> Self {
        let ports = Arc::new(PortAllocator::new(cfg.port_range, parts.inspector));
        let provisioner = Arc::new(Provisioner::new(
            ProvisionerConfig {
                workspaces_root: cfg.workspaces_root(),
                install_timeout: cfg.install_timeout,
                install_attempts: cfg.install_attempts,
            },
            parts.store,
            parts.runtime.clone(),
        ));
        let supervisor = Arc::new(Supervisor::new(
            SupervisorConfig {
                launch_grace: cfg.launch_grace,
                stop_grace: cfg.stop_grace,
                kill_wait: cfg.kill_wait,
                output_max_lines: cfg.output_max_lines,
            },
            ports.clone(),
            parts.runtime,
        ));
        Self {
            cfg,
            ports,
            provisioner,
            supervisor,
            manifests: parts.manifests,
            metadata: parts.metadata,
            tenant_locks: KeyedLocks::default(),
        }
    }

    pub fn config(&self) -> &DemoConfig {
        &self.cfg
    }

    pub fn reserved_ports(&self) -> usize {
        self.ports.reserved().len()
    }

    async fn report(&self, tenant: &TenantId, status: TenantStatus) {
        if let Err(e) = self.metadata.record_status(tenant, status).await {
            tracing::warn!(tenant = %tenant, error = %e, "failed to record tenant status");
        }
    }

    /// Running → ready when our live view says the demo is gone.
    async fn reconcile_stopped(&self, tenant: &TenantId) {
        if let Some(TenantStatus::Running { .. }) = self.metadata.status(tenant).await {
            tracing::info!(tenant = %tenant, "stored status said running; reconciled to ready");
            self.report(tenant, TenantStatus::Ready).await;
        }
    }

    async fn manifest(&self, tenant: &TenantId) -> Result<BundleManifest, DemoError> {
        self.manifests
            .manifest(tenant)
            .await
            .ok_or_else(|| DemoError::UnknownTenant(tenant.clone()))
    }

    fn running_response(&self, port: u16) -> LaunchResponse {
        LaunchResponse {
            state: LaunchState::Running,
            message: "Demo is already running".to_string(),
            url: Some(self.cfg.demo_url(port)),
            port: Some(port),
            estimated_wait_seconds: None,
        }
    }

    pub async fn register_manifest(
        &self,
        tenant: &TenantId,
        manifest: BundleManifest,
    ) -> Result<(), DemoError> {
        self.manifests.register(tenant, manifest).await?;
        tracing::info!(tenant = %tenant, "manifest registered");
        Ok(())
    }

    /// Provisioning runs outside the tenant lock so stop and cleanup never
    /// queue behind a dependency install; only the final check, port lease
    /// and spawn are serialized.
    pub async fn launch(&self, tenant: &TenantId) -> Result<LaunchResponse, DemoError> {
        if let DemoStatus::Running { port, .. } = self.supervisor.status(tenant) {
            return Ok(self.running_response(port));
        }

        let manifest = self.manifest(tenant).await?;
        match self.launch_fresh(tenant, &manifest).await {
            Ok(resp) => {
                if let Some(port) = resp.port {
                    self.report(
                        tenant,
                        TenantStatus::Running {
                            url: self.cfg.demo_url(port),
                            port,
                        },
                    )
                    .await;
                }
                Ok(resp)
            }
            Err(err) => {
                // Exhaustion is transient; the project itself is fine.
                if !matches!(err, DemoError::ResourceExhausted { .. }) {
                    self.report(
                        tenant,
                        TenantStatus::Error {
                            message: err.to_string(),
                        },
                    )
                    .await;
                }
                tracing::warn!(tenant = %tenant, code = err.code(), error = %err, "launch failed");
                Err(err)
            }
        }
    }

    async fn launch_fresh(
        &self,
        tenant: &TenantId,
        manifest: &BundleManifest,
    ) -> Result<LaunchResponse, DemoError> {
        let ws = self.provisioner.provision(tenant, manifest).await?;

        let lock = self.tenant_locks.lock_for(tenant.as_str());
        let _guard = lock.lock().await;

        if let DemoStatus::Running { port, .. } = self.supervisor.status(tenant) {
            return Ok(self.running_response(port));
        }
        if !ws.is_ready() {
            return Err(DemoError::ProvisionFailed {
                stage: ProvisionStage::Downloading,
                reason: "workspace was cleaned up before launch".to_string(),
                retryable: true,
            });
        }

        let reaped = self.supervisor.reap_dead();
        if reaped > 0 {
            tracing::debug!(reaped, "reaped exited demos before port acquisition");
        }
        let lease = self.ports.acquire_lease()?;

        match self
            .supervisor
            .spawn(tenant, &ws, &manifest.entry_path, lease)
            .await?
        {
            SpawnOutcome::Launched { port, .. } => Ok(LaunchResponse {
                state: LaunchState::Launching,
                message: "Demo is starting".to_string(),
                url: Some(self.cfg.demo_url(port)),
                port: Some(port),
                estimated_wait_seconds: Some(self.cfg.estimated_wait.as_secs() as u32),
            }),
            SpawnOutcome::AlreadyRunning { port, .. } => Ok(self.running_response(port)),
        }
    }

    pub async fn status(&self, tenant: &TenantId) -> StatusResponse {
        match self.supervisor.status(tenant) {
            DemoStatus::Running {
                port, started_at, ..
            } => StatusResponse {
                state: DemoState::Running,
                message: "Demo is running".to_string(),
                url: Some(self.cfg.demo_url(port)),
                port: Some(port),
                started_at: Some(started_at.to_rfc3339()),
            },
            DemoStatus::Stopped => {
                self.reconcile_stopped(tenant).await;
                StatusResponse {
                    state: DemoState::Stopped,
                    message: "Demo is not running".to_string(),
                    url: None,
                    port: None,
                    started_at: None,
                }
            }
        }
    }

    pub async fn stop(&self, tenant: &TenantId) -> Result<StopResponse, DemoError> {
        let lock = self.tenant_locks.lock_for(tenant.as_str());
        let _guard = lock.lock().await;
        self.stop_locked(tenant).await
    }

    async fn stop_locked(&self, tenant: &TenantId) -> Result<StopResponse, DemoError> {
        let outcome = self.supervisor.stop(tenant).await?;
        self.reconcile_stopped(tenant).await;
        Ok(match outcome {
            StopOutcome::Stopped { .. } => StopResponse {
                ok: true,
                was_running: true,
                message: "Demo stopped".to_string(),
            },
            StopOutcome::NotRunning => StopResponse {
                ok: true,
                was_running: false,
                message: "Demo is not running".to_string(),
            },
        })
    }

    pub async fn cleanup(&self, tenant: &TenantId) -> Result<CleanupResponse, DemoError> {
        let lock = self.tenant_locks.lock_for(tenant.as_str());
        let _guard = lock.lock().await;

        self.stop_locked(tenant).await?;
        self.provisioner.cleanup(tenant).await?;
        Ok(CleanupResponse { ok: true })
    }

    pub async fn prepare(&self, tenant: &TenantId) -> Result<PrepareResponse, DemoError> {
        let manifest = self.manifest(tenant).await?;
        let state = self.provisioner.prepare_in_background(tenant, manifest);
        tracing::info!(tenant = %tenant, ?state, "prepare requested");
        Ok(PrepareResponse { state })
    }

    pub async fn environment_status(&self, tenant: &TenantId) -> EnvironmentStatusResponse {
        self.provisioner.status(tenant).await
    }

    pub async fn stop_all(&self) -> StopAllResponse {
        let report = self.supervisor.stop_all().await;
        for tenant in &report.stopped {
            self.reconcile_stopped(tenant).await;
        }
        StopAllResponse {
            demos_stopped: report.stopped.len() as u32,
            ports_freed: report.ports_freed as u32,
        }
    }

    pub fn list_running(&self) -> Vec<RunningDemo> {
        self.supervisor.list_running()
    }

    pub fn logs(&self, tenant: &TenantId, limit: usize) -> LogsResponse {
        LogsResponse {
            lines: self
                .supervisor
                .tail_output(tenant, limit)
                .unwrap_or_default(),
        }
    }
}
