use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Mutex,
};

use anyhow::Context;
use async_trait::async_trait;
use demohub_process::{BundleManifest, TenantId};
use tokio::io::AsyncWriteExt;

/// Durable, user-facing project status. Derived from what the lifecycle
/// core reports; never consulted for launch decisions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TenantStatus {
    Ready,
    Running { url: String, port: u16 },
    Error { message: String },
}

#[async_trait]
pub trait ManifestSource: Send + Sync + std::fmt::Debug {
    async fn manifest(&self, tenant: &TenantId) -> Option<BundleManifest>;

    /// Records the manifest produced upstream for `tenant`, replacing any
    /// previous one.
    async fn register(&self, tenant: &TenantId, manifest: BundleManifest) -> anyhow::Result<()>;
}

#[async_trait]
pub trait TenantMetadataStore: Send + Sync + std::fmt::Debug {
    async fn status(&self, tenant: &TenantId) -> Option<TenantStatus>;

    async fn record_status(&self, tenant: &TenantId, status: TenantStatus) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct TenantRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    manifest: Option<BundleManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<TenantStatus>,
}

/// Manifests and statuses kept in memory, mirrored to a JSON file when a
/// path is configured.
#[derive(Debug)]
pub struct TenantStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<TenantId, TenantRecord>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl TenantStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let records = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn records(&self) -> std::sync::MutexGuard<'_, BTreeMap<TenantId, TenantRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let data = {
            let records = self.records();
            serde_json::to_vec_pretty(&*records).context("serialize tenants")?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create tenants tmp")?;
        f.write_all(&data).await.context("write tenants tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, path)
            .await
            .context("persist tenants")?;
        Ok(())
    }
}

#[async_trait]
impl ManifestSource for TenantStore {
    async fn manifest(&self, tenant: &TenantId) -> Option<BundleManifest> {
        self.records().get(tenant).and_then(|r| r.manifest.clone())
    }

    async fn register(&self, tenant: &TenantId, manifest: BundleManifest) -> anyhow::Result<()> {
        self.records()
            .entry(tenant.clone())
            .or_default()
            .manifest = Some(manifest);
        self.persist().await
    }
}

#[async_trait]
impl TenantMetadataStore for TenantStore {
    async fn status(&self, tenant: &TenantId) -> Option<TenantStatus> {
        self.records().get(tenant).and_then(|r| r.status.clone())
    }

    async fn record_status(&self, tenant: &TenantId, status: TenantStatus) -> anyhow::Result<()> {
        {
            let mut records = self.records();
            let rec = records.entry(tenant.clone()).or_default();
            if rec.status.as_ref() == Some(&status) {
                return Ok(());
            }
            rec.status = Some(status);
        }
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[tokio::test]
    async fn persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("tenants.json");

        let store = TenantStore::open(path.clone()).await.unwrap();
        store
            .register(
                &tenant("t1"),
                BundleManifest {
                    entry_path: "sub/app.py".into(),
                    dependency_manifest_path: None,
                },
            )
            .await
            .unwrap();
        store
            .record_status(
                &tenant("t1"),
                TenantStatus::Running {
                    url: "http://localhost:8501".into(),
                    port: 8501,
                },
            )
            .await
            .unwrap();

        let reopened = TenantStore::open(path).await.unwrap();
        assert_eq!(
            reopened.manifest(&tenant("t1")).await.unwrap().entry_path,
            "sub/app.py"
        );
        assert!(matches!(
            reopened.status(&tenant("t1")).await,
            Some(TenantStatus::Running { port: 8501, .. })
        ));
        assert!(reopened.manifest(&tenant("t2")).await.is_none());
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let v = serde_json::to_value(TenantStatus::Error {
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(v, serde_json::json!({"state": "error", "message": "boom"}));
    }
}
