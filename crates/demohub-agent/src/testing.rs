//! Fakes shared by the unit tests: an in-memory port inspector, a runtime
//! backend made of `sh` one-liners and a download-counting object store.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use demohub_process::TenantId;

use crate::{
    config::PortRange,
    object_store::{LocalObjectStore, ObjectStore, tenant_prefix},
    port_inspect::{PortHolder, PortInspector},
    runtime::{CommandSpec, RuntimeBackend},
};

#[derive(Debug, Default)]
struct FakeInspectorState {
    occupied: BTreeSet<u16>,
    listeners: BTreeMap<u16, Vec<u32>>,
    killed: Vec<u32>,
}

/// Port inspector driven entirely by the test. `terminate` only records the
/// pid; tests that start real strays kill them themselves.
#[derive(Debug, Default)]
pub(crate) struct FakeInspector {
    state: Mutex<FakeInspectorState>,
}

impl FakeInspector {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeInspectorState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn occupy(&self, port: u16) {
        self.state().occupied.insert(port);
    }

    pub(crate) fn vacate(&self, port: u16) {
        self.state().occupied.remove(&port);
    }

    pub(crate) fn add_listener(&self, port: u16, pid: u32) {
        let mut st = self.state();
        st.occupied.insert(port);
        st.listeners.entry(port).or_default().push(pid);
    }

    pub(crate) fn killed(&self) -> Vec<u32> {
        self.state().killed.clone()
    }
}

impl PortInspector for FakeInspector {
    fn is_bindable(&self, port: u16) -> bool {
        !self.state().occupied.contains(&port)
    }

    fn listeners(&self, range: PortRange) -> Vec<PortHolder> {
        self.state()
            .listeners
            .iter()
            .filter(|(port, _)| range.contains(**port))
            .map(|(port, pids)| PortHolder {
                port: *port,
                pids: pids.clone(),
            })
            .collect()
    }

    fn terminate(&self, pid: u32) -> bool {
        if pid == std::process::id() {
            return false;
        }
        let mut st = self.state();
        st.killed.push(pid);
        let emptied: Vec<u16> = st
            .listeners
            .iter_mut()
            .filter_map(|(port, pids)| {
                pids.retain(|p| *p != pid);
                pids.is_empty().then_some(*port)
            })
            .collect();
        for port in emptied {
            st.listeners.remove(&port);
            st.occupied.remove(&port);
        }
        true
    }
}

/// Runtime backend whose every step is a shell one-liner. The launched
/// "demo" sees `DEMO_PORT` and `DEMO_ENTRY`; package scripts get the package
/// name as `$1`.
#[derive(Debug, Clone)]
pub(crate) struct ScriptRuntime {
    pub(crate) manifest_install_script: String,
    pub(crate) package_install_script: String,
    pub(crate) launch_script: String,
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self {
            manifest_install_script: "exit 0".to_string(),
            package_install_script: "exit 0".to_string(),
            launch_script: "echo \"serving $DEMO_ENTRY on $DEMO_PORT\"; pwd; exec sleep 60"
                .to_string(),
        }
    }
}

impl ScriptRuntime {
    pub(crate) fn launching(script: &str) -> Self {
        Self {
            launch_script: script.to_string(),
            ..Self::default()
        }
    }

    fn sh(script: &str, arg: &str) -> CommandSpec {
        CommandSpec::new("sh")
            .arg("-c")
            .arg(script)
            .arg("sh")
            .arg(arg)
    }
}

impl RuntimeBackend for ScriptRuntime {
    fn dependency_manifest_name(&self) -> &str {
        "requirements.txt"
    }

    fn search_path_var(&self) -> &str {
        "DEMO_SEARCH_PATH"
    }

    fn baseline_package(&self) -> &str {
        "baseline-pkg"
    }

    fn create_command(&self, env_dir: &Path) -> CommandSpec {
        CommandSpec::new("mkdir")
            .arg("-p")
            .arg(env_dir.join("bin").to_string_lossy())
    }

    fn install_manifest_command(&self, _env_dir: &Path, manifest: &Path) -> CommandSpec {
        Self::sh(&self.manifest_install_script, &manifest.to_string_lossy())
    }

    fn install_package_command(
        &self,
        _env_dir: &Path,
        package: &str,
        _upgrade: bool,
    ) -> CommandSpec {
        Self::sh(&self.package_install_script, package)
    }

    fn launch_command(&self, _env_dir: &Path, entry: &Path, port: u16) -> CommandSpec {
        Self::sh(&self.launch_script, &entry.to_string_lossy())
            .env("DEMO_PORT", port.to_string())
            .env("DEMO_ENTRY", entry.to_string_lossy())
    }
}

/// Local object store that counts `download_all` calls and can slow them
/// down to widen race windows.
#[derive(Debug)]
pub(crate) struct CountingStore {
    root: PathBuf,
    inner: LocalObjectStore,
    delay: Duration,
    pub(crate) downloads: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn new(root: PathBuf, delay: Duration) -> Self {
        Self {
            inner: LocalObjectStore::new(root.clone()),
            root,
            delay,
            downloads: AtomicUsize::new(0),
        }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    async fn upload(&self, local: &Path, key: &str) -> anyhow::Result<String> {
        self.inner.upload(local, key).await
    }

    async fn download_all(&self, prefix: &str, dest: &Path) -> anyhow::Result<usize> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.download_all(prefix, dest).await
    }

    async fn delete_all(&self, prefix: &str) -> anyhow::Result<usize> {
        self.inner.delete_all(prefix).await
    }
}

/// Writes a tenant bundle straight into a local object store root.
pub(crate) fn seed_bundle(store_root: &Path, tenant: &TenantId, files: &[(&str, &str)]) {
    let base = store_root.join(tenant_prefix(tenant));
    for (rel, contents) in files {
        let p = base.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, contents).unwrap();
    }
}
