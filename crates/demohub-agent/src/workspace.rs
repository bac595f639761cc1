use std::{
    collections::BTreeSet,
    path::{Component, Path, PathBuf},
};

use anyhow::Context;
use demohub_process::TenantId;
use tokio::io::AsyncWriteExt;

use crate::error::DemoError;

pub const READY_MARKER: &str = ".demohub-ready";

const MAX_PRESENT_FILES: usize = 50;

/// OS and archive metadata that must never reach a tenant's runtime.
const ARTIFACT_NAMES: &[&str] = &[
    "__MACOSX",
    ".DS_Store",
    ".Spotlight-V100",
    ".Trashes",
    ".fseventsd",
    ".TemporaryItems",
    "Thumbs.db",
    "desktop.ini",
    "__pycache__",
    ".ipynb_checkpoints",
];

fn is_artifact(name: &str) -> bool {
    ARTIFACT_NAMES.contains(&name) || name.starts_with("._")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelPathError {
    Empty,
    Absolute,
    Traversal,
}

/// Normalizes a bundle-relative path: `\` becomes `/`, `.` segments are
/// dropped. Absolute paths and `..` are rejected.
pub fn normalize_rel_path(rel: &str) -> Result<PathBuf, RelPathError> {
    let rel = rel.trim().replace('\\', "/");
    if rel.is_empty() {
        return Err(RelPathError::Empty);
    }

    let p = Path::new(&rel);
    if p.is_absolute() {
        return Err(RelPathError::Absolute);
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => return Err(RelPathError::Traversal),
            Component::Prefix(_) | Component::RootDir => return Err(RelPathError::Absolute),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(RelPathError::Empty);
    }
    Ok(out)
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReadyMarker {
    pub prepared_at: String,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// `<workspaces>/<tenant>/{files,environment}` for one tenant.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(workspaces_root: &Path, tenant: &TenantId) -> Self {
        Self {
            root: workspaces_root.join(tenant.as_str()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn env_dir(&self) -> PathBuf {
        self.root.join("environment")
    }

    pub fn marker_path(&self) -> PathBuf {
        self.env_dir().join(READY_MARKER)
    }

    pub fn is_ready(&self) -> bool {
        self.marker_path().is_file()
    }

    pub async fn read_marker(&self) -> Option<ReadyMarker> {
        let raw = tokio::fs::read(self.marker_path()).await.ok()?;
        serde_json::from_slice(&raw).ok()
    }

    pub async fn write_marker(&self, notes: &[String]) -> anyhow::Result<()> {
        let marker = ReadyMarker {
            prepared_at: chrono::Utc::now().to_rfc3339(),
            notes: notes.to_vec(),
        };
        let path = self.marker_path();
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(&marker).context("serialize ready marker")?;
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create ready marker tmp")?;
        f.write_all(&data).await.context("write ready marker tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &path)
            .await
            .context("persist ready marker")?;
        Ok(())
    }

    /// Wipes any previous staging and runtime, leaving an empty `files/`.
    pub async fn reset(&self) -> anyhow::Result<()> {
        remove_dir_if_exists(&self.files_dir()).await?;
        remove_dir_if_exists(&self.env_dir()).await?;
        tokio::fs::create_dir_all(self.files_dir())
            .await
            .with_context(|| format!("create {}", self.files_dir().display()))?;
        Ok(())
    }

    /// Deletes the whole workspace. Returns false if it did not exist.
    pub async fn remove(&self) -> anyhow::Result<bool> {
        remove_dir_if_exists(&self.root).await
    }
}

async fn remove_dir_if_exists(dir: &Path) -> anyhow::Result<bool> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
    }
}

/// Removes metadata artifacts below `files_dir`. Paths in `protected` (and
/// their ancestors) survive, as do files named like any protected path.
/// Returns the removed paths, relative to `files_dir`.
pub fn sanitize(files_dir: &Path, protected: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut keep_paths = BTreeSet::new();
    let mut keep_names = BTreeSet::new();
    for p in protected {
        keep_paths.extend(p.ancestors().filter(|a| !a.as_os_str().is_empty()));
        if let Some(name) = p.file_name() {
            keep_names.insert(name.to_os_string());
        }
    }

    let mut removed = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let dir = files_dir.join(&rel_dir);
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read dir {}", dir.display()))?;
            let ft = entry.file_type()?;
            let name = entry.file_name();
            let rel = rel_dir.join(&name);

            let protected = keep_paths.contains(rel.as_path())
                || (!ft.is_dir() && keep_names.contains(&name));
            if !protected && name.to_str().is_some_and(is_artifact) {
                let path = entry.path();
                if ft.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                }
                .with_context(|| format!("remove {}", path.display()))?;
                removed.push(rel);
                continue;
            }
            if ft.is_dir() {
                stack.push(rel);
            }
        }
    }
    removed.sort();
    Ok(removed)
}

/// Every regular file named `name` below `root`, as relative paths ordered
/// by depth, then byte-wise. Symlinked directories are not followed.
fn find_all_by_name(root: &Path, name: &str) -> Vec<PathBuf> {
    let mut hits: Vec<(usize, PathBuf)> = Vec::new();
    let mut stack = vec![(PathBuf::new(), 0usize)];
    while let Some((rel_dir, depth)) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(root.join(&rel_dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(ft) = entry.file_type() else {
                continue;
            };
            let rel = rel_dir.join(entry.file_name());
            if ft.is_dir() {
                stack.push((rel, depth + 1));
            } else if entry.file_name() == name && entry.path().is_file() {
                hits.push((depth, rel));
            }
        }
    }
    hits.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.as_os_str().as_encoded_bytes().cmp(b.1.as_os_str().as_encoded_bytes()))
    });
    hits.into_iter().map(|(_, p)| p).collect()
}

pub fn find_by_name(root: &Path, name: &str) -> Option<PathBuf> {
    find_all_by_name(root, name).into_iter().next()
}

/// Relative paths of up to `limit` files below `root`, sorted.
pub fn list_files(root: &Path, limit: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(root.join(&rel_dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(ft) = entry.file_type() else {
                continue;
            };
            let rel = rel_dir.join(entry.file_name());
            if ft.is_dir() {
                stack.push(rel);
            } else {
                out.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    out.sort();
    out.truncate(limit);
    out
}

/// Locates the dependency manifest: the declared path when it exists,
/// otherwise the shallowest file called `default_name`.
pub fn find_dependency_manifest(
    files_dir: &Path,
    declared: Option<&str>,
    default_name: &str,
) -> Option<PathBuf> {
    if let Some(rel) = declared.and_then(|d| normalize_rel_path(d).ok())
        && files_dir.join(&rel).is_file()
    {
        return Some(rel);
    }
    find_by_name(files_dir, default_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Relative to the files dir.
    pub relative: PathBuf,
    pub path: PathBuf,
    pub working_dir: PathBuf,
}

/// Resolves the declared entry point: exact path, then the normalized
/// variant, then a basename search. Never falls back to a different name.
pub fn resolve_entry(files_dir: &Path, entry: &str) -> Result<ResolvedEntry, DemoError> {
    let not_found = |tried: Vec<String>| DemoError::EntryNotFound {
        entry: entry.to_string(),
        tried,
        present: list_files(files_dir, MAX_PRESENT_FILES),
    };

    let normalized = match normalize_rel_path(entry) {
        Ok(p) => p,
        Err(e) => {
            return Err(not_found(vec![format!("{entry} (rejected: {e:?})")]));
        }
    };

    let mut tried = vec![entry.to_string()];
    let found = |rel: PathBuf| {
        let path = files_dir.join(&rel);
        let working_dir = path.parent().unwrap_or(files_dir).to_path_buf();
        ResolvedEntry {
            relative: rel,
            path,
            working_dir,
        }
    };

    if files_dir.join(entry).is_file() {
        return Ok(found(normalized));
    }

    let normalized_str = normalized.to_string_lossy().into_owned();
    if normalized_str != entry {
        tried.push(normalized_str);
        if files_dir.join(&normalized).is_file() {
            return Ok(found(normalized));
        }
    }

    if let Some(name) = normalized.file_name().and_then(|n| n.to_str()) {
        tried.push(format!("**/{name}"));
        if let Some(rel) = find_by_name(files_dir, name) {
            tracing::info!(entry, resolved = %rel.display(), "entry point resolved by basename");
            return Ok(found(rel));
        }
    }

    Err(not_found(tried))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, rel: &str) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, b"x").unwrap();
    }

    #[test]
    fn normalize_rejects_escapes() {
        assert_eq!(normalize_rel_path("/etc/passwd"), Err(RelPathError::Absolute));
        assert_eq!(normalize_rel_path("a/../../b"), Err(RelPathError::Traversal));
        assert_eq!(normalize_rel_path("  "), Err(RelPathError::Empty));
        assert_eq!(normalize_rel_path("./"), Err(RelPathError::Empty));
        assert_eq!(
            normalize_rel_path(".\\sub\\app.py").unwrap(),
            PathBuf::from("sub/app.py")
        );
    }

    #[test]
    fn sanitize_removes_artifacts_but_keeps_protected_paths() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "app.py");
        touch(root, ".DS_Store");
        touch(root, "__MACOSX/app.py");
        touch(root, "sub/._app.py");
        touch(root, "sub/__pycache__/x.pyc");
        touch(root, "sub/Thumbs.db");
        touch(root, "__pycache__/requirements.txt");

        let removed = sanitize(
            root,
            &[
                PathBuf::from("app.py"),
                PathBuf::from("__pycache__/requirements.txt"),
            ],
        )
        .unwrap();

        assert_eq!(
            removed,
            vec![
                PathBuf::from(".DS_Store"),
                PathBuf::from("__MACOSX"),
                PathBuf::from("sub/._app.py"),
                PathBuf::from("sub/Thumbs.db"),
                PathBuf::from("sub/__pycache__"),
            ]
        );
        assert!(root.join("app.py").is_file());
        assert!(root.join("__pycache__/requirements.txt").is_file());
    }

    #[test]
    fn basename_search_prefers_shallow_then_bytewise() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "z/requirements.txt");
        touch(root, "a/b/requirements.txt");
        touch(root, "b/requirements.txt");

        assert_eq!(
            find_by_name(root, "requirements.txt"),
            Some(PathBuf::from("b/requirements.txt"))
        );
        assert_eq!(find_by_name(root, "missing.txt"), None);
    }

    #[test]
    fn declared_manifest_wins_over_search() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "requirements.txt");
        touch(root, "deep/dir/reqs.txt");

        assert_eq!(
            find_dependency_manifest(root, Some("deep/dir/reqs.txt"), "requirements.txt"),
            Some(PathBuf::from("deep/dir/reqs.txt"))
        );
        assert_eq!(
            find_dependency_manifest(root, Some("gone.txt"), "requirements.txt"),
            Some(PathBuf::from("requirements.txt"))
        );
    }

    #[test]
    fn resolve_entry_exact_path_sets_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "sub/app.py");

        let r = resolve_entry(root, "sub/app.py").unwrap();
        assert_eq!(r.relative, PathBuf::from("sub/app.py"));
        assert_eq!(r.working_dir, root.join("sub"));
    }

    #[test]
    fn resolve_entry_normalizes_separators() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "sub/app.py");

        let r = resolve_entry(root, ".\\sub\\app.py").unwrap();
        assert_eq!(r.path, root.join("sub/app.py"));
    }

    #[test]
    fn resolve_entry_falls_back_to_basename_search() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "nested/dir/app.py");

        let r = resolve_entry(root, "app.py").unwrap();
        assert_eq!(r.relative, PathBuf::from("nested/dir/app.py"));
        assert_eq!(r.working_dir, root.join("nested/dir"));
    }

    #[test]
    fn resolve_entry_reports_candidates_and_present_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "main.py");
        touch(root, "lib/util.py");

        let err = resolve_entry(root, "src/app.py").unwrap_err();
        match err {
            DemoError::EntryNotFound {
                entry,
                tried,
                present,
            } => {
                assert_eq!(entry, "src/app.py");
                assert_eq!(tried, vec!["src/app.py".to_string(), "**/app.py".to_string()]);
                assert_eq!(present, vec!["lib/util.py".to_string(), "main.py".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn resolve_entry_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_entry(dir.path(), "../outside.py").unwrap_err();
        assert!(matches!(err, DemoError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn marker_round_trip_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path(), &TenantId::parse("t1").unwrap());
        assert!(!ws.is_ready());
        assert!(!ws.remove().await.unwrap());

        ws.reset().await.unwrap();
        tokio::fs::create_dir_all(ws.env_dir()).await.unwrap();
        ws.write_marker(&["no dependency manifest found".to_string()])
            .await
            .unwrap();
        assert!(ws.is_ready());
        let marker = ws.read_marker().await.unwrap();
        assert_eq!(marker.notes.len(), 1);

        assert!(ws.remove().await.unwrap());
        assert!(!ws.root().exists());
    }
}
