use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;

use crate::workspace::normalize_rel_path;

/// Bundle storage. Keys are `/`-separated and relative; a prefix selects
/// every object below it.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    async fn upload(&self, local: &Path, key: &str) -> anyhow::Result<String>;

    /// Copies every object under `prefix` into `dest`, keeping the key
    /// layout below the prefix. Returns the number of objects written.
    async fn download_all(&self, prefix: &str, dest: &Path) -> anyhow::Result<usize>;

    async fn delete_all(&self, prefix: &str) -> anyhow::Result<usize>;
}

pub fn tenant_prefix(tenant: &demohub_process::TenantId) -> String {
    format!("projects/{}", tenant.as_str())
}

/// Directory-backed store: object `a/b/c` lives at `<root>/a/b/c`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn key_path(&self, key: &str) -> anyhow::Result<PathBuf> {
        let rel = normalize_rel_path(key)
            .map_err(|e| anyhow::anyhow!("invalid object key {key:?}: {e:?}"))?;
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, local: &Path, key: &str) -> anyhow::Result<String> {
        let dest = self.key_path(key)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = dest.with_extension("upload.tmp");
        tokio::fs::copy(local, &tmp)
            .await
            .with_context(|| format!("copy {} to object store", local.display()))?;
        tokio::fs::rename(&tmp, &dest)
            .await
            .with_context(|| format!("persist object {key}"))?;
        Ok(key.to_string())
    }

    async fn download_all(&self, prefix: &str, dest: &Path) -> anyhow::Result<usize> {
        let src = self.key_path(prefix)?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&src, &dest))
            .await
            .context("join download task")?
    }

    async fn delete_all(&self, prefix: &str) -> anyhow::Result<usize> {
        let dir = self.key_path(prefix)?;
        let count = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || count_files(&dir))
                .await
                .context("join delete task")?
        };
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e).with_context(|| format!("delete prefix {prefix}")),
        }
    }
}

fn copy_tree(src: &Path, dest: &Path) -> anyhow::Result<usize> {
    if !src.is_dir() {
        return Ok(0);
    }
    let mut copied = 0usize;
    let mut stack = vec![PathBuf::new()];
    while let Some(rel_dir) = stack.pop() {
        let dir = src.join(&rel_dir);
        let entries = std::fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let ft = entry.file_type()?;
            let rel = rel_dir.join(entry.file_name());
            if ft.is_dir() {
                std::fs::create_dir_all(dest.join(&rel))?;
                stack.push(rel);
            } else if ft.is_file() {
                let target = dest.join(&rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)
                    .with_context(|| format!("download {}", rel.display()))?;
                copied += 1;
            }
        }
    }
    Ok(copied)
}

fn count_files(dir: &Path) -> usize {
    let mut n = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&d) else {
            continue;
        };
        for entry in entries.flatten() {
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(entry.path()),
                Ok(_) => n += 1,
                Err(_) => {}
            }
        }
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_and_delete_prefix() {
        let store_dir = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(store_dir.path());

        let src = scratch.path().join("app.py");
        std::fs::write(&src, b"print('hi')").unwrap();
        store.upload(&src, "projects/t1/sub/app.py").await.unwrap();
        store.upload(&src, "projects/t1/README.md").await.unwrap();
        store.upload(&src, "projects/t2/app.py").await.unwrap();

        let dest = scratch.path().join("out");
        let n = store.download_all("projects/t1", &dest).await.unwrap();
        assert_eq!(n, 2);
        assert!(dest.join("sub/app.py").is_file());
        assert!(!dest.join("app.py").exists());

        assert_eq!(store.delete_all("projects/t1").await.unwrap(), 2);
        assert_eq!(store.download_all("projects/t1", &dest).await.unwrap(), 0);
        assert_eq!(store.delete_all("projects/t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let store_dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(store_dir.path());
        assert!(store.delete_all("../elsewhere").await.is_err());
    }
}
