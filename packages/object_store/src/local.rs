//! Directory-backed object store.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use crate::sync::{file_md5, is_unchanged};
use crate::{ObjectMeta, ObjectReader, ObjectStore, ObjectStoreError, PutOptions, PutOutcome};

/// Suffix of the JSON sidecar file holding an object's tags.
const TAGS_SUFFIX: &str = ".tags.json";

/// Objects stored as plain files below a root directory.
///
/// Keys map to relative paths (`/`-separated). Tags are written to
/// `<key>.tags.json` next to the object.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Creates a store rooted at `root`. The directory need not exist yet.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path for `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Reads back the tags written by [`ObjectStore::tag`].
    ///
    /// # Errors
    ///
    /// Returns [`ObjectStoreError::Io`] if the sidecar cannot be read, or
    /// [`ObjectStoreError::Tag`] if it is not valid JSON.
    pub async fn read_tags(&self, key: &str) -> Result<BTreeMap<String, String>, ObjectStoreError> {
        let path = self.tags_path(key);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = tokio::fs::read_to_string(&path).await?;
        serde_json::from_str(&text).map_err(|e| ObjectStoreError::Tag {
            uri: self.uri(),
            key: key.to_string(),
            source: Box::new(e),
        })
    }

    fn tags_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{TAGS_SUFFIX}"))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn uri(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn get_range(
        &self,
        key: &str,
        range: Range<u64>,
    ) -> Result<ObjectReader, ObjectStoreError> {
        let path = self.path_for(key);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ObjectStoreError::NotFound {
                    uri: self.uri(),
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if range.start >= range.end {
            return Ok(Box::pin(tokio::io::empty()));
        }

        file.seek(SeekFrom::Start(range.start)).await?;
        Ok(Box::pin(file.take(range.end - range.start)))
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, ObjectStoreError> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) if meta.is_file() => Ok(Some(ObjectMeta {
                size: meta.len(),
                etag: None,
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ObjectStoreError::Head {
                uri: self.uri(),
                key: key.to_string(),
                source: Box::new(e),
            }),
        }
    }

    async fn put_file(
        &self,
        key: &str,
        path: &Path,
        options: &PutOptions,
    ) -> Result<PutOutcome, ObjectStoreError> {
        let target = self.path_for(key);
        if target == path {
            return Ok(PutOutcome::Skipped);
        }
        if !options.force
            && let Ok(meta) = tokio::fs::metadata(&target).await
        {
            let existing = ObjectMeta {
                size: meta.len(),
                etag: Some(file_md5(&target).await?),
            };
            if is_unchanged(path, &existing).await? {
                log::info!("  {} -> {}: skipped (unchanged)", path.display(), target.display());
                return Ok(PutOutcome::Skipped);
            }
        }
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = tokio::fs::copy(path, &target)
            .await
            .map_err(|e| ObjectStoreError::Put {
                uri: self.uri(),
                key: key.to_string(),
                source: Box::new(e),
            })?;
        log::info!("  copied {} -> {} ({bytes} bytes)", path.display(), target.display());
        Ok(PutOutcome::Transferred)
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let list_err = |e: std::io::Error| ObjectStoreError::List {
            uri: self.uri(),
            prefix: prefix.to_string(),
            source: Box::new(e),
        };

        let mut keys = Vec::new();
        if !self.root.exists() {
            return Ok(keys);
        }

        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await.map_err(list_err)?;
            while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
                let path = entry.path();
                if entry.file_type().await.map_err(list_err)?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(TAGS_SUFFIX) || !key.starts_with(prefix) {
                    continue;
                }
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn tag(&self, key: &str, tags: &[(String, String)]) -> Result<(), ObjectStoreError> {
        let tag_err = |e: Box<dyn std::error::Error + Send + Sync>| ObjectStoreError::Tag {
            uri: self.uri(),
            key: key.to_string(),
            source: e,
        };

        if self.head(key).await?.is_none() {
            return Err(ObjectStoreError::NotFound {
                uri: self.uri(),
                key: key.to_string(),
            });
        }

        let map: BTreeMap<&str, &str> = tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let json = serde_json::to_string_pretty(&map).map_err(|e| tag_err(Box::new(e)))?;
        tokio::fs::write(self.tags_path(key), json)
            .await
            .map_err(|e| tag_err(Box::new(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn reads_exact_byte_range() {
        let dir = scratch("taxi_local_store_range");
        std::fs::write(dir.join("data.csv"), b"0123456789abcdef").unwrap();
        let store = LocalObjectStore::new(&dir);

        let mut reader = store.get_range("data.csv", 4..10).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "456789");

        // Past the end is a short read, not an error.
        let mut reader = store.get_range("data.csv", 12..100).await.unwrap();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "cdef");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = scratch("taxi_local_store_missing");
        let store = LocalObjectStore::new(&dir);

        assert!(matches!(
            store.get_range("nope.csv", 0..80).await,
            Err(ObjectStoreError::NotFound { .. })
        ));
        assert_eq!(store.head("nope.csv").await.unwrap(), None);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn puts_lists_and_tags() {
        let dir = scratch("taxi_local_store_put");
        let staging = scratch("taxi_local_store_put_staging");
        let src = staging.join("green-2016-01.csv");
        std::fs::write(&src, b"abc\n").unwrap();

        let store = LocalObjectStore::new(&dir);
        let outcome = store
            .put_file("nested/green-2016-01.csv", &src, &PutOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Transferred);
        assert_eq!(
            store.head("nested/green-2016-01.csv").await.unwrap().map(|m| m.size),
            Some(4)
        );

        let tags = vec![
            ("color".to_string(), "green".to_string()),
            ("year".to_string(), "2016".to_string()),
        ];
        store.tag("nested/green-2016-01.csv", &tags).await.unwrap();
        let read = store.read_tags("nested/green-2016-01.csv").await.unwrap();
        assert_eq!(read.get("color").map(String::as_str), Some("green"));

        let keys = store.list_keys("nested/").await.unwrap();
        assert_eq!(keys, vec!["nested/green-2016-01.csv".to_string()]);
        assert!(store.list_keys("other/").await.unwrap().is_empty());

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }

    #[tokio::test]
    async fn unchanged_file_is_skipped_unless_forced() {
        let dir = scratch("taxi_local_store_skip");
        let staging = scratch("taxi_local_store_skip_staging");
        let src = staging.join("green-2016-01.csv");
        std::fs::write(&src, b"abc\n").unwrap();
        let store = LocalObjectStore::new(&dir);
        let key = "green-2016-01.csv";

        let put = PutOptions::default();
        assert_eq!(store.put_file(key, &src, &put).await.unwrap(), PutOutcome::Transferred);
        assert_eq!(store.put_file(key, &src, &put).await.unwrap(), PutOutcome::Skipped);

        // Same size, different content.
        std::fs::write(&src, b"abd\n").unwrap();
        assert_eq!(store.put_file(key, &src, &put).await.unwrap(), PutOutcome::Transferred);
        assert_eq!(std::fs::read(dir.join(key)).unwrap(), b"abd\n");

        let forced = PutOptions {
            force: true,
            ..PutOptions::default()
        };
        assert_eq!(store.put_file(key, &src, &forced).await.unwrap(), PutOutcome::Transferred);

        std::fs::remove_dir_all(&dir).ok();
        std::fs::remove_dir_all(&staging).ok();
    }
}
