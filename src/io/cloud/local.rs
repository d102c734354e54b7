//! Filesystem-backed [`ObjectIO`].
//!
//! A bucket is a directory under the configured root and a key is a relative
//! path inside it, so `LocalObjectIO::new("/data")` stores `("filings",
//! "upload/2024/LEI/1.csv")` at `/data/filings/upload/2024/LEI/1.csv`. An
//! empty root makes bucket names plain paths, which is how the local
//! development setup addresses its data directory.

use crate::io::cloud::traits::{
    CloudIOError, CloudResult, ErrorKind, ObjectIO, ObjectMetadata,
};
use crate::io::glob::files_under;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct LocalObjectIO {
    root: PathBuf,
}

impl LocalObjectIO {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }

    fn object_path(&self, bucket: &str, key: &str) -> CloudResult<PathBuf> {
        let rel = Path::new(key.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CloudIOError::new(
                ErrorKind::InvalidInput,
                format!("Key {key} escapes its bucket"),
            ));
        }
        Ok(self.bucket_dir(bucket).join(rel))
    }
}

impl ObjectIO for LocalObjectIO {
    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> CloudResult<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data).map_err(|e| CloudIOError::from(e).with_source(path.display().to_string()))
    }

    fn get_object(&self, bucket: &str, key: &str) -> CloudResult<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        fs::read(&path).map_err(|e| CloudIOError::from(e).with_source(path.display().to_string()))
    }

    fn open_object(&self, bucket: &str, key: &str) -> CloudResult<Box<dyn Read + Send>> {
        let path = self.object_path(bucket, key)?;
        let file =
            File::open(&path).map_err(|e| CloudIOError::from(e).with_source(path.display().to_string()))?;
        Ok(Box::new(file))
    }

    fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> CloudResult<Vec<ObjectMetadata>> {
        let bucket_dir = self.bucket_dir(bucket);
        let prefix = prefix.unwrap_or("").trim_start_matches('/');
        // Only walk the deepest directory the prefix fully names.
        let walk_root = match prefix.rfind('/') {
            Some(idx) => bucket_dir.join(&prefix[..idx]),
            None => bucket_dir.clone(),
        };

        let files = files_under(&walk_root)
            .map_err(|e| CloudIOError::new(ErrorKind::InternalError, format!("{e:#}")))?;

        let mut objects = Vec::new();
        for path in files {
            let Ok(rel) = path.strip_prefix(&bucket_dir) else {
                continue;
            };
            let key = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/");
            if !key.starts_with(prefix) {
                continue;
            }
            objects.push(ObjectMetadata { key });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        Ok(self.object_path(bucket, key)?.is_file())
    }
}
