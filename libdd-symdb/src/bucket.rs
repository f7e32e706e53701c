// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object storage as seen by the symbol database.

use crate::SymdbError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Read access to objects. This trait is dyn-compatible thanks to the
/// `async_trait` macro.
#[async_trait]
pub trait BucketReader: Send + Sync {
    /// Returns the whole object.
    async fn get(&self, path: &str) -> Result<Bytes, SymdbError>;

    /// Returns `length` bytes of the object starting at `offset`. The range
    /// must be within the object.
    async fn get_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes, SymdbError>;

    /// Lists the objects whose path starts with `prefix`, in lexicographic
    /// order.
    async fn iter(&self, prefix: &str) -> Result<Vec<String>, SymdbError>;
}

#[async_trait]
pub trait BucketWriter: Send + Sync {
    async fn upload(&self, path: &str, data: Bytes) -> Result<(), SymdbError>;
}

fn not_found(path: &str) -> SymdbError {
    SymdbError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("object not found: {path}"),
    ))
}

fn out_of_range(path: &str, offset: u64, length: u64) -> SymdbError {
    SymdbError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("range {offset}+{length} is out of bounds of {path}"),
    ))
}

/// Parquet metadata of a V2 symbol table file.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ParquetFile {
    pub num_row_groups: u64,
    pub num_rows: u64,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Path relative to the block directory.
    pub rel_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parquet: Option<ParquetFile>,
}

/// Describes the files of a block.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub ulid: String,
    #[serde(default)]
    pub files: Vec<FileMeta>,
}

impl Meta {
    pub fn file(&self, rel_path: &str) -> Option<&FileMeta> {
        self.files.iter().find(|f| f.rel_path == rel_path)
    }

    /// The path of a block file within the bucket.
    pub fn path(&self, rel_path: &str) -> String {
        format!("{}/{}", self.ulid, rel_path)
    }
}

/// An in-memory bucket.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBucket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl BucketReader for MemoryBucket {
    async fn get(&self, path: &str) -> Result<Bytes, SymdbError> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| not_found(path))
    }

    async fn get_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes, SymdbError> {
        let object = self.get(path).await?;
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= object.len() as u64)
            .ok_or_else(|| out_of_range(path, offset, length))?;
        Ok(object.slice(offset as usize..end as usize))
    }

    async fn iter(&self, prefix: &str) -> Result<Vec<String>, SymdbError> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

#[async_trait]
impl BucketWriter for MemoryBucket {
    async fn upload(&self, path: &str, data: Bytes) -> Result<(), SymdbError> {
        self.objects.write().insert(path.to_string(), data);
        Ok(())
    }
}

/// A bucket backed by a local directory. Object paths use `/` as separator
/// and must stay within the directory.
#[derive(Clone, Debug)]
pub struct FilesystemBucket {
    root: PathBuf,
}

impl FilesystemBucket {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, SymdbError> {
        let rel = Path::new(path);
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(SymdbError::fmt(format_args!("invalid object path: {path}")));
        }
        Ok(self.root.join(rel))
    }
}

fn map_not_found(err: io::Error, path: &str) -> SymdbError {
    if err.kind() == io::ErrorKind::NotFound {
        not_found(path)
    } else {
        SymdbError::Io(err)
    }
}

#[async_trait]
impl BucketReader for FilesystemBucket {
    async fn get(&self, path: &str) -> Result<Bytes, SymdbError> {
        let data = tokio::fs::read(self.resolve(path)?)
            .await
            .map_err(|e| map_not_found(e, path))?;
        Ok(Bytes::from(data))
    }

    async fn get_range(&self, path: &str, offset: u64, length: u64) -> Result<Bytes, SymdbError> {
        let mut file = tokio::fs::File::open(self.resolve(path)?)
            .await
            .map_err(|e| map_not_found(e, path))?;
        let size = file.metadata().await?.len();
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(out_of_range(path, offset, length));
        }
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    async fn iter(&self, prefix: &str) -> Result<Vec<String>, SymdbError> {
        let mut objects = Vec::new();
        let mut dirs = vec![(self.root.clone(), String::new())];
        while let Some((dir, rel)) = dirs.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                if entry.file_type().await?.is_dir() {
                    dirs.push((entry.path(), path));
                } else if path.starts_with(prefix) {
                    objects.push(path);
                }
            }
        }
        objects.sort();
        Ok(objects)
    }
}

#[async_trait]
impl BucketWriter for FilesystemBucket {
    async fn upload(&self, path: &str, data: Bytes) -> Result<(), SymdbError> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}
