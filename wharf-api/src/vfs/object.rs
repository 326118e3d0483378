//! Object-store backends
//!
//! S3-compatible stores, Google Cloud Storage, Azure Blob and the
//! read-only HTTP filesystem, all through one object-store client.
//! Object stores have no symlinks, modes or owners; those capabilities
//! answer unsupported through the trait defaults.

use super::{FileInfo, Fs, FsRead, FsWrite, WriteFlags};
use crate::kms::SecretBox;
use crate::provider::fsconfig::FilesystemConfig;
use crate::util;
use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind as OpErrorKind, Operator};
use std::sync::Arc;
use wharf_common::{Error, Result};

pub struct ObjectFs {
    op: Operator,
    backend: &'static str,
    read_only: bool,
}

impl ObjectFs {
    pub fn new(config: &FilesystemConfig, kms: &Arc<SecretBox>, aad: &str) -> Result<Self> {
        let (op, backend, read_only) = match config {
            FilesystemConfig::S3(c) => {
                let secret = kms.decrypt(&c.access_secret, aad)?;
                let mut builder = opendal::services::S3::default()
                    .bucket(&c.bucket)
                    .root(&root_of(&c.key_prefix));
                if !c.region.is_empty() {
                    builder = builder.region(&c.region);
                }
                if !c.endpoint.is_empty() {
                    builder = builder.endpoint(&c.endpoint);
                }
                if !c.access_key.is_empty() {
                    builder = builder.access_key_id(&c.access_key).secret_access_key(&secret);
                }
                // Path-style is the client default; virtual-host
                // addressing only makes sense against AWS endpoints.
                if !c.force_path_style && c.endpoint.is_empty() {
                    builder = builder.enable_virtual_host_style();
                }
                (
                    Operator::new(builder).map_err(op_build_err)?.finish(),
                    "s3fs",
                    false,
                )
            }
            FilesystemConfig::Gcs(c) => {
                let mut builder = opendal::services::Gcs::default()
                    .bucket(&c.bucket)
                    .root(&root_of(&c.key_prefix));
                if !c.automatic_credentials {
                    let credentials = kms.decrypt(&c.credentials, aad)?;
                    builder = builder.credential(&credentials);
                }
                (
                    Operator::new(builder).map_err(op_build_err)?.finish(),
                    "gcsfs",
                    false,
                )
            }
            FilesystemConfig::AzBlob(c) => {
                let mut builder = opendal::services::Azblob::default()
                    .container(&c.container)
                    .root(&root_of(&c.key_prefix));
                if !c.account_name.is_empty() {
                    builder = builder.account_name(&c.account_name);
                }
                if !c.account_key.is_empty() {
                    let key = kms.decrypt(&c.account_key, aad)?;
                    builder = builder.account_key(&key);
                }
                if !c.endpoint.is_empty() {
                    builder = builder.endpoint(&c.endpoint);
                }
                (
                    Operator::new(builder).map_err(op_build_err)?.finish(),
                    "azblobfs",
                    false,
                )
            }
            FilesystemConfig::Http(c) => {
                let builder = opendal::services::Http::default().endpoint(&c.endpoint);
                (
                    Operator::new(builder).map_err(op_build_err)?.finish(),
                    "httpfs",
                    true,
                )
            }
            other => {
                return Err(Error::Internal(format!(
                    "not an object-store config: {}",
                    other.provider_name()
                )))
            }
        };
        Ok(Self {
            op,
            backend,
            read_only,
        })
    }

    /// Object keys have no leading slash.
    fn key(&self, path: &str) -> String {
        util::clean_path(path).trim_start_matches('/').to_string()
    }

    fn dir_key(&self, path: &str) -> String {
        let key = self.key(path);
        if key.is_empty() {
            String::new()
        } else {
            format!("{}/", key)
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::OperationUnsupported(format!(
                "{} is read-only",
                self.backend
            )));
        }
        Ok(())
    }
}

fn root_of(key_prefix: &str) -> String {
    if key_prefix.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", key_prefix.trim_matches('/'))
    }
}

fn op_build_err(e: opendal::Error) -> Error {
    Error::Validation(format!("invalid object store config: {}", e))
}

fn map_op_err(e: opendal::Error, context: &str) -> Error {
    match e.kind() {
        OpErrorKind::NotFound => Error::NotFound(context.to_string()),
        OpErrorKind::PermissionDenied => Error::PermissionDenied(context.to_string()),
        OpErrorKind::AlreadyExists => Error::Conflict(context.to_string()),
        OpErrorKind::Unsupported => Error::OperationUnsupported(context.to_string()),
        OpErrorKind::RateLimited => Error::RateLimited { retry_after_secs: 1 },
        _ => Error::Internal(format!("{}: {}", context, e)),
    }
}

fn info_from_metadata(name: String, metadata: &opendal::Metadata) -> FileInfo {
    FileInfo {
        name,
        size: metadata.content_length() as i64,
        is_dir: metadata.is_dir(),
        is_symlink: false,
        modified_ms: metadata
            .last_modified()
            .map(|t| t.into_inner().as_millisecond())
            .unwrap_or(0),
        mode: None,
    }
}

#[async_trait]
impl Fs for ObjectFs {
    fn name(&self) -> &'static str {
        self.backend
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let key = self.key(path);
        if key.is_empty() {
            return Ok(FileInfo {
                name: "/".to_string(),
                is_dir: true,
                ..Default::default()
            });
        }
        // A key can exist as an object or as a prefix marker.
        match self.op.stat(&key).await {
            Ok(metadata) => Ok(info_from_metadata(util::base_name(path), &metadata)),
            Err(e) if e.kind() == OpErrorKind::NotFound => {
                let metadata = self
                    .op
                    .stat(&self.dir_key(path))
                    .await
                    .map_err(|e| map_op_err(e, path))?;
                Ok(info_from_metadata(util::base_name(path), &metadata))
            }
            Err(e) => Err(map_op_err(e, path)),
        }
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = self.dir_key(path);
        let entries = self
            .op
            .list(&dir)
            .await
            .map_err(|e| map_op_err(e, path))?;
        Ok(entries
            .iter()
            // Some services return the listed prefix itself
            .filter(|entry| entry.path() != dir && !entry.name().is_empty())
            .map(|entry| {
                info_from_metadata(
                    entry.name().trim_end_matches('/').to_string(),
                    entry.metadata(),
                )
            })
            .collect())
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn FsRead>> {
        let key = self.key(path);
        let metadata = self.op.stat(&key).await.map_err(|e| map_op_err(e, path))?;
        Ok(Box::new(ObjectReader {
            op: self.op.clone(),
            key,
            pos: offset,
            size: metadata.content_length(),
        }))
    }

    async fn open_write(&self, path: &str, flags: WriteFlags) -> Result<Box<dyn FsWrite>> {
        self.check_writable()?;
        if flags.offset > 0 {
            return Err(Error::OperationUnsupported(format!(
                "resumed uploads are not supported on {}",
                self.backend
            )));
        }
        let key = self.key(path);
        let writer = self
            .op
            .writer(&key)
            .await
            .map_err(|e| map_op_err(e, path))?;
        Ok(Box::new(ObjectWriter {
            writer: Some(writer),
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.op
            .delete(&self.key(path))
            .await
            .map_err(|e| map_op_err(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        let dir = self.dir_key(path);
        let entries = self.op.list(&dir).await.map_err(|e| map_op_err(e, path))?;
        if entries.iter().any(|entry| entry.path() != dir) {
            return Err(Error::Validation(format!(
                "directory {:?} is not empty",
                path
            )));
        }
        self.op.delete(&dir).await.map_err(|e| map_op_err(e, path))
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.check_writable()?;
        let from = self.key(source);
        let to = self.key(target);
        match self.op.rename(&from, &to).await {
            Ok(()) => Ok(()),
            // Server-side rename unavailable: copy then delete.
            Err(e) if e.kind() == OpErrorKind::Unsupported => {
                self.op
                    .copy(&from, &to)
                    .await
                    .map_err(|e| map_op_err(e, source))?;
                self.op
                    .delete(&from)
                    .await
                    .map_err(|e| map_op_err(e, source))
            }
            Err(e) => Err(map_op_err(e, source)),
        }
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.check_writable()?;
        self.op
            .create_dir(&self.dir_key(path))
            .await
            .map_err(|e| map_op_err(e, path))
    }

    async fn walk(&self, path: &str) -> Result<Vec<(String, FileInfo)>> {
        let base = util::clean_path(path);
        let dir = self.dir_key(path);
        let entries = self
            .op
            .list_with(&dir)
            .recursive(true)
            .await
            .map_err(|e| map_op_err(e, path))?;
        Ok(entries
            .iter()
            .filter(|entry| entry.path() != dir)
            .map(|entry| {
                let relative = entry.path().strip_prefix(&dir).unwrap_or(entry.path());
                let virtual_path = util::join_path(&base, relative.trim_end_matches('/'));
                (
                    virtual_path.clone(),
                    info_from_metadata(util::base_name(&virtual_path), entry.metadata()),
                )
            })
            .collect())
    }
}

struct ObjectReader {
    op: Operator,
    key: String,
    pos: u64,
    size: u64,
}

#[async_trait]
impl FsRead for ObjectReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.pos >= self.size {
            return Ok(Bytes::new());
        }
        let end = (self.pos + max as u64).min(self.size);
        let buffer = self
            .op
            .read_with(&self.key)
            .range(self.pos..end)
            .await
            .map_err(|e| map_op_err(e, &self.key))?;
        self.pos = end;
        Ok(buffer.to_bytes())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct ObjectWriter {
    writer: Option<opendal::Writer>,
}

#[async_trait]
impl FsWrite for ObjectWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Internal("writer already closed".to_string()))?;
        writer
            .write(chunk.to_vec())
            .await
            .map_err(|e| map_op_err(e, "write"))
    }

    async fn close(&mut self) -> Result<()> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| Error::Internal("writer already closed".to_string()))?;
        writer.close().await.map_err(|e| map_op_err(e, "close"))?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.abort().await.map_err(|e| map_op_err(e, "abort"))?;
        }
        Ok(())
    }
}
