//! Local disk backend
//!
//! Implements the full capability set. Fresh writes stream to a hidden
//! temp file in the target directory and are renamed into place on
//! close, so a crashed upload never leaves a partial file at the final
//! path. Resumed writes append to the existing file in place.

use super::{classify_io_error, FileInfo, Fs, FsRead, FsWrite, WriteFlags};
use crate::provider::fsconfig::LocalFsConfig;
use crate::util;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use wharf_common::{Error, Result};

pub struct LocalFs {
    root: PathBuf,
    #[allow(dead_code)]
    config: LocalFsConfig,
}

impl LocalFs {
    pub fn new(root: &str, config: LocalFsConfig) -> Result<Self> {
        if root.is_empty() {
            return Err(Error::Validation(
                "local filesystem requires a root directory".to_string(),
            ));
        }
        Ok(Self {
            root: PathBuf::from(root),
            config,
        })
    }

    /// Join a backend path onto the root. The input is already cleaned
    /// by the VFS layer, this is a second line of defense.
    fn full_path(&self, path: &str) -> PathBuf {
        let cleaned = util::clean_path(path);
        self.root.join(cleaned.trim_start_matches('/'))
    }

    /// Reject paths whose resolved location escapes the root, which
    /// catches symlinks pointing outside the home dir.
    async fn check_within_root(&self, full: &Path) -> Result<()> {
        // The leaf may not exist yet; canonicalize the closest existing
        // ancestor.
        let mut probe = full.to_path_buf();
        let resolved = loop {
            match fs::canonicalize(&probe).await {
                Ok(resolved) => break resolved,
                Err(_) => match probe.parent() {
                    Some(parent) => probe = parent.to_path_buf(),
                    None => return Ok(()),
                },
            }
        };
        let root = fs::canonicalize(&self.root)
            .await
            .unwrap_or_else(|_| self.root.clone());
        if !resolved.starts_with(&root) {
            return Err(Error::PermissionDenied(format!(
                "path {:?} resolves outside the filesystem root",
                full
            )));
        }
        Ok(())
    }

    fn info_from_metadata(name: String, metadata: &std::fs::Metadata) -> FileInfo {
        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            Some(metadata.mode())
        };
        #[cfg(not(unix))]
        let mode = None;
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        FileInfo {
            name,
            size: metadata.len() as i64,
            is_dir: metadata.is_dir(),
            is_symlink: metadata.file_type().is_symlink(),
            modified_ms,
            mode,
        }
    }
}

#[async_trait]
impl Fs for LocalFs {
    fn name(&self) -> &'static str {
        "osfs"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        let metadata = fs::metadata(&full)
            .await
            .map_err(|e| classify_io_error(e, path))?;
        Ok(Self::info_from_metadata(util::base_name(path), &metadata))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        let mut entries = fs::read_dir(&full)
            .await
            .map_err(|e| classify_io_error(e, path))?;
        let mut result = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| classify_io_error(e, path))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            match entry.metadata().await {
                Ok(metadata) => result.push(Self::info_from_metadata(name, &metadata)),
                // Entry vanished between readdir and stat; skip it.
                Err(_) => continue,
            }
        }
        Ok(result)
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn FsRead>> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        let mut file = fs::File::open(&full)
            .await
            .map_err(|e| classify_io_error(e, path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| classify_io_error(e, path))?;
        }
        Ok(Box::new(LocalReader { file }))
    }

    async fn open_write(&self, path: &str, flags: WriteFlags) -> Result<Box<dyn FsWrite>> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        if let Some(parent) = full.parent() {
            if !parent.exists() {
                return Err(Error::NotFound(format!(
                    "parent directory of {:?} does not exist",
                    path
                )));
            }
        }
        if flags.offset > 0 {
            // Resume appends in place; atomicity is not possible here.
            let mut file = fs::OpenOptions::new()
                .write(true)
                .open(&full)
                .await
                .map_err(|e| classify_io_error(e, path))?;
            file.seek(SeekFrom::Start(flags.offset))
                .await
                .map_err(|e| classify_io_error(e, path))?;
            return Ok(Box::new(LocalWriter {
                file: Some(file),
                temp_path: None,
                final_path: full,
            }));
        }
        let temp_path = full.with_file_name(format!(
            ".wharf-upload-{}.tmp",
            util::random_string(12)
        ));
        let file = fs::File::create(&temp_path)
            .await
            .map_err(|e| classify_io_error(e, path))?;
        Ok(Box::new(LocalWriter {
            file: Some(file),
            temp_path: Some(temp_path),
            final_path: full,
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        fs::remove_file(&full)
            .await
            .map_err(|e| classify_io_error(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        fs::remove_dir(&full)
            .await
            .map_err(|e| classify_io_error(e, path))
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let from = self.full_path(source);
        let to = self.full_path(target);
        self.check_within_root(&from).await?;
        self.check_within_root(&to).await?;
        fs::rename(&from, &to)
            .await
            .map_err(|e| classify_io_error(e, source))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        fs::create_dir(&full)
            .await
            .map_err(|e| classify_io_error(e, path))
    }

    async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| classify_io_error(e, "create root"))
    }

    async fn walk(&self, path: &str) -> Result<Vec<(String, FileInfo)>> {
        let full = self.full_path(path);
        self.check_within_root(&full).await?;
        let base = util::clean_path(path);
        let root = full.clone();
        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in walkdir::WalkDir::new(&root).follow_links(false) {
                let entry = entry.map_err(|e| Error::Internal(format!("walk failed: {}", e)))?;
                if entry.path() == root {
                    continue;
                }
                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                let virtual_path = util::join_path(&base, &relative.to_string_lossy());
                let metadata = entry
                    .metadata()
                    .map_err(|e| Error::Internal(format!("walk stat failed: {}", e)))?;
                out.push((
                    virtual_path.clone(),
                    LocalFs::info_from_metadata(util::base_name(&virtual_path), &metadata),
                ));
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::Internal(format!("walk task failed: {}", e)))?
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        #[cfg(unix)]
        {
            let target_full = self.full_path(target);
            let link_full = self.full_path(link);
            self.check_within_root(&target_full).await?;
            self.check_within_root(&link_full).await?;
            fs::symlink(&target_full, &link_full)
                .await
                .map_err(|e| classify_io_error(e, link))
        }
        #[cfg(not(unix))]
        {
            let _ = (target, link);
            Err(Error::OperationUnsupported(
                "symlinks are not supported on this platform".to_string(),
            ))
        }
    }

    async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let full = self.full_path(path);
            fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| classify_io_error(e, path))
        }
        #[cfg(not(unix))]
        {
            let _ = (path, mode);
            Err(Error::OperationUnsupported("chmod".to_string()))
        }
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> Result<()> {
        #[cfg(unix)]
        {
            let full = self.full_path(path);
            let path_owned = path.to_string();
            tokio::task::spawn_blocking(move || {
                std::os::unix::fs::chown(&full, Some(uid), Some(gid))
                    .map_err(|e| classify_io_error(e, &path_owned))
            })
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
        }
        #[cfg(not(unix))]
        {
            let _ = (path, uid, gid);
            Err(Error::OperationUnsupported("chown".to_string()))
        }
    }

    async fn chtimes(&self, path: &str, _atime_ms: i64, mtime_ms: i64) -> Result<()> {
        let full = self.full_path(path);
        let path_owned = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_millis(mtime_ms as u64);
            let file = std::fs::File::options()
                .write(true)
                .open(&full)
                .map_err(|e| classify_io_error(e, &path_owned))?;
            file.set_modified(mtime)
                .map_err(|e| classify_io_error(e, &path_owned))
        })
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
    }
}

struct LocalReader {
    file: fs::File,
}

#[async_trait]
impl FsRead for LocalReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; max];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| classify_io_error(e, "read"))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct LocalWriter {
    file: Option<fs::File>,
    /// Set for fresh writes; `None` when resuming in place.
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
}

#[async_trait]
impl FsWrite for LocalWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::Internal("writer already closed".to_string()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| classify_io_error(e, "write"))
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::Internal("writer already closed".to_string()))?;
        file.flush()
            .await
            .map_err(|e| classify_io_error(e, "flush"))?;
        file.sync_all()
            .await
            .map_err(|e| classify_io_error(e, "sync"))?;
        drop(file);
        if let Some(temp) = self.temp_path.take() {
            fs::rename(&temp, &self.final_path)
                .await
                .map_err(|e| classify_io_error(e, "commit"))?;
        }
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.file.take();
        if let Some(temp) = self.temp_path.take() {
            let _ = fs::remove_file(&temp).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(root: &Path) -> LocalFs {
        LocalFs::new(&root.to_string_lossy(), LocalFsConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn write_is_atomic_until_close() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        let mut writer = fs
            .open_write("/data.bin", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"hello ").await.unwrap();
        writer.write_chunk(b"world").await.unwrap();
        assert!(fs.stat("/data.bin").await.is_err());
        writer.close().await.unwrap();
        let info = fs.stat("/data.bin").await.unwrap();
        assert_eq!(info.size, 11);
    }

    #[tokio::test]
    async fn abort_leaves_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        let mut writer = fs
            .open_write("/gone.bin", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"partial").await.unwrap();
        writer.abort().await.unwrap();
        assert!(fs.stat("/gone.bin").await.is_err());
        assert_eq!(fs.list("/").await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn read_with_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        let mut writer = fs
            .open_write("/f.txt", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"0123456789").await.unwrap();
        writer.close().await.unwrap();

        let mut reader = fs.open_read("/f.txt", 7).await.unwrap();
        let chunk = reader.read_chunk(16).await.unwrap();
        assert_eq!(&chunk[..], b"789");
        assert!(reader.read_chunk(16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_appends_at_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        let mut writer = fs
            .open_write("/f.txt", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"0123456789").await.unwrap();
        writer.close().await.unwrap();

        let mut writer = fs
            .open_write(
                "/f.txt",
                WriteFlags {
                    offset: 5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        writer.write_chunk(b"XYZ").await.unwrap();
        writer.close().await.unwrap();

        let mut reader = fs.open_read("/f.txt", 0).await.unwrap();
        let chunk = reader.read_chunk(32).await.unwrap();
        assert_eq!(&chunk[..], b"01234XYZ89");
    }

    #[tokio::test]
    async fn two_concurrent_readers() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        let mut writer = fs
            .open_write("/f.txt", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"shared content").await.unwrap();
        writer.close().await.unwrap();

        let mut r1 = fs.open_read("/f.txt", 0).await.unwrap();
        let mut r2 = fs.open_read("/f.txt", 0).await.unwrap();
        let a = r1.read_chunk(64).await.unwrap();
        let b = r2.read_chunk(64).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn walk_returns_virtual_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = local(tmp.path());
        fs.mkdir("/sub").await.unwrap();
        let mut writer = fs
            .open_write("/sub/a.txt", WriteFlags::default())
            .await
            .unwrap();
        writer.write_chunk(b"x").await.unwrap();
        writer.close().await.unwrap();

        let entries = fs.walk("/").await.unwrap();
        let paths: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert!(paths.contains(&"/sub"));
        assert!(paths.contains(&"/sub/a.txt"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escaping_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();
        let fs = local(tmp.path());
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            tmp.path().join("link.txt"),
        )
        .unwrap();
        let err = fs.open_read("/link.txt", 0).await.unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }
}
