//! Virtual filesystem
//!
//! A uniform file interface over heterogeneous backends plus per-user
//! path virtualization: the composed user's home is mounted at "/" and
//! each virtual folder at its mount point. Backends receive
//! backend-native paths; all virtual-to-backend translation happens
//! here.

pub mod cryptfs;
pub mod local;
pub mod object;
pub mod sftpfs;

use crate::kms::SecretBox;
use crate::provider::folders::VirtualFolder;
use crate::provider::fsconfig::FilesystemConfig;
use crate::provider::users::User;
use crate::util;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use wharf_common::{Error, Result};

/// Metadata for one file or directory.
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    pub name: String,
    /// Plaintext size in bytes (backends accounting for envelopes
    /// report the logical size).
    pub size: i64,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Milliseconds since the epoch; 0 when the backend has no mtime.
    pub modified_ms: i64,
    /// Unix mode bits when the backend tracks them.
    pub mode: Option<u32>,
}

/// Options for opening a writer.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteFlags {
    /// Starting offset for resumed uploads; 0 with `truncate` for a
    /// fresh write.
    pub offset: u64,
    pub truncate: bool,
    /// Size hint of data being replaced, used for quota accounting on
    /// resumable uploads.
    pub truncated_size: i64,
}

/// Chunked reader handed to the transfer layer.
#[async_trait]
pub trait FsRead: Send {
    /// Read up to `max` bytes; an empty buffer signals end of file.
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes>;
    async fn close(&mut self) -> Result<()>;
}

impl std::fmt::Debug for dyn FsRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn FsRead")
    }
}

/// Chunked writer handed to the transfer layer.
///
/// Implementations stage data so that `close` either publishes the file
/// at its final path or leaves nothing behind; `abort` always leaves
/// nothing behind.
#[async_trait]
pub trait FsWrite: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
    async fn abort(&mut self) -> Result<()>;
}

/// Capability set every storage backend exposes. Paths are
/// backend-native. Optional capabilities default to
/// [`Error::OperationUnsupported`].
#[async_trait]
pub trait Fs: Send + Sync {
    fn name(&self) -> &'static str;

    async fn stat(&self, path: &str) -> Result<FileInfo>;
    async fn list(&self, path: &str) -> Result<Vec<FileInfo>>;
    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn FsRead>>;
    async fn open_write(&self, path: &str, flags: WriteFlags) -> Result<Box<dyn FsWrite>>;
    async fn remove_file(&self, path: &str) -> Result<()>;
    async fn remove_dir(&self, path: &str) -> Result<()>;
    async fn rename(&self, source: &str, target: &str) -> Result<()>;
    async fn mkdir(&self, path: &str) -> Result<()>;
    /// Recursive listing of files under `path` as (path, info) pairs.
    async fn walk(&self, path: &str) -> Result<Vec<(String, FileInfo)>>;

    async fn symlink(&self, _target: &str, _link: &str) -> Result<()> {
        Err(Error::OperationUnsupported(format!(
            "symlinks are not supported on {}",
            self.name()
        )))
    }
    async fn chmod(&self, _path: &str, _mode: u32) -> Result<()> {
        Err(Error::OperationUnsupported(format!(
            "chmod is not supported on {}",
            self.name()
        )))
    }
    async fn chown(&self, _path: &str, _uid: u32, _gid: u32) -> Result<()> {
        Err(Error::OperationUnsupported(format!(
            "chown is not supported on {}",
            self.name()
        )))
    }
    async fn chtimes(&self, _path: &str, _atime_ms: i64, _mtime_ms: i64) -> Result<()> {
        Err(Error::OperationUnsupported(format!(
            "chtimes is not supported on {}",
            self.name()
        )))
    }
    /// Free space in bytes, when the backend can answer cheaply.
    async fn available_space(&self, _path: &str) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Make sure the backend root exists; local disks create the
    /// directory, object stores need nothing.
    async fn ensure_root(&self) -> Result<()> {
        Ok(())
    }
}

/// Classify a std I/O error at the VFS boundary; only classified errors
/// escape to protocol adapters.
pub fn classify_io_error(e: std::io::Error, context: &str) -> Error {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::NotFound => Error::NotFound(context.to_string()),
        ErrorKind::PermissionDenied => Error::PermissionDenied(context.to_string()),
        ErrorKind::AlreadyExists => Error::Conflict(context.to_string()),
        ErrorKind::TimedOut => Error::Timeout(context.to_string()),
        ErrorKind::Interrupted => Error::Cancelled,
        _ => Error::Internal(format!("{}: {}", context, e)),
    }
}

/// Build a backend from a filesystem config. `local_root` is the
/// absolute backend path local filesystems are rooted at (the user's
/// home or a folder's mapped path).
pub fn build_backend(
    config: &FilesystemConfig,
    local_root: &str,
    kms: &Arc<SecretBox>,
    aad: &str,
) -> Result<Arc<dyn Fs>> {
    match config {
        FilesystemConfig::Local(local) => {
            Ok(Arc::new(local::LocalFs::new(local_root, local.clone())?))
        }
        FilesystemConfig::S3(_)
        | FilesystemConfig::Gcs(_)
        | FilesystemConfig::AzBlob(_)
        | FilesystemConfig::Http(_) => {
            Ok(Arc::new(object::ObjectFs::new(config, kms, aad)?))
        }
        FilesystemConfig::Sftp(sftp) => Ok(Arc::new(sftpfs::SftpFs::new(
            sftp.clone(),
            kms.clone(),
            aad,
        )?)),
        FilesystemConfig::Crypt(crypt) => {
            let inner = build_backend(&crypt.wrapped, local_root, kms, aad)?;
            let passphrase = kms.decrypt(&crypt.passphrase, aad)?;
            Ok(Arc::new(cryptfs::CryptFs::new(inner, &passphrase)))
        }
    }
}

/// A resolved mount: the backend plus the mount's quota metadata.
pub struct ResolvedPath {
    pub fs: Arc<dyn Fs>,
    /// Backend-native path.
    pub fs_path: String,
    /// The mount the path landed in; `None` for the home filesystem.
    pub folder: Option<VirtualFolder>,
}

/// A user's composed virtual tree.
pub struct VirtualFs {
    user: User,
    home: Arc<dyn Fs>,
    mounts: Vec<(String, Arc<dyn Fs>, VirtualFolder)>,
}

impl VirtualFs {
    /// Assemble the tree for an effective user.
    pub fn for_user(user: &User, kms: &Arc<SecretBox>) -> Result<Self> {
        let home = build_backend(&user.filesystem, &user.home_dir, kms, &user.username)?;
        let mut mounts = Vec::with_capacity(user.virtual_folders.len());
        // Longer mount points first so longest-prefix resolution is a
        // simple scan.
        let mut folders = user.virtual_folders.clone();
        folders.sort_by(|a, b| b.virtual_path.len().cmp(&a.virtual_path.len()));
        for folder in folders {
            let aad = format!("folder_{}", folder.folder.name);
            let fs = build_backend(
                &folder.folder.filesystem,
                &folder.folder.mapped_path,
                kms,
                &aad,
            )?;
            mounts.push((folder.virtual_path.clone(), fs, folder));
        }
        Ok(Self {
            user: user.clone(),
            home,
            mounts,
        })
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Create the home directory (and local mounts) when missing, so a
    /// fresh account can log in before its first upload.
    pub async fn ensure_root(&self) -> Result<()> {
        self.home.ensure_root().await?;
        for (_, fs, _) in &self.mounts {
            fs.ensure_root().await?;
        }
        Ok(())
    }

    /// Resolve a virtual path to `(backend, backend path, mount)`.
    ///
    /// The cleaned path can never escape the mount: `..` segments are
    /// collapsed lexically before prefix matching.
    pub fn resolve(&self, virtual_path: &str) -> ResolvedPath {
        let cleaned = util::clean_path(virtual_path);
        for (mount_point, fs, folder) in &self.mounts {
            if util::is_same_or_ancestor(mount_point, &cleaned) {
                let relative = &cleaned[mount_point.len()..];
                let fs_path = if relative.is_empty() {
                    "/".to_string()
                } else {
                    relative.to_string()
                };
                return ResolvedPath {
                    fs: fs.clone(),
                    fs_path,
                    folder: Some(folder.clone()),
                };
            }
        }
        ResolvedPath {
            fs: self.home.clone(),
            fs_path: cleaned,
            folder: None,
        }
    }

    /// True when both paths resolve into the same mount, a requirement
    /// for rename.
    pub fn same_mount(&self, a: &str, b: &str) -> bool {
        let ra = self.resolve(a);
        let rb = self.resolve(b);
        match (&ra.folder, &rb.folder) {
            (None, None) => true,
            (Some(fa), Some(fb)) => fa.virtual_path == fb.virtual_path,
            _ => false,
        }
    }

    /// Rename across mounts is refused; backends with different
    /// storage cannot do it as one operation.
    pub async fn rename(&self, source: &str, target: &str) -> Result<()> {
        if !self.same_mount(source, target) {
            return Err(Error::OperationUnsupported(
                "rename across filesystem mounts".to_string(),
            ));
        }
        let rs = self.resolve(source);
        let rt = self.resolve(target);
        rs.fs.rename(&rs.fs_path, &rt.fs_path).await
    }

    /// Mount points directly under `virtual_dir`, so listings can show
    /// them as directories.
    pub fn mount_points_in(&self, virtual_dir: &str) -> Vec<String> {
        let dir = util::clean_path(virtual_dir);
        self.mounts
            .iter()
            .filter_map(|(mount_point, _, _)| {
                if util::parent_path(mount_point) == dir {
                    Some(util::base_name(mount_point))
                } else {
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::KmsConfig;
    use crate::provider::folders::BaseVirtualFolder;
    use std::collections::HashMap;
    use wharf_common::Permission;

    fn kms() -> Arc<SecretBox> {
        Arc::new(
            SecretBox::new(&KmsConfig {
                master_key: hex::encode([9u8; 32]),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn user_with_mounts(tmp: &std::path::Path) -> User {
        let mut permissions = HashMap::new();
        permissions.insert("/".to_string(), vec![Permission::Any]);
        User {
            username: "alice".to_string(),
            home_dir: tmp.join("home").to_string_lossy().to_string(),
            permissions,
            virtual_folders: vec![
                VirtualFolder {
                    folder: BaseVirtualFolder {
                        name: "docs".to_string(),
                        mapped_path: tmp.join("docs").to_string_lossy().to_string(),
                        ..Default::default()
                    },
                    virtual_path: "/docs".to_string(),
                    quota_size: -1,
                    quota_files: -1,
                },
                VirtualFolder {
                    folder: BaseVirtualFolder {
                        name: "docs-archive".to_string(),
                        mapped_path: tmp.join("archive").to_string_lossy().to_string(),
                        ..Default::default()
                    },
                    virtual_path: "/docs/archive".to_string(),
                    quota_size: -1,
                    quota_files: -1,
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn longest_mount_prefix_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let user = user_with_mounts(tmp.path());
        let vfs = VirtualFs::for_user(&user, &kms()).unwrap();

        let r = vfs.resolve("/docs/archive/2024/report.pdf");
        assert_eq!(r.folder.as_ref().unwrap().folder.name, "docs-archive");
        assert_eq!(r.fs_path, "/2024/report.pdf");

        let r = vfs.resolve("/docs/readme.md");
        assert_eq!(r.folder.as_ref().unwrap().folder.name, "docs");
        assert_eq!(r.fs_path, "/readme.md");

        let r = vfs.resolve("/other/file");
        assert!(r.folder.is_none());
        assert_eq!(r.fs_path, "/other/file");
    }

    #[test]
    fn dotdot_cannot_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let user = user_with_mounts(tmp.path());
        let vfs = VirtualFs::for_user(&user, &kms()).unwrap();
        let r = vfs.resolve("/../../etc/passwd");
        assert!(r.folder.is_none());
        assert_eq!(r.fs_path, "/etc/passwd");
        // inside a mount, .. walks up into the parent mount space but
        // resolution happens on the cleaned path
        let r = vfs.resolve("/docs/../other");
        assert!(r.folder.is_none());
        assert_eq!(r.fs_path, "/other");
    }

    #[test]
    fn rename_across_mounts_unsupported() {
        let tmp = tempfile::tempdir().unwrap();
        let user = user_with_mounts(tmp.path());
        let vfs = VirtualFs::for_user(&user, &kms()).unwrap();
        assert!(vfs.same_mount("/docs/a", "/docs/b"));
        assert!(!vfs.same_mount("/docs/a", "/home-file"));
        assert!(!vfs.same_mount("/docs/a", "/docs/archive/b"));
    }

    #[test]
    fn mount_points_listed_in_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let user = user_with_mounts(tmp.path());
        let vfs = VirtualFs::for_user(&user, &kms()).unwrap();
        assert_eq!(vfs.mount_points_in("/"), vec!["docs".to_string()]);
        assert_eq!(vfs.mount_points_in("/docs"), vec!["archive".to_string()]);
    }
}
