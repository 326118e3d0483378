//! SFTP sub-account backend
//!
//! Proxies a user's tree onto a remote SFTP account. The ssh2 session is
//! blocking, so every operation hops through `spawn_blocking`; one
//! session is kept per backend instance and re-established on error.

use super::{FileInfo, Fs, FsRead, FsWrite, WriteFlags};
use crate::kms::SecretBox;
use crate::provider::fsconfig::SftpFsConfig;
use crate::util;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use wharf_common::{Error, Result};

/// Decrypted connection credentials.
struct Credentials {
    password: Option<String>,
    private_key: Option<String>,
    key_passphrase: Option<String>,
}

pub struct SftpFs {
    config: SftpFsConfig,
    credentials: Arc<Credentials>,
    sftp: Arc<Mutex<Option<ssh2::Sftp>>>,
}

impl SftpFs {
    pub fn new(config: SftpFsConfig, kms: Arc<SecretBox>, aad: &str) -> Result<Self> {
        let credentials = Credentials {
            password: if config.password.is_empty() {
                None
            } else {
                Some(kms.decrypt(&config.password, aad)?)
            },
            private_key: if config.private_key.is_empty() {
                None
            } else {
                Some(kms.decrypt(&config.private_key, aad)?)
            },
            key_passphrase: if config.key_passphrase.is_empty() {
                None
            } else {
                Some(kms.decrypt(&config.key_passphrase, aad)?)
            },
        };
        Ok(Self {
            config,
            credentials: Arc::new(credentials),
            sftp: Arc::new(Mutex::new(None)),
        })
    }

    /// The protocol allows two concurrent readers on one file unless
    /// this backend disables it.
    pub fn concurrent_reads_disabled(&self) -> bool {
        self.config.disable_concurrent_reads
    }

    fn remote_path(&self, path: &str) -> PathBuf {
        let cleaned = util::clean_path(path);
        if self.config.prefix.is_empty() {
            PathBuf::from(cleaned)
        } else {
            Path::new(&self.config.prefix).join(cleaned.trim_start_matches('/'))
        }
    }

    fn connect(config: &SftpFsConfig, credentials: &Credentials) -> Result<ssh2::Sftp> {
        let stream = TcpStream::connect(&config.endpoint)
            .map_err(|e| Error::ProviderUnavailable(format!("sftp connect failed: {}", e)))?;
        let mut session = ssh2::Session::new()
            .map_err(|e| Error::Internal(format!("ssh session init failed: {}", e)))?;
        session.set_tcp_stream(stream);
        session
            .handshake()
            .map_err(|e| Error::ProviderUnavailable(format!("ssh handshake failed: {}", e)))?;
        if !config.fingerprints.is_empty() {
            let fingerprint = session
                .host_key_hash(ssh2::HashType::Sha256)
                .map(hex::encode)
                .unwrap_or_default();
            if !config
                .fingerprints
                .iter()
                .any(|f| f.eq_ignore_ascii_case(&fingerprint))
            {
                return Err(Error::Unauthorized(format!(
                    "sftp host key {:?} does not match any configured fingerprint",
                    fingerprint
                )));
            }
        }
        if let Some(key) = &credentials.private_key {
            session
                .userauth_pubkey_memory(
                    &config.username,
                    None,
                    key,
                    credentials.key_passphrase.as_deref(),
                )
                .map_err(|e| Error::Unauthorized(format!("sftp key auth failed: {}", e)))?;
        } else if let Some(password) = &credentials.password {
            session
                .userauth_password(&config.username, password)
                .map_err(|e| Error::Unauthorized(format!("sftp password auth failed: {}", e)))?;
        }
        if !session.authenticated() {
            return Err(Error::Unauthorized(
                "sftp authentication failed".to_string(),
            ));
        }
        session
            .sftp()
            .map_err(|e| Error::Internal(format!("sftp subsystem failed: {}", e)))
    }

    /// Run `f` against the cached session, reconnecting once on error.
    async fn with_sftp<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&ssh2::Sftp) -> Result<T> + Send + Sync + 'static,
    {
        let config = self.config.clone();
        let credentials = self.credentials.clone();
        let slot = self.sftp.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = slot.lock().unwrap();
            if guard.is_none() {
                *guard = Some(Self::connect(&config, &credentials)?);
            }
            let sftp = guard.as_ref().unwrap();
            match f(sftp) {
                Ok(value) => Ok(value),
                Err(e) if e.is_transient() => {
                    // Drop the broken session and retry once fresh.
                    *guard = Some(Self::connect(&config, &credentials)?);
                    f(guard.as_ref().unwrap())
                }
                Err(e) => Err(e),
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("sftp task failed: {}", e)))?
    }
}

fn map_ssh_err(e: ssh2::Error, context: &str) -> Error {
    match e.code() {
        ssh2::ErrorCode::SFTP(2) => Error::NotFound(context.to_string()),
        ssh2::ErrorCode::SFTP(3) => Error::PermissionDenied(context.to_string()),
        ssh2::ErrorCode::SFTP(8) => Error::OperationUnsupported(context.to_string()),
        _ => Error::Internal(format!("{}: {}", context, e)),
    }
}

fn info_from_stat(name: String, stat: &ssh2::FileStat) -> FileInfo {
    FileInfo {
        name,
        size: stat.size.unwrap_or(0) as i64,
        is_dir: stat.is_dir(),
        is_symlink: stat
            .file_type()
            .is_symlink(),
        modified_ms: stat.mtime.map(|t| t as i64 * 1000).unwrap_or(0),
        mode: stat.perm,
    }
}

#[async_trait]
impl Fs for SftpFs {
    fn name(&self) -> &'static str {
        "sftpfs"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        let remote = self.remote_path(path);
        let name = util::base_name(path);
        self.with_sftp(move |sftp| {
            let stat = sftp
                .stat(&remote)
                .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))?;
            Ok(info_from_stat(name.clone(), &stat))
        })
        .await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        let remote = self.remote_path(path);
        self.with_sftp(move |sftp| {
            let entries = sftp
                .readdir(&remote)
                .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))?;
            Ok(entries
                .into_iter()
                .map(|(entry_path, stat)| {
                    let name = entry_path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_default();
                    info_from_stat(name, &stat)
                })
                .collect())
        })
        .await
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn FsRead>> {
        let remote = self.remote_path(path);
        let file = self
            .with_sftp(move |sftp| {
                let mut file = sftp
                    .open(&remote)
                    .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))?;
                if offset > 0 {
                    file.seek(SeekFrom::Start(offset))
                        .map_err(|e| super::classify_io_error(e, "seek"))?;
                }
                Ok(Arc::new(Mutex::new(file)))
            })
            .await?;
        Ok(Box::new(SftpReader { file }))
    }

    async fn open_write(&self, path: &str, flags: WriteFlags) -> Result<Box<dyn FsWrite>> {
        let remote = self.remote_path(path);
        let sftp_slot = self.sftp.clone();
        let file = self
            .with_sftp(move |sftp| {
                use ssh2::OpenFlags;
                let mut open_flags = OpenFlags::WRITE | OpenFlags::CREATE;
                if flags.truncate && flags.offset == 0 {
                    open_flags |= OpenFlags::TRUNCATE;
                }
                let mut file = sftp
                    .open_mode(
                        &remote,
                        open_flags,
                        0o644,
                        ssh2::OpenType::File,
                    )
                    .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))?;
                if flags.offset > 0 {
                    file.seek(SeekFrom::Start(flags.offset))
                        .map_err(|e| super::classify_io_error(e, "seek"))?;
                }
                Ok(Arc::new(Mutex::new(file)))
            })
            .await?;
        let remote = self.remote_path(path);
        Ok(Box::new(SftpWriter {
            file,
            remote,
            sftp: sftp_slot,
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        self.with_sftp(move |sftp| {
            sftp.unlink(&remote)
                .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))
        })
        .await
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        self.with_sftp(move |sftp| {
            sftp.rmdir(&remote)
                .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))
        })
        .await
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        let from = self.remote_path(source);
        let to = self.remote_path(target);
        self.with_sftp(move |sftp| {
            sftp.rename(&from, &to, Some(ssh2::RenameFlags::OVERWRITE))
                .map_err(|e| map_ssh_err(e, &from.to_string_lossy()))
        })
        .await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let remote = self.remote_path(path);
        self.with_sftp(move |sftp| {
            sftp.mkdir(&remote, 0o755)
                .map_err(|e| map_ssh_err(e, &remote.to_string_lossy()))
        })
        .await
    }

    async fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let target = self.remote_path(target);
        let link = self.remote_path(link);
        self.with_sftp(move |sftp| {
            sftp.symlink(&target, &link)
                .map_err(|e| map_ssh_err(e, &link.to_string_lossy()))
        })
        .await
    }

    async fn walk(&self, path: &str) -> Result<Vec<(String, FileInfo)>> {
        // Breadth-first over readdir; remote trees can be large but the
        // walk is only used by retention and quota scans.
        let mut result = Vec::new();
        let mut queue = vec![util::clean_path(path)];
        while let Some(dir) = queue.pop() {
            for info in self.list(&dir).await? {
                let child = util::join_path(&dir, &info.name);
                if info.is_dir {
                    queue.push(child.clone());
                }
                result.push((child, info));
            }
        }
        Ok(result)
    }
}

struct SftpReader {
    file: Arc<Mutex<ssh2::File>>,
}

#[async_trait]
impl FsRead for SftpReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = file.lock().unwrap();
            let mut buf = vec![0u8; max];
            let n = guard
                .read(&mut buf)
                .map_err(|e| super::classify_io_error(e, "sftp read"))?;
            buf.truncate(n);
            Ok(Bytes::from(buf))
        })
        .await
        .map_err(|e| Error::Internal(format!("sftp read task failed: {}", e)))?
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

struct SftpWriter {
    file: Arc<Mutex<ssh2::File>>,
    remote: PathBuf,
    sftp: Arc<Mutex<Option<ssh2::Sftp>>>,
}

#[async_trait]
impl FsWrite for SftpWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self.file.clone();
        let chunk = chunk.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = file.lock().unwrap();
            guard
                .write_all(&chunk)
                .map_err(|e| super::classify_io_error(e, "sftp write"))
        })
        .await
        .map_err(|e| Error::Internal(format!("sftp write task failed: {}", e)))?
    }

    async fn close(&mut self) -> Result<()> {
        let file = self.file.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = file.lock().unwrap();
            guard
                .flush()
                .map_err(|e| super::classify_io_error(e, "sftp flush"))
        })
        .await
        .map_err(|e| Error::Internal(format!("sftp close task failed: {}", e)))?
    }

    async fn abort(&mut self) -> Result<()> {
        // Remote writes land in place; best effort removal of the
        // partial file.
        let remote = self.remote.clone();
        let slot = self.sftp.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(sftp) = slot.lock().unwrap().as_ref() {
                let _ = sftp.unlink(&remote);
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::Internal(format!("sftp abort task failed: {}", e)))?
    }
}
