//! Encrypted filesystem overlay
//!
//! Wraps any backend and encrypts file contents with AES-256-GCM in
//! fixed-size chunks under a key derived from the configured
//! passphrase. Stored objects carry a fixed header plus a 16-byte tag
//! per chunk; all reported sizes are plaintext sizes.

use super::{FileInfo, Fs, FsRead, FsWrite, WriteFlags};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use wharf_common::{Error, Result};

const MAGIC: &[u8; 4] = b"WCF1";
/// magic + version byte + 8-byte file id
const HEADER_SIZE: usize = 13;
/// Plaintext bytes per chunk
const CHUNK_SIZE: usize = 64 * 1024;
/// AES-GCM tag length
const TAG_SIZE: usize = 16;
const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

pub struct CryptFs {
    inner: Arc<dyn Fs>,
    key: [u8; 32],
}

impl CryptFs {
    pub fn new(inner: Arc<dyn Fs>, passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"wharf-cryptfs-v1");
        hasher.update(passphrase.as_bytes());
        let key: [u8; 32] = hasher.finalize().into();
        Self { inner, key }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("cipher init failed: {}", e)))
    }

    /// Plaintext size of a stored object.
    fn plaintext_size(stored: i64) -> i64 {
        if stored <= HEADER_SIZE as i64 {
            return 0;
        }
        let body = stored - HEADER_SIZE as i64;
        let full_chunks = body / SEALED_CHUNK_SIZE as i64;
        let remainder = body % SEALED_CHUNK_SIZE as i64;
        let tail = if remainder > 0 {
            remainder - TAG_SIZE as i64
        } else {
            0
        };
        full_chunks * CHUNK_SIZE as i64 + tail.max(0)
    }

    fn adjust_info(mut info: FileInfo) -> FileInfo {
        if !info.is_dir {
            info.size = Self::plaintext_size(info.size);
        }
        info
    }
}

fn chunk_nonce(file_id: &[u8; 8], index: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(file_id);
    nonce[8..].copy_from_slice(&index.to_be_bytes());
    nonce
}

#[async_trait]
impl Fs for CryptFs {
    fn name(&self) -> &'static str {
        "cryptfs"
    }

    async fn stat(&self, path: &str) -> Result<FileInfo> {
        Ok(Self::adjust_info(self.inner.stat(path).await?))
    }

    async fn list(&self, path: &str) -> Result<Vec<FileInfo>> {
        Ok(self
            .inner
            .list(path)
            .await?
            .into_iter()
            .map(Self::adjust_info)
            .collect())
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn FsRead>> {
        let mut inner = self.inner.open_read(path, 0).await?;
        // Header first; an object without it was not written by this
        // overlay. Backends may return short reads, accumulate.
        let mut header = Vec::with_capacity(HEADER_SIZE);
        while header.len() < HEADER_SIZE {
            let chunk = inner.read_chunk(HEADER_SIZE - header.len()).await?;
            if chunk.is_empty() {
                break;
            }
            header.extend_from_slice(&chunk);
        }
        if header.len() != HEADER_SIZE || &header[..4] != MAGIC {
            inner.close().await?;
            return Err(Error::CryptoIntegrityError(format!(
                "{:?} is not an encrypted file",
                path
            )));
        }
        let mut file_id = [0u8; 8];
        file_id.copy_from_slice(&header[5..13]);
        let mut reader = CryptReader {
            inner,
            cipher: self.cipher()?,
            file_id,
            chunk_index: 0,
            buffered: Vec::new(),
            buffer_pos: 0,
            eof: false,
        };
        // Chunk-aligned seek: decrypt and discard up to the offset.
        let mut to_skip = offset as usize;
        while to_skip > 0 {
            let available = reader.buffered.len() - reader.buffer_pos;
            if available > 0 {
                let step = available.min(to_skip);
                reader.buffer_pos += step;
                to_skip -= step;
                continue;
            }
            if !reader.fill().await? {
                break;
            }
        }
        Ok(Box::new(reader))
    }

    async fn open_write(&self, path: &str, flags: WriteFlags) -> Result<Box<dyn FsWrite>> {
        if flags.offset > 0 {
            return Err(Error::OperationUnsupported(
                "resumed uploads are not supported on cryptfs".to_string(),
            ));
        }
        let mut inner = self.inner.open_write(path, flags).await?;
        let mut file_id = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut file_id);
        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.extend_from_slice(MAGIC);
        header.push(1);
        header.extend_from_slice(&file_id);
        inner.write_chunk(&header).await?;
        Ok(Box::new(CryptWriter {
            inner,
            cipher: self.cipher()?,
            file_id,
            chunk_index: 0,
            pending: Vec::with_capacity(CHUNK_SIZE),
        }))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        self.inner.remove_file(path).await
    }

    async fn remove_dir(&self, path: &str) -> Result<()> {
        self.inner.remove_dir(path).await
    }

    async fn rename(&self, source: &str, target: &str) -> Result<()> {
        self.inner.rename(source, target).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        self.inner.mkdir(path).await
    }

    async fn walk(&self, path: &str) -> Result<Vec<(String, FileInfo)>> {
        Ok(self
            .inner
            .walk(path)
            .await?
            .into_iter()
            .map(|(p, info)| (p, Self::adjust_info(info)))
            .collect())
    }

    async fn available_space(&self, path: &str) -> Result<Option<u64>> {
        self.inner.available_space(path).await
    }
}

struct CryptReader {
    inner: Box<dyn FsRead>,
    cipher: Aes256Gcm,
    file_id: [u8; 8],
    chunk_index: u32,
    buffered: Vec<u8>,
    buffer_pos: usize,
    eof: bool,
}

impl CryptReader {
    /// Pull and decrypt the next sealed chunk; false at end of file.
    async fn fill(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        // The inner reader may return short reads; accumulate a full
        // sealed chunk or the final partial one.
        let mut sealed = Vec::with_capacity(SEALED_CHUNK_SIZE);
        while sealed.len() < SEALED_CHUNK_SIZE {
            let chunk = self
                .inner
                .read_chunk(SEALED_CHUNK_SIZE - sealed.len())
                .await?;
            if chunk.is_empty() {
                self.eof = true;
                break;
            }
            sealed.extend_from_slice(&chunk);
        }
        if sealed.is_empty() {
            return Ok(false);
        }
        if sealed.len() <= TAG_SIZE {
            return Err(Error::CryptoIntegrityError(
                "truncated encrypted chunk".to_string(),
            ));
        }
        let nonce = chunk_nonce(&self.file_id, self.chunk_index);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &[],
                },
            )
            .map_err(|_| {
                Error::CryptoIntegrityError("chunk authentication failed".to_string())
            })?;
        self.chunk_index += 1;
        self.buffered = plaintext;
        self.buffer_pos = 0;
        Ok(true)
    }
}

#[async_trait]
impl FsRead for CryptReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.buffer_pos >= self.buffered.len() && !self.fill().await? {
            return Ok(Bytes::new());
        }
        let end = (self.buffer_pos + max).min(self.buffered.len());
        let out = Bytes::copy_from_slice(&self.buffered[self.buffer_pos..end]);
        self.buffer_pos = end;
        Ok(out)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

struct CryptWriter {
    inner: Box<dyn FsWrite>,
    cipher: Aes256Gcm,
    file_id: [u8; 8],
    chunk_index: u32,
    pending: Vec<u8>,
}

impl CryptWriter {
    async fn seal_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let nonce = chunk_nonce(&self.file_id, self.chunk_index);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &self.pending,
                    aad: &[],
                },
            )
            .map_err(|e| Error::Internal(format!("chunk encryption failed: {}", e)))?;
        self.inner.write_chunk(&sealed).await?;
        self.chunk_index += 1;
        self.pending.clear();
        Ok(())
    }
}

#[async_trait]
impl FsWrite for CryptWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let mut rest = chunk;
        while !rest.is_empty() {
            let room = CHUNK_SIZE - self.pending.len();
            let take = room.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == CHUNK_SIZE {
                self.seal_pending().await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.seal_pending().await?;
        self.inner.close().await
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::fsconfig::LocalFsConfig;
    use crate::vfs::local::LocalFs;

    fn crypt(root: &std::path::Path) -> CryptFs {
        let inner = Arc::new(
            LocalFs::new(&root.to_string_lossy(), LocalFsConfig::default()).unwrap(),
        );
        CryptFs::new(inner, "correct horse battery staple")
    }

    #[tokio::test]
    async fn roundtrip_small_file() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = crypt(tmp.path());
        let mut writer = fs.open_write("/a.bin", WriteFlags::default()).await.unwrap();
        writer.write_chunk(b"attack at dawn").await.unwrap();
        writer.close().await.unwrap();

        // Ciphertext on disk differs from the plaintext
        let raw = std::fs::read(tmp.path().join("a.bin")).unwrap();
        assert_eq!(&raw[..4], MAGIC);
        assert!(!raw.windows(6).any(|w| w == b"attack"));

        let mut reader = fs.open_read("/a.bin", 0).await.unwrap();
        let data = reader.read_chunk(1024).await.unwrap();
        assert_eq!(&data[..], b"attack at dawn");
    }

    #[tokio::test]
    async fn stat_reports_plaintext_size() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = crypt(tmp.path());
        let payload = vec![7u8; CHUNK_SIZE + 123];
        let mut writer = fs.open_write("/b.bin", WriteFlags::default()).await.unwrap();
        writer.write_chunk(&payload).await.unwrap();
        writer.close().await.unwrap();

        let info = fs.stat("/b.bin").await.unwrap();
        assert_eq!(info.size, payload.len() as i64);
    }

    #[tokio::test]
    async fn offset_read_crosses_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = crypt(tmp.path());
        let payload: Vec<u8> = (0..(CHUNK_SIZE * 2 + 50)).map(|i| (i % 251) as u8).collect();
        let mut writer = fs.open_write("/c.bin", WriteFlags::default()).await.unwrap();
        writer.write_chunk(&payload).await.unwrap();
        writer.close().await.unwrap();

        let offset = CHUNK_SIZE + 17;
        let mut reader = fs.open_read("/c.bin", offset as u64).await.unwrap();
        let mut collected = Vec::new();
        loop {
            let chunk = reader.read_chunk(8192).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, &payload[offset..]);
    }

    #[tokio::test]
    async fn wrong_passphrase_fails_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let fs = crypt(tmp.path());
        let mut writer = fs.open_write("/d.bin", WriteFlags::default()).await.unwrap();
        writer.write_chunk(b"sensitive").await.unwrap();
        writer.close().await.unwrap();

        let inner = Arc::new(
            LocalFs::new(&tmp.path().to_string_lossy(), LocalFsConfig::default()).unwrap(),
        );
        let wrong = CryptFs::new(inner, "wrong passphrase");
        let mut reader = wrong.open_read("/d.bin", 0).await.unwrap();
        let err = reader.read_chunk(1024).await.unwrap_err();
        assert_eq!(err.kind(), "crypto_integrity");
    }

    #[test]
    fn plaintext_size_formula() {
        assert_eq!(CryptFs::plaintext_size(0), 0);
        assert_eq!(CryptFs::plaintext_size(HEADER_SIZE as i64), 0);
        // one 10-byte chunk
        assert_eq!(
            CryptFs::plaintext_size((HEADER_SIZE + 10 + TAG_SIZE) as i64),
            10
        );
        // one full chunk plus a 1-byte tail
        assert_eq!(
            CryptFs::plaintext_size(
                (HEADER_SIZE + SEALED_CHUNK_SIZE + 1 + TAG_SIZE) as i64
            ),
            (CHUNK_SIZE + 1) as i64
        );
    }
}
