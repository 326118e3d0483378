//! Connection and transfer registry
//!
//! Process-wide table of live protocol sessions and their open
//! transfers. Admission enforces the global cap, the per-user session
//! cap and the optional IP allow-list; closing a connection cancels its
//! transfers and waits for them to drain. A coarse mutex protects
//! membership only; long operations never hold it.

use crate::bandwidth::RateLimiter;
use crate::config::CommonConfig;
use crate::provider::sessions::{ActiveTransfer, TransferType};
use crate::provider::DataProvider;
use crate::util;
use crate::vfs::{FsRead, FsWrite};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wharf_common::{Error, Protocol, Result};

/// Live state of one protocol session.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    pub username: String,
    pub protocol: Protocol,
    pub ip: IpAddr,
    pub connected_at: i64,
    last_activity: AtomicI64,
    token: CancellationToken,
    transfers: Mutex<Vec<Arc<Transfer>>>,
    next_transfer_id: AtomicI64,
}

impl Connection {
    pub fn touch(&self) {
        self.last_activity.store(util::now_ms(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    fn active_transfers(&self) -> Vec<Arc<Transfer>> {
        self.transfers.lock().unwrap().clone()
    }
}

/// One open upload or download inside a connection.
#[derive(Debug)]
pub struct Transfer {
    pub id: i64,
    pub connection_id: String,
    pub username: String,
    pub transfer_type: TransferType,
    pub virtual_path: String,
    pub folder_name: String,
    pub started_at: i64,
    pub truncated_size: i64,
    ul_bytes: AtomicI64,
    dl_bytes: AtomicI64,
    limiter: RateLimiter,
    token: CancellationToken,
}

impl Transfer {
    pub fn bytes_sent(&self) -> i64 {
        self.dl_bytes.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> i64 {
        self.ul_bytes.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, rate_kbps: i64) {
        self.limiter.set_rate(rate_kbps);
    }
}

/// Serializable snapshot for the connections API.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connection_id: String,
    pub username: String,
    pub protocol: &'static str,
    pub remote_address: String,
    pub connection_time: i64,
    pub last_activity: i64,
    pub active_transfers: Vec<TransferStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferStatus {
    pub transfer_id: i64,
    pub operation_type: &'static str,
    pub path: String,
    pub start_time: i64,
    pub size: i64,
}

/// The process-wide registry.
pub struct ConnectionManager {
    config: CommonConfig,
    provider: Arc<DataProvider>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    /// IP/CIDR allow-list loaded from the whitelist file; `None`
    /// disables the check.
    whitelist: RwLock<Option<Vec<String>>>,
}

impl ConnectionManager {
    pub fn new(config: CommonConfig, provider: Arc<DataProvider>) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            provider,
            connections: Mutex::new(HashMap::new()),
            whitelist: RwLock::new(None),
        });
        manager.reload_whitelist();
        manager
    }

    /// Re-read the whitelist file; called at startup and on SIGHUP.
    pub fn reload_whitelist(&self) {
        if self.config.whitelist_file.is_empty() {
            return;
        }
        match std::fs::read_to_string(&self.config.whitelist_file) {
            Ok(contents) => {
                let entries: Vec<String> = contents
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                tracing::info!(entries = entries.len(), "loaded connection whitelist");
                *self.whitelist.write().unwrap() = Some(entries);
            }
            Err(e) => {
                tracing::error!(
                    file = %self.config.whitelist_file,
                    "unable to read whitelist: {}", e
                );
            }
        }
    }

    /// Admit a new session. The checks run in order: global cap,
    /// per-principal cap, IP allow-list.
    pub fn add_connection(
        &self,
        username: &str,
        max_sessions: i32,
        protocol: Protocol,
        ip: IpAddr,
    ) -> Result<Arc<Connection>> {
        let mut connections = self.connections.lock().unwrap();
        if self.config.max_total_connections > 0
            && connections.len() >= self.config.max_total_connections
        {
            return Err(Error::TooManySessions(
                "too many open sessions".to_string(),
            ));
        }
        if max_sessions > 0 {
            let current = connections
                .values()
                .filter(|c| c.username == username)
                .count();
            if current >= max_sessions as usize {
                return Err(Error::TooManySessions(format!(
                    "user {:?} has reached the session limit {}",
                    username, max_sessions
                )));
            }
        }
        if let Some(whitelist) = self.whitelist.read().unwrap().as_ref() {
            if !crate::validation::ip_matches_any(ip, whitelist) {
                return Err(Error::PermissionDenied(format!(
                    "connection from {} is not whitelisted",
                    ip
                )));
            }
        }
        let now = util::now_ms();
        let connection = Arc::new(Connection {
            id: format!("{}_{}", protocol.as_str(), uuid::Uuid::new_v4()),
            username: username.to_string(),
            protocol,
            ip,
            connected_at: now,
            last_activity: AtomicI64::new(now),
            token: CancellationToken::new(),
            transfers: Mutex::new(Vec::new()),
            next_transfer_id: AtomicI64::new(1),
        });
        connections.insert(connection.id.clone(), connection.clone());
        tracing::debug!(
            connection = %connection.id,
            user = %username,
            "connection admitted"
        );
        Ok(connection)
    }

    pub fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(connection_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn statuses(&self) -> Vec<ConnectionStatus> {
        let connections: Vec<Arc<Connection>> =
            self.connections.lock().unwrap().values().cloned().collect();
        connections
            .iter()
            .map(|c| ConnectionStatus {
                connection_id: c.id.clone(),
                username: c.username.clone(),
                protocol: c.protocol.as_str(),
                remote_address: c.ip.to_string(),
                connection_time: c.connected_at,
                last_activity: c.last_activity(),
                active_transfers: c
                    .active_transfers()
                    .iter()
                    .map(|t| TransferStatus {
                        transfer_id: t.id,
                        operation_type: match t.transfer_type {
                            TransferType::Upload => "upload",
                            TransferType::Download => "download",
                        },
                        path: t.virtual_path.clone(),
                        start_time: t.started_at,
                        size: t.bytes_received() + t.bytes_sent(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Cancel a connection, wait up to `close_timeout` for its
    /// transfers to drain, then drop it from the registry.
    pub async fn close_connection(&self, connection_id: &str) -> Result<()> {
        let connection = self
            .get(connection_id)
            .ok_or_else(|| Error::NotFound(format!("connection {:?}", connection_id)))?;
        connection.token.cancel();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.close_timeout_secs);
        loop {
            let open = connection.transfers.lock().unwrap().len();
            if open == 0 || tokio::time::Instant::now() >= deadline {
                if open > 0 {
                    tracing::warn!(
                        connection = %connection_id,
                        transfers = open,
                        "close timeout reached with transfers still open"
                    );
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        // Rows of transfers that never settled are removed here.
        for transfer in connection.active_transfers() {
            let _ = crate::provider::sessions::remove_active_transfer(
                self.provider.pool(),
                connection_id,
                transfer.id,
            )
            .await;
        }
        self.connections.lock().unwrap().remove(connection_id);
        tracing::debug!(connection = %connection_id, "connection closed");
        Ok(())
    }

    /// Cancel and drain every connection, used by graceful shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.connections.lock().unwrap().keys().cloned().collect();
        for id in ids {
            let _ = self.close_connection(&id).await;
        }
    }

    /// Open a transfer on a connection: persists the row and returns
    /// the handle wrapping reads/writes with shaping and accounting.
    pub async fn open_transfer(
        &self,
        connection: &Arc<Connection>,
        transfer_type: TransferType,
        virtual_path: &str,
        folder_name: &str,
        rate_kbps: i64,
        truncated_size: i64,
    ) -> Result<Arc<Transfer>> {
        if connection.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let id = connection.next_transfer_id.fetch_add(1, Ordering::Relaxed);
        let transfer = Arc::new(Transfer {
            id,
            connection_id: connection.id.clone(),
            username: connection.username.clone(),
            transfer_type,
            virtual_path: virtual_path.to_string(),
            folder_name: folder_name.to_string(),
            started_at: util::now_ms(),
            truncated_size,
            ul_bytes: AtomicI64::new(0),
            dl_bytes: AtomicI64::new(0),
            limiter: RateLimiter::new(rate_kbps),
            token: connection.token.child_token(),
        });
        crate::provider::sessions::add_active_transfer(
            self.provider.pool(),
            &ActiveTransfer {
                id: 0,
                connection_id: connection.id.clone(),
                transfer_id: id,
                transfer_type,
                username: connection.username.clone(),
                folder_name: folder_name.to_string(),
                ip: connection.ip.to_string(),
                truncated_size,
                current_ul_size: 0,
                current_dl_size: 0,
                created_at: 0,
                updated_at: 0,
            },
        )
        .await?;
        connection
            .transfers
            .lock()
            .unwrap()
            .push(transfer.clone());
        connection.touch();
        Ok(transfer)
    }

    /// Remove a finished transfer and settle its persisted row.
    pub async fn close_transfer(
        &self,
        connection: &Arc<Connection>,
        transfer: &Arc<Transfer>,
    ) -> Result<()> {
        connection
            .transfers
            .lock()
            .unwrap()
            .retain(|t| t.id != transfer.id);
        crate::provider::sessions::remove_active_transfer(
            self.provider.pool(),
            &transfer.connection_id,
            transfer.id,
        )
        .await?;
        connection.touch();
        Ok(())
    }

    /// Periodic maintenance: close idle connections and refresh the
    /// persisted byte counters of running transfers.
    pub async fn run_maintenance(self: Arc<Self>, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.transfer_update_interval_secs.max(1));
        let idle_limit = Duration::from_secs(self.config.idle_timeout_mins * 60);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            let connections: Vec<Arc<Connection>> =
                self.connections.lock().unwrap().values().cloned().collect();
            let now = util::now_ms();
            for connection in connections {
                if self.config.idle_timeout_mins > 0
                    && now - connection.last_activity() > idle_limit.as_millis() as i64
                {
                    tracing::info!(
                        connection = %connection.id,
                        user = %connection.username,
                        "closing idle connection"
                    );
                    let _ = self.close_connection(&connection.id).await;
                    continue;
                }
                for transfer in connection.active_transfers() {
                    let _ = crate::provider::sessions::update_active_transfer_sizes(
                        self.provider.pool(),
                        &transfer.connection_id,
                        transfer.id,
                        transfer.bytes_received(),
                        transfer.bytes_sent(),
                    )
                    .await;
                }
            }
            // Rows from dead nodes age out after a grace period.
            let grace = (interval.as_millis() as i64) * 6;
            let _ = crate::provider::sessions::cleanup_active_transfers(
                self.provider.pool(),
                now - grace,
            )
            .await;
            // One-shot codes expire after minutes; a day-old row is
            // garbage whatever its type.
            let _ = crate::provider::sessions::cleanup_shared_sessions(
                self.provider.pool(),
                now - 24 * 3600 * 1000,
            )
            .await;
        }
    }
}

/// Reader wrapper: cancellation check, token-bucket wait and byte
/// accounting on every chunk boundary.
pub struct TransferReader {
    inner: Box<dyn FsRead>,
    transfer: Arc<Transfer>,
}

impl TransferReader {
    pub fn new(inner: Box<dyn FsRead>, transfer: Arc<Transfer>) -> Self {
        Self { inner, transfer }
    }
}

#[async_trait]
impl FsRead for TransferReader {
    async fn read_chunk(&mut self, max: usize) -> Result<Bytes> {
        if self.transfer.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let chunk = tokio::select! {
            _ = self.transfer.token.cancelled() => return Err(Error::Cancelled),
            chunk = self.inner.read_chunk(max) => chunk?,
        };
        if !chunk.is_empty() {
            self.transfer.limiter.consume(chunk.len()).await;
            self.transfer
                .dl_bytes
                .fetch_add(chunk.len() as i64, Ordering::Relaxed);
        }
        Ok(chunk)
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }
}

/// Writer wrapper, mirror of [`TransferReader`], shaping and counting
/// received bytes.
pub struct TransferWriter {
    inner: Box<dyn FsWrite>,
    transfer: Arc<Transfer>,
}

impl TransferWriter {
    pub fn new(inner: Box<dyn FsWrite>, transfer: Arc<Transfer>) -> Self {
        Self { inner, transfer }
    }
}

#[async_trait]
impl FsWrite for TransferWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        if self.transfer.token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.transfer.limiter.consume(chunk.len()).await;
        tokio::select! {
            _ = self.transfer.token.cancelled() => Err(Error::Cancelled),
            res = self.inner.write_chunk(chunk) => res,
        }?;
        self.transfer
            .ul_bytes
            .fetch_add(chunk.len() as i64, Ordering::Relaxed);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.close().await
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner.abort().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataProviderConfig;
    use crate::kms::{KmsConfig, SecretBox};

    async fn manager(max_total: usize) -> Arc<ConnectionManager> {
        let pool = crate::db::open_test_pool().await;
        let kms = Arc::new(SecretBox::new(&KmsConfig::default()).unwrap());
        let provider = Arc::new(DataProvider::new(
            pool,
            kms,
            DataProviderConfig::default(),
        ));
        let config = CommonConfig {
            max_total_connections: max_total,
            close_timeout_secs: 1,
            ..Default::default()
        };
        ConnectionManager::new(config, provider)
    }

    fn ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn per_user_session_cap() {
        let manager = manager(0).await;
        let first = manager
            .add_connection("alice", 1, Protocol::Http, ip())
            .unwrap();
        let err = manager
            .add_connection("alice", 1, Protocol::Http, ip())
            .unwrap_err();
        assert_eq!(err.kind(), "too_many_sessions");
        // Another user is unaffected
        manager
            .add_connection("bob", 1, Protocol::Http, ip())
            .unwrap();
        manager.close_connection(&first.id).await.unwrap();
        manager
            .add_connection("alice", 1, Protocol::Http, ip())
            .unwrap();
    }

    #[tokio::test]
    async fn global_cap() {
        let manager = manager(2).await;
        manager
            .add_connection("a", 0, Protocol::Ssh, ip())
            .unwrap();
        manager
            .add_connection("b", 0, Protocol::Ftp, ip())
            .unwrap();
        let err = manager
            .add_connection("c", 0, Protocol::Http, ip())
            .unwrap_err();
        assert_eq!(err.kind(), "too_many_sessions");
    }

    async fn manager_with_whitelist(max_total: usize, entries: &str) -> Arc<ConnectionManager> {
        let pool = crate::db::open_test_pool().await;
        let kms = Arc::new(SecretBox::new(&KmsConfig::default()).unwrap());
        let provider = Arc::new(DataProvider::new(
            pool,
            kms,
            DataProviderConfig::default(),
        ));
        let dir = tempfile::tempdir().unwrap();
        let whitelist = dir.path().join("whitelist.txt");
        std::fs::write(&whitelist, entries).unwrap();
        let config = CommonConfig {
            max_total_connections: max_total,
            close_timeout_secs: 1,
            whitelist_file: whitelist.to_string_lossy().to_string(),
            ..Default::default()
        };
        let manager = ConnectionManager::new(config, provider);
        // Keep the file alive for reloads during the test
        std::mem::forget(dir);
        manager
    }

    #[tokio::test]
    async fn admission_checks_caps_before_whitelist() {
        let manager = manager_with_whitelist(1, "10.0.0.0/8\n").await;
        manager
            .add_connection("a", 0, Protocol::Http, "10.0.0.1".parse().unwrap())
            .unwrap();
        // Both the global cap and the whitelist reject this source; the
        // cap is checked first.
        let err = manager
            .add_connection("b", 0, Protocol::Http, "192.168.1.1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), "too_many_sessions");
    }

    #[tokio::test]
    async fn whitelist_rejects_unlisted_sources() {
        let manager = manager_with_whitelist(0, "10.0.0.0/8\n# comment\n").await;
        manager
            .add_connection("a", 0, Protocol::Http, "10.1.2.3".parse().unwrap())
            .unwrap();
        let err = manager
            .add_connection("b", 0, Protocol::Http, "192.168.1.1".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), "permission_denied");
    }

    #[tokio::test]
    async fn close_cancels_transfers() {
        let manager = manager(0).await;
        let connection = manager
            .add_connection("alice", 0, Protocol::Http, ip())
            .unwrap();
        let transfer = manager
            .open_transfer(
                &connection,
                TransferType::Download,
                "/f.txt",
                "",
                0,
                0,
            )
            .await
            .unwrap();
        assert!(!connection.is_cancelled());
        let manager_bg = manager.clone();
        let id = connection.id.clone();
        let closer = tokio::spawn(async move { manager_bg.close_connection(&id).await });
        // The transfer observes cancellation and detaches
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connection.is_cancelled());
        manager.close_transfer(&connection, &transfer).await.unwrap();
        closer.await.unwrap().unwrap();
        assert!(manager.get(&connection.id).is_none());
    }

    #[tokio::test]
    async fn transfer_counters_accumulate() {
        let manager = manager(0).await;
        let connection = manager
            .add_connection("alice", 0, Protocol::Http, ip())
            .unwrap();
        let transfer = manager
            .open_transfer(&connection, TransferType::Upload, "/up.bin", "", 0, 0)
            .await
            .unwrap();

        struct NullSink;
        #[async_trait]
        impl crate::vfs::FsWrite for NullSink {
            async fn write_chunk(&mut self, _chunk: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
            async fn abort(&mut self) -> Result<()> {
                Ok(())
            }
        }

        let mut writer = TransferWriter::new(Box::new(NullSink), transfer.clone());
        writer.write_chunk(&[0u8; 1000]).await.unwrap();
        writer.write_chunk(&[0u8; 500]).await.unwrap();
        crate::vfs::FsWrite::close(&mut writer).await.unwrap();
        assert_eq!(transfer.bytes_received(), 1500);
        assert_eq!(transfer.bytes_sent(), 0);
        manager.close_transfer(&connection, &transfer).await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_transfer_rejects_io() {
        let manager = manager(0).await;
        let connection = manager
            .add_connection("alice", 0, Protocol::Http, ip())
            .unwrap();
        let transfer = manager
            .open_transfer(&connection, TransferType::Upload, "/up.bin", "", 0, 0)
            .await
            .unwrap();
        connection.cancellation_token().cancel();

        struct NullSink;
        #[async_trait]
        impl crate::vfs::FsWrite for NullSink {
            async fn write_chunk(&mut self, _chunk: &[u8]) -> Result<()> {
                Ok(())
            }
            async fn close(&mut self) -> Result<()> {
                Ok(())
            }
            async fn abort(&mut self) -> Result<()> {
                Ok(())
            }
        }
        let mut writer = TransferWriter::new(Box::new(NullSink), transfer.clone());
        let err = writer.write_chunk(&[0u8; 10]).await.unwrap_err();
        assert_eq!(err.kind(), "cancelled");
    }
}
