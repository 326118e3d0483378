//! Brute-force defender
//!
//! Scores failed authentications per source address inside a sliding
//! observation window and bans offenders that cross the threshold. The
//! memory driver is purely in-process; the provider driver coordinates
//! bans across nodes through the defender tables.

use crate::config::DefenderConfig;
use crate::util;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use wharf_common::{Error, Result};

/// Event weights fed by the authentication paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefenderEventKind {
    /// Wrong password for an existing account.
    InvalidPassword,
    /// Login attempt for a non-existing account.
    InvalidUser,
    /// Activity from a host that is already at the limit.
    LimitExceeded,
}

/// Snapshot of one scored host.
#[derive(Debug, Clone, Serialize)]
pub struct DefenderHost {
    /// Stable identifier: the hex-encoded address.
    pub id: String,
    pub ip: String,
    pub score: i32,
    /// Millisecond timestamp; 0 when not banned.
    pub ban_time: i64,
}

impl DefenderHost {
    fn new(ip: &str, score: i32, ban_time: i64) -> Self {
        Self {
            id: hex::encode(ip.as_bytes()),
            ip: ip.to_string(),
            score,
            ban_time,
        }
    }
}

/// Decode a host id back to the address string.
pub fn decode_host_id(id: &str) -> Result<String> {
    let raw = hex::decode(id)
        .map_err(|_| Error::Validation(format!("invalid host id {:?}", id)))?;
    String::from_utf8(raw).map_err(|_| Error::Validation(format!("invalid host id {:?}", id)))
}

struct MemoryHost {
    /// (timestamp ms, weight) pairs inside the window.
    events: Vec<(i64, i32)>,
    banned_until: i64,
}

/// One lock covers both the event log and the ban map.
struct MemoryDriver {
    hosts: Mutex<HashMap<String, MemoryHost>>,
}

enum Driver {
    Memory(MemoryDriver),
    Provider(SqlitePool),
}

pub struct Defender {
    config: DefenderConfig,
    driver: Driver,
}

impl Defender {
    pub fn new_memory(config: DefenderConfig) -> Self {
        Self {
            config,
            driver: Driver::Memory(MemoryDriver {
                hosts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn new_provider(config: DefenderConfig, pool: SqlitePool) -> Self {
        Self {
            config,
            driver: Driver::Provider(pool),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn weight_of(&self, kind: DefenderEventKind) -> i32 {
        match kind {
            DefenderEventKind::InvalidPassword => 1,
            DefenderEventKind::InvalidUser => 2,
            DefenderEventKind::LimitExceeded => self.config.score_limit_exceeded,
        }
    }

    fn window_start(&self, now: i64) -> i64 {
        now - self.config.observation_time_mins * 60 * 1000
    }

    fn ban_duration_ms(&self) -> i64 {
        self.config.ban_time_mins * 60 * 1000
    }

    fn ban_increment_ms(&self) -> i64 {
        self.ban_duration_ms() * self.config.ban_time_increment / 100
    }

    /// Record a failed authentication. Returns `true` when the event
    /// produced or extended a ban.
    pub async fn add_event(&self, ip: IpAddr, kind: DefenderEventKind) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }
        let now = util::now_ms();
        let weight = self.weight_of(kind);
        match &self.driver {
            Driver::Memory(memory) => Ok(self.add_event_memory(memory, ip, weight, now)),
            Driver::Provider(pool) => self.add_event_provider(pool, ip, weight, now).await,
        }
    }

    fn add_event_memory(&self, memory: &MemoryDriver, ip: IpAddr, weight: i32, now: i64) -> bool {
        let mut hosts = memory.hosts.lock().unwrap();
        let host = hosts.entry(ip.to_string()).or_insert(MemoryHost {
            events: Vec::new(),
            banned_until: 0,
        });
        if host.banned_until > now {
            // Repeat offense while banned extends the ban.
            host.banned_until += self.ban_increment_ms();
            return true;
        }
        host.events.push((now, weight));
        let window_start = self.window_start(now);
        host.events.retain(|(ts, _)| *ts >= window_start);
        let score: i32 = host.events.iter().map(|(_, w)| *w).sum();
        if score >= self.config.threshold {
            host.banned_until = host.banned_until.max(now + self.ban_duration_ms());
            host.events.clear();
            true
        } else {
            false
        }
    }

    async fn add_event_provider(
        &self,
        pool: &SqlitePool,
        ip: IpAddr,
        weight: i32,
        now: i64,
    ) -> Result<bool> {
        let ip = ip.to_string();
        let mut tx = pool.begin().await.map_err(db_err)?;
        let row = sqlx::query("SELECT id, ban_time FROM defender_hosts WHERE ip = ?")
            .bind(&ip)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let (host_id, ban_time) = match row {
            Some(row) => (row.get::<i64, _>("id"), row.get::<i64, _>("ban_time")),
            None => {
                let res = sqlx::query(
                    "INSERT INTO defender_hosts (ip, ban_time, updated_at) VALUES (?, 0, ?)",
                )
                .bind(&ip)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                (res.last_insert_rowid(), 0)
            }
        };
        if ban_time > now {
            sqlx::query("UPDATE defender_hosts SET ban_time = ?, updated_at = ? WHERE id = ?")
                .bind(ban_time + self.ban_increment_ms())
                .bind(now)
                .bind(host_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            return Ok(true);
        }
        sqlx::query("INSERT INTO defender_events (date, score, host_id) VALUES (?, ?, ?)")
            .bind(now)
            .bind(weight)
            .bind(host_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let window_start = self.window_start(now);
        sqlx::query("DELETE FROM defender_events WHERE host_id = ? AND date < ?")
            .bind(host_id)
            .bind(window_start)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let score: i32 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(score), 0) FROM defender_events WHERE host_id = ?",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let banned = score >= self.config.threshold;
        if banned {
            sqlx::query("UPDATE defender_hosts SET ban_time = ?, updated_at = ? WHERE id = ?")
                .bind(now + self.ban_duration_ms())
                .bind(now)
                .bind(host_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            sqlx::query("DELETE FROM defender_events WHERE host_id = ?")
                .bind(host_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(banned)
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        if !self.config.enabled {
            return false;
        }
        let now = util::now_ms();
        match &self.driver {
            Driver::Memory(memory) => {
                let hosts = memory.hosts.lock().unwrap();
                hosts
                    .get(&ip.to_string())
                    .map(|h| h.banned_until > now)
                    .unwrap_or(false)
            }
            Driver::Provider(pool) => {
                let ban_time: Option<i64> =
                    sqlx::query_scalar("SELECT ban_time FROM defender_hosts WHERE ip = ?")
                        .bind(ip.to_string())
                        .fetch_optional(pool)
                        .await
                        .ok()
                        .flatten();
                ban_time.map(|t| t > now).unwrap_or(false)
            }
        }
    }

    pub async fn score(&self, ip: IpAddr) -> i32 {
        let now = util::now_ms();
        let window_start = self.window_start(now);
        match &self.driver {
            Driver::Memory(memory) => {
                let hosts = memory.hosts.lock().unwrap();
                hosts
                    .get(&ip.to_string())
                    .map(|h| {
                        h.events
                            .iter()
                            .filter(|(ts, _)| *ts >= window_start)
                            .map(|(_, w)| *w)
                            .sum()
                    })
                    .unwrap_or(0)
            }
            Driver::Provider(pool) => sqlx::query_scalar(
                "SELECT COALESCE(SUM(e.score), 0) FROM defender_events e
                 JOIN defender_hosts h ON h.id = e.host_id WHERE h.ip = ? AND e.date >= ?",
            )
            .bind(ip.to_string())
            .bind(window_start)
            .fetch_one(pool)
            .await
            .unwrap_or(0),
        }
    }

    pub async fn list_hosts(&self) -> Result<Vec<DefenderHost>> {
        let now = util::now_ms();
        let window_start = self.window_start(now);
        match &self.driver {
            Driver::Memory(memory) => {
                let mut hosts = memory.hosts.lock().unwrap();
                // Hosts with no ban and no recent events age out here.
                hosts.retain(|_, h| {
                    h.banned_until > now || h.events.iter().any(|(ts, _)| *ts >= window_start)
                });
                Ok(hosts
                    .iter()
                    .map(|(ip, h)| {
                        let score = h
                            .events
                            .iter()
                            .filter(|(ts, _)| *ts >= window_start)
                            .map(|(_, w)| *w)
                            .sum();
                        let ban = if h.banned_until > now {
                            h.banned_until
                        } else {
                            0
                        };
                        DefenderHost::new(ip, score, ban)
                    })
                    .collect())
            }
            Driver::Provider(pool) => {
                let rows = sqlx::query(
                    "SELECT h.ip, h.ban_time,
                     (SELECT COALESCE(SUM(score), 0) FROM defender_events e
                      WHERE e.host_id = h.id AND e.date >= ?) AS score
                     FROM defender_hosts h",
                )
                .bind(window_start)
                .fetch_all(pool)
                .await
                .map_err(db_err)?;
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let ban_time: i64 = row.get("ban_time");
                        let score: i32 = row.get("score");
                        if ban_time <= now && score == 0 {
                            return None;
                        }
                        Some(DefenderHost::new(
                            &row.get::<String, _>("ip"),
                            score,
                            if ban_time > now { ban_time } else { 0 },
                        ))
                    })
                    .collect())
            }
        }
    }

    pub async fn get_host(&self, ip: &str) -> Result<DefenderHost> {
        let hosts = self.list_hosts().await?;
        hosts
            .into_iter()
            .find(|h| h.ip == ip)
            .ok_or_else(|| Error::NotFound(format!("host {:?}", ip)))
    }

    /// Operator unban: clears the score log and the ban.
    pub async fn delete_host(&self, ip: &str) -> Result<()> {
        match &self.driver {
            Driver::Memory(memory) => {
                let removed = memory.hosts.lock().unwrap().remove(ip).is_some();
                if removed {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("host {:?}", ip)))
                }
            }
            Driver::Provider(pool) => {
                let res = sqlx::query("DELETE FROM defender_hosts WHERE ip = ?")
                    .bind(ip)
                    .execute(pool)
                    .await
                    .map_err(db_err)?;
                if res.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("host {:?}", ip)));
                }
                Ok(())
            }
        }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::ProviderUnavailable(format!("defender store error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: i32) -> DefenderConfig {
        DefenderConfig {
            enabled: true,
            driver: "memory".to_string(),
            threshold,
            score_limit_exceeded: 2,
            observation_time_mins: 30,
            ban_time_mins: 30,
            ban_time_increment: 50,
        }
    }

    fn ip() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn ban_at_threshold() {
        let defender = Defender::new_memory(config(3));
        assert!(!defender.add_event(ip(), DefenderEventKind::InvalidPassword).await.unwrap());
        assert!(!defender.add_event(ip(), DefenderEventKind::InvalidPassword).await.unwrap());
        assert_eq!(defender.score(ip()).await, 2);
        assert!(!defender.is_banned(ip()).await);
        assert!(defender.add_event(ip(), DefenderEventKind::InvalidPassword).await.unwrap());
        assert!(defender.is_banned(ip()).await);
        // Score log cleared on ban
        assert_eq!(defender.score(ip()).await, 0);
    }

    #[tokio::test]
    async fn events_while_banned_extend() {
        let defender = Defender::new_memory(config(1));
        defender
            .add_event(ip(), DefenderEventKind::InvalidPassword)
            .await
            .unwrap();
        let before = defender.get_host(&ip().to_string()).await.unwrap().ban_time;
        defender
            .add_event(ip(), DefenderEventKind::LimitExceeded)
            .await
            .unwrap();
        let after = defender.get_host(&ip().to_string()).await.unwrap().ban_time;
        assert!(after > before);
    }

    #[tokio::test]
    async fn delete_host_unbans() {
        let defender = Defender::new_memory(config(1));
        defender
            .add_event(ip(), DefenderEventKind::InvalidPassword)
            .await
            .unwrap();
        assert!(defender.is_banned(ip()).await);
        defender.delete_host(&ip().to_string()).await.unwrap();
        assert!(!defender.is_banned(ip()).await);
    }

    #[tokio::test]
    async fn disabled_defender_never_bans() {
        let mut cfg = config(1);
        cfg.enabled = false;
        let defender = Defender::new_memory(cfg);
        assert!(!defender.add_event(ip(), DefenderEventKind::InvalidUser).await.unwrap());
        assert!(!defender.is_banned(ip()).await);
    }

    #[tokio::test]
    async fn provider_driver_bans_and_lists() {
        let pool = crate::db::open_test_pool().await;
        let defender = Defender::new_provider(config(2), pool);
        assert!(!defender.add_event(ip(), DefenderEventKind::InvalidPassword).await.unwrap());
        assert!(defender.add_event(ip(), DefenderEventKind::InvalidPassword).await.unwrap());
        assert!(defender.is_banned(ip()).await);
        let hosts = defender.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].ip, ip().to_string());
        assert!(hosts[0].ban_time > 0);
        assert_eq!(decode_host_id(&hosts[0].id).unwrap(), ip().to_string());
    }
}
