use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{StreamExt, stream};

use crate::error::{GuardError, GuardResult};
use crate::models::session::{BackupStats, RestoreStats, SessionRecord, SessionState, compute_checksum};
use crate::ports::SessionStore;

const LIVE_PREFIX: &str = "session:";
const BACKUP_PREFIX: &str = "backup:";

fn live_key(id: &str) -> String {
    format!("{LIVE_PREFIX}{id}")
}

/// Zero-padded version so the lexically greatest key is the newest backup.
fn backup_key(id: &str, version: u64) -> String {
    format!("{BACKUP_PREFIX}{id}:{version:010}")
}

fn parse_backup_key(key: &str) -> Option<(String, u64)> {
    let rest = key.strip_prefix(BACKUP_PREFIX)?;
    let (id, version) = rest.rsplit_once(':')?;
    Some((id.to_string(), version.parse().ok()?))
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub live_ttl: Duration,
    /// Backups outlive the records they protect.
    pub backup_ttl: Duration,
    pub concurrency: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            live_ttl: Duration::from_secs(3600),
            backup_ttl: Duration::from_secs(86400),
            concurrency: 32,
        }
    }
}

/// Snapshots and restores session state against the durable store so a
/// rollback loses no in-flight session, even if the live records were
/// disturbed during cutover.
pub struct SessionPreservationManager {
    store: Arc<dyn SessionStore>,
    cfg: SessionConfig,
}

impl SessionPreservationManager {
    pub fn new(store: Arc<dyn SessionStore>, cfg: SessionConfig) -> Self {
        Self { store, cfg }
    }

    fn encode(record: &SessionRecord) -> GuardResult<Vec<u8>> {
        rmp_serde::to_vec(record).map_err(|e| GuardError::Store(format!("encode session: {e}")))
    }

    fn decode(bytes: &[u8]) -> GuardResult<SessionRecord> {
        rmp_serde::from_slice(bytes).map_err(|e| GuardError::Store(format!("decode session: {e}")))
    }

    pub async fn create_session(
        &self,
        owner_id: &str,
        payload: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> GuardResult<SessionRecord> {
        let record = SessionRecord::new(
            uuid::Uuid::new_v4().to_string(),
            owner_id.to_string(),
            payload,
        );
        self.put_session(&record).await?;
        Ok(record)
    }

    pub async fn put_session(&self, record: &SessionRecord) -> GuardResult<()> {
        self.store
            .set(&live_key(&record.id), Self::encode(record)?, self.cfg.live_ttl)
            .await
    }

    /// Integrity-enforced read: a live record failing checksum verification
    /// is transparently rebuilt from its latest backup before returning.
    pub async fn get_session(&self, id: &str) -> GuardResult<Option<SessionRecord>> {
        let Some(bytes) = self.store.get(&live_key(id)).await? else {
            return Ok(None);
        };
        match Self::decode(&bytes) {
            Ok(record) if record.verify() => Ok(Some(record)),
            Ok(_) => {
                tracing::warn!("session {id}: checksum mismatch on read, healing from backup");
                self.heal_from_backup(id).await.map(Some)
            }
            Err(e) => {
                tracing::warn!("session {id}: undecodable live record ({e}), healing from backup");
                self.heal_from_backup(id).await.map(Some)
            }
        }
    }

    async fn heal_from_backup(&self, id: &str) -> GuardResult<SessionRecord> {
        let record = self
            .latest_backup(id)
            .await?
            .ok_or_else(|| GuardError::Store(format!("session {id}: corrupt and no backup")))?;
        self.put_session(&record).await?;
        Ok(record)
    }

    pub async fn latest_backup(&self, id: &str) -> GuardResult<Option<SessionRecord>> {
        let prefix = format!("{BACKUP_PREFIX}{id}:");
        let keys = self.store.keys_by_prefix(&prefix).await?;
        // Keys are zero-padded, so the last one is the highest version.
        let Some(key) = keys.last() else {
            return Ok(None);
        };
        let Some(bytes) = self.store.get(key).await? else {
            return Ok(None);
        };
        let mut record = Self::decode(&bytes)?;
        record.state = normalize_state(record.state);
        Ok(Some(record))
    }

    /// Back up every known live session with bounded concurrency.
    /// Per-session failures are counted, never fatal to the batch; sessions
    /// created after the key listing are covered by the next cycle.
    pub async fn backup_all(&self) -> GuardResult<BackupStats> {
        let started = Instant::now();
        let keys = self.store.keys_by_prefix(LIVE_PREFIX).await?;
        let total = keys.len();

        let results: Vec<bool> = stream::iter(keys)
            .map(|key| async move {
                match self.backup_one(&key).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("backup of {key} failed: {e}");
                        false
                    }
                }
            })
            .buffer_unordered(self.cfg.concurrency.max(1))
            .collect()
            .await;

        let backed_up = results.iter().filter(|ok| **ok).count();
        let stats = BackupStats {
            total,
            backed_up,
            failed: total - backed_up,
            duration: started.elapsed(),
        };
        tracing::info!(
            "session backup: {}/{} in {:?} ({} failed)",
            stats.backed_up,
            stats.total,
            stats.duration,
            stats.failed
        );
        Ok(stats)
    }

    async fn backup_one(&self, key: &str) -> GuardResult<()> {
        let Some(bytes) = self.store.get(key).await? else {
            // Expired between listing and read; nothing to protect.
            return Ok(());
        };
        let mut record = match Self::decode(&bytes) {
            Ok(r) if r.verify() => r,
            _ => {
                let id = key.strip_prefix(LIVE_PREFIX).unwrap_or(key);
                self.heal_from_backup(id).await?
            }
        };
        record.backup_version += 1;
        record.checksum = compute_checksum(&record.payload);
        let encoded = Self::encode(&record)?;
        self.store
            .set(
                &backup_key(&record.id, record.backup_version),
                encoded.clone(),
                self.cfg.backup_ttl,
            )
            .await?;
        // Live copy keeps the bumped generation counter.
        self.store.set(key, encoded, self.cfg.live_ttl).await?;
        Ok(())
    }

    /// Rebuild every session from its highest backup version and republish
    /// it as live. Writes nothing under the backup prefix, so running it
    /// twice yields an identical final set.
    pub async fn restore_all(&self) -> GuardResult<RestoreStats> {
        let started = Instant::now();
        let keys = self.store.keys_by_prefix(BACKUP_PREFIX).await?;

        let mut newest: HashMap<String, u64> = HashMap::new();
        for key in &keys {
            if let Some((id, version)) = parse_backup_key(key) {
                let entry = newest.entry(id).or_insert(version);
                *entry = (*entry).max(version);
            }
        }

        let total = newest.len();
        let results: Vec<bool> = stream::iter(newest)
            .map(|(id, version)| async move {
                match self.restore_one(&id, version).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("restore of session {id} failed: {e}");
                        false
                    }
                }
            })
            .buffer_unordered(self.cfg.concurrency.max(1))
            .collect()
            .await;

        let restored = results.iter().filter(|ok| **ok).count();
        let stats = RestoreStats {
            total,
            restored,
            failed: total - restored,
            duration: started.elapsed(),
        };
        tracing::info!(
            "session restore: {}/{} in {:?} ({} failed)",
            stats.restored,
            stats.total,
            stats.duration,
            stats.failed
        );
        Ok(stats)
    }

    async fn restore_one(&self, id: &str, version: u64) -> GuardResult<()> {
        let key = backup_key(id, version);
        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or_else(|| GuardError::Store(format!("backup {key} vanished")))?;
        let mut record = Self::decode(&bytes)?;
        record.state = normalize_state(record.state);
        record.checksum = compute_checksum(&record.payload);
        self.put_session(&record).await
    }
}

/// Transient states never survive a restore.
fn normalize_state(state: SessionState) -> SessionState {
    match state {
        SessionState::BackingUp | SessionState::Restoring => SessionState::Active,
        other => other,
    }
}
