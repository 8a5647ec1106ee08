use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Suspended,
    BackingUp,
    Restoring,
    Expired,
}

/// One in-flight user session. The payload is opaque to the guard; a
/// BTreeMap keeps serialization canonical so the checksum is stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub state: SessionState,
    pub payload: BTreeMap<String, serde_json::Value>,
    pub checksum: String,
    /// Monotonic per-session backup generation counter.
    pub backup_version: u64,
}

impl SessionRecord {
    pub fn new(id: String, owner_id: String, payload: BTreeMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        let checksum = compute_checksum(&payload);
        Self {
            id,
            owner_id,
            created_at: now,
            last_activity: now,
            state: SessionState::Active,
            payload,
            checksum,
            backup_version: 0,
        }
    }

    /// Replace the payload, stamping activity and recomputing the checksum.
    pub fn set_payload(&mut self, payload: BTreeMap<String, serde_json::Value>) {
        self.payload = payload;
        self.last_activity = Utc::now();
        self.checksum = compute_checksum(&self.payload);
    }

    /// True when the stored checksum matches the payload.
    pub fn verify(&self) -> bool {
        self.checksum == compute_checksum(&self.payload)
    }
}

/// SHA-256 hex over the canonical JSON encoding of the payload.
pub fn compute_checksum(payload: &BTreeMap<String, serde_json::Value>) -> String {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStats {
    pub total: usize,
    pub backed_up: usize,
    pub failed: usize,
    #[serde(skip)]
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreStats {
    pub total: usize,
    pub restored: usize,
    pub failed: usize,
    #[serde(skip)]
    pub duration: Duration,
}
