//! SHA-256 chained observation journal.
//!
//! Every plan lifecycle transition and safety action is appended as a block
//! hashing the previous block's hash, one JSONL file per UTC day under the
//! configured log directory. A broken chain is detectable after the fact,
//! which is what makes the nightly record usable as observation provenance.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEvent {
    /// Plan changed lifecycle state.
    PlanState,
    /// Safety action: unsafe pointing, excursion abort, forced park.
    Safety,
    /// Environment turned unsafe / slit commanded.
    Environment,
    /// Device link came up or went down.
    Device,
    /// Daemon start/stop marks.
    Session,
}

impl std::fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_string(self).unwrap_or_default();
        write!(f, "{}", s.trim_matches('"'))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalBlock {
    pub seq: u64,
    pub timestamp_ms: u64,
    /// Hex SHA-256 of the previous block; 64 zeros for the genesis block.
    pub prev_hash: String,
    pub event: JournalEvent,
    pub payload_json: String,
    pub block_hash: String,
}

impl JournalBlock {
    fn compute_hash(prev: &str, timestamp_ms: u64, event: &JournalEvent, payload: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(event.to_string().as_bytes());
        hasher.update(payload.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn new(
        seq: u64,
        timestamp_ms: u64,
        prev_hash: String,
        event: JournalEvent,
        payload_json: String,
    ) -> Self {
        let block_hash = Self::compute_hash(&prev_hash, timestamp_ms, &event, &payload_json);
        Self { seq, timestamp_ms, prev_hash, event, payload_json, block_hash }
    }

    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.prev_hash, self.timestamp_ms, &self.event, &self.payload_json)
            == self.block_hash
    }
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

struct JournalState {
    seq: u64,
    last_hash: String,
}

/// Append-only chained journal; cloneable handle, single write path.
#[derive(Clone)]
pub struct Journal {
    state: Arc<RwLock<JournalState>>,
    dir: PathBuf,
}

impl Journal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(RwLock::new(JournalState {
                seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
            dir: dir.into(),
        }
    }

    fn file_path(&self) -> PathBuf {
        let day = chrono::Utc::now().format("%Y%m%d");
        self.dir.join(format!("obsd-{day}.jsonl"))
    }

    /// Append one block. Failures are logged, never propagated: losing one
    /// journal line must not disturb a running observation.
    pub async fn append(&self, event: JournalEvent, payload: serde_json::Value) {
        let timestamp_ms = chrono::Utc::now().timestamp_millis() as u64;
        let payload_json = payload.to_string();

        let block = {
            let mut state = self.state.write().await;
            let block = JournalBlock::new(
                state.seq,
                timestamp_ms,
                state.last_hash.clone(),
                event,
                payload_json,
            );
            state.last_hash = block.block_hash.clone();
            state.seq += 1;
            block
        };
        debug_assert!(block.verify());

        let line = match serde_json::to_string(&block) {
            Ok(l) => format!("{l}\n"),
            Err(e) => {
                warn!("journal: serialize failed: {e}");
                return;
            }
        };
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("journal: cannot create {}: {e}", self.dir.display());
            return;
        }
        match OpenOptions::new().create(true).append(true).open(self.file_path()).await {
            Ok(mut f) => {
                if let Err(e) = f.write_all(line.as_bytes()).await {
                    warn!("journal: write failed: {e}");
                }
            }
            Err(e) => warn!("journal: cannot open {}: {e}", self.file_path().display()),
        }
    }

    pub async fn plan_state(&self, plan_sn: &str, state: &str, gid: &str, uid: &str) {
        self.append(
            JournalEvent::PlanState,
            serde_json::json!({ "plan_sn": plan_sn, "state": state, "gid": gid, "uid": uid }),
        )
        .await;
    }

    pub async fn safety(&self, gid: &str, uid: &str, action: &str, detail: serde_json::Value) {
        self.append(
            JournalEvent::Safety,
            serde_json::json!({ "gid": gid, "uid": uid, "action": action, "detail": detail }),
        )
        .await;
    }

    pub async fn environment(&self, gid: &str, safe: bool, detail: serde_json::Value) {
        self.append(
            JournalEvent::Environment,
            serde_json::json!({ "gid": gid, "safe": safe, "detail": detail }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_chain_verifies_and_detects_tampering() {
        let a = JournalBlock::new(
            0,
            1000,
            GENESIS_HASH.to_string(),
            JournalEvent::PlanState,
            r#"{"plan_sn":"A"}"#.to_string(),
        );
        assert!(a.verify());
        let b = JournalBlock::new(
            1,
            2000,
            a.block_hash.clone(),
            JournalEvent::Safety,
            r#"{"action":"park"}"#.to_string(),
        );
        assert!(b.verify());
        assert_eq!(b.prev_hash, a.block_hash);

        let mut tampered = b.clone();
        tampered.payload_json = r#"{"action":"open"}"#.to_string();
        assert!(!tampered.verify());
    }

    #[tokio::test]
    async fn append_advances_the_chain() {
        let dir = std::env::temp_dir().join(format!("obsd-journal-{}", uuid::Uuid::new_v4()));
        let journal = Journal::new(&dir);
        journal.plan_state("A", "running", "001", "01").await;
        journal.plan_state("A", "over", "001", "01").await;

        let state = journal.state.read().await;
        assert_eq!(state.seq, 2);
        assert_ne!(state.last_hash, GENESIS_HASH);

        let text = std::fs::read_to_string(journal.file_path()).unwrap();
        let blocks: Vec<JournalBlock> =
            text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(JournalBlock::verify));
        assert_eq!(blocks[1].prev_hash, blocks[0].block_hash);
        let _ = std::fs::remove_dir_all(dir);
    }
}
