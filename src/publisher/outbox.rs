use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{error, warn};

use crate::envelope::EventEnvelope;
use crate::utils::error::BusError;

const OUTBOX_TREE: &str = "outbox";

/// Entry as stored on disk.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct OutboxEntry {
    envelope: EventEnvelope,
    attempts: u32,
}

/// Durable queue of envelopes waiting to be published.
///
/// Keys are `{sequence:020}_{message_id}` where the sequence comes from sled's
/// persistent id generator, so iteration order is insertion order across
/// restarts.
#[derive(Clone)]
pub struct Outbox {
    db: Db,
    tree: Tree,
}

impl Outbox {
    pub fn open(path: &str) -> Result<Self, BusError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(OUTBOX_TREE)?;
        Ok(Self { db, tree })
    }

    /// Store `envelope` and flush before returning its key.
    pub fn enqueue(&self, envelope: &EventEnvelope) -> Result<String, BusError> {
        let sequence = self.db.generate_id()?;
        let key = format!(
            "{:020}_{}",
            sequence,
            envelope.message_id().unwrap_or("anonymous")
        );
        let entry = OutboxEntry {
            envelope: envelope.clone(),
            attempts: 0,
        };
        self.tree.insert(key.as_bytes(), serde_json::to_vec(&entry)?)?;
        self.tree.flush()?;
        Ok(key)
    }

    /// Pending envelopes, oldest first. Entries that no longer decode are
    /// logged and dropped.
    pub fn pending(&self) -> Result<Vec<(String, EventEnvelope)>, BusError> {
        let mut pending = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            let key = String::from_utf8_lossy(&key).into_owned();
            match serde_json::from_slice::<OutboxEntry>(&value) {
                Ok(entry) => pending.push((key, entry.envelope)),
                Err(e) => {
                    error!(key, error = %e, "corrupt outbox entry dropped");
                    self.tree.remove(key.as_bytes())?;
                }
            }
        }
        Ok(pending)
    }

    /// Bump the attempt counter of a pending entry, returning the new count.
    pub fn record_attempt(&self, key: &str) -> Result<u32, BusError> {
        let Some(value) = self.tree.get(key.as_bytes())? else {
            return Ok(0);
        };
        let mut entry: OutboxEntry = serde_json::from_slice(&value)?;
        entry.attempts = entry.attempts.saturating_add(1);
        self.tree.insert(key.as_bytes(), serde_json::to_vec(&entry)?)?;
        if entry.attempts % 10 == 0 {
            warn!(key, attempts = entry.attempts, "outbox entry still undelivered");
        }
        Ok(entry.attempts)
    }

    pub fn remove(&self, key: &str) -> Result<(), BusError> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("db", &"sled::Db")
            .field("pending", &self.tree.len())
            .finish()
    }
}
