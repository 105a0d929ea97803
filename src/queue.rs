// Copyright 2023 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! `DurableQueue`: a per-peer FIFO of [`QueueEntry`] persisted to a single
//! file via temp-file-plus-rename (spec §4.2).

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};
use crate::message::Message;

fn wall_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// One message awaiting delivery, plus its bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub message: Message,
    pub enqueued_at: f64,
    pub attempts: u32,
}

/// On-disk representation: one peer's queue plus a top-level timestamp
/// (spec §6 "Persistent state layout").
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedQueue {
    timestamp: f64,
    entries: VecDeque<QueueEntry>,
}

/// A per-peer, time-bounded, persistent FIFO.
///
/// Every `enqueue` call guarantees the entry is on stable storage before
/// returning, per the durability contract. The in-memory buffer and the
/// persistence write share one mutex; I/O happens while it is held, which is
/// acceptable because the writes are small and rare (spec §5).
pub struct DurableQueue {
    path: PathBuf,
    max_age: Duration,
    inner: Mutex<VecDeque<QueueEntry>>,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue").field("path", &self.path).finish_non_exhaustive()
    }
}

impl DurableQueue {
    /// Loads (or creates) the queue file for one peer at `path`, applying
    /// `expire()` to whatever was recovered from disk.
    pub async fn load(path: PathBuf, max_age: Duration) -> Result<Self> {
        let entries = match fs::read(&path).await {
            Ok(bytes) => {
                let persisted: PersistedQueue = serde_json::from_slice(&bytes)?;
                persisted.entries
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => return Err(BridgeError::Io(e)),
        };

        let queue = Self { path, max_age, inner: Mutex::new(entries) };
        queue.expire_locked(&mut *queue.inner.lock().await);
        Ok(queue)
    }

    /// Whether `message` is already older than `max_age`, measured from its
    /// own timestamp rather than an enqueued-at bookkeeping field — used to
    /// reject a message outright instead of queuing something that would
    /// just expire unsent (spec.md §4.1 outcome (c)).
    pub(crate) fn is_stale(&self, message: &Message) -> bool {
        wall_now() - message.timestamp > self.max_age.as_secs_f64()
    }

    /// Appends `m`, then persists the whole queue before returning.
    /// Idempotent on message id: a duplicate id replaces the existing entry
    /// in place, preserving the original's order position. Rejects a message
    /// that is already stale at enqueue time rather than queuing it.
    pub async fn enqueue(&self, message: Message) -> Result<()> {
        if self.is_stale(&message) {
            return Err(BridgeError::MessageExpired(message.id));
        }

        let mut guard = self.inner.lock().await;
        self.expire_locked(&mut guard);

        let entry = QueueEntry { message, enqueued_at: wall_now(), attempts: 0 };
        if let Some(existing) = guard.iter_mut().find(|e| e.message.id == entry.message.id) {
            existing.message = entry.message;
            existing.enqueued_at = entry.enqueued_at;
        } else {
            guard.push_back(entry);
        }

        self.persist_locked(&guard).await
    }

    /// While the caller reports `is_ready() == true`, snapshots the current
    /// entries, clears and persists an empty queue, then sends each entry in
    /// order. Any entry whose `send_fn` fails is re-enqueued at the head,
    /// preserving original order, and draining stops there.
    pub async fn drain<F, Fut>(&self, is_ready: impl Fn() -> bool, send_fn: F) -> Result<usize>
    where
        F: Fn(Message) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let mut guard = self.inner.lock().await;
        if !is_ready() {
            return Ok(0);
        }
        self.expire_locked(&mut guard);

        let snapshot: Vec<QueueEntry> = guard.drain(..).collect();
        self.persist_locked(&guard).await?;
        drop(guard);

        let mut sent = 0;
        for (idx, mut entry) in snapshot.into_iter().enumerate() {
            if !is_ready() {
                self.requeue_remaining(entry, idx).await?;
                break;
            }
            match send_fn(entry.message.clone()).await {
                Ok(()) => sent += 1,
                Err(_) => {
                    entry.attempts += 1;
                    let mut guard = self.inner.lock().await;
                    guard.push_front(entry);
                    self.persist_locked(&guard).await?;
                    break;
                }
            }
        }
        Ok(sent)
    }

    async fn requeue_remaining(&self, first: QueueEntry, _from_idx: usize) -> Result<()> {
        let mut guard = self.inner.lock().await;
        guard.push_front(first);
        self.persist_locked(&guard).await
    }

    /// Removes entries older than `max_age`; called on load and on every
    /// persistence write.
    pub async fn expire(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        self.expire_locked(&mut guard);
        self.persist_locked(&guard).await
    }

    fn expire_locked(&self, entries: &mut VecDeque<QueueEntry>) {
        let now = wall_now();
        let max_age_secs = self.max_age.as_secs_f64();
        entries.retain(|e| now - e.enqueued_at <= max_age_secs);
    }

    async fn persist_locked(&self, entries: &VecDeque<QueueEntry>) -> Result<()> {
        let persisted = PersistedQueue { timestamp: wall_now(), entries: entries.clone() };
        let serialized = serde_json::to_vec(&persisted)?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent).await?;

        let path = self.path.clone();
        let peer = path.display().to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut temp_file = NamedTempFile::new_in(parent).map_err(|e| {
                BridgeError::QueuePersistence { peer: peer.clone(), reason: e.to_string() }
            })?;
            temp_file.write_all(&serialized).map_err(|e| BridgeError::QueuePersistence {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;
            temp_file.persist(&path).map_err(|e| BridgeError::QueuePersistence {
                peer,
                reason: e.to_string(),
            })?;
            Ok(())
        })
        .await
        .map_err(|e| BridgeError::QueuePersistence {
            peer: self.path.display().to_string(),
            reason: e.to_string(),
        })??;

        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Context, Kind};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn msg(id: &str) -> Message {
        Message::new(id, Kind::Request, json!({}), Context::system("test"))
    }

    #[tokio::test]
    async fn enqueue_then_drain_delivers_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::load(dir.path().join("peer.json"), Duration::from_secs(3600))
            .await
            .unwrap();

        queue.enqueue(msg("m1")).await.unwrap();

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        let sent = queue
            .drain(
                || true,
                move |_m| {
                    let d = d.clone();
                    async move {
                        d.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(sent, 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn preserves_fifo_order_across_three_messages() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::load(dir.path().join("peer.json"), Duration::from_secs(3600))
            .await
            .unwrap();

        queue.enqueue(msg("r1")).await.unwrap();
        queue.enqueue(msg("r2")).await.unwrap();
        queue.enqueue(msg("r3")).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let o = order.clone();
        queue
            .drain(
                || true,
                move |m| {
                    let o = o.clone();
                    async move {
                        o.lock().await.push(m.id);
                        Ok(())
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(*order.lock().await, vec!["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn duplicate_id_replaces_without_moving_position() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::load(dir.path().join("peer.json"), Duration::from_secs(3600))
            .await
            .unwrap();

        queue.enqueue(msg("a")).await.unwrap();
        queue.enqueue(msg("b")).await.unwrap();
        queue.enqueue(msg("a")).await.unwrap();

        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test]
    async fn remaining_entries_persist_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.json");

        {
            let queue = DurableQueue::load(path.clone(), Duration::from_secs(3600)).await.unwrap();
            for id in ["q1", "q2", "q3", "q4", "q5", "q6"] {
                queue.enqueue(msg(id)).await.unwrap();
            }
        }

        let reloaded = DurableQueue::load(path, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reloaded.len().await, 6);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peer.json");

        {
            let queue = DurableQueue::load(path.clone(), Duration::from_secs(3600)).await.unwrap();
            let mut stale = msg("stale");
            stale.timestamp = wall_now() - 7200.0;
            let mut guard = queue.inner.lock().await;
            guard.push_back(QueueEntry {
                message: stale,
                enqueued_at: wall_now() - 7200.0,
                attempts: 0,
            });
            queue.persist_locked(&guard).await.unwrap();
        }

        let reloaded = DurableQueue::load(path, Duration::from_secs(3600)).await.unwrap();
        assert!(reloaded.is_empty().await);
    }

    #[tokio::test]
    async fn enqueue_rejects_a_message_already_older_than_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let queue = DurableQueue::load(dir.path().join("peer.json"), Duration::from_secs(3600))
            .await
            .unwrap();

        let mut stale = msg("stale");
        stale.timestamp = wall_now() - 7200.0;

        let result = queue.enqueue(stale).await;
        assert_matches::assert_matches!(result, Err(BridgeError::MessageExpired(id)) if id == "stale");
        assert!(queue.is_empty().await);
    }
}
