/// Member directory: conversation list with per-peer unread flags
use crate::error::Result;
use crate::identity::Identity;
use crate::local_store::{LocalStore, UNREAD_KEY};
use crate::model::{parse_timestamp, ConversationSummary, Id};
use crate::normalize::collection_entries;
use crate::rest::Backend;
use crate::routes::DIRECTORY_PATH;
use crate::watermark::ReadWatermarks;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Unread rule: the last item came from someone else and is newer than
/// what this user has seen. No last item means nothing to read.
pub fn is_unread(
    summary: &ConversationSummary,
    me: &Id,
    watermark: Option<DateTime<Utc>>,
) -> bool {
    let Some(last) = &summary.last_message else {
        return false;
    };
    let from_me = last
        .sender_id
        .as_ref()
        .map(|sender| sender.compare(me) == Ordering::Equal)
        .unwrap_or(false);
    if from_me {
        return false;
    }
    let Some(seen) = watermark else {
        return true;
    };
    match parse_timestamp(&last.timestamp) {
        Some(ts) => ts > seen,
        None => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub conversation_id: Id,
    pub peer_id: Option<Id>,
    pub unread: bool,
}

/// Decode a directory listing; malformed rows are dropped.
pub fn parse_summaries(raw: &Value) -> Vec<ConversationSummary> {
    let Some(rows) = collection_entries(raw) else {
        warn!("Ignoring directory listing with unexpected shape");
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| match serde_json::from_value(row.clone()) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Dropping malformed conversation summary: {}", e);
                None
            }
        })
        .collect()
}

pub fn compute_entries(
    summaries: &[ConversationSummary],
    me: &Id,
    watermarks: &ReadWatermarks,
) -> Result<Vec<DirectoryEntry>> {
    summaries
        .iter()
        .map(|summary| {
            let seen = watermarks.get(&summary.id.to_string())?;
            Ok(DirectoryEntry {
                conversation_id: summary.id.clone(),
                peer_id: summary.other_participant.as_ref().map(|p| p.id.clone()),
                unread: is_unread(summary, me, seen),
            })
        })
        .collect()
}

/// `peerId -> unread`, the shape persisted under `unread_map`
pub fn unread_map(entries: &[DirectoryEntry]) -> BTreeMap<String, bool> {
    let mut map = BTreeMap::new();
    for entry in entries {
        if let Some(peer) = &entry.peer_id {
            let flag = map.entry(peer.to_string()).or_insert(false);
            *flag |= entry.unread;
        }
    }
    map
}

struct Scanner<B: Backend> {
    backend: B,
    me: Id,
    store: LocalStore,
    watermarks: ReadWatermarks,
    entries: watch::Sender<Vec<DirectoryEntry>>,
}

impl<B: Backend> Scanner<B> {
    async fn scan(&self) -> Result<Vec<DirectoryEntry>> {
        let raw = self.backend.fetch(DIRECTORY_PATH).await?;
        let summaries = parse_summaries(&raw);
        let entries = compute_entries(&summaries, &self.me, &self.watermarks)?;

        self.store.put_json(UNREAD_KEY, &unread_map(&entries))?;
        let unread = entries.iter().filter(|e| e.unread).count();
        debug!("Directory: {} conversations, {} unread", entries.len(), unread);
        self.entries.send_replace(entries.clone());
        Ok(entries)
    }
}

/// Periodic directory scan publishing entries on a watch channel
pub struct DirectoryPoller<B: Backend> {
    scanner: Arc<Scanner<B>>,
    every: Duration,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<B: Backend> DirectoryPoller<B> {
    pub fn new(backend: B, identity: &Identity, store: LocalStore, every: Duration) -> Self {
        let (entries, _) = watch::channel(Vec::new());
        Self {
            scanner: Arc::new(Scanner {
                backend,
                me: identity.user_id().clone(),
                watermarks: ReadWatermarks::new(store.clone()),
                store,
                entries,
            }),
            every,
            shutdown: None,
            task: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<DirectoryEntry>> {
        self.scanner.entries.subscribe()
    }

    /// Flags from the previous run, shown until the first scan completes
    pub fn stored_unread(&self) -> Result<BTreeMap<String, bool>> {
        Ok(self.scanner.store.get_json(UNREAD_KEY)?.unwrap_or_default())
    }

    /// One scan: list, compute flags, persist the unread map, publish.
    pub async fn poll_once(&self) -> Result<Vec<DirectoryEntry>> {
        self.scanner.scan().await
    }

    pub fn start(&mut self) {
        self.stop();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scanner = self.scanner.clone();
        let every = self.every;

        info!("Polling directory every {:?}", every);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                let scanned = tokio::select! {
                    r = scanner.scan() => r,
                    _ = shutdown_rx.changed() => break,
                };
                if let Err(e) = scanned {
                    warn!("Directory poll failed: {}", e);
                }
            }
        }));
        self.shutdown = Some(shutdown_tx);
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl<B: Backend> Drop for DirectoryPoller<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
