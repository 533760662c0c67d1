/// Live view: one conversation or Q&A panel kept in sync from snapshot + feed
///
/// Lifecycle: `new` -> `activate` (snapshot, seed, start feed) -> `close`
/// (stop feed, force the read watermark to now). Dropping an open view closes it.
use crate::config::{Config, FeedMode};
use crate::error::{Result, SyncError};
use crate::feed::{FeedEvent, IncrementalFeed, PollFeed, PushFeed};
use crate::identity::Identity;
use crate::merge::{latest_timestamp, MergeEngine, PendingItem};
use crate::model::{Id, Item};
use crate::rest::Backend;
use crate::routes::{socket_url, Channel};
use crate::watermark::ReadWatermarks;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the presentational layer renders
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ViewState {
    /// Confirmed items in canonical order
    pub items: Vec<Item>,
    /// Locally sent items not yet confirmed
    pub pending: Vec<PendingItem>,
    pub loading: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Server confirmed the item
    Sent(Item),
    /// Empty content, or another send was still in flight
    Ignored,
}

/// Feed for `channel` as selected by `config.feed_mode`
pub fn build_feed<B: Backend>(
    config: &Config,
    channel: &Channel,
    backend: &B,
    identity: &Identity,
) -> Box<dyn IncrementalFeed> {
    match config.feed_mode {
        FeedMode::Push => Box::new(PushFeed::new(
            socket_url(&config.ws_base, channel, &identity.token),
            config.reconnect.clone(),
        )),
        FeedMode::Poll => Box::new(PollFeed::new(
            backend.clone(),
            channel.collection_path(),
            config.poll_interval,
        )),
    }
}

/// State reachable from the pump task
struct Shared {
    channel: Channel,
    engine: Mutex<MergeEngine>,
    state: watch::Sender<ViewState>,
    watermarks: OnceLock<ReadWatermarks>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, engine: &MergeEngine) {
        self.state.send_modify(|s| {
            s.items = engine.items().to_vec();
            s.pending = engine.pending().to_vec();
        });
    }

    fn set_error(&self, error: Option<String>) {
        self.state.send_modify(|s| s.error = error);
    }

    fn advance_watermark(&self, ts: Option<DateTime<Utc>>) {
        let (Some(marks), Some(conversation), Some(ts)) =
            (self.watermarks.get(), self.channel.watermark_id(), ts)
        else {
            return;
        };
        if let Err(e) = marks.advance(&conversation, ts) {
            warn!("Failed to advance watermark for {}: {}", conversation, e);
        }
    }

    fn force_watermark(&self) {
        let (Some(marks), Some(conversation)) =
            (self.watermarks.get(), self.channel.watermark_id())
        else {
            return;
        };
        if let Err(e) = marks.force_now(&conversation) {
            warn!("Failed to mark {} read: {}", conversation, e);
        }
    }

    async fn apply(&self, event: FeedEvent) {
        let mut engine = self.engine.lock().await;
        if self.is_closed() {
            return;
        }
        match event {
            FeedEvent::Batch(raw) => {
                if let Some(fresh) = engine.merge_incremental(&raw) {
                    self.publish(&engine);
                    drop(engine);
                    self.advance_watermark(latest_timestamp(&fresh));
                }
            }
            FeedEvent::PointUpdate { id, patch } => {
                if engine.apply_point_update(&id, &patch) {
                    self.publish(&engine);
                }
            }
            FeedEvent::PointRemoval { id } => {
                if engine.apply_point_removal(&id) {
                    self.publish(&engine);
                }
            }
        }
    }
}

/// Clears the in-flight flag when a send finishes, however it finishes
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct LiveView<B: Backend> {
    shared: Arc<Shared>,
    backend: B,
    identity: Identity,
    max_content_len: usize,
    feed: Mutex<Box<dyn IncrementalFeed>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    sending: AtomicBool,
    draft: Mutex<String>,
}

impl<B: Backend> LiveView<B> {
    pub fn new(
        channel: Channel,
        backend: B,
        identity: Identity,
        feed: Box<dyn IncrementalFeed>,
    ) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            shared: Arc::new(Shared {
                channel,
                engine: Mutex::new(MergeEngine::new()),
                state,
                watermarks: OnceLock::new(),
                closed: AtomicBool::new(false),
            }),
            backend,
            identity,
            max_content_len: Config::default().max_content_len,
            feed: Mutex::new(feed),
            pump: Mutex::new(None),
            sending: AtomicBool::new(false),
            draft: Mutex::new(String::new()),
        }
    }

    /// View wired from `config`: feed strategy, content limit, watermarks.
    pub fn from_config(
        config: &Config,
        channel: Channel,
        backend: B,
        identity: Identity,
        watermarks: ReadWatermarks,
    ) -> Self {
        let feed = build_feed(config, &channel, &backend, &identity);
        Self::new(channel, backend, identity, feed)
            .with_watermarks(watermarks)
            .with_max_content_len(config.max_content_len)
    }

    /// Maintain the read watermark (conversations only). The first store bound wins.
    pub fn with_watermarks(self, watermarks: ReadWatermarks) -> Self {
        if self.shared.watermarks.set(watermarks).is_err() {
            warn!(
                "Watermarks already bound for {:?}; keeping the first",
                self.shared.channel
            );
        }
        self
    }

    pub fn with_max_content_len(mut self, max: usize) -> Self {
        self.max_content_len = max;
        self
    }

    pub fn channel(&self) -> &Channel {
        &self.shared.channel
    }

    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.shared.state.subscribe()
    }

    /// Current state
    pub fn state(&self) -> ViewState {
        self.shared.state.borrow().clone()
    }

    pub async fn items(&self) -> Vec<Item> {
        self.shared.engine.lock().await.items().to_vec()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Load the snapshot, seed the engine, advance the watermark and start
    /// the feed. The feed starts even if the snapshot fails; the failure is
    /// published in `ViewState::error` and returned.
    pub async fn activate(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.shared.state.send_modify(|s| {
            s.loading = true;
            s.error = None;
        });

        let snapshot = self.backend.fetch(&self.shared.channel.collection_path()).await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let loaded = match snapshot {
            Ok(raw) => {
                let latest = {
                    let mut engine = self.shared.engine.lock().await;
                    engine.seed(&raw);
                    self.shared.publish(&engine);
                    engine.latest_timestamp()
                };
                self.shared.advance_watermark(latest);
                self.shared.state.send_modify(|s| s.loading = false);
                Ok(())
            }
            Err(e) => {
                warn!("Snapshot of {:?} failed: {}", self.shared.channel, e);
                let message = e.user_message();
                self.shared.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(message);
                });
                Err(e)
            }
        };

        self.start_feed().await?;
        loaded
    }

    async fn start_feed(&self) -> Result<()> {
        let mut feed = self.feed.lock().await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.start(tx)?;

        let shared = self.shared.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if shared.is_closed() {
                    break;
                }
                shared.apply(event).await;
            }
        });
        if let Some(old) = self.pump.lock().await.replace(pump) {
            old.abort();
        }
        info!("{} feed started for {:?}", feed.name(), self.shared.channel);
        Ok(())
    }

    /// Optimistic send. Shows a pending item at once, then swaps it for the
    /// server-confirmed copy unless the feed already delivered that id.
    pub async fn send(&self, content: &str) -> Result<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        self.check_length(content)?;

        if self.sending.swap(true, Ordering::AcqRel) {
            debug!("Send already in flight, ignoring");
            return Ok(SendOutcome::Ignored);
        }
        let _in_flight = InFlight(&self.sending);

        let key = {
            let mut engine = self.shared.engine.lock().await;
            let key = engine.push_pending(content, Some(self.identity.user_id().clone()));
            self.shared.publish(&engine);
            key
        };

        let created = self
            .backend
            .create(&self.shared.channel.collection_path(), self.content_body(content))
            .await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }

        let confirmed = created.and_then(|raw| {
            serde_json::from_value::<Item>(raw)
                .map_err(|e| SyncError::Protocol(format!("Created item is malformed: {}", e)))
        });

        let mut engine = self.shared.engine.lock().await;
        match confirmed {
            Ok(item) => {
                if !engine.confirm_pending(key, item.clone()) {
                    debug!("Item {} already delivered by the feed", item.id);
                }
                self.shared.publish(&engine);
                drop(engine);
                self.shared.set_error(None);
                self.shared.advance_watermark(item.timestamp());
                Ok(SendOutcome::Sent(item))
            }
            Err(e) => {
                engine.discard_pending(key);
                self.shared.publish(&engine);
                drop(engine);
                warn!("Send to {:?} failed: {}", self.shared.channel, e);
                self.shared.set_error(Some(e.user_message()));
                Err(e)
            }
        }
    }

    pub async fn set_draft(&self, text: &str) {
        *self.draft.lock().await = text.to_string();
    }

    pub async fn draft(&self) -> String {
        self.draft.lock().await.clone()
    }

    /// Send the draft; it is cleared only once the server confirms.
    pub async fn send_draft(&self) -> Result<SendOutcome> {
        let content = self.draft().await;
        let outcome = self.send(&content).await?;
        if matches!(outcome, SendOutcome::Sent(_)) {
            self.draft.lock().await.clear();
        }
        Ok(outcome)
    }

    pub async fn upvote(&self, id: &Id) -> Result<()> {
        let path = self
            .shared
            .channel
            .upvote_path(id)
            .ok_or_else(|| SyncError::Validation("Only questions can be upvoted".to_string()))?;
        let resp = self.backend.create(&path, Value::Object(Map::new())).await;
        self.apply_response(id, resp).await
    }

    pub async fn edit(&self, id: &Id, content: &str) -> Result<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SyncError::Validation("Content cannot be empty".to_string()));
        }
        self.check_length(content)?;
        let resp = self
            .backend
            .update(&self.shared.channel.item_path(id), self.content_body(content))
            .await;
        self.apply_response(id, resp).await
    }

    pub async fn delete(&self, id: &Id) -> Result<()> {
        let resp = self.backend.remove(&self.shared.channel.item_path(id)).await;
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        match resp {
            Ok(()) => {
                let mut engine = self.shared.engine.lock().await;
                if engine.apply_point_removal(id) {
                    self.shared.publish(&engine);
                }
                Ok(())
            }
            Err(e) => {
                self.shared.set_error(Some(e.user_message()));
                Err(e)
            }
        }
    }

    /// Teardown: stop the feed and mark the conversation read up to now.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.feed.lock().await.stop();
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.shared.force_watermark();
        info!("Closed view {:?}", self.shared.channel);
    }

    fn check_length(&self, content: &str) -> Result<()> {
        let len = content.chars().count();
        if len > self.max_content_len {
            let e = SyncError::Validation(format!(
                "Message is too long ({} characters, limit {})",
                len, self.max_content_len
            ));
            self.shared.set_error(Some(e.user_message()));
            return Err(e);
        }
        Ok(())
    }

    fn content_body(&self, content: &str) -> Value {
        let mut body = Map::new();
        body.insert(
            self.shared.channel.content_field().to_string(),
            Value::String(content.to_string()),
        );
        Value::Object(body)
    }

    async fn apply_response(&self, id: &Id, resp: Result<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Closed);
        }
        match resp {
            Ok(Value::Object(patch)) => {
                let mut engine = self.shared.engine.lock().await;
                if engine.apply_point_update(id, &patch) {
                    self.shared.publish(&engine);
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                self.shared.set_error(Some(e.user_message()));
                Err(e)
            }
        }
    }
}

impl<B: Backend> Drop for LiveView<B> {
    fn drop(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.feed.get_mut().stop();
        if let Some(pump) = self.pump.get_mut().take() {
            pump.abort();
        }
        self.shared.force_watermark();
    }
}
