/// Live view integration tests
/// Snapshot + feed merge, optimistic sends, watermarks and teardown against
/// an in-memory backend and a hand-driven feed.

use chatsync_core::directory::DirectoryPoller;
use chatsync_core::feed::{FeedEvent, FeedSender, IncrementalFeed};
use chatsync_core::identity::Identity;
use chatsync_core::local_store::LocalStore;
use chatsync_core::model::{parse_timestamp, CurrentUser};
use chatsync_core::watermark::ReadWatermarks;
use chatsync_core::{Backend, Channel, Id, LiveView, Result, SendOutcome, SyncError, ViewState};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

#[derive(Default)]
struct BackendState {
    snapshot: Value,
    directory: Value,
    next_id: i64,
    fail_fetch: bool,
    fail_create: Option<(u16, String)>,
    gate: Option<Arc<Notify>>,
    created: Vec<Value>,
}

/// In-memory backend: fixed snapshot, numbered creates
#[derive(Clone)]
struct FakeBackend(Arc<Mutex<BackendState>>);

impl FakeBackend {
    fn new(snapshot: Value) -> Self {
        Self(Arc::new(Mutex::new(BackendState {
            snapshot,
            directory: json!([]),
            next_id: 100,
            ..Default::default()
        })))
    }

    fn with<R>(&self, f: impl FnOnce(&mut BackendState) -> R) -> R {
        f(&mut self.0.lock().unwrap())
    }

    fn created_count(&self) -> usize {
        self.with(|s| s.created.len())
    }
}

impl Backend for FakeBackend {
    async fn fetch(&self, path: &str) -> Result<Value> {
        self.with(|s| {
            if s.fail_fetch {
                return Err(SyncError::Network("connection refused".into()));
            }
            if path == "/api/conversations/" {
                Ok(s.directory.clone())
            } else {
                Ok(s.snapshot.clone())
            }
        })
    }

    async fn create(&self, path: &str, body: Value) -> Result<Value> {
        let gate = self.with(|s| s.gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.with(|s| {
            if let Some((status, message)) = s.fail_create.clone() {
                return Err(SyncError::Server { status, message });
            }
            if path.ends_with("/upvote/") {
                return Ok(json!({"upvoteCount": 4}));
            }
            let id = s.next_id;
            s.next_id += 1;
            s.created.push(body.clone());
            let content = body
                .get("content")
                .or_else(|| body.get("body"))
                .cloned()
                .unwrap_or(Value::Null);
            Ok(json!({
                "id": id,
                "content": content,
                "senderId": 1,
                "createdAt": "2024-01-01T00:00:30Z"
            }))
        })
    }

    async fn update(&self, _path: &str, body: Value) -> Result<Value> {
        Ok(body)
    }

    async fn remove(&self, _path: &str) -> Result<()> {
        Ok(())
    }
}

/// Feed driven by the test through `ManualHandle`
struct ManualFeed {
    handle: ManualHandle,
}

#[derive(Clone, Default)]
struct ManualHandle {
    sender: Arc<Mutex<Option<FeedSender>>>,
    started: Arc<AtomicUsize>,
    stopped: Arc<AtomicBool>,
}

impl ManualHandle {
    fn push(&self, event: FeedEvent) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }
}

impl IncrementalFeed for ManualFeed {
    fn start(&mut self, events: FeedSender) -> Result<()> {
        *self.handle.sender.lock().unwrap() = Some(events);
        self.handle.started.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.handle.sender.lock().unwrap().take();
        self.handle.stopped.store(true, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

fn me() -> Identity {
    Identity {
        user: CurrentUser {
            id: Id::Int(1),
            username: Some("me".into()),
        },
        token: "secret".into(),
    }
}

fn t(sec: u32) -> String {
    format!("2024-01-01T00:00:{:02}Z", sec)
}

fn msg(id: i64, sec: u32, sender: i64) -> Value {
    json!({"id": id, "content": format!("m{}", id), "senderId": sender, "createdAt": t(sec)})
}

struct Harness {
    _dir: TempDir,
    store: LocalStore,
    backend: FakeBackend,
    feed: ManualHandle,
    view: Arc<LiveView<FakeBackend>>,
}

fn harness(channel: Channel, snapshot: Value) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let backend = FakeBackend::new(snapshot);
    let feed = ManualHandle::default();
    let view = LiveView::new(
        channel,
        backend.clone(),
        me(),
        Box::new(ManualFeed {
            handle: feed.clone(),
        }),
    )
    .with_watermarks(ReadWatermarks::new(store.clone()));
    Harness {
        _dir: dir,
        store,
        backend,
        feed,
        view: Arc::new(view),
    }
}

async fn wait_until(rx: &mut watch::Receiver<ViewState>, pred: impl Fn(&ViewState) -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let matched = pred(&rx.borrow_and_update());
            if matched {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("view state never matched");
}

fn ids(state: &ViewState) -> Vec<Id> {
    state.items.iter().map(|i| i.id.clone()).collect()
}

#[tokio::test]
async fn test_feed_batch_merges_in_order() {
    let h = harness(
        Channel::Conversation(Id::Int(7)),
        json!([msg(1, 1, 2), msg(3, 3, 2)]),
    );
    h.view.activate().await.unwrap();
    assert_eq!(h.feed.started.load(Ordering::SeqCst), 1);

    let mut rx = h.view.subscribe();
    assert!(h.feed.push(FeedEvent::Batch(json!([msg(2, 2, 2), msg(3, 3, 2)]))));
    wait_until(&mut rx, |s| s.items.len() == 3).await;
    assert_eq!(ids(&h.view.state()), vec![Id::Int(1), Id::Int(2), Id::Int(3)]);

    // Same batch again changes nothing.
    assert!(h.feed.push(FeedEvent::Batch(json!([msg(2, 2, 2)]))));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.view.items().await.len(), 3);
}

#[tokio::test]
async fn test_point_events_from_feed() {
    let h = harness(
        Channel::EventQuestions(Id::Int(3)),
        json!([msg(1, 1, 2), msg(2, 2, 2)]),
    );
    h.view.activate().await.unwrap();
    let mut rx = h.view.subscribe();

    let mut patch = Map::new();
    patch.insert("upvoteCount".into(), json!(9));
    h.feed.push(FeedEvent::PointUpdate {
        id: Id::Int(99),
        patch: patch.clone(),
    });
    h.feed.push(FeedEvent::PointUpdate {
        id: Id::Int(2),
        patch,
    });
    wait_until(&mut rx, |s| s.items[1].upvote_count() == Some(9)).await;

    h.feed.push(FeedEvent::PointRemoval { id: Id::Int(1) });
    wait_until(&mut rx, |s| s.items.len() == 1).await;

    // A removed id is never admitted again.
    h.feed.push(FeedEvent::Batch(json!([msg(1, 1, 2)])));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids(&h.view.state()), vec![Id::Int(2)]);
}

#[tokio::test]
async fn test_watermark_on_mount_and_close() {
    let h = harness(
        Channel::Conversation(Id::Int(7)),
        json!([msg(1, 1, 2), msg(5, 5, 2)]),
    );
    let marks = ReadWatermarks::new(h.store.clone());
    marks.advance("7", parse_timestamp(&t(2)).unwrap()).unwrap();

    h.view.activate().await.unwrap();
    let t5 = parse_timestamp(&t(5)).unwrap();
    assert_eq!(marks.get("7").unwrap(), Some(t5));

    h.view.close().await;
    assert!(marks.get("7").unwrap().unwrap() > t5);
}

#[tokio::test]
async fn test_feed_items_advance_watermark() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    let marks = ReadWatermarks::new(h.store.clone());
    h.view.activate().await.unwrap();

    let mut rx = h.view.subscribe();
    h.feed.push(FeedEvent::Batch(json!([msg(2, 8, 2)])));
    wait_until(&mut rx, |s| s.items.len() == 2).await;
    // The pump publishes before it writes the watermark.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(marks.get("7").unwrap(), parse_timestamp(&t(8)));
}

#[tokio::test]
async fn test_watermarks_bound_after_activate() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::open(dir.path()).unwrap();
    let feed = ManualHandle::default();
    let view = LiveView::new(
        Channel::Conversation(Id::Int(7)),
        FakeBackend::new(json!([msg(1, 1, 2)])),
        me(),
        Box::new(ManualFeed {
            handle: feed.clone(),
        }),
    );
    view.activate().await.unwrap();
    let view = view.with_watermarks(ReadWatermarks::new(store.clone()));

    let mut rx = view.subscribe();
    feed.push(FeedEvent::Batch(json!([msg(2, 9, 2)])));
    wait_until(&mut rx, |s| s.items.len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let marks = ReadWatermarks::new(store.clone());
    assert_eq!(marks.get("7").unwrap(), parse_timestamp(&t(9)));
    view.close().await;
}

#[tokio::test]
async fn test_echo_before_confirmation_shows_once() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    let gate = Arc::new(Notify::new());
    h.backend.with(|s| s.gate = Some(gate.clone()));
    h.view.activate().await.unwrap();
    let mut rx = h.view.subscribe();

    let view = h.view.clone();
    let sending = tokio::spawn(async move { view.send("  hi  ").await });
    wait_until(&mut rx, |s| s.pending.len() == 1).await;
    assert_eq!(h.view.state().pending[0].content, "hi");

    // The push channel delivers the new item before the POST returns.
    h.feed.push(FeedEvent::Batch(json!([{
        "id": 100, "content": "hi", "senderId": 1, "createdAt": "2024-01-01T00:00:30Z"
    }])));
    wait_until(&mut rx, |s| s.items.len() == 2).await;

    // Still waiting on the POST: the echo has replaced the pending entry.
    let state = h.view.state();
    assert!(state.pending.is_empty());
    let shown = state.items.iter().filter(|i| i.content == "hi").count()
        + state.pending.iter().filter(|p| p.content == "hi").count();
    assert_eq!(shown, 1);

    gate.notify_one();
    let outcome = sending.await.unwrap().unwrap();
    assert!(matches!(outcome, SendOutcome::Sent(ref item) if item.id == Id::Int(100)));

    let state = h.view.state();
    assert!(state.pending.is_empty());
    let hits = state.items.iter().filter(|i| i.content == "hi").count();
    assert_eq!(hits, 1);
    assert_eq!(h.backend.created_count(), 1);
}

#[tokio::test]
async fn test_send_then_echo_shows_once() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    h.view.activate().await.unwrap();
    let marks = ReadWatermarks::new(h.store.clone());

    let outcome = h.view.send("hello").await.unwrap();
    let SendOutcome::Sent(item) = outcome else {
        panic!("send was ignored");
    };
    assert_eq!(marks.get("7").unwrap(), parse_timestamp(&t(30)));

    let mut rx = h.view.subscribe();
    h.feed.push(FeedEvent::Batch(json!([serde_json::to_value(&item).unwrap()])));
    h.feed.push(FeedEvent::Batch(json!([msg(2, 31, 2)])));
    wait_until(&mut rx, |s| s.items.len() == 3).await;
    let state = h.view.state();
    assert_eq!(ids(&state), vec![Id::Int(1), Id::Int(100), Id::Int(2)]);
    assert_eq!(h.backend.created_count(), 1);
}

#[tokio::test]
async fn test_failed_send_keeps_draft() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([]));
    h.backend
        .with(|s| s.fail_create = Some((400, "Conversation is closed".into())));
    h.view.activate().await.unwrap();

    h.view.set_draft("hello there").await;
    let err = h.view.send_draft().await.unwrap_err();
    assert!(matches!(err, SyncError::Server { status: 400, .. }));
    assert_eq!(h.view.draft().await, "hello there");

    let state = h.view.state();
    assert!(state.pending.is_empty());
    assert!(state.items.is_empty());
    assert_eq!(state.error.as_deref(), Some("Conversation is closed"));

    h.backend.with(|s| s.fail_create = None);
    let outcome = h.view.send_draft().await.unwrap();
    assert!(matches!(outcome, SendOutcome::Sent(_)));
    assert_eq!(h.view.draft().await, "");
    assert_eq!(h.view.state().error, None);
}

#[tokio::test]
async fn test_double_submit_is_suppressed() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([]));
    let gate = Arc::new(Notify::new());
    h.backend.with(|s| s.gate = Some(gate.clone()));
    h.view.activate().await.unwrap();
    let mut rx = h.view.subscribe();

    let view = h.view.clone();
    let first = tokio::spawn(async move { view.send("once").await });
    wait_until(&mut rx, |s| s.pending.len() == 1).await;

    let second = h.view.send("once").await.unwrap();
    assert_eq!(second, SendOutcome::Ignored);

    gate.notify_one();
    assert!(matches!(first.await.unwrap().unwrap(), SendOutcome::Sent(_)));
    assert_eq!(h.backend.created_count(), 1);
    assert_eq!(h.view.items().await.len(), 1);
}

#[tokio::test]
async fn test_send_validation() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([]));
    let view = Arc::try_unwrap(h.view).ok().unwrap().with_max_content_len(5);
    view.activate().await.unwrap();

    assert_eq!(view.send("   ").await.unwrap(), SendOutcome::Ignored);
    let err = view.send("far too long").await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
    assert!(view.state().error.is_some());
    assert_eq!(h.backend.created_count(), 0);
    assert!(view.state().pending.is_empty());
}

#[tokio::test]
async fn test_question_upvote_and_edit() {
    let h = harness(
        Channel::EventQuestions(Id::Int(3)),
        json!([{"id": 1, "body": "why?", "createdAt": t(1), "upvoteCount": 3}]),
    );
    h.view.activate().await.unwrap();

    h.view.upvote(&Id::Int(1)).await.unwrap();
    assert_eq!(h.view.items().await[0].upvote_count(), Some(4));

    h.view.edit(&Id::Int(1), "why not?").await.unwrap();
    assert_eq!(h.view.items().await[0].content, "why not?");

    let sent = h.view.send("next").await.unwrap();
    assert!(matches!(sent, SendOutcome::Sent(_)));
    let body = h.backend.with(|s| s.created[0].clone());
    assert_eq!(body, json!({"body": "next"}));

    h.view.delete(&Id::Int(1)).await.unwrap();
    assert_eq!(h.view.items().await.len(), 1);
}

#[tokio::test]
async fn test_upvote_needs_question_channel() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    h.view.activate().await.unwrap();
    let err = h.view.upvote(&Id::Int(1)).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn test_snapshot_failure_still_starts_feed() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([]));
    h.backend.with(|s| s.fail_fetch = true);

    let err = h.view.activate().await.unwrap_err();
    assert!(matches!(err, SyncError::Network(_)));
    let state = h.view.state();
    assert!(!state.loading);
    assert!(state.error.is_some());
    assert_eq!(h.feed.started.load(Ordering::SeqCst), 1);

    let mut rx = h.view.subscribe();
    h.feed.push(FeedEvent::Batch(json!([msg(1, 1, 2)])));
    wait_until(&mut rx, |s| s.items.len() == 1).await;
}

#[tokio::test]
async fn test_close_stops_feed_and_rejects_writes() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    h.view.activate().await.unwrap();

    h.view.close().await;
    h.view.close().await;
    assert!(h.view.is_closed());
    assert!(h.feed.stopped.load(Ordering::SeqCst));
    assert!(!h.feed.push(FeedEvent::Batch(json!([msg(2, 2, 2)]))));

    assert!(matches!(h.view.send("late").await, Err(SyncError::Closed)));
    assert!(matches!(h.view.activate().await, Err(SyncError::Closed)));
    assert_eq!(h.view.items().await.len(), 1);
}

#[tokio::test]
async fn test_response_after_close_is_discarded() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([]));
    let gate = Arc::new(Notify::new());
    h.backend.with(|s| s.gate = Some(gate.clone()));
    h.view.activate().await.unwrap();
    let mut rx = h.view.subscribe();

    let view = h.view.clone();
    let sending = tokio::spawn(async move { view.send("bye").await });
    wait_until(&mut rx, |s| s.pending.len() == 1).await;

    h.view.close().await;
    gate.notify_one();
    assert!(matches!(sending.await.unwrap(), Err(SyncError::Closed)));
    assert!(h.view.items().await.is_empty());
}

#[tokio::test]
async fn test_drop_marks_read() {
    let h = harness(Channel::Conversation(Id::Int(7)), json!([msg(1, 1, 2)]));
    h.view.activate().await.unwrap();
    let marks = ReadWatermarks::new(h.store.clone());
    let t1 = parse_timestamp(&t(1)).unwrap();
    assert_eq!(marks.get("7").unwrap(), Some(t1));

    let feed = h.feed.clone();
    drop(h.view);
    assert!(feed.stopped.load(Ordering::SeqCst));
    assert!(marks.get("7").unwrap().unwrap() > t1);
}

#[tokio::test]
async fn test_directory_clears_after_viewing() {
    let h = harness(
        Channel::Conversation(Id::Int(42)),
        json!([msg(1, 5, 2), msg(2, 9, 2)]),
    );
    h.backend.with(|s| {
        s.directory = json!([{
            "id": 42,
            "otherParticipant": {"id": 2},
            "lastMessage": {"timestamp": t(9), "senderId": 2}
        }])
    });
    let marks = ReadWatermarks::new(h.store.clone());
    marks.advance("42", parse_timestamp(&t(5)).unwrap()).unwrap();

    let poller = DirectoryPoller::new(
        h.backend.clone(),
        &me(),
        h.store.clone(),
        Duration::from_secs(5),
    );
    assert!(poller.poll_once().await.unwrap()[0].unread);

    h.view.activate().await.unwrap();
    h.view.close().await;

    assert!(!poller.poll_once().await.unwrap()[0].unread);
}
