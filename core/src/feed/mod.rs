/// Incremental feeds: deliver new/changed items after the snapshot
pub mod poll;
pub mod push;

use crate::error::Result;
use crate::model::Id;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

pub use poll::PollFeed;
pub use push::PushFeed;

/// One delivery from a feed
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// Raw collection (array or envelope) to merge
    Batch(Value),
    /// In-place change of an existing item
    PointUpdate { id: Id, patch: Map<String, Value> },
    /// Item deleted on the server
    PointRemoval { id: Id },
}

pub type FeedSender = mpsc::UnboundedSender<FeedEvent>;

/// Push and poll strategies behind one interface so the merge and send
/// paths do not care which one is running.
pub trait IncrementalFeed: Send {
    /// Begin delivering events. Calling `start` on a running feed restarts it.
    fn start(&mut self, events: FeedSender) -> Result<()>;

    /// Stop delivering. Safe to call more than once.
    fn stop(&mut self);

    /// Short name for logs
    fn name(&self) -> &'static str;
}
