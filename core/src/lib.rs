/// chatsync - client-side real-time sync engine
///
/// Keeps conversation and Q&A views consistent with a REST backend: snapshot
/// load, push or poll feeds, order-preserving merge with de-duplication,
/// optimistic sends and per-conversation read watermarks.

pub mod error;
pub mod config;
pub mod model;
pub mod normalize;
pub mod merge;
pub mod local_store;
pub mod identity;
pub mod watermark;
pub mod routes;
pub mod rest;
pub mod feed;
pub mod view;
pub mod directory;
pub mod cli_app;

pub use error::{Result, SyncError};
pub use config::{Config, FeedMode, ReconnectPolicy};
pub use model::{Id, Item};
pub use merge::MergeEngine;
pub use rest::{Backend, RestClient};
pub use routes::Channel;
pub use view::{LiveView, SendOutcome, ViewState};
pub use directory::{DirectoryEntry, DirectoryPoller};
