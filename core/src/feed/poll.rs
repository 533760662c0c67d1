/// Pull strategy: re-fetch the snapshot window on a fixed interval
use super::{FeedEvent, FeedSender, IncrementalFeed};
use crate::error::Result;
use crate::rest::Backend;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

pub struct PollFeed<B: Backend> {
    backend: B,
    path: String,
    every: Duration,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl<B: Backend> PollFeed<B> {
    pub fn new(backend: B, path: impl Into<String>, every: Duration) -> Self {
        Self {
            backend,
            path: path.into(),
            every,
            shutdown: None,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

impl<B: Backend> IncrementalFeed for PollFeed<B> {
    fn start(&mut self, events: FeedSender) -> Result<()> {
        self.stop();

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let backend = self.backend.clone();
        let path = self.path.clone();
        let every = self.every;

        info!("Polling {} every {:?}", path, every);
        let task = tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                // The first tick completes immediately.
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let fetched = tokio::select! {
                    r = backend.fetch(&path) => r,
                    _ = shutdown_rx.changed() => break,
                };

                match fetched {
                    Ok(raw) => {
                        if events.send(FeedEvent::Batch(raw)).is_err() {
                            debug!("Poll receiver dropped, stopping {}", path);
                            break;
                        }
                    }
                    Err(e) => warn!("Poll of {} failed: {}", path, e),
                }
            }
            debug!("Poll loop for {} ended", path);
        });

        self.shutdown = Some(shutdown_tx);
        self.task = Some(task);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn name(&self) -> &'static str {
        "poll"
    }
}

impl<B: Backend> Drop for PollFeed<B> {
    fn drop(&mut self) {
        self.stop();
    }
}
