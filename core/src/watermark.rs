/// Read watermarks: per conversation, the newest timestamp the user has seen
use crate::error::Result;
use crate::local_store::{watermark_key, LocalStore};
use crate::model::parse_timestamp;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;

/// Monotonic per-conversation watermark, shared by every view through the local store
#[derive(Clone)]
pub struct ReadWatermarks {
    store: LocalStore,
}

impl ReadWatermarks {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Stored watermark. A value that does not parse counts as absent.
    pub fn get(&self, conversation_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(&watermark_key(conversation_id))?
            .as_deref()
            .and_then(parse_timestamp))
    }

    /// Set the watermark to `max(current, ts)` and return the stored value.
    pub fn advance(&self, conversation_id: &str, ts: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let stored = self.store.update(&watermark_key(conversation_id), |old| {
            let next = match old.and_then(parse_timestamp) {
                Some(current) if current >= ts => current,
                _ => ts,
            };
            Some(next.to_rfc3339_opts(SecondsFormat::Micros, true))
        })?;

        let value = stored.as_deref().and_then(parse_timestamp).unwrap_or(ts);
        debug!("Watermark for {} is {}", conversation_id, value);
        Ok(value)
    }

    /// Teardown: mark everything up to now as read.
    pub fn force_now(&self, conversation_id: &str) -> Result<DateTime<Utc>> {
        self.advance(conversation_id, Utc::now())
    }
}
