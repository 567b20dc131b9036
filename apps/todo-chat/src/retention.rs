//! Chat history persistence and expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::ChatError;
use crate::messages::{format_timestamp, ChatMessage, MessageKey, KEY_PREFIX};
use crate::storage::SharedStore;

const SWEEP_BATCH: usize = 100;

/// What `recent` does with entries it finds expired or unreadable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ExpiredEntryPolicy {
    /// Leave them for the sweeper.
    #[default]
    Skip,
    /// Delete them on read.
    Delete,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub window: usize,
    pub horizon: chrono::Duration,
    pub sweep_interval: Duration,
    pub expired_entries: ExpiredEntryPolicy,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window: 50,
            horizon: chrono::Duration::minutes(30),
            sweep_interval: Duration::from_secs(60),
            expired_entries: ExpiredEntryPolicy::Skip,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: usize,
    pub malformed: usize,
}

#[derive(Clone)]
pub struct RetentionPolicy {
    store: SharedStore,
    clock: Arc<dyn Clock>,
    config: RetentionConfig,
}

impl RetentionPolicy {
    pub fn new(store: SharedStore, config: RetentionConfig) -> Self {
        Self::with_clock(store, Arc::new(SystemClock), config)
    }

    pub fn with_clock(store: SharedStore, clock: Arc<dyn Clock>, config: RetentionConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Stamp and persist a message under `chat:{room_id}:{timestamp}`.
    ///
    /// Two messages in one room stamped with the same microsecond share a key;
    /// the later write wins.
    pub async fn record(
        &self,
        room_id: &str,
        fields: Map<String, Value>,
    ) -> Result<ChatMessage, ChatError> {
        let message = ChatMessage::new(fields, format_timestamp(self.clock.now()));
        let key = MessageKey::new(room_id, message.timestamp.clone()).to_string();
        let value = serde_json::to_string(&message)?;
        self.store.set(&key, &value).await?;
        debug!(room_id = %room_id, key = %key, "recorded chat message");
        Ok(message)
    }

    /// The last `window` messages of a room that are still inside the
    /// retention horizon, oldest first.
    pub async fn recent(&self, room_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let prefix = MessageKey::room_prefix(room_id);
        let mut keys: Vec<String> = self
            .store
            .keys(&prefix)
            .await?
            .into_iter()
            .filter(|key| MessageKey::parse(key).is_some_and(|parsed| parsed.room_id == room_id))
            .collect();
        keys.sort_unstable();
        let keys = keys.split_off(keys.len().saturating_sub(self.config.window));

        let values = self.store.get_many(&keys).await?;
        let cutoff = self.cutoff();
        let mut messages = Vec::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(raw) = value else {
                continue;
            };
            match decode_entry(&raw) {
                Some((message, sent_at)) if sent_at >= cutoff => messages.push(message),
                Some(_) => self.discard_on_read(key, "expired").await,
                None => self.discard_on_read(key, "malformed").await,
            }
        }
        Ok(messages)
    }

    /// Delete every chat entry older than the horizon or unreadable.
    pub async fn sweep(&self) -> Result<SweepReport, ChatError> {
        let keys = self.store.keys(KEY_PREFIX).await?;
        let cutoff = self.cutoff();
        let mut report = SweepReport::default();

        for chunk in keys.chunks(SWEEP_BATCH) {
            let values = self.store.get_many(chunk).await?;
            for (key, value) in chunk.iter().zip(values) {
                report.scanned += 1;
                let Some(raw) = value else {
                    continue;
                };
                let expired = match decode_entry(&raw) {
                    Some((_, sent_at)) => sent_at < cutoff,
                    None => {
                        report.malformed += 1;
                        true
                    }
                };
                if expired {
                    self.store.delete(key).await?;
                    report.deleted += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `cancel` fires.
    /// A failed pass is logged and retried on the next tick.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let policy = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(policy.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match policy.sweep().await {
                    Ok(report) => {
                        counter!("todo_chat_sweep_deleted_total").increment(report.deleted as u64);
                        if report.deleted > 0 {
                            info!(
                                scanned = report.scanned,
                                deleted = report.deleted,
                                malformed = report.malformed,
                                "retention sweep removed expired messages"
                            );
                        }
                    }
                    Err(err) => {
                        counter!("todo_chat_sweep_failures_total", "reason" => err.metric_label())
                            .increment(1);
                        warn!(error = %err, "retention sweep failed; retrying next tick");
                    }
                }
            }
            info!("retention sweeper stopped");
        })
    }

    /// Oldest timestamp still inside the horizon. A horizon reaching past the
    /// representable range keeps everything.
    fn cutoff(&self) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_sub_signed(self.config.horizon)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    async fn discard_on_read(&self, key: &str, reason: &'static str) {
        if self.config.expired_entries != ExpiredEntryPolicy::Delete {
            return;
        }
        match self.store.delete(key).await {
            Ok(()) => debug!(key = %key, reason, "deleted stale chat entry on read"),
            Err(err) => warn!(key = %key, reason, error = %err, "failed to delete stale chat entry"),
        }
    }
}

fn decode_entry(raw: &str) -> Option<(ChatMessage, DateTime<Utc>)> {
    let message: ChatMessage = serde_json::from_str(raw).ok()?;
    let sent_at = message.sent_at()?;
    Some((message, sent_at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{InMemoryStore, KeyValueStore};
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(fields) => fields,
            other => panic!("expected object, got {other}"),
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn policy_with(
        config: RetentionConfig,
    ) -> (RetentionPolicy, Arc<InMemoryStore>, Arc<ManualClock>) {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let policy = RetentionPolicy::with_clock(store.clone(), clock.clone(), config);
        (policy, store, clock)
    }

    fn policy() -> (RetentionPolicy, Arc<InMemoryStore>, Arc<ManualClock>) {
        policy_with(RetentionConfig::default())
    }

    #[tokio::test]
    async fn recorded_message_is_returned_with_timestamp() {
        let (policy, _store, _clock) = policy();
        let recorded = policy
            .record("r1", payload(json!({"username": "ann", "content": "hi"})))
            .await
            .unwrap();
        assert_eq!(recorded.timestamp, "2024-05-01T12:00:00.000000Z");

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent, vec![recorded]);
        assert_eq!(
            serde_json::to_value(&recent[0]).unwrap(),
            json!({
                "username": "ann",
                "content": "hi",
                "timestamp": "2024-05-01T12:00:00.000000Z"
            })
        );
    }

    #[tokio::test]
    async fn recent_returns_last_window_in_order() {
        let (policy, _store, clock) = policy();
        for i in 0..51 {
            policy.record("r1", payload(json!({ "n": i }))).await.unwrap();
            clock.advance(chrono::Duration::milliseconds(10));
        }

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent.len(), 50);
        let seq: Vec<i64> = recent
            .iter()
            .map(|m| m.fields["n"].as_i64().unwrap())
            .collect();
        assert_eq!(seq, (1..51).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn messages_past_the_horizon_are_excluded() {
        let (policy, _store, clock) = policy();
        policy.record("r1", payload(json!({"text": "old"}))).await.unwrap();
        clock.advance(chrono::Duration::minutes(31));
        policy.record("r1", payload(json!({"text": "new"}))).await.unwrap();

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fields["text"], json!("new"));
    }

    #[tokio::test]
    async fn same_timestamp_in_one_room_overwrites() {
        let (policy, store, _clock) = policy();
        policy.record("r1", payload(json!({"text": "first"}))).await.unwrap();
        policy.record("r1", payload(json!({"text": "second"}))).await.unwrap();

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fields["text"], json!("second"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn rooms_sharing_a_prefix_stay_separate() {
        let (policy, _store, clock) = policy();
        policy.record("a", payload(json!({"text": "in a"}))).await.unwrap();
        clock.advance(chrono::Duration::seconds(1));
        policy.record("a:b", payload(json!({"text": "in a:b"}))).await.unwrap();

        let recent = policy.recent("a").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].fields["text"], json!("in a"));
        assert_eq!(policy.recent("a:b").await.unwrap().len(), 1);
        assert!(policy.recent("*").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped_by_default() {
        let (policy, store, _clock) = policy();
        let key = MessageKey::new("r1", "2024-05-01T11:59:00.000000Z").to_string();
        store.set(&key, "{not json").await.unwrap();
        policy.record("r1", payload(json!({"text": "ok"}))).await.unwrap();

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn delete_policy_removes_stale_entries_on_read() {
        let config = RetentionConfig {
            expired_entries: ExpiredEntryPolicy::Delete,
            ..RetentionConfig::default()
        };
        let (policy, store, clock) = policy_with(config);
        let malformed = MessageKey::new("r1", "2024-05-01T11:59:00.000000Z").to_string();
        store.set(&malformed, r#"{"text":"no timestamp"}"#).await.unwrap();
        policy.record("r1", payload(json!({"text": "old"}))).await.unwrap();
        clock.advance(chrono::Duration::minutes(45));
        policy.record("r1", payload(json!({"text": "new"}))).await.unwrap();

        let recent = policy.recent("r1").await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(store.len().await, 1);
        assert!(!store.exists(&malformed).await.unwrap());
    }

    #[tokio::test]
    async fn sweep_deletes_old_and_unreadable_entries() {
        let (policy, store, clock) = policy();
        policy.record("r1", payload(json!({"text": "old"}))).await.unwrap();
        policy.record("r2", payload(json!({"text": "old"}))).await.unwrap();
        store
            .set("chat:r1:2024-05-01T12:00:00.123456", "legacy")
            .await
            .unwrap();
        clock.advance(chrono::Duration::minutes(31));
        policy.record("r1", payload(json!({"text": "fresh"}))).await.unwrap();
        store.set("todo:1", "untouched").await.unwrap();

        let report = policy.sweep().await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                scanned: 4,
                deleted: 3,
                malformed: 1
            }
        );
        assert_eq!(store.keys(KEY_PREFIX).await.unwrap().len(), 1);
        assert!(store.exists("todo:1").await.unwrap());
    }

    #[tokio::test]
    async fn horizon_beyond_calendar_range_keeps_everything() {
        let config = RetentionConfig {
            horizon: chrono::Duration::seconds(9_000_000_000_000),
            ..RetentionConfig::default()
        };
        let (policy, _store, clock) = policy_with(config);
        policy.record("r1", payload(json!({"text": "ancient"}))).await.unwrap();
        clock.advance(chrono::Duration::days(365));
        policy.record("r1", payload(json!({"text": "recent"}))).await.unwrap();

        assert_eq!(policy.recent("r1").await.unwrap().len(), 2);
        assert_eq!(policy.sweep().await.unwrap().deleted, 0);
    }

    #[tokio::test]
    async fn store_outage_surfaces_as_store_unavailable() {
        let (policy, store, _clock) = policy();
        store.set_available(false);
        let err = policy
            .record("r1", payload(json!({"text": "hi"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::StoreUnavailable(_)));
        assert!(matches!(
            policy.recent("r1").await.unwrap_err(),
            ChatError::StoreUnavailable(_)
        ));
        assert!(policy.sweep().await.is_err());
    }

    #[tokio::test]
    async fn sweeper_survives_failed_passes() {
        let config = RetentionConfig {
            sweep_interval: Duration::from_millis(20),
            ..RetentionConfig::default()
        };
        let (policy, store, clock) = policy_with(config);
        policy.record("r1", payload(json!({"text": "old"}))).await.unwrap();
        clock.advance(chrono::Duration::hours(1));
        store.set_available(false);

        let cancel = CancellationToken::new();
        let sweeper = policy.spawn_sweeper(cancel.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!sweeper.is_finished());

        store.set_available(true);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.len().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweeper never recovered");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), sweeper)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
