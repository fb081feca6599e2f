//! Append-only per-channel message log on top of [`Database`].
//!
//! Each channel has its own append lock guarding a cached tail
//! (last sequence and timestamp). Appends to one channel are linearized;
//! appends to different channels only meet on the short SQLite insert.
//! Idle channels can be evicted from the cache and reload from disk.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use pairline_types::models::Message;
use pairline_types::{ChannelId, ChatError, Result};

use crate::Database;
use crate::models::MessageRow;

/// Rows fetched per round trip by [`Backfill`].
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, Default)]
struct Tail {
    sequence: u64,
    timestamp_ms: i64,
}

/// Per-channel append slot. `None` until the tail is loaded from disk.
type TailSlot = Arc<Mutex<Option<Tail>>>;

#[derive(Clone)]
pub struct MessageStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Arc<Database>,
    tails: Mutex<HashMap<ChannelId, TailSlot>>,
    page_size: u32,
}

impl MessageStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_page_size(db, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(db: Arc<Database>, page_size: u32) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                db,
                tails: Mutex::new(HashMap::new()),
                page_size: page_size.max(1),
            }),
        }
    }

    /// Append `text` from `sender_id`. Returns once the row is committed.
    pub fn append(&self, channel_id: &ChannelId, sender_id: &str, text: &str) -> Result<Message> {
        self.append_then(channel_id, sender_id, text, |_| {})
    }

    /// Append, then run `after_commit` while still holding the channel's append
    /// lock, so whatever it does observes messages in commit order.
    pub fn append_then<F>(
        &self,
        channel_id: &ChannelId,
        sender_id: &str,
        text: &str,
        after_commit: F,
    ) -> Result<Message>
    where
        F: FnOnce(&Message),
    {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let receiver_id = channel_id
            .counterpart(sender_id)
            .ok_or_else(|| ChatError::UnauthorizedSender {
                channel_id: channel_id.to_string(),
                sender_id: sender_id.to_string(),
            })?;

        let slot = self.slot(channel_id)?;
        let mut guard = slot.lock().map_err(|_| poisoned(channel_id))?;
        let tail = match *guard {
            Some(tail) => tail,
            None => self.load_tail(channel_id)?,
        };

        // Clock may step backwards; the log may not.
        let timestamp_ms = Utc::now().timestamp_millis().max(tail.timestamp_ms);
        let sequence = tail.sequence + 1;

        let row = MessageRow {
            channel_id: channel_id.to_string(),
            sequence: sequence as i64,
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            text: text.to_string(),
            server_ts: timestamp_ms,
        };

        if let Err(e) = self.inner.db.insert_message(&row) {
            warn!("Append to {} failed at sequence {}: {}", channel_id, sequence, e);
            // Leave the cached tail untouched so the sequence does not advance
            *guard = Some(tail);
            return Err(ChatError::unavailable(e));
        }

        *guard = Some(Tail {
            sequence,
            timestamp_ms,
        });

        let message = row_to_message(channel_id, row)?;
        debug!("{} committed #{} from {}", channel_id, sequence, sender_id);

        after_commit(&message);
        Ok(message)
    }

    /// Run `f` with the channel's current tail sequence while holding the
    /// append lock. No append can commit on this channel until `f` returns.
    pub fn with_tail<F, T>(&self, channel_id: &ChannelId, f: F) -> Result<T>
    where
        F: FnOnce(u64) -> T,
    {
        let slot = self.slot(channel_id)?;
        let mut guard = slot.lock().map_err(|_| poisoned(channel_id))?;
        let tail = match *guard {
            Some(tail) => tail,
            None => {
                let tail = self.load_tail(channel_id)?;
                *guard = Some(tail);
                tail
            }
        };
        Ok(f(tail.sequence))
    }

    /// Last committed sequence on the channel, 0 when empty. Goes through the
    /// append lock only for channels already cached, and never adds one.
    pub fn tail(&self, channel_id: &ChannelId) -> Result<u64> {
        let cached = self
            .inner
            .tails
            .lock()
            .map_err(|_| poisoned(channel_id))?
            .get(channel_id)
            .cloned();
        match cached {
            Some(_) => self.with_tail(channel_id, |sequence| sequence),
            None => Ok(self.load_tail(channel_id)?.sequence),
        }
    }

    /// Forget the cached tail of `channel_id` unless someone is using its append
    /// slot right now. Returns whether an entry was removed.
    pub fn evict_idle(&self, channel_id: &ChannelId) -> bool {
        let Ok(mut tails) = self.inner.tails.lock() else {
            return false;
        };
        // Slots are only cloned under this lock, so a count of one means idle
        let idle = tails
            .get(channel_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            tails.remove(channel_id);
            debug!("Evicted cached tail of {}", channel_id);
        }
        idle
    }

    /// Channels with a cached tail.
    pub fn cached_channels(&self) -> usize {
        self.inner
            .tails
            .lock()
            .map(|tails| tails.len())
            .unwrap_or_default()
    }

    /// Everything after `after_sequence`, ascending. Lazy: nothing is read until
    /// the first `next()`, which also fixes the upper bound at the tail of that moment.
    pub fn read_from(&self, channel_id: &ChannelId, after_sequence: u64) -> Backfill {
        Backfill::new(self.clone(), channel_id.clone(), after_sequence, None)
    }

    pub fn read_all(&self, channel_id: &ChannelId) -> Backfill {
        self.read_from(channel_id, 0)
    }

    /// Messages with `after_sequence < sequence <= until_sequence`.
    pub fn read_between(
        &self,
        channel_id: &ChannelId,
        after_sequence: u64,
        until_sequence: u64,
    ) -> Backfill {
        Backfill::new(
            self.clone(),
            channel_id.clone(),
            after_sequence,
            Some(until_sequence),
        )
    }

    /// One bounded page, for paginated history endpoints.
    pub fn read_page(
        &self,
        channel_id: &ChannelId,
        after_sequence: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.fetch(channel_id, after_sequence, u64::MAX, limit)
    }

    fn fetch(
        &self,
        channel_id: &ChannelId,
        after: u64,
        until: u64,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let until = i64::try_from(until).unwrap_or(i64::MAX);
        let after = i64::try_from(after).unwrap_or(i64::MAX);
        self.inner
            .db
            .get_messages_between(channel_id.as_str(), after, until, limit)
            .map_err(ChatError::unavailable)?
            .into_iter()
            .map(|row| row_to_message(channel_id, row))
            .collect()
    }

    fn slot(&self, channel_id: &ChannelId) -> Result<TailSlot> {
        let mut tails = self
            .inner
            .tails
            .lock()
            .map_err(|_| poisoned(channel_id))?;
        Ok(tails.entry(channel_id.clone()).or_default().clone())
    }

    fn load_tail(&self, channel_id: &ChannelId) -> Result<Tail> {
        let tail = self
            .inner
            .db
            .get_channel_tail(channel_id.as_str())
            .map_err(ChatError::unavailable)?
            .map(|(sequence, timestamp_ms)| Tail {
                sequence: sequence as u64,
                timestamp_ms,
            })
            .unwrap_or_default();
        debug!("Loaded tail of {} at #{}", channel_id, tail.sequence);
        Ok(tail)
    }
}

fn poisoned(channel_id: &ChannelId) -> ChatError {
    ChatError::ChannelUnavailable(format!("append lock for {} poisoned", channel_id))
}

fn row_to_message(channel_id: &ChannelId, row: MessageRow) -> Result<Message> {
    let server_timestamp: DateTime<Utc> = DateTime::from_timestamp_millis(row.server_ts)
        .ok_or_else(|| {
            ChatError::ChannelUnavailable(format!(
                "corrupt timestamp {} at {}#{}",
                row.server_ts, channel_id, row.sequence
            ))
        })?;

    Ok(Message {
        channel_id: channel_id.clone(),
        sequence: row.sequence as u64,
        sender_id: row.sender_id,
        receiver_id: row.receiver_id,
        text: row.text,
        server_timestamp,
    })
}

/// Lazy, finite, restartable read over one channel's log.
///
/// Pages through the database `page_size` rows at a time. Cloning or calling
/// [`Backfill::restart`] replays the same range from the beginning.
#[derive(Clone)]
pub struct Backfill {
    store: MessageStore,
    channel_id: ChannelId,
    start: u64,
    cursor: u64,
    until: Option<u64>,
    buffer: VecDeque<Message>,
    done: bool,
}

impl Backfill {
    fn new(store: MessageStore, channel_id: ChannelId, start: u64, until: Option<u64>) -> Self {
        Self {
            store,
            channel_id,
            start,
            cursor: start,
            until,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Sequence of the last message yielded (or the starting cursor).
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Rewind to the starting cursor. The upper bound, once fixed, is kept.
    pub fn restart(&mut self) {
        self.cursor = self.start;
        self.buffer.clear();
        self.done = false;
    }

    fn fill(&mut self) -> Result<()> {
        let until = match self.until {
            Some(until) => until,
            None => {
                let until = self.store.tail(&self.channel_id)?;
                self.until = Some(until);
                until
            }
        };

        if self.cursor >= until {
            self.done = true;
            return Ok(());
        }

        let page_size = self.store.inner.page_size;
        let page = self
            .store
            .fetch(&self.channel_id, self.cursor, until, page_size)?;
        if page.len() < page_size as usize {
            self.done = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for Backfill {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.done {
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let message = self.buffer.pop_front()?;
        self.cursor = message.sequence;
        Some(Ok(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairline_types::resolve_channel;

    fn store() -> MessageStore {
        MessageStore::with_page_size(Arc::new(Database::open_in_memory().unwrap()), 2)
    }

    fn channel() -> ChannelId {
        resolve_channel("u1", "u2").unwrap()
    }

    #[test]
    fn sequences_are_contiguous_and_ordered() {
        let store = store();
        let channel = channel();
        for i in 0..7 {
            let sender = if i % 2 == 0 { "u1" } else { "u2" };
            store.append(&channel, sender, &format!("m{}", i)).unwrap();
        }

        let all: Vec<Message> = store.read_all(&channel).collect::<Result<_>>().unwrap();
        let seqs: Vec<u64> = all.iter().map(|m| m.sequence).collect();
        assert_eq!(seqs, (1..=7).collect::<Vec<_>>());
        assert!(all.windows(2).all(|w| w[0].order_key() <= w[1].order_key()));
    }

    #[test]
    fn scenario_hi_yo() {
        let store = store();
        let channel = resolve_channel("u1", "u2").unwrap();
        assert_eq!(channel.as_str(), "u1_u2");

        store.append(&channel, "u1", "hi").unwrap();
        store.append(&channel, "u2", "yo").unwrap();

        let all: Vec<Message> = store.read_all(&channel).collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!((all[0].sender_id.as_str(), all[0].text.as_str(), all[0].sequence), ("u1", "hi", 1));
        assert_eq!((all[1].sender_id.as_str(), all[1].text.as_str(), all[1].sequence), ("u2", "yo", 2));
        assert_eq!(all[0].receiver_id, "u2");
        assert_eq!(all[1].receiver_id, "u1");
    }

    #[test]
    fn blank_text_does_not_advance_sequence() {
        let store = store();
        let channel = channel();
        assert_eq!(store.append(&channel, "u1", ""), Err(ChatError::EmptyMessage));
        assert_eq!(store.append(&channel, "u1", "   "), Err(ChatError::EmptyMessage));
        assert_eq!(store.append(&channel, "u1", "\n\t"), Err(ChatError::EmptyMessage));
        assert_eq!(store.tail(&channel).unwrap(), 0);

        let message = store.append(&channel, "u1", "  padded  ").unwrap();
        assert_eq!(message.sequence, 1);
        assert_eq!(message.text, "padded");
    }

    #[test]
    fn outsider_cannot_append() {
        let store = store();
        let channel = channel();
        let err = store.append(&channel, "u3", "hello").unwrap_err();
        assert!(matches!(err, ChatError::UnauthorizedSender { .. }));
        assert_eq!(store.tail(&channel).unwrap(), 0);
    }

    #[test]
    fn read_from_skips_up_to_cursor_and_is_restartable() {
        let store = store();
        let channel = channel();
        for i in 0..5 {
            store.append(&channel, "u1", &format!("m{}", i)).unwrap();
        }

        let mut backfill = store.read_from(&channel, 2);
        let first: Vec<u64> = backfill.by_ref().map(|m| m.unwrap().sequence).collect();
        assert_eq!(first, vec![3, 4, 5]);
        assert_eq!(backfill.cursor(), 5);

        backfill.restart();
        let again: Vec<u64> = backfill.map(|m| m.unwrap().sequence).collect();
        assert_eq!(again, first);
    }

    #[test]
    fn read_is_bounded_by_tail_at_first_poll() {
        let store = store();
        let channel = channel();
        store.append(&channel, "u1", "one").unwrap();
        store.append(&channel, "u1", "two").unwrap();

        let mut backfill = store.read_all(&channel);
        assert_eq!(backfill.next().unwrap().unwrap().sequence, 1);

        // Appended after the bound was fixed; not part of this read
        store.append(&channel, "u2", "three").unwrap();
        let rest: Vec<u64> = backfill.map(|m| m.unwrap().sequence).collect();
        assert_eq!(rest, vec![2]);

        let between: Vec<u64> = store
            .read_between(&channel, 1, 3)
            .map(|m| m.unwrap().sequence)
            .collect();
        assert_eq!(between, vec![2, 3]);
    }

    #[test]
    fn channels_are_independent() {
        let store = store();
        let a = resolve_channel("u1", "u2").unwrap();
        let b = resolve_channel("u1", "u3").unwrap();
        store.append(&a, "u1", "to two").unwrap();
        store.append(&b, "u1", "to three").unwrap();
        store.append(&b, "u3", "back").unwrap();

        assert_eq!(store.tail(&a).unwrap(), 1);
        assert_eq!(store.tail(&b).unwrap(), 2);
        assert_eq!(store.read_all(&a).count(), 1);
    }

    #[test]
    fn concurrent_appends_stay_contiguous() {
        let store = store();
        let channel = channel();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                let channel = channel.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let sender = if t % 2 == 0 { "u1" } else { "u2" };
                        store.append(&channel, sender, &format!("{}-{}", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let all: Vec<Message> = store.read_all(&channel).collect::<Result<_>>().unwrap();
        assert_eq!(all.len(), 200);
        for (i, message) in all.iter().enumerate() {
            assert_eq!(message.sequence, i as u64 + 1);
        }
        assert!(all.windows(2).all(|w| w[0].server_timestamp <= w[1].server_timestamp));
    }

    #[test]
    fn after_commit_runs_in_commit_order() {
        let store = store();
        let channel = channel();
        let seen = Mutex::new(Vec::new());

        for text in ["a", "b", "c"] {
            store
                .append_then(&channel, "u1", text, |m| seen.lock().unwrap().push(m.sequence))
                .unwrap();
        }
        // Rejected appends never reach the hook
        let _ = store.append_then(&channel, "u1", " ", |m| seen.lock().unwrap().push(m.sequence));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn reopened_log_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.db");
        let channel = channel();

        {
            let store = MessageStore::new(Arc::new(Database::open(&path).unwrap()));
            store.append(&channel, "u1", "hi").unwrap();
            store.append(&channel, "u2", "yo").unwrap();
        }

        let store = MessageStore::new(Arc::new(Database::open(&path).unwrap()));
        assert_eq!(store.tail(&channel).unwrap(), 2);
        let next = store.append(&channel, "u1", "back").unwrap();
        assert_eq!(next.sequence, 3);

        let texts: Vec<String> = store
            .read_all(&channel)
            .map(|m| m.unwrap().text)
            .collect();
        assert_eq!(texts, vec!["hi", "yo", "back"]);
    }

    #[test]
    fn evicted_tail_reloads_from_disk() {
        let store = store();
        let channel = channel();
        store.append(&channel, "u1", "a").unwrap();
        store.append(&channel, "u2", "b").unwrap();
        assert_eq!(store.cached_channels(), 1);

        assert!(store.evict_idle(&channel));
        assert_eq!(store.cached_channels(), 0);
        assert!(!store.evict_idle(&channel));

        // Reads do not repopulate the cache
        assert_eq!(store.tail(&channel).unwrap(), 2);
        assert_eq!(store.read_all(&channel).count(), 2);
        assert_eq!(store.cached_channels(), 0);

        let next = store.append(&channel, "u1", "c").unwrap();
        assert_eq!(next.sequence, 3);
        assert_eq!(store.cached_channels(), 1);
    }

    #[test]
    fn busy_slot_is_not_evicted() {
        let store = store();
        let channel = channel();
        let evicted = std::cell::Cell::new(true);
        store
            .append_then(&channel, "u1", "a", |_| evicted.set(store.evict_idle(&channel)))
            .unwrap();
        assert!(!evicted.get());
        assert_eq!(store.cached_channels(), 1);

        let inside = store.with_tail(&channel, |_| store.evict_idle(&channel)).unwrap();
        assert!(!inside);
        assert_eq!(store.cached_channels(), 1);
    }
}
