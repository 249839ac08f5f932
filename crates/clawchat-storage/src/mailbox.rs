//! Durable mailbox: a JSON array of messages with single-writer,
//! rewrite-on-mutation persistence.
//!
//! Every mutation holds the lock, applies the change, and rewrites
//! the file (temp file + rename) before returning, so a crash after a
//! successful `send` leaves the outbox entry on disk. A write failure
//! is retried briefly and then surfaces as [`ClawchatError::Storage`]
//! — the gateway treats that as fatal for mailboxes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use clawchat_types::{ClawchatError, Message, MessageId, MessageStatus, Result, Timestamp};

/// Rewrite attempts before giving up on a mailbox write.
const WRITE_RETRIES: usize = 3;

/// Pause between rewrite attempts.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

/// One identity's inbox or outbox.
pub struct Mailbox {
    path: PathBuf,
    inner: Mutex<Vec<Message>>,
}

impl Mailbox {
    /// Opens a mailbox file, creating an empty one in memory when the
    /// file does not exist yet. Entries are accepted in any order.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<Vec<Message>>(&bytes).map_err(|e| {
                    ClawchatError::Storage {
                        reason: format!("malformed mailbox '{}': {e}", path.display()),
                    }
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(ClawchatError::Storage {
                    reason: format!("failed to read mailbox '{}': {e}", path.display()),
                });
            }
        };
        Ok(Self {
            path,
            inner: Mutex::new(entries),
        })
    }

    /// Appends a message unless its id is already present.
    ///
    /// Returns `true` when the message was inserted, `false` for a
    /// duplicate id (the file is left untouched).
    pub fn insert(&self, message: Message) -> Result<bool> {
        let mut entries = self.lock()?;
        if entries.iter().any(|m| m.id == message.id) {
            tracing::debug!(id = %message.id, "duplicate message id ignored");
            return Ok(false);
        }
        entries.push(message);
        self.persist(&entries)?;
        Ok(true)
    }

    /// Updates the status of one message by id.
    pub fn update_status(&self, id: &MessageId, status: MessageStatus) -> Result<()> {
        let mut entries = self.lock()?;
        let entry = entries
            .iter_mut()
            .find(|m| &m.id == id)
            .ok_or_else(|| ClawchatError::NotFound {
                what: format!("message {id}"),
            })?;
        entry.status = status;
        self.persist(&entries)
    }

    /// Whether a message id exists in this mailbox.
    pub fn contains(&self, id: &MessageId) -> Result<bool> {
        Ok(self.lock()?.iter().any(|m| &m.id == id))
    }

    /// Full snapshot, in stored order.
    pub fn snapshot(&self) -> Result<Vec<Message>> {
        Ok(self.lock()?.clone())
    }

    /// Entries with status `pending`, in stored order.
    pub fn pending(&self) -> Result<Vec<Message>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|m| m.status == MessageStatus::Pending)
            .cloned()
            .collect())
    }

    /// Entries strictly newer than `since`.
    pub fn newer_than(&self, since: Timestamp) -> Result<Vec<Message>> {
        Ok(self
            .lock()?
            .iter()
            .filter(|m| m.timestamp > since)
            .cloned()
            .collect())
    }

    /// Number of stored messages.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Whether the mailbox is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    // -- Internal ----------------------------------------------------------

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Message>>> {
        self.inner.lock().map_err(|e| ClawchatError::Storage {
            reason: format!("mailbox lock poisoned: {e}"),
        })
    }

    /// Full-file rewrite via temp file + rename, with a short retry.
    fn persist(&self, entries: &[Message]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries).map_err(|e| ClawchatError::Storage {
            reason: format!("failed to serialize mailbox: {e}"),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        let mut last_err = None;
        for attempt in 0..WRITE_RETRIES {
            if attempt > 0 {
                std::thread::sleep(WRITE_RETRY_DELAY);
            }
            let result = std::fs::write(&tmp, &json)
                .and_then(|()| std::fs::rename(&tmp, &self.path));
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "mailbox write failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(ClawchatError::Storage {
            reason: format!(
                "mailbox write to '{}' failed after {WRITE_RETRIES} attempts: {}",
                self.path.display(),
                last_err.map(|e| e.to_string()).unwrap_or_default()
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clawchat_types::Principal;

    fn message(id_byte: u8, ts: i64, status: MessageStatus) -> Message {
        Message {
            id: MessageId::new([id_byte; 16]),
            from: Principal::local_from_public_key(&[0x01; 32]),
            from_nick: None,
            to: Principal::local_from_public_key(&[0x02; 32]),
            content: "hello".into(),
            timestamp: Timestamp::from_millis(ts),
            status,
        }
    }

    #[test]
    fn insert_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("outbox.json");

        let mailbox = Mailbox::open(&path)?;
        assert!(mailbox.insert(message(1, 10, MessageStatus::Pending))?);
        drop(mailbox);

        let reopened = Mailbox::open(&path)?;
        let entries = reopened.snapshot()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, MessageStatus::Pending);
        Ok(())
    }

    #[test]
    fn duplicate_id_is_dropped() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let mailbox = Mailbox::open(dir.path().join("inbox.json"))?;

        assert!(mailbox.insert(message(7, 10, MessageStatus::Delivered))?);
        assert!(!mailbox.insert(message(7, 99, MessageStatus::Delivered))?);
        assert_eq!(mailbox.len()?, 1);
        // The original entry is untouched.
        assert_eq!(mailbox.snapshot()?[0].timestamp, Timestamp::from_millis(10));
        Ok(())
    }

    #[test]
    fn update_status_persists() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("outbox.json");
        let mailbox = Mailbox::open(&path)?;
        let msg = message(3, 10, MessageStatus::Pending);
        let id = msg.id;
        mailbox.insert(msg)?;

        mailbox.update_status(&id, MessageStatus::Sent)?;
        drop(mailbox);

        let reopened = Mailbox::open(&path)?;
        assert_eq!(reopened.snapshot()?[0].status, MessageStatus::Sent);
        assert!(reopened.pending()?.is_empty());
        Ok(())
    }

    #[test]
    fn update_unknown_id_is_not_found() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let mailbox = Mailbox::open(dir.path().join("outbox.json"))?;
        let result = mailbox.update_status(&MessageId::new([9; 16]), MessageStatus::Sent);
        assert!(matches!(result, Err(ClawchatError::NotFound { .. })));
        Ok(())
    }

    #[test]
    fn newer_than_filters_strictly() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let mailbox = Mailbox::open(dir.path().join("inbox.json"))?;
        mailbox.insert(message(1, 100, MessageStatus::Delivered))?;
        mailbox.insert(message(2, 200, MessageStatus::Delivered))?;

        let newer = mailbox.newer_than(Timestamp::from_millis(100))?;
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, MessageId::new([2; 16]));
        Ok(())
    }

    #[test]
    fn tolerates_arbitrary_order_on_read() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inbox.json");
        // Timestamps deliberately descending.
        let entries = vec![
            message(1, 300, MessageStatus::Delivered),
            message(2, 100, MessageStatus::Delivered),
            message(3, 200, MessageStatus::Delivered),
        ];
        std::fs::write(&path, serde_json::to_vec(&entries).expect("serialize"))
            .expect("write");

        let mailbox = Mailbox::open(&path)?;
        assert_eq!(mailbox.len()?, 3);
        assert_eq!(mailbox.newer_than(Timestamp::from_millis(150))?.len(), 2);
        Ok(())
    }

    #[test]
    fn malformed_file_is_storage_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inbox.json");
        std::fs::write(&path, b"{not json").expect("write");
        assert!(matches!(
            Mailbox::open(&path),
            Err(ClawchatError::Storage { .. })
        ));
    }
}
