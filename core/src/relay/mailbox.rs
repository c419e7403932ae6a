//! Provider mailbox: holds delivered payloads until the recipient pulls them

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

use super::protocol::PULL_ENTRY_OVERHEAD;

/// Mailbox configuration
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// Maximum payloads queued per recipient
    pub max_stored_per_recipient: usize,
    /// Payloads older than this are swept by `cleanup_expired`
    pub ttl: Duration,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_stored_per_recipient: 10_000,
            ttl: Duration::from_secs(24 * 3600), // 24 hours
        }
    }
}

impl MailboxConfig {
    pub fn validate(&self) -> Result<(), MailboxError> {
        if self.max_stored_per_recipient == 0 {
            return Err(MailboxError::InvalidConfig(
                "max_stored_per_recipient must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MailboxError {
    #[error("Mailbox full for recipient {0}")]
    Full(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// A queued payload
#[derive(Debug, Clone)]
pub struct MailboxEntry {
    pub recipient_id: String,
    pub payload: Vec<u8>,
    pub enqueued_at: Instant,
}

/// Statistics about mailbox operations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxStats {
    /// Payloads currently queued
    pub stored: usize,
    /// Payloads handed out by `retrieve`
    pub delivered: u64,
    /// Deposits refused because a recipient queue was full
    pub rejected: u64,
    /// Payloads removed by the TTL sweep
    pub expired: u64,
}

pub struct Mailbox {
    config: MailboxConfig,
    /// recipient_id -> queued entries, oldest first
    storage: RwLock<HashMap<String, VecDeque<MailboxEntry>>>,
    stats: RwLock<MailboxStats>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::with_config(MailboxConfig::default())
    }

    pub fn with_config(config: MailboxConfig) -> Self {
        Self {
            config,
            storage: RwLock::new(HashMap::new()),
            stats: RwLock::new(MailboxStats::default()),
        }
    }

    /// Queue `payload` for `recipient_id`
    pub fn deposit(&self, recipient_id: &str, payload: Vec<u8>) -> Result<(), MailboxError> {
        let mut storage = self.storage.write();
        let queue = storage.entry(recipient_id.to_string()).or_default();

        if queue.len() >= self.config.max_stored_per_recipient {
            self.stats.write().rejected += 1;
            return Err(MailboxError::Full(recipient_id.to_string()));
        }

        queue.push_back(MailboxEntry {
            recipient_id: recipient_id.to_string(),
            payload,
            enqueued_at: Instant::now(),
        });
        self.stats.write().stored += 1;
        Ok(())
    }

    /// Remove and return everything queued for `recipient_id`
    pub fn retrieve(&self, recipient_id: &str) -> Vec<Vec<u8>> {
        let entries = self.storage.write().remove(recipient_id).unwrap_or_default();

        let mut stats = self.stats.write();
        stats.stored -= entries.len();
        stats.delivered += entries.len() as u64;

        entries.into_iter().map(|entry| entry.payload).collect()
    }

    /// Remove and return the oldest payloads for `recipient_id` that fit in
    /// `max_bytes`, charging each its length plus `PULL_ENTRY_OVERHEAD`.
    /// The rest stay queued; the second value is how many remain.
    ///
    /// A first entry larger than the budget is still handed out on its own.
    pub fn retrieve_batch(&self, recipient_id: &str, max_bytes: usize) -> (Vec<Vec<u8>>, usize) {
        let mut storage = self.storage.write();
        let Some(queue) = storage.get_mut(recipient_id) else {
            return (Vec::new(), 0);
        };

        let mut payloads = Vec::new();
        let mut used = 0;
        while let Some(cost) = queue.front().map(|e| e.payload.len() + PULL_ENTRY_OVERHEAD) {
            if !payloads.is_empty() && used + cost > max_bytes {
                break;
            }
            used += cost;
            if let Some(entry) = queue.pop_front() {
                payloads.push(entry.payload);
            }
        }

        let remaining = queue.len();
        if remaining == 0 {
            storage.remove(recipient_id);
        }
        drop(storage);

        let mut stats = self.stats.write();
        stats.stored -= payloads.len();
        stats.delivered += payloads.len() as u64;
        (payloads, remaining)
    }

    /// Number of payloads queued for `recipient_id`
    pub fn pending_for(&self, recipient_id: &str) -> usize {
        self.storage.read().get(recipient_id).map_or(0, |q| q.len())
    }

    /// Drop payloads older than the configured TTL; returns how many were removed
    pub fn cleanup_expired(&self) -> usize {
        let ttl = self.config.ttl;
        let mut storage = self.storage.write();

        let mut removed = 0;
        for queue in storage.values_mut() {
            let before = queue.len();
            queue.retain(|entry| entry.enqueued_at.elapsed() < ttl);
            removed += before - queue.len();
        }
        storage.retain(|_, queue| !queue.is_empty());

        let mut stats = self.stats.write();
        stats.stored -= removed;
        stats.expired += removed as u64;
        removed
    }

    pub fn stats(&self) -> MailboxStats {
        self.stats.read().clone()
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
