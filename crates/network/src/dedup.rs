// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2025 Danmu Console Developers. All rights reserved.
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Time-windowed duplicate suppression for inbound chat messages.
//!
//! Brokers occasionally redeliver a message around a reconnect, and some
//! chat sources simply repeat themselves. The cache fingerprints each
//! message by sender and content and suppresses repeats arriving within
//! the suppression window. A periodic sweep evicts fingerprints older
//! than the retention window so the cache stays bounded.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::Instant;

use crate::message::ChatMessage;

/// Records recently seen message fingerprints with their first-seen time.
#[derive(Debug)]
pub struct DedupCache {
    records: DashMap<String, Instant>,
    suppression: Duration,
    retention: Duration,
}

impl DedupCache {
    /// Creates a cache suppressing repeats within `suppression` and retaining
    /// fingerprints for at most `retention`.
    #[must_use]
    pub fn new(suppression: Duration, retention: Duration) -> Self {
        Self {
            records: DashMap::new(),
            suppression,
            retention,
        }
    }

    /// Computes the fingerprint for a sender/content pair.
    ///
    /// Leading and trailing whitespace is ignored so padded variants of the
    /// same message collapse to one fingerprint.
    #[must_use]
    pub fn fingerprint(sender: &str, content: &str) -> String {
        format!("{}_{}", sender.trim(), content.trim())
    }

    /// Returns `true` if `message` should be delivered to handlers.
    ///
    /// A message is suppressed when the same fingerprint was first seen
    /// within the suppression window. Suppressed hits do not refresh the
    /// window, so a steady stream of duplicates still gets one delivery
    /// per window.
    pub fn should_deliver(&self, message: &ChatMessage) -> bool {
        let key = Self::fingerprint(&message.sender, &message.content);
        let now = Instant::now();

        if let Some(seen) = self.records.get(&key) {
            if now.saturating_duration_since(*seen) < self.suppression {
                return false;
            }
        }

        self.records.insert(key, now);
        true
    }

    /// Evicts fingerprints older than the retention window.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.records
            .retain(|_, seen| now.saturating_duration_since(*seen) < self.retention);
    }

    /// Spawns the periodic sweep task for `cache`, ticking every `interval`.
    pub fn spawn_sweep_task(
        cache: Arc<Self>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // First tick resolves immediately

            loop {
                ticker.tick().await;
                cache.sweep();
                tracing::trace!(entries = cache.len(), "Dedup cache swept");
            }
        })
    }

    /// Returns the number of retained fingerprints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn cache() -> DedupCache {
        DedupCache::new(Duration::from_secs(10), Duration::from_secs(60))
    }

    #[rstest]
    fn test_fingerprint_trims_whitespace() {
        assert_eq!(
            DedupCache::fingerprint("  alice ", " hello\n"),
            "alice_hello"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_suppressed() {
        let cache = cache();
        let msg = ChatMessage::new("alice", "hello");

        assert!(cache.should_deliver(&msg));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(!cache.should_deliver(&msg));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_after_window_delivered() {
        let cache = cache();
        let msg = ChatMessage::new("alice", "hello");

        assert!(cache.should_deliver(&msg));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.should_deliver(&msg));
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppressed_hit_does_not_refresh_window() {
        let cache = cache();
        let msg = ChatMessage::new("alice", "hello");

        assert!(cache.should_deliver(&msg));
        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(!cache.should_deliver(&msg));
        // 11s after first sight; a refreshed window would still suppress
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(cache.should_deliver(&msg));
    }

    #[tokio::test(start_paused = true)]
    async fn test_padded_variant_suppressed() {
        let cache = cache();
        assert!(cache.should_deliver(&ChatMessage::new("alice", "hello")));
        assert!(!cache.should_deliver(&ChatMessage::new(" alice", "hello  ")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_messages_unaffected() {
        let cache = cache();
        assert!(cache.should_deliver(&ChatMessage::new("alice", "hello")));
        assert!(cache.should_deliver(&ChatMessage::new("bob", "hello")));
        assert!(cache.should_deliver(&ChatMessage::new("alice", "hello again")));
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_expired_fingerprints() {
        let cache = cache();
        assert!(cache.should_deliver(&ChatMessage::new("alice", "old")));
        tokio::time::advance(Duration::from_secs(55)).await;
        assert!(cache.should_deliver(&ChatMessage::new("alice", "new")));
        tokio::time::advance(Duration::from_secs(6)).await;

        // "old" is 61s stale, "new" only 6s
        cache.sweep();
        assert_eq!(cache.len(), 1);
        assert!(!cache.should_deliver(&ChatMessage::new("alice", "new")));
        assert!(cache.should_deliver(&ChatMessage::new("alice", "old")));
    }
}
