//! Bounded memory of recent fire execution ids

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Remembers execution ids for a fixed window
///
/// Ids seen within the window are duplicates. Entries older than the window
/// are evicted on every check, so memory is bounded by the fire rate.
#[derive(Debug)]
pub struct DedupWindow {
    window: Duration,
    /// Map of execution id to the instant it was first seen
    seen: HashMap<String, Instant>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record `execution_id`; returns `false` if it was already seen within the window
    pub fn check_and_insert(&mut self, execution_id: &str) -> bool {
        let now = Instant::now();
        self.evict_older_than(now);

        if self.seen.contains_key(execution_id) {
            return false;
        }
        self.seen.insert(execution_id.to_string(), now);
        true
    }

    /// Drop `execution_id` so a later delivery is handled again
    pub fn forget(&mut self, execution_id: &str) {
        self.seen.remove(execution_id);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn evict_older_than(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window() {
        let mut dedup = DedupWindow::new(Duration::from_secs(600));
        assert!(dedup.check_and_insert("job-42:1000"));
        assert!(!dedup.check_and_insert("job-42:1000"));
        assert!(dedup.check_and_insert("job-42:1060"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let mut dedup = DedupWindow::new(Duration::from_secs(10));
        assert!(dedup.check_and_insert("a"));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(dedup.check_and_insert("a"));
        assert_eq!(dedup.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_id_is_accepted_again() {
        let mut dedup = DedupWindow::new(Duration::from_secs(600));
        assert!(dedup.check_and_insert("job-42:1000"));
        dedup.forget("job-42:1000");
        assert!(dedup.is_empty());
        assert!(dedup.check_and_insert("job-42:1000"));
    }
}
