//! Pending communication-change queue.
//!
//! A communication-change request with `keep_request` set that cannot be
//! satisfied immediately is parked here. The maintenance sweep replays
//! entries in priority order (priority = 100 − 10 × priority-class; FIFO
//! among equals) and expires entries after their timeout. A duplicate
//! session id replaces the stored parameters and bumps the retry counter.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use magic_models::{ClientId, CommunicationRequest, SessionId};
use tracing::{debug, info, warn};

/// Fixed queue capacity.
pub const QUEUE_CAPACITY: usize = 64;
/// Default per-entry timeout.
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// One parked request.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    /// Session waiting for resources.
    pub session_id: SessionId,
    /// Owning client.
    pub client_id: ClientId,
    /// The request to replay.
    pub request: CommunicationRequest,
    /// Replay priority; smaller is served first.
    pub priority: u32,
    /// Enqueue time; tie-breaker among equal priorities.
    pub enqueued_at: DateTime<Utc>,
    /// Expiry deadline.
    pub expires_at: DateTime<Utc>,
    /// Times the entry was re-submitted or replayed.
    pub retry_count: u32,
}

/// Outcome of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new entry was parked.
    Added,
    /// An existing entry for the session was updated in place.
    Updated,
    /// The queue is at capacity.
    Full,
}

/// The queue.
pub struct PendingQueue {
    entries: Mutex<Vec<PendingEntry>>,
    timeout: Duration,
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(QUEUE_TIMEOUT)
    }
}

impl PendingQueue {
    /// Create a queue with the given per-entry timeout.
    pub fn new(timeout: Duration) -> Self {
        PendingQueue {
            entries: Mutex::new(Vec::new()),
            timeout,
        }
    }

    /// Priority derived from a priority class (1 = highest class ⇒ 90).
    pub fn priority_for_class(priority_class: u8) -> u32 {
        100u32.saturating_sub(10 * u32::from(priority_class))
    }

    /// Park a request, replacing an existing entry for the same session.
    pub fn enqueue(
        &self,
        session_id: &SessionId,
        client_id: &ClientId,
        request: CommunicationRequest,
        priority_class: u8,
        timeout_override: Option<Duration>,
    ) -> EnqueueOutcome {
        let now = Utc::now();
        let timeout = timeout_override.unwrap_or(self.timeout);
        let priority = Self::priority_for_class(priority_class);
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|e| e.expires_at > now);

        if let Some(existing) = entries.iter_mut().find(|e| &e.session_id == session_id) {
            existing.request = request;
            existing.priority = priority;
            existing.retry_count += 1;
            info!(session = %session_id, retries = existing.retry_count, "queue entry updated");
            return EnqueueOutcome::Updated;
        }

        if entries.len() >= QUEUE_CAPACITY {
            warn!(session = %session_id, "queue full");
            return EnqueueOutcome::Full;
        }

        entries.push(PendingEntry {
            session_id: session_id.clone(),
            client_id: client_id.clone(),
            request,
            priority,
            enqueued_at: now,
            expires_at: now
                + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::seconds(30)),
            retry_count: 0,
        });
        info!(session = %session_id, priority, "queue entry added");
        EnqueueOutcome::Added
    }

    /// Remove the entry of a session (request satisfied or stopped).
    pub fn dequeue(&self, session_id: &SessionId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| &e.session_id != session_id);
        let removed = entries.len() != before;
        if removed {
            debug!(session = %session_id, "queue entry removed");
        }
        removed
    }

    /// Drop and return expired entries.
    pub fn expire(&self, now: DateTime<Utc>) -> Vec<PendingEntry> {
        let mut entries = self.entries.lock().unwrap();
        let (expired, keep): (Vec<_>, Vec<_>) =
            entries.drain(..).partition(|e| e.expires_at <= now);
        *entries = keep;
        for entry in &expired {
            info!(session = %entry.session_id, "queue entry expired");
        }
        expired
    }

    /// Pop the best pending entry: lowest priority value, FIFO among
    /// equals. The caller replays it and re-enqueues on continued failure.
    pub fn take_next(&self) -> Option<PendingEntry> {
        let mut entries = self.entries.lock().unwrap();
        let best = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority, e.enqueued_at))?
            .0;
        Some(entries.remove(best))
    }

    /// Put a popped entry back unchanged (replay attempt failed, entry not
    /// yet expired). Silently drops the entry when the queue refilled.
    pub fn restore(&self, entry: PendingEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() < QUEUE_CAPACITY
            && !entries.iter().any(|e| e.session_id == entry.session_id)
        {
            entries.push(entry);
        }
    }

    /// Number of parked entries.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> CommunicationRequest {
        CommunicationRequest {
            requested_forward_bps: Some(100_000),
            keep_request: Some(true),
            ..CommunicationRequest::default()
        }
    }

    fn queue() -> PendingQueue {
        PendingQueue::new(Duration::from_secs(30))
    }

    #[test]
    fn priority_mapping() {
        assert_eq!(PendingQueue::priority_for_class(1), 90);
        assert_eq!(PendingQueue::priority_for_class(9), 10);
    }

    #[test]
    fn capacity_is_exactly_sixty_four() {
        let q = queue();
        for i in 0..QUEUE_CAPACITY {
            let outcome = q.enqueue(
                &SessionId::new(&format!("s{i}")),
                &ClientId::new("c"),
                req(),
                5,
                None,
            );
            assert_eq!(outcome, EnqueueOutcome::Added);
        }
        let outcome = q.enqueue(&SessionId::new("s65"), &ClientId::new("c"), req(), 5, None);
        assert_eq!(outcome, EnqueueOutcome::Full);
        assert_eq!(q.len(), QUEUE_CAPACITY);
    }

    #[test]
    fn duplicate_session_updates_in_place() {
        let q = queue();
        let sid = SessionId::new("s1");
        assert_eq!(
            q.enqueue(&sid, &ClientId::new("c"), req(), 5, None),
            EnqueueOutcome::Added
        );
        assert_eq!(
            q.enqueue(&sid, &ClientId::new("c"), req(), 2, None),
            EnqueueOutcome::Updated
        );
        assert_eq!(q.len(), 1);
        let entry = q.take_next().unwrap();
        assert_eq!(entry.retry_count, 1);
        assert_eq!(entry.priority, 80);
    }

    #[test]
    fn take_next_orders_by_priority_then_fifo() {
        let q = queue();
        q.enqueue(&SessionId::new("low"), &ClientId::new("c"), req(), 9, None);
        q.enqueue(&SessionId::new("high"), &ClientId::new("c"), req(), 1, None);
        q.enqueue(&SessionId::new("high2"), &ClientId::new("c"), req(), 1, None);
        assert_eq!(q.take_next().unwrap().session_id, SessionId::new("high"));
        assert_eq!(q.take_next().unwrap().session_id, SessionId::new("high2"));
        assert_eq!(q.take_next().unwrap().session_id, SessionId::new("low"));
        assert!(q.take_next().is_none());
    }

    #[test]
    fn expiry_drops_entries() {
        let q = PendingQueue::new(Duration::from_secs(0));
        q.enqueue(&SessionId::new("s1"), &ClientId::new("c"), req(), 5, None);
        let expired = q.expire(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(expired.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn dequeue_removes_only_named_session() {
        let q = queue();
        q.enqueue(&SessionId::new("s1"), &ClientId::new("c"), req(), 5, None);
        q.enqueue(&SessionId::new("s2"), &ClientId::new("c"), req(), 5, None);
        assert!(q.dequeue(&SessionId::new("s1")));
        assert!(!q.dequeue(&SessionId::new("s1")));
        assert_eq!(q.len(), 1);
    }
}
