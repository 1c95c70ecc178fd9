//! Online-user tracking for one channel.
//!
//! Turns the stream of presence events into the authoritative set of online
//! users and a minimal stream of join/leave notices. Duplicate announcements
//! caused by retained-message replay, reconnect races, or periodic heartbeats
//! never produce more than one "joined" notice.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use tracing::debug;

use mqchat_shared::protocol::{PresenceEnvelope, PresenceStatus};
use mqchat_shared::ProtocolError;

/// Human-facing membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceNotice {
    Joined(String),
    Left(String),
}

impl fmt::Display for PresenceNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Joined(user) => write!(f, "{user} joined the chat"),
            Self::Left(user) => write!(f, "{user} left the chat"),
        }
    }
}

/// Result of handling one presence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub notice: Option<PresenceNotice>,
    /// Sorted online users after the event. Always present so the list is
    /// refreshed even when nothing changed.
    pub users: Vec<String>,
}

/// Tracks who is online in the channel.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_user: String,
    online: BTreeSet<String>,
    /// When each user's last "joined" notice fired.
    recent_joins: HashMap<String, Instant>,
    /// When each user last announced itself online.
    last_seen: HashMap<String, Instant>,
    join_debounce: Duration,
}

impl PresenceTracker {
    pub fn new(local_user: impl Into<String>, join_debounce: Duration) -> Self {
        Self {
            local_user: local_user.into(),
            online: BTreeSet::new(),
            recent_joins: HashMap::new(),
            last_seen: HashMap::new(),
            join_debounce,
        }
    }

    /// Forget all membership state.
    pub fn reset(&mut self) {
        self.online.clear();
        self.recent_joins.clear();
        self.last_seen.clear();
    }

    /// Forget every remote member but keep the debounce table, so users
    /// rediscovered right away are not announced twice.
    pub fn clear_remote(&mut self) {
        let local = self.local_user.as_str();
        self.online.retain(|user| user == local);
        self.last_seen.retain(|user, _| user == local);
    }

    /// Sorted snapshot of online users.
    pub fn users(&self) -> Vec<String> {
        self.online.iter().cloned().collect()
    }

    pub fn is_online(&self, user: &str) -> bool {
        self.online.contains(user)
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// Handle a presence payload received on `topic_user`'s presence topic.
    ///
    /// An empty (or whitespace-only) payload means the retained slot was
    /// cleared and the user is gone. Payloads whose `user` disagrees with the
    /// topic, or that are not valid JSON, are rejected without touching state.
    pub fn handle(
        &mut self,
        topic_user: &str,
        payload: &[u8],
        now: Instant,
    ) -> Result<PresenceUpdate, ProtocolError> {
        let notice = if payload.iter().all(u8::is_ascii_whitespace) {
            self.on_offline(topic_user)
        } else {
            let envelope = PresenceEnvelope::parse_for(topic_user, payload)?;
            match envelope.status {
                PresenceStatus::Online => self.on_online(&envelope.user, now),
                PresenceStatus::Offline => self.on_offline(&envelope.user),
                PresenceStatus::Unknown => None,
            }
        };

        Ok(PresenceUpdate {
            notice,
            users: self.users(),
        })
    }

    /// Record an online announcement. Returns a notice only for a genuinely
    /// new remote user outside the debounce window.
    pub fn on_online(&mut self, user: &str, now: Instant) -> Option<PresenceNotice> {
        let was_online = !self.online.insert(user.to_string());
        self.last_seen.insert(user.to_string(), now);

        let elapsed = self
            .recent_joins
            .get(user)
            .map(|at| now.saturating_duration_since(*at))
            .unwrap_or(Duration::MAX);

        if was_online || user == self.local_user || elapsed <= self.join_debounce {
            return None;
        }

        debug!(user = %user, "User joined");
        self.recent_joins.insert(user.to_string(), now);
        Some(PresenceNotice::Joined(user.to_string()))
    }

    /// Remove a user. Returns a notice if a remote user was actually online.
    pub fn on_offline(&mut self, user: &str) -> Option<PresenceNotice> {
        self.last_seen.remove(user);
        if !self.online.remove(user) {
            return None;
        }
        self.recent_joins.remove(user);

        debug!(user = %user, "User left");
        (user != self.local_user).then(|| PresenceNotice::Left(user.to_string()))
    }

    /// Drop remote users that have not announced themselves within `max_age`.
    pub fn evict_stale(&mut self, now: Instant, max_age: Duration) -> Vec<PresenceNotice> {
        let stale: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(user, seen)| {
                **user != self.local_user && now.saturating_duration_since(**seen) > max_age
            })
            .map(|(user, _)| user.clone())
            .collect();

        stale
            .iter()
            .filter_map(|user| {
                debug!(user = %user, "Evicting stale user");
                self.on_offline(user)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEBOUNCE: Duration = Duration::from_secs(60);

    fn online(user: &str) -> Vec<u8> {
        PresenceEnvelope::online(user).to_json().unwrap().into_bytes()
    }

    fn offline(user: &str) -> Vec<u8> {
        PresenceEnvelope::offline(user).to_json().unwrap().into_bytes()
    }

    fn joined(user: &str) -> Option<PresenceNotice> {
        Some(PresenceNotice::Joined(user.to_string()))
    }

    fn left(user: &str) -> Option<PresenceNotice> {
        Some(PresenceNotice::Left(user.to_string()))
    }

    #[test]
    fn test_duplicate_online_single_notice() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let t0 = Instant::now();

        let first = tracker.handle("alice", &online("alice"), t0).unwrap();
        assert_eq!(first.notice, joined("alice"));
        assert_eq!(first.users, vec!["alice"]);

        let second = tracker
            .handle("alice", &online("alice"), t0 + Duration::from_secs(1))
            .unwrap();
        assert_eq!(second.notice, None);
        assert_eq!(second.users, vec!["alice"]);
    }

    #[test]
    fn test_rejoin_after_leave_notifies_again() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let t0 = Instant::now();

        let events = [
            (online("alice"), t0),
            (offline("alice"), t0 + Duration::from_secs(61)),
            (online("alice"), t0 + Duration::from_secs(122)),
        ];
        let notices: Vec<_> = events
            .iter()
            .filter_map(|(payload, at)| tracker.handle("alice", payload, *at).unwrap().notice)
            .collect();

        assert_eq!(
            notices,
            vec![
                PresenceNotice::Joined("alice".into()),
                PresenceNotice::Left("alice".into()),
                PresenceNotice::Joined("alice".into()),
            ]
        );
    }

    #[test]
    fn test_debounce_window_suppresses_quick_rejoin() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let t0 = Instant::now();

        assert_eq!(tracker.on_online("alice", t0), joined("alice"));
        // Membership lost without a leave (e.g. list resync), debounce entry kept.
        tracker.online.remove("alice");
        assert_eq!(tracker.on_online("alice", t0 + Duration::from_secs(30)), None);
        assert!(tracker.is_online("alice"));

        tracker.online.remove("alice");
        assert_eq!(
            tracker.on_online("alice", t0 + Duration::from_secs(61)),
            joined("alice")
        );
    }

    #[test]
    fn test_local_user_never_announced() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let now = Instant::now();

        let update = tracker.handle("bob", &online("bob"), now).unwrap();
        assert_eq!(update.notice, None);
        assert_eq!(update.users, vec!["bob"]);

        let update = tracker.handle("bob", &offline("bob"), now).unwrap();
        assert_eq!(update.notice, None);
        assert!(update.users.is_empty());
    }

    #[test]
    fn test_empty_payload_removes_user() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let now = Instant::now();
        tracker.handle("alice", &online("alice"), now).unwrap();

        let update = tracker.handle("alice", b"", now).unwrap();
        assert_eq!(update.notice, left("alice"));
        assert!(update.users.is_empty());

        // Unknown user: no notice, list still refreshed.
        let update = tracker.handle("carol", b"  ", now).unwrap();
        assert_eq!(update.notice, None);
        assert!(update.users.is_empty());
    }

    #[test]
    fn test_mismatched_user_is_rejected() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let err = tracker
            .handle("alice", &online("mallory"), Instant::now())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UserMismatch { .. }));
        assert_eq!(tracker.online_count(), 0);

        assert!(tracker.handle("alice", b"{oops", Instant::now()).is_err());
    }

    #[test]
    fn test_unknown_status_refreshes_only() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let payload = br#"{"user":"alice","status":"away","timestamp":1}"#;
        let update = tracker.handle("alice", payload, Instant::now()).unwrap();
        assert_eq!(update.notice, None);
        assert!(update.users.is_empty());
    }

    #[test]
    fn test_users_sorted() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let now = Instant::now();
        for user in ["zed", "alice", "bob", "mike"] {
            tracker.on_online(user, now);
        }
        assert_eq!(tracker.users(), vec!["alice", "bob", "mike", "zed"]);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let now = Instant::now();
        tracker.on_online("alice", now);
        tracker.reset();

        assert_eq!(tracker.online_count(), 0);
        assert!(tracker.recent_joins.is_empty());
        // Fresh session: alice is announced again immediately.
        assert_eq!(tracker.on_online("alice", now), joined("alice"));
    }

    #[test]
    fn test_clear_remote_keeps_debounce() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let t0 = Instant::now();
        tracker.on_online("bob", t0);
        tracker.on_online("alice", t0);

        tracker.clear_remote();
        assert_eq!(tracker.users(), vec!["bob"]);
        assert_eq!(tracker.on_online("alice", t0 + Duration::from_secs(5)), None);
        assert!(tracker.is_online("alice"));
    }

    #[test]
    fn test_evict_stale_users() {
        let mut tracker = PresenceTracker::new("bob", DEBOUNCE);
        let t0 = Instant::now();
        tracker.on_online("bob", t0);
        tracker.on_online("alice", t0);
        tracker.on_online("carol", t0 + Duration::from_secs(80));

        let notices = tracker.evict_stale(t0 + Duration::from_secs(100), Duration::from_secs(90));
        assert_eq!(notices, vec![PresenceNotice::Left("alice".into())]);
        assert_eq!(tracker.users(), vec!["bob", "carol"]);
    }

    #[test]
    fn test_notice_text() {
        assert_eq!(
            PresenceNotice::Joined("alice".into()).to_string(),
            "alice joined the chat"
        );
        assert_eq!(PresenceNotice::Left("alice".into()).to_string(), "alice left the chat");
    }
}
