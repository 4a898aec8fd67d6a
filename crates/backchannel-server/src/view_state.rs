use std::collections::HashSet;

use dashmap::DashMap;

/// Per-session expand/collapse state for the notification panel.
///
/// Purely presentational: lives in server memory, keyed by an opaque session
/// key from the transport, and dies with the session. Never touches
/// `is_read` or anything persisted.
pub struct ViewStates {
    sessions: DashMap<String, HashSet<String>>,
}

impl ViewStates {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Toggle one notification's expanded state; returns the new state.
    pub fn toggle(&self, session: &str, notification_id: &str) -> bool {
        let mut expanded = self.sessions.entry(session.to_string()).or_default();
        if expanded.remove(notification_id) {
            false
        } else {
            expanded.insert(notification_id.to_string());
            true
        }
    }

    pub fn is_expanded(&self, session: &str, notification_id: &str) -> bool {
        self.sessions
            .get(session)
            .map(|expanded| expanded.contains(notification_id))
            .unwrap_or(false)
    }

    /// Drop all view state for a session.
    pub fn end_session(&self, session: &str) {
        self.sessions.remove(session);
    }
}

impl Default for ViewStates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggle_flips_state() {
        let views = ViewStates::new();
        assert!(!views.is_expanded("sess-1", "notif_a"));
        assert!(views.toggle("sess-1", "notif_a"));
        assert!(views.is_expanded("sess-1", "notif_a"));
        assert!(!views.toggle("sess-1", "notif_a"));
        assert!(!views.is_expanded("sess-1", "notif_a"));
    }

    #[test]
    fn sessions_are_isolated() {
        let views = ViewStates::new();
        views.toggle("sess-1", "notif_a");
        assert!(!views.is_expanded("sess-2", "notif_a"));
    }

    #[test]
    fn end_session_clears_state() {
        let views = ViewStates::new();
        views.toggle("sess-1", "notif_a");
        views.toggle("sess-1", "notif_b");
        views.end_session("sess-1");
        assert!(!views.is_expanded("sess-1", "notif_a"));
        assert!(!views.is_expanded("sess-1", "notif_b"));
    }

    #[test]
    fn ending_unknown_session_is_harmless() {
        let views = ViewStates::new();
        views.end_session("sess-missing");
    }
}
