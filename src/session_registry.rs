//! User identity resolution from a client-presented cookie value, and
//! idle-session bookkeeping. Grounded on
//! `original_source/user_session_manager.py`'s `get_or_create_user_id`
//! (UUID-validated cookie, 30-day default timeout) and
//! `game_state_lock_manager.py`'s idle-game tracking idiom, generalized
//! to also watch per-`(user_id, game_id)` last-activity timestamps so
//! [[game_engine]]'s background cleanup loop can evict stale sessions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CookieDirective {
    pub name: String,
    pub value: String,
    pub max_age_secs: u64,
}

/// Resolves the user id a request should operate as: the cookie value if
/// present and a well-formed UUID, otherwise a freshly minted one. Always
/// returns a `CookieDirective` so the caller refreshes the cookie's
/// expiry on every request, mirroring the original's unconditional
/// `response.set_cookie`.
pub fn resolve_user_id(cookie_name: &str, presented: Option<&str>, cookie_ttl_days: u32) -> (String, CookieDirective) {
    let user_id = presented
        .filter(|v| Uuid::parse_str(v).is_ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| {
            let id = Uuid::new_v4().to_string();
            log::info!("created new user id: {id}");
            id
        });
    let directive = CookieDirective {
        name: cookie_name.to_string(),
        value: user_id.clone(),
        max_age_secs: cookie_ttl_days as u64 * 24 * 3600,
    };
    (user_id, directive)
}

/// Tracks last-activity time per `(user_id, game_id)` so idle sessions can
/// be evicted from in-memory state (their save file on disk is untouched;
/// eviction only drops the live `GameState` from memory).
#[derive(Default)]
pub struct SessionRegistry {
    last_activity: Mutex<HashMap<(String, String), Instant>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn touch(&self, user_id: &str, game_id: &str) {
        self.last_activity.lock().await.insert((user_id.to_string(), game_id.to_string()), Instant::now());
    }

    pub async fn forget(&self, user_id: &str, game_id: &str) {
        self.last_activity.lock().await.remove(&(user_id.to_string(), game_id.to_string()));
    }

    /// Returns the `(user_id, game_id)` pairs idle longer than `timeout`,
    /// without removing them — the caller evicts the in-memory game state
    /// first, then calls `forget`.
    pub async fn idle_sessions(&self, timeout: Duration) -> Vec<(String, String)> {
        let now = Instant::now();
        self.last_activity
            .lock()
            .await
            .iter()
            .filter(|(_, last)| now.saturating_duration_since(**last) > timeout)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub async fn active_count(&self) -> usize {
        self.last_activity.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_uuid_cookie_is_reused() {
        let existing = Uuid::new_v4().to_string();
        let (user_id, directive) = resolve_user_id("labyrinthia_user_id", Some(existing.as_str()), 30);
        assert_eq!(user_id, existing);
        assert_eq!(directive.max_age_secs, 30 * 24 * 3600);
    }

    #[test]
    fn missing_or_malformed_cookie_mints_new_id() {
        let (user_id, _) = resolve_user_id("labyrinthia_user_id", Some("not-a-uuid"), 30);
        assert!(Uuid::parse_str(&user_id).is_ok());
        let (user_id, _) = resolve_user_id("labyrinthia_user_id", None, 30);
        assert!(Uuid::parse_str(&user_id).is_ok());
    }

    #[tokio::test]
    async fn idle_sessions_reports_only_past_timeout() {
        let registry = SessionRegistry::new();
        registry.touch("u1", "g1").await;
        let idle = registry.idle_sessions(Duration::from_secs(3600)).await;
        assert!(idle.is_empty());
        let idle = registry.idle_sessions(Duration::from_secs(0)).await;
        assert_eq!(idle.len(), 1);
    }

    #[tokio::test]
    async fn forget_removes_tracked_session() {
        let registry = SessionRegistry::new();
        registry.touch("u1", "g1").await;
        registry.forget("u1", "g1").await;
        assert_eq!(registry.active_count().await, 0);
    }
}
