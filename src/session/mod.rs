//! Session Manager
//!
//! Sessions carry the per-peer conversational context: the spawned agent
//! subprocess, activity timestamps, and the heartbeat deadline. The manager
//! is the single owner of all sessions; everyone else holds `Arc<Session>`
//! handles. A background sweeper destroys idle sessions and a scheduler
//! reports due heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::SessionScope;
use crate::reply::agent::AgentProcess;

/// Derive the stable session key for a sender, per scope.
///
/// Group senders keep a `group:` prefix so the shared group session never
/// collides with a member's direct-message session; `whatsapp:` wire prefixes
/// are stripped; `telegram:`-namespaced identifiers pass through, keeping
/// cross-provider senders distinct.
pub fn derive_session_key(scope: SessionScope, sender: Option<&str>) -> String {
    if scope == SessionScope::Global {
        return "global".to_string();
    }
    let sender = sender.map(str::trim).unwrap_or("");
    if sender.is_empty() {
        return "unknown".to_string();
    }
    if crate::utils::is_group_jid(sender) {
        return format!("group:{sender}");
    }
    if let Some(stripped) = sender.strip_prefix("whatsapp:") {
        return stripped.to_string();
    }
    sender.to_string()
}

/// One live conversational session.
pub struct Session {
    key: String,
    created_at: chrono::DateTime<chrono::Utc>,
    last_activity: Mutex<Instant>,
    /// Serialises agent invocations: one in-flight prompt per session.
    invocation_lock: Mutex<()>,
    agent: Mutex<Option<Arc<AgentProcess>>>,
    heartbeat_due: Mutex<Option<Instant>>,
}

impl Session {
    fn new(key: String) -> Self {
        Self {
            key,
            created_at: chrono::Utc::now(),
            last_activity: Mutex::new(Instant::now()),
            invocation_lock: Mutex::new(()),
            agent: Mutex::new(None),
            heartbeat_due: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.created_at
    }

    /// Acquire the per-session invocation lock.
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.invocation_lock.lock().await
    }

    pub async fn agent(&self) -> Option<Arc<AgentProcess>> {
        self.agent.lock().await.clone()
    }

    pub async fn set_agent(&self, agent: Arc<AgentProcess>) {
        *self.agent.lock().await = Some(agent);
    }

    pub async fn clear_agent(&self) {
        if let Some(agent) = self.agent.lock().await.take() {
            agent.kill().await;
        }
    }
}

pub struct SessionManager {
    scope: SessionScope,
    idle: Duration,
    heartbeat: Option<Duration>,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(scope: SessionScope, idle_minutes: u64, heartbeat_minutes: Option<u64>) -> Self {
        Self {
            scope,
            idle: Duration::from_secs(idle_minutes * 60),
            heartbeat: heartbeat_minutes
                .filter(|&m| m > 0)
                .map(|m| Duration::from_secs(m * 60)),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> SessionScope {
        self.scope
    }

    /// A zero idle window destroys the session as soon as its reply settles.
    pub fn destroys_after_reply(&self) -> bool {
        self.idle.is_zero()
    }

    /// Look up or create the session for a sender. Returns the handle and
    /// whether it was freshly created. At most one live session exists per
    /// key.
    pub async fn resolve(&self, sender: Option<&str>) -> (Arc<Session>, bool) {
        let key = derive_session_key(self.scope, sender);
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&key) {
            return (existing.clone(), false);
        }
        let session = Arc::new(Session::new(key.clone()));
        sessions.insert(key.clone(), session.clone());
        tracing::info!("session created: {key}");
        (session, true)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(key).cloned()
    }

    /// Stamp activity and re-arm the heartbeat deadline.
    pub async fn touch(&self, session: &Session) {
        let now = Instant::now();
        *session.last_activity.lock().await = now;
        *session.heartbeat_due.lock().await = self.heartbeat.map(|hb| now + hb);
    }

    /// Destroy a session: terminate its agent and cancel its heartbeat.
    pub async fn destroy(&self, key: &str) {
        let removed = self.sessions.lock().await.remove(key);
        if let Some(session) = removed {
            session.clear_agent().await;
            *session.heartbeat_due.lock().await = None;
            tracing::info!("session destroyed: {key}");
        }
    }

    pub async fn destroy_all(&self) {
        let keys: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for key in keys {
            self.destroy(&key).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Long-lived task: destroy sessions whose idle window elapsed.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_secs(30));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();
            let mut expired = Vec::new();
            {
                let sessions = self.sessions.lock().await;
                for (key, session) in sessions.iter() {
                    let last = *session.last_activity.lock().await;
                    if now.duration_since(last) >= self.idle {
                        expired.push(key.clone());
                    }
                }
            }
            for key in expired {
                tracing::info!("session idle-expired: {key}");
                self.destroy(&key).await;
            }
        }
        tracing::debug!("session sweeper stopped");
    }

    /// Long-lived task: report sessions whose heartbeat deadline passed.
    /// Each due key is sent once; the deadline re-arms on the next `touch`.
    pub async fn run_heartbeats(
        self: Arc<Self>,
        cancel: CancellationToken,
        fire: mpsc::Sender<String>,
    ) {
        if self.heartbeat.is_none() {
            return;
        }
        let mut tick = tokio::time::interval(Duration::from_secs(15));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            let now = Instant::now();
            let mut due = Vec::new();
            {
                let sessions = self.sessions.lock().await;
                for (key, session) in sessions.iter() {
                    let mut deadline = session.heartbeat_due.lock().await;
                    if deadline.is_some_and(|d| d <= now) {
                        *deadline = None;
                        due.push(key.clone());
                    }
                }
            }
            for key in due {
                if fire.send(key).await.is_err() {
                    return;
                }
            }
        }
        tracing::debug!("heartbeat scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_global_scope() {
        assert_eq!(
            derive_session_key(SessionScope::Global, Some("+15551234567")),
            "global"
        );
        assert_eq!(derive_session_key(SessionScope::Global, None), "global");
    }

    #[test]
    fn test_key_per_sender_e164() {
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("+15551234567")),
            "+15551234567"
        );
    }

    #[test]
    fn test_key_strips_whatsapp_prefix() {
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("whatsapp:+15551234567")),
            "+15551234567"
        );
    }

    #[test]
    fn test_key_group_prefix() {
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("12345-678@g.us")),
            "group:12345-678@g.us"
        );
    }

    #[test]
    fn test_key_telegram_namespace_passthrough() {
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("telegram:@alice")),
            "telegram:@alice"
        );
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("telegram:123456")),
            "telegram:123456"
        );
    }

    #[test]
    fn test_key_cross_provider_isolation() {
        let tg = derive_session_key(SessionScope::PerSender, Some("telegram:@alice"));
        let wa = derive_session_key(SessionScope::PerSender, Some("+15551234567"));
        assert_ne!(tg, wa);
    }

    #[test]
    fn test_key_absent_sender() {
        assert_eq!(derive_session_key(SessionScope::PerSender, None), "unknown");
        assert_eq!(
            derive_session_key(SessionScope::PerSender, Some("  ")),
            "unknown"
        );
    }

    #[test]
    fn test_key_matches_canonical_alias() {
        // Any alias of the same sender lands on the same key once canonical.
        let via_wire = derive_session_key(SessionScope::PerSender, Some("whatsapp:+491234"));
        let via_canonical = derive_session_key(SessionScope::PerSender, Some("+491234"));
        assert_eq!(via_wire, via_canonical);
    }

    #[tokio::test]
    async fn test_resolve_reuses_live_session() {
        let mgr = SessionManager::new(SessionScope::PerSender, 60, None);
        let (first, is_new) = mgr.resolve(Some("+15551234567")).await;
        assert!(is_new);
        let (second, is_new) = mgr.resolve(Some("+15551234567")).await;
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(mgr.len().await, 1);
    }

    #[tokio::test]
    async fn test_destroy_removes_session() {
        let mgr = SessionManager::new(SessionScope::PerSender, 60, None);
        let (session, _) = mgr.resolve(Some("+15551234567")).await;
        mgr.destroy(session.key()).await;
        assert_eq!(mgr.len().await, 0);
        let (_, is_new) = mgr.resolve(Some("+15551234567")).await;
        assert!(is_new);
    }

    #[tokio::test]
    async fn test_zero_idle_destroys_after_reply() {
        let mgr = SessionManager::new(SessionScope::PerSender, 0, None);
        assert!(mgr.destroys_after_reply());
        let mgr = SessionManager::new(SessionScope::PerSender, 1440, None);
        assert!(!mgr.destroys_after_reply());
    }

    #[tokio::test]
    async fn test_touch_arms_heartbeat() {
        let mgr = SessionManager::new(SessionScope::PerSender, 60, Some(30));
        let (session, _) = mgr.resolve(Some("+15551234567")).await;
        assert!(session.heartbeat_due.lock().await.is_none());
        mgr.touch(&session).await;
        assert!(session.heartbeat_due.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_disabled_without_interval() {
        let mgr = SessionManager::new(SessionScope::PerSender, 60, None);
        let (session, _) = mgr.resolve(Some("+15551234567")).await;
        mgr.touch(&session).await;
        assert!(session.heartbeat_due.lock().await.is_none());
    }
}
