//! The session coordinator.
//!
//! Single source of truth for connections, sessions, ownership and resume
//! tokens. Every mutation goes through one mutex, which is what makes the
//! resume-vs-sweep race resolve to exactly one winner.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use agent_relay_core::{
    ClientCapability, ClientId, ClientIdGen, ResumeToken, SessionError, SessionHost, SessionId,
    SessionNotification,
};

use crate::handle::{ConnectionHandle, Outbound};

/// Coordinator tuning knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a disconnected client's sessions survive.
    pub grace_period: Duration,
    /// How often the background sweep runs.
    pub sweep_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Session state handed back on a successful resume.
#[derive(Debug, Clone)]
pub struct ResumedSession {
    pub session_id: SessionId,
    pub cwd: PathBuf,
    pub state: serde_json::Value,
    pub created_at: i64,
}

struct SessionRecord {
    /// Owning client. While the owner is disconnected, this keeps the old
    /// id; the disconnection map decides whether the session is orphaned.
    owner: ClientId,
    token: ResumeToken,
    created_at: i64,
    cwd: PathBuf,
    /// Opaque conversation/mode state. The coordinator never inspects it.
    state: serde_json::Value,
    next_tool_call: u64,
    /// Whether a prompt turn is currently running. A turn holds the cancel
    /// flag, so a second turn must not reset it.
    turn_active: bool,
    cancel: Arc<AtomicBool>,
}

struct State {
    connections: HashMap<ClientId, ConnectionHandle>,
    sessions: HashMap<SessionId, SessionRecord>,
    disconnected: HashMap<ClientId, Instant>,
}

/// The coordinator. Shared as `Arc<Coordinator>` and injected into
/// transport handlers; there is no ambient/global access.
pub struct Coordinator {
    state: Mutex<State>,
    ids: ClientIdGen,
    config: CoordinatorConfig,
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Coordinator {
    /// Create a coordinator with the given config.
    #[must_use]
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: Mutex::new(State {
                connections: HashMap::new(),
                sessions: HashMap::new(),
                disconnected: HashMap::new(),
            }),
            ids: ClientIdGen::new(),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // Lock poisoning only happens if a holder panicked; the maps are
        // still consistent because every mutation completes in one call.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new connection; allocates a fresh, never-reused id.
    pub fn register_client(
        &self,
        outbound: mpsc::UnboundedSender<Outbound>,
        capability: Arc<dyn ClientCapability>,
    ) -> ClientId {
        let client_id = self.ids.next_id();
        let handle = ConnectionHandle::new(client_id, outbound, capability);
        self.lock().connections.insert(client_id, handle);
        tracing::debug!(client_id, "client registered");
        client_id
    }

    /// Create a session owned by `client_id`.
    pub fn new_session(
        &self,
        cwd: PathBuf,
        client_id: ClientId,
    ) -> Result<(SessionId, ResumeToken), SessionError> {
        let mut state = self.lock();
        if !state.connections.contains_key(&client_id) {
            return Err(SessionError::ClientGone(client_id));
        }

        let session_id = SessionId::new_v4();
        let token = ResumeToken::generate();
        state.sessions.insert(
            session_id,
            SessionRecord {
                owner: client_id,
                token: token.clone(),
                created_at: now_epoch(),
                cwd,
                state: serde_json::Value::Null,
                next_tool_call: 0,
                turn_active: false,
                cancel: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::info!(client_id, %session_id, "session created");
        Ok((session_id, token))
    }

    /// The connection currently authorized to receive this session's
    /// notifications.
    pub fn route(&self, session_id: SessionId) -> Result<ConnectionHandle, SessionError> {
        let state = self.lock();
        let record = state
            .sessions
            .get(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        state
            .connections
            .get(&record.owner)
            .cloned()
            .ok_or(SessionError::Orphaned(session_id))
    }

    /// Look up a connection by client id.
    #[must_use]
    pub fn connection(&self, client_id: ClientId) -> Option<ConnectionHandle> {
        self.lock().connections.get(&client_id).cloned()
    }

    /// Drop a connection.
    ///
    /// With `allow_reconnect`, the client's sessions are retained as
    /// orphans for the grace period; otherwise they are deleted now.
    pub fn unregister_client(&self, client_id: ClientId, allow_reconnect: bool) {
        let mut state = self.lock();
        if state.connections.remove(&client_id).is_none() {
            return;
        }

        let owns_sessions = state.sessions.values().any(|s| s.owner == client_id);
        if allow_reconnect && owns_sessions {
            state.disconnected.insert(client_id, Instant::now());
            tracing::info!(client_id, "client disconnected, sessions retained");
        } else {
            let before = state.sessions.len();
            state.sessions.retain(|_, s| s.owner != client_id);
            state.disconnected.remove(&client_id);
            let removed = before - state.sessions.len();
            if removed > 0 {
                tracing::info!(client_id, removed, "client gone, sessions deleted");
            }
        }
    }

    /// Reclaim a disconnected session.
    ///
    /// On success ownership moves atomically to `new_client_id`; there is
    /// no window in which both owners are valid. Failures mutate nothing.
    pub fn resume_session(
        &self,
        session_id: SessionId,
        token: &str,
        new_client_id: ClientId,
    ) -> Result<ResumedSession, SessionError> {
        let mut state = self.lock();

        let record = state
            .sessions
            .get(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        if !record.token.matches(token) {
            return Err(SessionError::InvalidToken(session_id));
        }
        let old_owner = record.owner;
        let disconnected_at = state
            .disconnected
            .get(&old_owner)
            .copied()
            .ok_or(SessionError::NotDisconnected(session_id))?;
        if disconnected_at.elapsed() > self.config.grace_period {
            return Err(SessionError::GracePeriodExpired(session_id));
        }
        if !state.connections.contains_key(&new_client_id) {
            return Err(SessionError::ClientGone(new_client_id));
        }

        // All checks passed; mutate under the same lock hold.
        let record = state
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        record.owner = new_client_id;
        let resumed = ResumedSession {
            session_id,
            cwd: record.cwd.clone(),
            state: record.state.clone(),
            created_at: record.created_at,
        };

        // The old owner's record is cleared once none of its sessions
        // remain orphaned; earlier removal would strand the others.
        if !state.sessions.values().any(|s| s.owner == old_owner) {
            state.disconnected.remove(&old_owner);
        }
        tracing::info!(%session_id, old_owner, new_client_id, "session resumed");
        Ok(resumed)
    }

    /// Remove sessions whose former owner's grace period has expired.
    /// Returns the number of sessions removed.
    pub fn sweep_expired(&self) -> usize {
        let mut state = self.lock();
        let expired: Vec<ClientId> = state
            .disconnected
            .iter()
            .filter(|(_, at)| at.elapsed() > self.config.grace_period)
            .map(|(id, _)| *id)
            .collect();

        let mut removed = 0;
        for client_id in expired {
            let before = state.sessions.len();
            state.sessions.retain(|_, s| s.owner != client_id);
            removed += before - state.sessions.len();
            state.disconnected.remove(&client_id);
            tracing::info!(client_id, "grace period expired, sessions swept");
        }
        removed
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut interval = tokio::time::interval(coordinator.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            loop {
                interval.tick().await;
                let removed = coordinator.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, "sweep removed expired sessions");
                }
            }
        })
    }

    /// Arm a new turn: clears the cancel flag and hands it back.
    ///
    /// One turn per session at a time. Refusing a second `prompt` here is
    /// what keeps a pending cancellation from being erased out from under
    /// the turn that is polling the flag.
    pub fn begin_turn(&self, session_id: SessionId) -> Result<Arc<AtomicBool>, SessionError> {
        let mut state = self.lock();
        let record = state
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        if record.turn_active {
            return Err(SessionError::TurnInFlight(session_id));
        }
        record.turn_active = true;
        record.cancel.store(false, Ordering::SeqCst);
        Ok(Arc::clone(&record.cancel))
    }

    /// Mark the in-flight turn finished. A session deleted mid-turn is
    /// simply ignored.
    pub fn end_turn(&self, session_id: SessionId) {
        let mut state = self.lock();
        if let Some(record) = state.sessions.get_mut(&session_id) {
            record.turn_active = false;
        }
    }

    /// Request cancellation of the in-flight turn.
    pub fn cancel(&self, session_id: SessionId) -> Result<(), SessionError> {
        let state = self.lock();
        let record = state
            .sessions
            .get(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        record.cancel.store(true, Ordering::SeqCst);
        tracing::info!(%session_id, "cancellation requested");
        Ok(())
    }

    /// Store opaque conversation state for a session.
    pub fn set_session_state(
        &self,
        session_id: SessionId,
        value: serde_json::Value,
    ) -> Result<(), SessionError> {
        let mut state = self.lock();
        let record = state
            .sessions
            .get_mut(&session_id)
            .ok_or(SessionError::SessionNotFound(session_id))?;
        record.state = value;
        Ok(())
    }

    /// Working directory of a session.
    pub fn session_cwd(&self, session_id: SessionId) -> Result<PathBuf, SessionError> {
        let state = self.lock();
        state
            .sessions
            .get(&session_id)
            .map(|s| s.cwd.clone())
            .ok_or(SessionError::SessionNotFound(session_id))
    }

    /// Number of live sessions (for tests and health reporting).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

impl SessionHost for Coordinator {
    fn notify(&self, session_id: SessionId, update: SessionNotification) {
        let state = self.lock();
        let Some(record) = state.sessions.get(&session_id) else {
            tracing::debug!(%session_id, "notify for unknown session dropped");
            return;
        };
        match state.connections.get(&record.owner) {
            Some(handle) => {
                if !handle.send(Outbound::SessionUpdate { session_id, update }) {
                    tracing::debug!(%session_id, "owner writer gone, update dropped");
                }
            }
            None => {
                tracing::debug!(%session_id, "session orphaned, update dropped");
            }
        }
    }

    fn capability(&self, session_id: SessionId) -> Option<Arc<dyn ClientCapability>> {
        let state = self.lock();
        let record = state.sessions.get(&session_id)?;
        state
            .connections
            .get(&record.owner)
            .map(ConnectionHandle::capability)
    }

    fn begin_tool_call(&self, session_id: SessionId) -> Option<u64> {
        let mut state = self.lock();
        let record = state.sessions.get_mut(&session_id)?;
        record.next_tool_call += 1;
        Some(record.next_tool_call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_relay_core::ChannelCapability;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn coordinator_with_grace(grace: Duration) -> Coordinator {
        Coordinator::new(CoordinatorConfig {
            grace_period: grace,
            sweep_interval: Duration::from_secs(60),
        })
    }

    fn connect(coordinator: &Coordinator) -> (ClientId, UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (capability, _updates) = ChannelCapability::new();
        (coordinator.register_client(tx, capability), rx)
    }

    #[test]
    fn client_ids_never_repeat() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (a, _rx_a) = connect(&coordinator);
        coordinator.unregister_client(a, false);
        let (b, _rx_b) = connect(&coordinator);
        assert_ne!(a, b);
    }

    #[test]
    fn new_session_requires_registered_client() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let err = coordinator.new_session(PathBuf::from("/w"), 999).unwrap_err();
        assert_eq!(err, SessionError::ClientGone(999));
    }

    #[test]
    fn route_follows_current_owner() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (client, _rx) = connect(&coordinator);
        let (session, _token) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();

        let handle = coordinator.route(session).unwrap();
        assert_eq!(handle.client_id, client);
    }

    #[test]
    fn notifications_reach_owner_in_order() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (client, mut rx) = connect(&coordinator);
        let (session, _token) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();

        for i in 0..3 {
            coordinator.notify(
                session,
                SessionNotification::AgentMessageChunk {
                    text: i.to_string(),
                },
            );
        }
        for i in 0..3 {
            match rx.try_recv().unwrap() {
                Outbound::SessionUpdate {
                    update: SessionNotification::AgentMessageChunk { text },
                    ..
                } => assert_eq!(text, i.to_string()),
                other => panic!("unexpected outbound: {other:?}"),
            }
        }
    }

    #[test]
    fn resume_transfers_ownership_atomically() {
        let coordinator = coordinator_with_grace(Duration::from_secs(300));
        let (a, _rx_a) = connect(&coordinator);
        let (session, token) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();

        coordinator.unregister_client(a, true);
        assert!(matches!(
            coordinator.route(session).unwrap_err(),
            SessionError::Orphaned(_)
        ));

        let (b, _rx_b) = connect(&coordinator);
        let resumed = coordinator
            .resume_session(session, token.as_str(), b)
            .unwrap();
        assert_eq!(resumed.session_id, session);
        assert_eq!(coordinator.route(session).unwrap().client_id, b);
    }

    #[test]
    fn resume_with_wrong_token_mutates_nothing() {
        let coordinator = coordinator_with_grace(Duration::from_secs(300));
        let (a, _rx_a) = connect(&coordinator);
        let (session, _token) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();
        coordinator.unregister_client(a, true);
        let (b, _rx_b) = connect(&coordinator);

        let err = coordinator
            .resume_session(session, "not-the-token", b)
            .unwrap_err();
        assert_eq!(err, SessionError::InvalidToken(session));
        // Still orphaned, still resumable by the right token later.
        assert!(matches!(
            coordinator.route(session).unwrap_err(),
            SessionError::Orphaned(_)
        ));
        assert_eq!(coordinator.session_count(), 1);
    }

    #[test]
    fn resume_of_connected_owner_is_refused() {
        let coordinator = coordinator_with_grace(Duration::from_secs(300));
        let (a, _rx_a) = connect(&coordinator);
        let (session, token) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();
        let (b, _rx_b) = connect(&coordinator);

        let err = coordinator
            .resume_session(session, token.as_str(), b)
            .unwrap_err();
        assert_eq!(err, SessionError::NotDisconnected(session));
        assert_eq!(coordinator.route(session).unwrap().client_id, a);
    }

    #[test]
    fn grace_expiry_fails_resume_and_sweep_removes_once() {
        let coordinator = coordinator_with_grace(Duration::from_millis(0));
        let (a, _rx_a) = connect(&coordinator);
        let (session, token) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();
        coordinator.unregister_client(a, true);
        std::thread::sleep(Duration::from_millis(5));

        let (b, _rx_b) = connect(&coordinator);
        let err = coordinator
            .resume_session(session, token.as_str(), b)
            .unwrap_err();
        assert_eq!(err, SessionError::GracePeriodExpired(session));

        assert_eq!(coordinator.sweep_expired(), 1);
        assert_eq!(coordinator.sweep_expired(), 0);
        assert_eq!(
            coordinator
                .resume_session(session, token.as_str(), b)
                .unwrap_err(),
            SessionError::SessionNotFound(session)
        );
    }

    #[test]
    fn non_reconnectable_disconnect_deletes_immediately() {
        let coordinator = coordinator_with_grace(Duration::from_secs(300));
        let (a, _rx_a) = connect(&coordinator);
        let (session, token) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();

        coordinator.unregister_client(a, false);
        assert_eq!(coordinator.session_count(), 0);

        let (b, _rx_b) = connect(&coordinator);
        assert_eq!(
            coordinator
                .resume_session(session, token.as_str(), b)
                .unwrap_err(),
            SessionError::SessionNotFound(session)
        );
    }

    #[test]
    fn partial_resume_keeps_record_for_remaining_sessions() {
        let coordinator = coordinator_with_grace(Duration::from_secs(300));
        let (a, _rx_a) = connect(&coordinator);
        let (s1, t1) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();
        let (s2, t2) = coordinator.new_session(PathBuf::from("/w"), a).unwrap();
        coordinator.unregister_client(a, true);

        let (b, _rx_b) = connect(&coordinator);
        coordinator.resume_session(s1, t1.as_str(), b).unwrap();

        // s2 is still reclaimable: the disconnection record must survive
        // until the last orphan is gone.
        let (c, _rx_c) = connect(&coordinator);
        coordinator.resume_session(s2, t2.as_str(), c).unwrap();
        assert_eq!(coordinator.route(s2).unwrap().client_id, c);
    }

    #[test]
    fn tool_call_ids_increment_per_session() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (client, _rx) = connect(&coordinator);
        let (s1, _) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();
        let (s2, _) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();

        assert_eq!(coordinator.begin_tool_call(s1), Some(1));
        assert_eq!(coordinator.begin_tool_call(s1), Some(2));
        assert_eq!(coordinator.begin_tool_call(s2), Some(1));
    }

    #[test]
    fn pending_cancel_survives_a_second_prompt_attempt() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (client, _rx) = connect(&coordinator);
        let (session, _) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();

        let flag = coordinator.begin_turn(session).unwrap();
        coordinator.cancel(session).unwrap();

        // The running turn holds the flag; a second turn must be refused
        // rather than clearing it.
        assert_eq!(
            coordinator.begin_turn(session).unwrap_err(),
            SessionError::TurnInFlight(session)
        );
        assert!(flag.load(Ordering::SeqCst));

        coordinator.end_turn(session);
        let next = coordinator.begin_turn(session).unwrap();
        assert!(!next.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_sets_the_turn_flag() {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (client, _rx) = connect(&coordinator);
        let (session, _) = coordinator.new_session(PathBuf::from("/w"), client).unwrap();

        let flag = coordinator.begin_turn(session).unwrap();
        assert!(!flag.load(Ordering::SeqCst));
        coordinator.cancel(session).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
