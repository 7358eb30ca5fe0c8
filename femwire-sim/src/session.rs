//! Per-connection engine session.

use crate::config::EngineConfig;
use crate::interpreter::Engine;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for HELLO.
    Connected,
    /// Handshake complete.
    Ready,
    /// EXIT received; the connection closes after the reply.
    Closing,
}

/// One client's engine session. Each session owns a private engine, so
/// two connections never see each other's workspace or model.
#[derive(Debug)]
pub struct Session {
    /// Unique session ID.
    pub id: String,
    /// Peer description, for logging.
    pub peer: String,
    state: SessionState,
    protocol_version: u16,
    client_name: Option<String>,
    engine: Engine,
    request_count: u64,
    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(peer: impl Into<String>, config: &EngineConfig) -> Self {
        let now = Instant::now();
        Self {
            id: Uuid::new_v4().to_string(),
            peer: peer.into(),
            state: SessionState::Connected,
            protocol_version: 0,
            client_name: None,
            engine: Engine::new(config),
            request_count: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn complete_handshake(&mut self, protocol_version: u16, client_name: Option<String>) {
        self.protocol_version = protocol_version;
        self.client_name = client_name;
        self.state = SessionState::Ready;
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Records a request.
    pub fn record_request(&mut self) {
        self.request_count += 1;
        self.last_activity = Instant::now();
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Time since the last request.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_handshake() {
        let mut session = Session::new("test", &EngineConfig::default());
        assert_eq!(session.state(), SessionState::Connected);

        session.complete_handshake(1, Some("pytest".to_string()));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.protocol_version(), 1);
        assert_eq!(session.client_name(), Some("pytest"));
    }

    #[test]
    fn test_sessions_are_isolated() {
        let config = EngineConfig::default();
        let mut a = Session::new("a", &config);
        let b = Session::new("b", &config);
        a.engine_mut().run("*VEC,V,D,ALLOC,3").unwrap();
        assert!(a.engine().workspace().contains("V"));
        assert!(!b.engine().workspace().contains("V"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_record_request() {
        let mut session = Session::new("test", &EngineConfig::default());
        session.record_request();
        session.record_request();
        assert_eq!(session.request_count(), 2);
        assert!(session.idle_duration() <= session.age());
    }
}
