//! Session lifecycle states.

use log::debug;
use serde::Serialize;

/// Phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Inputs validated, nothing started.
    Idle,
    /// Pulling the image and starting the container.
    Provisioning,
    /// Polling the health endpoint.
    AwaitingReady,
    /// Minting the API key.
    Bootstrapping,
    /// Command running, or idling until interrupted.
    Running,
    /// Tearing the container down.
    Stopping,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Provisioning)
                | (Provisioning, AwaitingReady)
                | (Provisioning, Stopping)
                | (AwaitingReady, Bootstrapping)
                | (AwaitingReady, Stopping)
                | (Bootstrapping, Running)
                | (Bootstrapping, Stopping)
                | (Running, Stopping)
                | (Stopping, Done)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Provisioning => write!(f, "provisioning"),
            SessionState::AwaitingReady => write!(f, "awaiting_ready"),
            SessionState::Bootstrapping => write!(f, "bootstrapping"),
            SessionState::Running => write!(f, "running"),
            SessionState::Stopping => write!(f, "stopping"),
            SessionState::Done => write!(f, "done"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Records the path a session took through its states.
#[derive(Debug, Clone)]
pub struct StateTracker {
    current: SessionState,
    history: Vec<SessionState>,
    /// Phase in which the first failure happened.
    failed_in: Option<SessionState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            current: SessionState::Idle,
            history: vec![SessionState::Idle],
            failed_in: None,
        }
    }

    pub fn current(&self) -> SessionState {
        self.current
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn failed_in(&self) -> Option<SessionState> {
        self.failed_in
    }

    /// Move to `next`. Illegal transitions are ignored and logged.
    pub fn advance(&mut self, next: SessionState) {
        if !self.current.can_transition_to(next) {
            debug!("ignoring session transition {} -> {}", self.current, next);
            return;
        }
        debug!("session {} -> {}", self.current, next);
        self.current = next;
        self.history.push(next);
    }

    /// Note that the current phase failed, without leaving it yet.
    ///
    /// Only the first failure is kept; teardown may still follow.
    pub fn mark_failed(&mut self) {
        if self.failed_in.is_none() {
            self.failed_in = Some(self.current);
        }
    }

    /// Enter the terminal state matching whether anything failed.
    pub fn finish(&mut self) {
        if self.failed_in.is_some() {
            self.advance(SessionState::Failed);
        } else {
            self.advance(SessionState::Done);
        }
    }

    pub fn visited(&self, state: SessionState) -> bool {
        self.history.contains(&state)
    }
}
