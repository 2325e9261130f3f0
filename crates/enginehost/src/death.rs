//! Peer-death observation for bound service connections.
//!
//! One observer per service incarnation. It starts Idle, moves to Watching
//! when the supervisor attaches it to a delivered endpoint, and fires at
//! most once when the peer process terminates. Firing is terminal: later
//! disconnect signals for the same incarnation are ignored.

/// Observer lifecycle. `Fired` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Idle,
    Watching,
    Fired,
}

/// Detects and reports peer-process termination on a channel.
///
/// Holds at most one zero-payload callback; registering again overwrites
/// the previous one. The callback runs on the supervisor's event loop, so
/// callbacks for different services are never concurrent with each other.
pub struct DeathObserver {
    state: ObserverState,
    callback: Option<Box<dyn FnOnce() + Send>>,
}

impl DeathObserver {
    pub fn new() -> Self {
        Self {
            state: ObserverState::Idle,
            callback: None,
        }
    }

    pub fn state(&self) -> ObserverState {
        self.state
    }

    /// Register the disconnect callback. Overwrites any prior registration;
    /// a registration after the observer has fired will never run.
    pub fn on_disconnect<F>(&mut self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state == ObserverState::Fired {
            tracing::warn!("disconnect callback registered after observer fired, dropping it");
            return;
        }
        if self.callback.is_some() {
            tracing::debug!("replacing disconnect callback");
        }
        self.callback = Some(Box::new(callback));
    }

    /// Attach to a delivered endpoint and start watching.
    pub fn watch(&mut self) {
        match self.state {
            ObserverState::Idle => self.state = ObserverState::Watching,
            other => tracing::warn!(state = ?other, "observer already attached"),
        }
    }

    /// Signal peer termination. Returns true only on the transition into
    /// `Fired`; duplicate signals and signals before attachment are ignored.
    pub fn fire(&mut self) -> bool {
        match self.state {
            ObserverState::Watching => {
                self.state = ObserverState::Fired;
                if let Some(callback) = self.callback.take() {
                    callback();
                }
                true
            }
            ObserverState::Idle => {
                tracing::warn!("disconnect signaled before observer was attached");
                false
            }
            ObserverState::Fired => {
                tracing::debug!("duplicate disconnect signal ignored");
                false
            }
        }
    }
}

impl Default for DeathObserver {
    fn default() -> Self {
        Self::new()
    }
}
