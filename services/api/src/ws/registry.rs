//! Process-wide record of the one active voice session.
//!
//! A new connection always wins: acquiring a lease cancels whichever session
//! held it before. The stale session observes the cancellation, tears itself
//! down, and then releases; a release only clears the registry if it still
//! names the releasing session.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

struct ActiveSession {
    id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
}

#[derive(Default)]
pub struct SessionRegistry {
    active: Mutex<Option<ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `session_id` as the active session, cancelling any previous one.
    pub fn acquire(self: &Arc<Self>, session_id: &str) -> SessionLease {
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let next = ActiveSession {
            id: session_id.to_string(),
            cancel: cancel.clone(),
            finished: finished.clone(),
        };

        let previous = match self.active.lock() {
            Ok(mut active) => active.replace(next),
            Err(poisoned) => poisoned.into_inner().replace(next),
        };
        let predecessor = previous.map(|stale| {
            warn!(stale_session = %stale.id, "Replacing active session with a new connection.");
            stale.cancel.cancel();
            stale.finished
        });
        info!(%session_id, "Session registered as active.");

        SessionLease {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            cancel,
            finished,
            predecessor,
            released: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active_id().is_some()
    }

    pub fn active_id(&self) -> Option<String> {
        match self.active.lock() {
            Ok(active) => active.as_ref().map(|s| s.id.clone()),
            Err(poisoned) => poisoned.into_inner().as_ref().map(|s| s.id.clone()),
        }
    }

    fn release(&self, session_id: &str) -> bool {
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        if active.as_ref().is_some_and(|s| s.id == session_id) {
            *active = None;
            true
        } else {
            false
        }
    }
}

/// Proof of being the active session. Released explicitly at the end of
/// teardown, or on drop as a backstop.
pub struct SessionLease {
    registry: Arc<SessionRegistry>,
    session_id: String,
    cancel: CancellationToken,
    finished: CancellationToken,
    predecessor: Option<CancellationToken>,
    released: bool,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Resolves when a newer session replaces this one.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits up to `timeout` for the replaced session to finish its teardown.
    /// Returns false if it was still running when the wait gave up.
    pub async fn wait_for_predecessor(&self, timeout: Duration) -> bool {
        let Some(predecessor) = &self.predecessor else {
            return true;
        };
        match tokio::time::timeout(timeout, predecessor.cancelled()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(session_id = %self.session_id, "Replaced session did not finish teardown in time.");
                false
            }
        }
    }

    /// Clears the active flag if this session still holds it.
    pub fn release(mut self) -> bool {
        self.release_inner()
    }

    fn release_inner(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.finished.cancel();
        let cleared = self.registry.release(&self.session_id);
        debug!(session_id = %self.session_id, cleared, "Session lease released.");
        cleared
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            warn!(session_id = %self.session_id, "Session lease dropped without release.");
            self.release_inner();
        }
    }
}
