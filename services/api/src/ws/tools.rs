//! Tracked tool-execution tasks for one session.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, error, warn};

/// A tool call that had not produced its result when the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedCall {
    pub call_id: String,
    pub name: String,
}

struct PendingCall {
    name: String,
    sending: bool,
}

type PendingCalls = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Handed to each round trip: tells it when to give up on the executor and
/// marks the point after which it owns the result it is sending.
pub struct CallTicket {
    call_id: String,
    cancel: CancellationToken,
    pending: PendingCalls,
}

impl CallTicket {
    /// Resolves once teardown stops waiting for executors.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Marks the result as being sent. From here on teardown neither aborts
    /// the call nor sends a result for it.
    pub fn begin_sending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            if let Some(call) = pending.get_mut(&self.call_id) {
                call.sending = true;
            }
        }
    }
}

#[derive(Default)]
struct Tasks {
    set: JoinSet<()>,
    closed: bool,
}

/// Every tool round trip spawned by a session, with the calls still pending.
///
/// A call leaves the pending map only after its future, which includes
/// sending the result, has completed.
#[derive(Default)]
pub struct ToolTaskSet {
    tasks: Mutex<Tasks>,
    pending: PendingCalls,
    cancel: CancellationToken,
}

impl ToolTaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns the round trip built by `round_trip` for `call_id`. Returns
    /// false once the set has been drained.
    pub fn spawn<F, Fut>(&self, call_id: &str, name: &str, round_trip: F) -> bool
    where
        F: FnOnce(CallTicket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Ok(mut tasks) = self.tasks.lock() else {
            error!(%call_id, "Tool task set lock poisoned.");
            return false;
        };
        if tasks.closed {
            warn!(%call_id, tool = %name, "Tool call arrived after teardown began.");
            return false;
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(
                call_id.to_string(),
                PendingCall {
                    name: name.to_string(),
                    sending: false,
                },
            );
        }

        let future = round_trip(CallTicket {
            call_id: call_id.to_string(),
            cancel: self.cancel.clone(),
            pending: Arc::clone(&self.pending),
        });
        let pending = Arc::clone(&self.pending);
        let call_id = call_id.to_string();
        tasks.set.spawn(async move {
            future.await;
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&call_id);
            }
        });
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Closes the set and lets running calls finish for up to `grace`. Calls
    /// still running are then cancelled and given another `grace` to send
    /// their own error result before being aborted.
    ///
    /// Returns the calls that never started sending a result; a call whose
    /// result was already in flight is not reported, even if it was aborted.
    pub async fn drain(&self, grace: Duration) -> Vec<UnresolvedCall> {
        let mut set = match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.closed = true;
                std::mem::take(&mut tasks.set)
            }
            Err(_) => JoinSet::new(),
        };

        if !join_all(&mut set, grace).await {
            warn!(remaining = set.len(), ?grace, "Tool tasks still running after grace period; cancelling.");
            self.cancel.cancel();
            if !join_all(&mut set, grace).await {
                warn!(remaining = set.len(), "Tool tasks ignored cancellation; aborting.");
                set.shutdown().await;
            }
        }

        let mut unresolved: Vec<UnresolvedCall> = match self.pending.lock() {
            Ok(mut pending) => pending
                .drain()
                .filter(|(_, call)| !call.sending)
                .map(|(call_id, call)| UnresolvedCall {
                    call_id,
                    name: call.name,
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        unresolved.sort_by(|a, b| a.call_id.cmp(&b.call_id));
        debug!(unresolved = unresolved.len(), "Tool task set drained.");
        unresolved
    }
}

/// Joins every task in `set` within `grace`. Returns false on timeout.
async fn join_all(set: &mut JoinSet<()>, grace: Duration) -> bool {
    tokio::time::timeout(grace, async {
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!(error = %e, "Tool task panicked.");
                }
            }
        }
    })
    .await
    .is_ok()
}
