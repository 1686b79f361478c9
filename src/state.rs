use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// The lifecycle of one container workload.
///
/// `Deleted` is the terminal state; `Stopped` and `Failed` only lead there.
/// `Unknown` is transient and may be entered from any live state when the
/// backend loses track of the workload.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Uninitiated,
    Initializing,
    Running,
    Failed,
    Terminating,
    Unknown,
    Stopped,
    Deleted,
}

impl ContainerState {
    /// Whether the workload has finished and only deletion remains.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed | Self::Deleted)
    }

    /// Whether any further transition is legal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// The legal transition graph. Re-entering the current state is not a
    /// transition and is handled separately by [StateCell::transition].
    pub fn can_transition_to(self, next: Self) -> bool {
        use ContainerState::*;
        match (self, next) {
            (Uninitiated, Initializing) => true,
            (Initializing, Running | Failed) => true,
            (Running, Terminating | Stopped | Failed) => true,
            (Terminating, Stopped | Failed) => true,
            // transient only: the backend lost sight of a live workload
            (Uninitiated | Initializing | Running | Terminating, Unknown) => true,
            (Unknown, Initializing | Running | Terminating | Stopped | Failed) => true,
            (Stopped | Failed, Deleted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitiated => "UNINITIATED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Terminating => "TERMINATING",
            Self::Unknown => "UNKNOWN",
            Self::Stopped => "STOPPED",
            Self::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// The current state plus waiter wakeup, backed by a watch channel so every
/// accepted transition wakes all waiters exactly once.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<ContainerState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ContainerState::Uninitiated);
        Self { tx }
    }

    pub(crate) fn get(&self) -> ContainerState {
        *self.tx.borrow()
    }

    /// Applies `next` if the edge is legal and returns whether the state
    /// changed. Re-entering the current state is a quiet no-op; an illegal
    /// edge is logged and dropped, leaving the state untouched.
    pub(crate) fn transition(&self, next: ContainerState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if current.can_transition_to(next) {
                tracing::debug!(from = %current, to = %next, "state transition");
                *current = next;
                changed = true;
                true
            } else {
                tracing::warn!(from = %current, to = %next, "illegal state transition dropped");
                false
            }
        });
        changed
    }

    /// Waits until the state equals `target`. Returns `false` on timeout.
    /// A `None` timeout waits indefinitely.
    pub(crate) async fn wait_for(
        &self,
        target: ContainerState,
        timeout: Option<Duration>,
    ) -> bool {
        self.wait_until(move |s| s == target, timeout).await
    }

    /// Waits until `predicate` holds for the state. Returns `false` on
    /// timeout.
    pub(crate) async fn wait_until(
        &self,
        predicate: impl Fn(ContainerState) -> bool,
        timeout: Option<Duration>,
    ) -> bool {
        let mut rx = self.tx.subscribe();
        let wait = async move {
            loop {
                if predicate(*rx.borrow_and_update()) {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        match timeout {
            Some(budget) => tokio::time::timeout(budget, wait).await.unwrap_or(false),
            None => wait.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContainerState::*;

    #[test]
    fn legal_edges() {
        assert!(Uninitiated.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Running));
        assert!(Initializing.can_transition_to(Failed));
        assert!(Running.can_transition_to(Terminating));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Failed));
        assert!(Terminating.can_transition_to(Stopped));
        assert!(Terminating.can_transition_to(Failed));
        assert!(Stopped.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Deleted));
        assert!(Running.can_transition_to(Unknown));
        assert!(Unknown.can_transition_to(Running));
    }

    #[test]
    fn illegal_edges() {
        assert!(!Uninitiated.can_transition_to(Running));
        assert!(!Initializing.can_transition_to(Stopped));
        assert!(!Running.can_transition_to(Deleted));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Unknown));
        assert!(!Failed.can_transition_to(Unknown));
        assert!(!Deleted.can_transition_to(Unknown));
        assert!(!Deleted.can_transition_to(Stopped));
    }

    #[test]
    fn cell_rejects_illegal_and_keeps_state() {
        let cell = StateCell::new();
        assert!(!cell.transition(Running));
        assert_eq!(cell.get(), Uninitiated);
        assert!(cell.transition(Initializing));
        assert!(cell.transition(Running));
        // re-entry is a quiet no-op
        assert!(!cell.transition(Running));
        assert_eq!(cell.get(), Running);
    }

    #[test]
    fn full_lifecycle_sequence() {
        let cell = StateCell::new();
        for state in [Initializing, Running, Terminating, Stopped, Deleted] {
            assert!(cell.transition(state), "expected edge into {state}");
        }
        assert!(cell.get().is_terminal());
        assert!(!cell.transition(Running));
    }

    #[tokio::test]
    async fn waiters_wake_on_transition() {
        let cell = std::sync::Arc::new(StateCell::new());
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait_for(Running, Some(Duration::from_secs(5))).await })
        };
        tokio::task::yield_now().await;
        cell.transition(Initializing);
        cell.transition(Running);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out() {
        let cell = StateCell::new();
        assert!(!cell.wait_for(Running, Some(Duration::from_millis(20))).await);
    }

    #[tokio::test]
    async fn wait_until_completion_predicate() {
        let cell = StateCell::new();
        cell.transition(Initializing);
        cell.transition(Failed);
        assert!(
            cell.wait_until(|s| s.is_completed(), Some(Duration::from_millis(20)))
                .await
        );
    }
}
