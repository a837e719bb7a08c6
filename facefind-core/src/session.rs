use crate::descriptor::ImageInput;
use crate::matcher::{MatchConfig, MatchError, MatchOutcome, Matcher, ScoredCandidate};
use crate::threshold::ResultKind;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

/// Lifecycle of one match session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    Idle,
    Preparing,
    Scanning,
    Completed,
    Cancelled,
    Failed,
}

impl MatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchState::Completed | MatchState::Cancelled | MatchState::Failed
        )
    }
}

/// Candidates processed so far out of the candidates in scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.done as f32 / self.total as f32
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }
}

/// Immutable view of a session, published after every state change and batch
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub results: Vec<ScoredCandidate>,
    pub kind: ResultKind,
    pub progress: Progress,
    pub state: MatchState,
    /// Candidates visited that produced no usable descriptor
    pub unscored: usize,
    /// Set only on the terminal snapshot of a failed session
    pub error: Option<MatchError>,
}

/// Cloneable cancel switch for a running session
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; in-flight provider calls are left to settle
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Caller's side of a running match session.
///
/// Dropping the handle does not stop the session; call [`MatchHandle::cancel`]
/// or retire it through a [`SessionSlot`].
pub struct MatchHandle {
    updates: UnboundedReceiverStream<MatchSnapshot>,
    cancel: CancelHandle,
    task: JoinHandle<Result<MatchOutcome, MatchError>>,
}

impl MatchHandle {
    pub(crate) fn new(
        updates: mpsc::UnboundedReceiver<MatchSnapshot>,
        cancel: CancelHandle,
        task: JoinHandle<Result<MatchOutcome, MatchError>>,
    ) -> Self {
        Self {
            updates: UnboundedReceiverStream::new(updates),
            cancel,
            task,
        }
    }

    /// Next published snapshot, or `None` once the session has ended
    pub async fn next(&mut self) -> Option<MatchSnapshot> {
        self.updates.next().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn canceller(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Wait for the session to end and return its final outcome
    pub async fn join(self) -> Result<MatchOutcome, MatchError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MatchError::Internal(e.to_string())),
        }
    }

    /// Consume the handle as a stream of snapshots ending with the terminal one
    pub fn into_stream(self) -> UnboundedReceiverStream<MatchSnapshot> {
        self.updates
    }
}

/// Holds at most one active session for a caller context
#[derive(Debug, Default)]
pub struct SessionSlot {
    active: Option<CancelHandle>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retire any prior session, then start a new one
    pub fn start(&mut self, matcher: &Matcher, query: ImageInput, config: MatchConfig) -> MatchHandle {
        if self.retire() {
            log::debug!("Retired previous match session");
        }
        let handle = matcher.start(query, config);
        self.active = Some(handle.canceller());
        handle
    }

    /// Cancel the active session, returning whether one was still running
    pub fn retire(&mut self) -> bool {
        match self.active.take() {
            Some(cancel) if !cancel.is_cancelled() => {
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .as_ref()
            .map(|cancel| !cancel.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(Progress { done: 0, total: 0 }.fraction(), 1.0);
        assert_eq!(Progress { done: 1, total: 4 }.fraction(), 0.25);
        assert!(Progress { done: 4, total: 4 }.is_complete());
        assert!(!Progress { done: 3, total: 4 }.is_complete());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MatchState::Idle.is_terminal());
        assert!(!MatchState::Preparing.is_terminal());
        assert!(!MatchState::Scanning.is_terminal());
        assert!(MatchState::Completed.is_terminal());
        assert!(MatchState::Cancelled.is_terminal());
        assert!(MatchState::Failed.is_terminal());
    }

    #[test]
    fn test_cancel_handle_shared() {
        let handle = CancelHandle::new();
        let other = handle.clone();
        assert!(!other.is_cancelled());
        handle.cancel();
        assert!(other.is_cancelled());
    }
}
