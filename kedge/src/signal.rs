//! Abort signalling.
//!
//! Every request owns an [`AbortHandle`]; callers may pass their own via
//! request options. A handle is a `watch` channel so that late observers
//! still see an abort that already happened, and so that the carried
//! reason reaches every waiter.

use std::sync::Arc;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AbortState {
    Armed,
    Aborted(Option<String>),
}

/// Clonable cancellation handle carrying an optional reason.
///
/// The first `abort` wins; later calls are no-ops. All clones observe the
/// same state.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<AbortState>>,
}

impl AbortHandle {
    /// A new, armed handle.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(AbortState::Armed);
        AbortHandle { tx: Arc::new(tx) }
    }

    /// Fire the handle. Only the first call takes effect.
    pub fn abort(&self, reason: Option<String>) {
        let mut reason = Some(reason);
        self.tx.send_if_modified(|state| {
            if matches!(state, AbortState::Armed) {
                *state = AbortState::Aborted(reason.take().flatten());
                true
            } else {
                false
            }
        });
    }

    /// Whether the handle has fired.
    pub fn is_aborted(&self) -> bool {
        matches!(*self.tx.borrow(), AbortState::Aborted(_))
    }

    /// The carried reason, once fired.
    pub fn reason(&self) -> Option<Option<String>> {
        match &*self.tx.borrow() {
            AbortState::Armed => None,
            AbortState::Aborted(reason) => Some(reason.clone()),
        }
    }

    /// Resolves with the carried reason when the handle fires.
    pub async fn aborted(&self) -> Option<String> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(|state| matches!(state, AbortState::Aborted(_)))
            .await;
        match state.as_deref() {
            Ok(AbortState::Aborted(reason)) => reason.clone(),
            _ => None,
        }
    }
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves when either the request's own handle or the caller-supplied
/// external handle fires, whichever is first.
pub(crate) async fn aborted_any(
    own: &AbortHandle,
    external: Option<&AbortHandle>,
) -> Option<String> {
    match external {
        Some(external) => tokio::select! {
            reason = own.aborted() => reason,
            reason = external.aborted() => reason,
        },
        None => own.aborted().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn abort_carries_reason_to_late_subscribers() {
        let handle = AbortHandle::new();
        handle.abort(Some("shutting down".into()));

        assert!(handle.is_aborted());
        // Subscribing after the fact still observes the abort.
        assert_eq!(handle.aborted().await, Some("shutting down".into()));
    }

    #[tokio::test]
    async fn first_abort_wins() {
        let handle = AbortHandle::new();
        handle.abort(None);
        handle.abort(Some("too late".into()));
        assert_eq!(handle.reason(), Some(None));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let handle = AbortHandle::new();
        let clone = handle.clone();
        let waiter = tokio::spawn(async move { clone.aborted().await });

        handle.abort(Some("stop".into()));
        assert_eq!(waiter.await.unwrap(), Some("stop".into()));
    }

    #[tokio::test]
    async fn aborted_any_listens_to_both() {
        let own = AbortHandle::new();
        let external = AbortHandle::new();
        external.abort(Some("caller".into()));
        assert_eq!(
            aborted_any(&own, Some(&external)).await,
            Some("caller".into())
        );
    }
}
