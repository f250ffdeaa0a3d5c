//! Exactly-once completion.

use crate::atomic::result::UpdateOutcome;
use crate::core::error::{CacheError, CacheResult};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Latches the first result handed to it; later results are dropped.
#[derive(Debug)]
pub struct CompletionLatch<T> {
    done: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> CompletionLatch<T> {
    /// Create a latch and the receiver its result is delivered to.
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let latch = Self {
            done: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
        };
        (latch, rx)
    }

    /// Latch `value`. Returns `true` only for the call that won.
    pub fn complete(&self, value: T) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(tx) = self.tx.lock().take() {
            // The caller may have stopped waiting.
            let _ = tx.send(value);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Client-side handle of an atomic update.
///
/// Resolves once the update completes: successfully, with a terminal error, or
/// after the retry budget ran out.
#[derive(Debug)]
pub struct UpdateHandle {
    rx: oneshot::Receiver<CacheResult<UpdateOutcome>>,
}

impl UpdateHandle {
    pub(crate) fn new(rx: oneshot::Receiver<CacheResult<UpdateOutcome>>) -> Self {
        Self { rx }
    }

    /// Wait for the update to complete.
    pub async fn wait(self) -> CacheResult<UpdateOutcome> {
        self.await
    }

    /// Result if the update already completed.
    pub fn try_result(&mut self) -> Option<CacheResult<UpdateOutcome>> {
        self.rx.try_recv().ok()
    }
}

impl Future for UpdateHandle {
    type Output = CacheResult<UpdateOutcome>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(CacheError::internal(
                "update future dropped without completing",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn first_completion_wins() {
        let (latch, mut rx) = CompletionLatch::new();
        assert!(latch.complete(1));
        assert!(!latch.complete(2));
        assert!(latch.is_done());
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn concurrent_completions_latch_once() {
        let (latch, mut rx) = CompletionLatch::new();
        let latch = Arc::new(latch);

        let winners: usize = (0..16)
            .map(|i| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.complete(i))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn handle_resolves_with_result() {
        let (latch, rx) = CompletionLatch::new();
        let handle = UpdateHandle::new(rx);
        latch.complete(Ok(UpdateOutcome::Success(true)));
        assert_eq!(handle.await.unwrap(), UpdateOutcome::Success(true));
    }

    #[tokio::test]
    async fn dropped_latch_is_internal_error() {
        let (latch, rx) = CompletionLatch::<CacheResult<UpdateOutcome>>::new();
        drop(latch);
        let result = UpdateHandle::new(rx).await;
        assert!(matches!(result, Err(CacheError::Internal { .. })));
    }
}
