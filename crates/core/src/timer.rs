use crate::error::StageError;
use crate::stage::Stage;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

pub type TimerId = u64;

/// A delayed, cancellable action tied to the stage it was armed for.
#[derive(Debug)]
pub struct FallbackTimer {
    id: TimerId,
    stage: Stage,
    handle: JoinHandle<()>,
}

impl FallbackTimer {
    /// Sleeps for `delay`, then runs `action`. Cancellation is a normal exit;
    /// an error returned by the action is logged and goes no further.
    pub fn spawn<F>(id: TimerId, stage: Stage, delay: Duration, action: F) -> Self
    where
        F: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = action.await {
                tracing::error!(%stage, "Fallback timer action failed: {}", e);
            }
        });
        Self { id, stage, handle }
    }

    pub fn id(&self) -> TimerId {
        self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Holds the one live fallback timer of a room.
#[derive(Debug, Default)]
pub struct TimerRegistry {
    current: Option<FallbackTimer>,
    next_id: TimerId,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms a timer for `stage`, cancelling whatever was pending before.
    /// `make_action` receives the new timer's id so the action can later
    /// `release` itself.
    pub fn arm<F>(
        &mut self,
        stage: Stage,
        delay: Duration,
        make_action: impl FnOnce(TimerId) -> F,
    ) -> TimerId
    where
        F: Future<Output = Result<(), StageError>> + Send + 'static,
    {
        self.cancel();
        self.next_id += 1;
        let id = self.next_id;
        tracing::debug!(%stage, id, "Arming fallback timer for {:?}", delay);
        self.current = Some(FallbackTimer::spawn(id, stage, delay, make_action(id)));
        id
    }

    /// Cancels the pending timer, returning the stage it was armed for.
    pub fn cancel(&mut self) -> Option<Stage> {
        let timer = self.current.take()?;
        let stage = timer.stage();
        tracing::debug!(%stage, id = timer.id(), "Cancelling fallback timer");
        timer.cancel();
        Some(stage)
    }

    /// Detaches the timer with `id` without aborting it. A firing timer calls
    /// this before acting so nothing can cancel it halfway through its own
    /// transition. Returns false when that timer is no longer the live one.
    pub fn release(&mut self, id: TimerId) -> bool {
        match &self.current {
            Some(timer) if timer.id() == id => {
                self.current = None;
                true
            }
            _ => false,
        }
    }

    /// The stage of the live timer, if any.
    pub fn pending(&self) -> Option<Stage> {
        self.current.as_ref().map(FallbackTimer::stage)
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_action(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnOnce(TimerId) -> std::pin::Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>>
    {
        let counter = counter.clone();
        move |_| {
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut registry = TimerRegistry::new();
        registry.arm(Stage::SelfIntro, Duration::from_secs(2), counting_action(&fired));
        assert_eq!(registry.pending(), Some(Stage::SelfIntro));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_arming_replaces_previous_timer() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut registry = TimerRegistry::new();
        registry.arm(Stage::SelfIntro, Duration::from_secs(1), counting_action(&first));
        registry.arm(Stage::Experience, Duration::from_secs(1), counting_action(&second));
        assert_eq!(registry.pending(), Some(Stage::Experience));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut registry = TimerRegistry::new();
        registry.arm(Stage::Start, Duration::from_secs(1), counting_action(&fired));
        assert_eq!(registry.cancel(), Some(Stage::Start));
        assert_eq!(registry.cancel(), None);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(registry.pending(), None);
    }

    #[tokio::test]
    async fn test_release_only_matches_live_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut registry = TimerRegistry::new();
        let old = registry.arm(Stage::Start, Duration::from_secs(60), counting_action(&fired));
        let live = registry.arm(Stage::SelfIntro, Duration::from_secs(60), counting_action(&fired));
        assert!(!registry.release(old));
        assert!(registry.release(live));
        assert_eq!(registry.pending(), None);
    }
}
