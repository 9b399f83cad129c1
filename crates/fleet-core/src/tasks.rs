use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::{JoinError, JoinSet};
use tracing::{error, warn};

use crate::Result;

/// Best-effort side effects (reactions, read receipts).
///
/// Each submission runs at most once; failures and panics are logged and
/// dropped, never retried.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    workers: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let mut workers = self.workers();
        workers.spawn(async move {
            if let Err(e) = fut.await {
                warn!(task = name, error = %e, "background task failed");
            }
        });

        // Reap whatever already finished so the set does not grow unbounded.
        while let Some(res) = workers.try_join_next() {
            log_join_result(res);
        }
    }

    pub fn pending(&self) -> usize {
        self.workers().len()
    }

    /// Wait up to `grace` for pending work. Returns false if some was still
    /// running; that remainder is aborted.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut workers = std::mem::take(&mut *self.workers());
        let done = tokio::time::timeout(grace, async {
            while let Some(res) = workers.join_next().await {
                log_join_result(res);
            }
        })
        .await
        .is_ok();

        if !done {
            warn!(
                pending = workers.len(),
                "background tasks still running at shutdown; aborting"
            );
        }
        done
    }

    fn workers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn log_join_result(res: std::result::Result<(), JoinError>) {
    match res {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(error = %e, "background task panicked"),
        Err(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::Error;

    #[tokio::test]
    async fn failures_and_panics_do_not_escape() {
        let pool = BackgroundTasks::new();
        let ran = Arc::new(AtomicUsize::new(0));

        let r = ran.clone();
        pool.submit("ok", async move {
            r.fetch_add(1, Ordering::SeqCst);
            Ok::<(), Error>(())
        });
        pool.submit("err", async { Err::<(), _>(Error::Transport("down".into())) });
        pool.submit("panic", async {
            if ran_never() {
                return Ok::<(), Error>(());
            }
            panic!("boom")
        });

        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn drain_gives_up_after_grace() {
        let pool = BackgroundTasks::new();
        pool.submit("slow", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        assert!(!pool.drain(Duration::from_millis(20)).await);
        assert_eq!(pool.pending(), 0);

        // The pool stays usable after a drain.
        pool.submit("after", async { Ok(()) });
        assert!(pool.drain(Duration::from_secs(5)).await);
    }

    fn ran_never() -> bool {
        false
    }
}
