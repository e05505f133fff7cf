//! Named periodic tasks with idempotent start and stop

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

type TaskAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct RunningTask {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A named action run on a fixed cadence
///
/// Ticks missed while an action is still running are skipped rather than
/// replayed. Stopping waits for the in-flight action to finish.
pub struct PeriodicTask {
    name: String,
    period: Duration,
    action: TaskAction,
    running: Mutex<Option<RunningTask>>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, period: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let action: TaskAction = Arc::new(move || action().boxed());
        Self { name: name.into(), period, action, running: Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().as_ref().is_some_and(|task| !task.handle.is_finished())
    }

    /// Start the task; returns false when it was already running
    pub fn start(&self) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            debug!(task = %self.name, "Task already running");
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel();
        let action = self.action.clone();
        let period = self.period;
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => (action)().await,
                }
            }
            debug!(task = %name, "Task loop exited");
        });

        *running = Some(RunningTask { stop_tx, handle });
        info!(task = %self.name, "Started periodic task every {:?}", self.period);
        true
    }

    /// Stop the task; returns false when it was not running
    pub async fn stop(&self) -> bool {
        let Some(task) = self.running.lock().take() else {
            return false;
        };

        let _ = task.stop_tx.send(());
        if let Err(e) = task.handle.await {
            error!(task = %self.name, "Task ended abnormally: {}", e);
        }
        info!(task = %self.name, "Stopped periodic task");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_task(counter: Arc<AtomicUsize>) -> PeriodicTask {
        PeriodicTask::new("counter", Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[tokio::test]
    async fn test_runs_until_stopped() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(counter.clone());

        assert!(task.start());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(task.stop().await);

        let after_stop = counter.load(Ordering::SeqCst);
        assert!(after_stop >= 2, "ran {after_stop} times");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let task = counting_task(Arc::new(AtomicUsize::new(0)));

        assert!(!task.stop().await);
        assert!(task.start());
        assert!(!task.start());
        assert!(task.is_running());

        assert!(task.stop().await);
        assert!(!task.stop().await);
        assert!(!task.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting_task(counter.clone());

        task.start();
        task.stop().await;
        let before = counter.load(Ordering::SeqCst);

        assert!(task.start());
        tokio::time::sleep(Duration::from_millis(30)).await;
        task.stop().await;
        assert!(counter.load(Ordering::SeqCst) > before);
    }
}
