use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Runs a function on demand, at most once per `min_interval` and at least
/// once per `max_interval`.
///
/// Requests made while a run is pending or in progress collapse into one
/// follow-up run.
pub struct BoundedFrequencyRunner {
    name: String,
    min_interval: Duration,
    max_interval: Duration,
    notify: Notify,
}

impl BoundedFrequencyRunner {
    pub fn new(name: impl Into<String>, min_interval: Duration, max_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            min_interval,
            max_interval: max_interval.max(min_interval),
            notify: Notify::new(),
        })
    }

    /// Request a run.
    pub fn run(&self) {
        self.notify.notify_one();
    }

    /// Spawn the loop driving `f`.
    pub fn start<F, Fut>(self: &Arc<Self>, mut f: F) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let runner = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_run: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = runner.notify.notified() => {
                        debug!("{}: run requested", runner.name);
                    }
                    _ = tokio::time::sleep(runner.max_interval) => {
                        debug!("{}: periodic run", runner.name);
                    }
                }
                if let Some(last) = last_run {
                    let since = last.elapsed();
                    if since < runner.min_interval {
                        tokio::time::sleep(runner.min_interval - since).await;
                    }
                }
                last_run = Some(Instant::now());
                f().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn start_counting(runner: &Arc<BoundedFrequencyRunner>) -> (Arc<AtomicUsize>, tokio::task::JoinHandle<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = runner.start(move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, handle)
    }

    #[tokio::test]
    async fn bursts_are_coalesced() {
        let runner = BoundedFrequencyRunner::new("test", Duration::from_millis(200), Duration::from_secs(60));
        let (count, handle) = start_counting(&runner);

        runner.run();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            runner.run();
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        handle.abort();
    }

    #[tokio::test]
    async fn runs_periodically_without_requests() {
        let runner = BoundedFrequencyRunner::new("test", Duration::from_millis(10), Duration::from_millis(50));
        let (count, handle) = start_counting(&runner);

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!(count.load(Ordering::SeqCst) >= 2);
        handle.abort();
    }
}
