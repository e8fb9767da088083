//! Periodic background tasks.
//!
//! A [`Loop`] runs an async body on a fixed period until it is stopped,
//! cancelled, reaches its iteration count, or the client shuts down.
//!
//! ```rust,ignore
//! let heartbeat = Loop::new(Duration::from_secs(60), move || {
//!     let handle = handle.clone();
//!     async move {
//!         handle.update_presence(Presence {
//!             activities: vec![Activity::playing("with ferrum")],
//!             ..Default::default()
//!         })?;
//!         Ok(())
//!     }
//! })
//! .on_error(|e| async move { warn!(error = %e, "Presence update failed") });
//!
//! client.start_loop(&heartbeat);
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Level, debug, span, warn};

use ferrum_core::{BoxError, panic_message};

type Body = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;
type LoopHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
type LoopErrorHook = Arc<dyn Fn(BoxError) -> BoxFuture<'static, ()> + Send + Sync>;

struct Shared {
    name: String,
    body: Body,
    period: Mutex<Duration>,
    count: Option<u64>,
    reconnect: bool,
    before: Option<LoopHook>,
    after: Option<LoopHook>,
    on_error: Option<LoopErrorHook>,
    completed: AtomicU64,
}

struct Running {
    stop: CancellationToken,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A body run every `period`, first immediately.
///
/// Configure with the consuming setters, then [`start`](Loop::start) it.
/// A stopped loop can be started again; the iteration counter carries over.
pub struct Loop {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Loop {
    pub fn new<F, Fut>(period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                name: "loop".to_string(),
                body: Arc::new(move || body().boxed()),
                period: Mutex::new(period),
                count: None,
                reconnect: true,
                before: None,
                after: None,
                on_error: None,
                completed: AtomicU64::new(0),
            }),
            running: Mutex::new(None),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => f(shared),
            None => warn!(task = %self.shared.name, "Loop reconfigured after start, ignoring"),
        }
        self
    }

    /// Name used in logs.
    pub fn name(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.configure(|s| s.name = name)
    }

    /// Stops after `count` iterations, failed ones included.
    pub fn count(self, count: u64) -> Self {
        self.configure(|s| s.count = Some(count))
    }

    /// Whether a failed iteration keeps the loop going. On by default.
    pub fn reconnect(self, reconnect: bool) -> Self {
        self.configure(|s| s.reconnect = reconnect)
    }

    /// Runs once before the first iteration.
    pub fn before_loop<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.configure(|s| s.before = Some(Arc::new(move || f().boxed())))
    }

    /// Runs once after the last iteration, however the loop ended.
    pub fn after_loop<F, Fut>(self, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.configure(|s| s.after = Some(Arc::new(move || f().boxed())))
    }

    /// Receives every failed or panicked iteration. Without one, failures
    /// are logged.
    pub fn on_error<F, Fut>(self, f: F) -> Self
    where
        F: Fn(BoxError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.configure(|s| s.on_error = Some(Arc::new(move |e| f(e).boxed())))
    }

    /// Spawns the loop. It also ends when `shutdown` is cancelled.
    ///
    /// Returns `false` if the loop is already running.
    pub fn start(&self, shutdown: &CancellationToken) -> bool {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return false;
        }

        let stop = CancellationToken::new();
        let cancel = shutdown.child_token();
        let span = span!(Level::DEBUG, "task", name = %self.shared.name);
        let task = tokio::spawn(
            run(Arc::clone(&self.shared), stop.clone(), cancel.clone()).instrument(span),
        );
        *running = Some(Running { stop, cancel, task });
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Ends the loop after the current iteration.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.stop.cancel();
        }
    }

    /// Ends the loop now, abandoning an iteration in progress.
    pub fn cancel(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.cancel.cancel();
        }
    }

    /// Waits for the loop to end.
    pub async fn join(&self) {
        let task = self.running.lock().take().map(|r| r.task);
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(task = %self.shared.name, error = %e, "Loop task failed");
            }
        }
    }

    /// Takes effect from the next wait.
    pub fn change_interval(&self, period: Duration) {
        *self.shared.period.lock() = period;
    }

    pub fn interval(&self) -> Duration {
        *self.shared.period.lock()
    }

    /// Iterations finished so far.
    pub fn current_loop(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Loop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loop")
            .field("name", &self.shared.name)
            .field("interval", &self.interval())
            .field("current_loop", &self.current_loop())
            .field("running", &self.is_running())
            .finish()
    }
}

/// `None` for a zero period, which yields between iterations instead.
fn make_ticker(period: Duration, start: Instant) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => tokio::task::yield_now().await,
    }
}

async fn iterate(shared: &Shared) -> Result<(), BoxError> {
    match AssertUnwindSafe((shared.body)()).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(format!("loop body panicked: {}", panic_message(&*payload)).into()),
    }
}

async fn run(shared: Arc<Shared>, stop: CancellationToken, cancel: CancellationToken) {
    if let Some(before) = &shared.before {
        before().await;
    }

    let mut period = *shared.period.lock();
    let mut ticker = make_ticker(period, Instant::now());
    let mut iterations = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = stop.cancelled() => break,
            _ = tick(&mut ticker) => {}
        }

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            outcome = iterate(&shared) => outcome,
        };
        iterations += 1;
        shared.completed.fetch_add(1, Ordering::AcqRel);

        if let Err(e) = outcome {
            match &shared.on_error {
                Some(hook) => hook(e).await,
                None => warn!(error = %e, "Loop iteration failed"),
            }
            if !shared.reconnect {
                debug!("Loop ended after a failed iteration");
                break;
            }
        }
        if shared.count.is_some_and(|count| iterations >= count) || stop.is_cancelled() {
            break;
        }

        let current = *shared.period.lock();
        if current != period {
            period = current;
            ticker = make_ticker(period, Instant::now() + period);
        }
    }

    if let Some(after) = &shared.after {
        after().await;
    }
    debug!(iterations, "Loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    type Ready = futures::future::Ready<Result<(), BoxError>>;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Ready + Send + Sync + 'static) {
        let runs = Arc::new(AtomicUsize::new(0));
        let body_runs = runs.clone();
        let body = move || {
            body_runs.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        };
        (runs, body)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_count_times_on_period() {
        let (runs, body) = counter();
        let events = Arc::new(Mutex::new(Vec::new()));
        let (before, after) = (events.clone(), events.clone());
        let task = Loop::new(Duration::from_secs(10), body)
            .count(3)
            .before_loop(move || {
                before.lock().push("before");
                async {}
            })
            .after_loop(move || {
                after.lock().push("after");
                async {}
            });

        let started = Instant::now();
        assert!(task.start(&CancellationToken::new()));
        task.join().await;

        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(task.current_loop(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(*events.lock(), ["before", "after"]);
        assert!(!task.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_reach_hook_and_reconnect() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let task = Loop::new(Duration::from_secs(1), || async {
            Err::<(), BoxError>("flaky".into())
        })
        .count(2)
        .on_error(move |e| {
            let sink = sink.clone();
            async move { sink.lock().push(e.to_string()) }
        });

        task.start(&CancellationToken::new());
        task.join().await;
        assert_eq!(*errors.lock(), ["flaky", "flaky"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_reconnect_ends_loop() {
        let ended = Arc::new(AtomicUsize::new(0));
        let after = ended.clone();
        fn explode() -> Result<(), BoxError> {
            panic!("boom")
        }
        let task = Loop::new(Duration::from_secs(1), || async { explode() })
            .reconnect(false)
            .after_loop(move || {
                after.fetch_add(1, Ordering::SeqCst);
                async {}
            });

        task.start(&CancellationToken::new());
        task.join().await;
        assert_eq!(task.current_loop(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_shutdown() {
        let (runs, body) = counter();
        let task = Loop::new(Duration::from_secs(5), body);
        let shutdown = CancellationToken::new();

        assert!(task.start(&shutdown));
        assert!(!task.start(&shutdown));
        tokio::time::sleep(Duration::from_secs(12)).await;
        task.stop();
        task.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        // Restartable; the client shutdown token ends it too.
        assert!(task.start(&shutdown));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        task.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 4);
        assert_eq!(task.current_loop(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_iteration() {
        let finished = Arc::new(AtomicUsize::new(0));
        let done = finished.clone();
        let task = Loop::new(Duration::from_secs(1), move || {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        task.start(&CancellationToken::new());
        tokio::time::sleep(Duration::from_secs(1)).await;
        task.cancel();
        task.join().await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
        assert_eq!(task.current_loop(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_interval() {
        let (runs, body) = counter();
        let task = Loop::new(Duration::from_secs(10), body).count(3);
        task.change_interval(Duration::from_secs(2));

        let started = Instant::now();
        task.start(&CancellationToken::new());
        task.join().await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(4));
        assert_eq!(task.interval(), Duration::from_secs(2));
    }
}
