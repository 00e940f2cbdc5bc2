//! Serial task queue with timers
//!
//! Every controller owns one [`Worker`]. Jobs run one at a time in submission
//! order, so a controller's internal state is only ever touched by one job.
//! Timers do not run jobs themselves; they enqueue them, and hold only a
//! weak reference so a dropped worker stops its timers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tracing::{Instrument, Span, debug};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to one scheduled timer
#[derive(Debug, Clone)]
pub struct TimerHandle(AbortHandle);

impl TimerHandle {
    /// Stop the timer; jobs it already enqueued still run
    pub fn cancel(&self) {
        self.0.abort();
    }
}

/// Serial executor owned by one controller
///
/// Must be created inside a tokio runtime. Clones share the same queue.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
    span: Span,
    timers: Mutex<Vec<AbortHandle>>,
    runner: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Worker {
    /// Start a worker; jobs run inside `span`
    pub fn new(name: &'static str, span: Span) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

        let runner = tokio::spawn(
            async move {
                while let Some(job) = rx.recv().await {
                    job.await;
                }
                debug!("Worker queue closed");
            }
            .instrument(span.clone()),
        );

        Self {
            inner: Arc::new(WorkerInner {
                name,
                tx,
                span,
                timers: Mutex::new(Vec::new()),
                runner: Mutex::new(Some(runner)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Worker name
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Span jobs run in
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Enqueue a job; false once the worker has shut down
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            debug!("{}: dropping job submitted after shutdown", self.inner.name);
            return false;
        }
        self.inner
            .tx
            .send(Box::pin(job.instrument(self.inner.span.clone())))
            .is_ok()
    }

    /// Enqueue `make()` once after `delay`
    pub fn schedule_once<F, M>(&self, delay: Duration, make: M) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
        M: FnOnce() -> F + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                Worker { inner }.submit(make());
            }
        });
        self.track(handle)
    }

    /// Enqueue `make()` every `period`, first after one period
    pub fn schedule_every<F, M>(&self, period: Duration, make: M) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
        M: Fn() -> F + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if !(Worker { inner }).submit(make()) {
                    break;
                }
            }
        });
        self.track(handle)
    }

    /// Cancel every pending timer
    pub fn cancel_scheduled(&self) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }

    /// Wait until every job submitted so far has run, up to `limit`
    pub async fn drain(&self, limit: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        if !self.submit(async move {
            let _ = tx.send(());
        }) {
            return false;
        }
        matches!(timeout(limit, rx).await, Ok(Ok(())))
    }

    /// Cancel timers, stop the runner, and reject further jobs
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_scheduled();
        if let Some(runner) = self
            .inner
            .runner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runner.abort();
        }
        debug!("{}: worker shut down", self.inner.name);
    }

    /// Whether [`Worker::shutdown`] has run
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    fn track(&self, handle: JoinHandle<()>) -> TimerHandle {
        let abort = handle.abort_handle();
        let mut timers = self.inner.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.retain(|t| !t.is_finished());
        timers.push(abort.clone());
        TimerHandle(abort)
    }
}

impl Drop for WorkerInner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        for timer in timers.drain(..) {
            timer.abort();
        }
    }
}
