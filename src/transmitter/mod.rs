//! Background drainer: peeks the spool, posts each transmission, and
//! resolves the outcome. The loop never exits on its own; only
//! [`Transmitter::dispose`] stops it.

use crate::clock::Clock;
use crate::sender::{Backoff, HttpResult, HttpSender};
use crate::spool::{FileSystem, Spool};
use crate::stats::TelemetryCounters;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

const MIN_SENDING_INTERVAL: Duration = Duration::from_millis(50);
const DISPOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct TransmitterConfig {
    /// Idle poll floor. Values below 50 ms are raised to it so an empty
    /// spool does not spin.
    pub sending_interval: Duration,
    pub request_timeout: Duration,
    pub workers: usize,
    pub gc_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub counters: Arc<TelemetryCounters>,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            sending_interval: Duration::from_millis(50),
            request_timeout: Duration::from_secs(30),
            workers: 1,
            gc_interval: Duration::from_secs(3600),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            counters: Arc::new(TelemetryCounters::default()),
        }
    }
}

/// Handle over the running worker pool.
pub struct Transmitter {
    stop: Arc<StopSignal>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl Transmitter {
    pub fn start<F, C, S>(
        spool: Arc<Spool<F, C>>,
        sender: Arc<S>,
        config: TransmitterConfig,
    ) -> Self
    where
        F: FileSystem,
        C: Clock,
        S: HttpSender,
    {
        let stop = Arc::new(StopSignal::default());
        let workers = (0..config.workers.max(1))
            .map(|worker| {
                tokio::spawn(drain_loop(
                    worker,
                    spool.clone(),
                    sender.clone(),
                    config.clone(),
                    stop.clone(),
                ))
            })
            .collect();
        Self { stop, workers }
    }

    /// Stops the drain loop, waiting up to five seconds for workers to
    /// notice. Attempts still on the wire are abandoned; their files stay
    /// on disk for the next process.
    pub async fn dispose(mut self) {
        self.stop.trigger();
        let handles = std::mem::take(&mut self.workers);
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = futures::future::join_all(handles);
        if tokio::time::timeout(DISPOSE_GRACE, joined).await.is_err() {
            warn!("transmitter.dispose.timeout");
            for abort in aborts {
                abort.abort();
            }
        }
    }
}

#[derive(Debug, Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn trigger(&self) {
        self.stopped.store(true, Ordering::Relaxed);
        self.notify.notify_waiters();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }

    /// Sleeps for `duration` or until the signal fires.
    async fn sleep(&self, duration: Duration) {
        if self.is_stopped() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.notify.notified() => {}
        }
    }
}

enum DrainOutcome {
    /// Delivered or permanently dropped; look for more work right away.
    Progress,
    /// Retryable failure; the item went back to the queue.
    Retry,
    /// Nothing decodable to send.
    Idle,
}

async fn drain_loop<F, C, S>(
    worker: usize,
    spool: Arc<Spool<F, C>>,
    sender: Arc<S>,
    config: TransmitterConfig,
    stop: Arc<StopSignal>,
) where
    F: FileSystem,
    C: Clock,
    S: HttpSender,
{
    let sending_interval = config.sending_interval.max(MIN_SENDING_INTERVAL);
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_max);
    let mut last_gc = tokio::time::Instant::now();
    info!(worker, "transmitter.start");

    while !stop.is_stopped() {
        let outcome = {
            let iteration = drain_once(&spool, &*sender, &config, &mut backoff);
            AssertUnwindSafe(iteration).catch_unwind().await
        };
        match outcome {
            Ok(DrainOutcome::Progress) => {}
            Ok(DrainOutcome::Retry) => {
                let delay = backoff.next_delay();
                stop.sleep(delay).await;
            }
            Ok(DrainOutcome::Idle) => {
                let delay = backoff.next_delay().max(sending_interval);
                stop.sleep(delay).await;
            }
            Err(_) => {
                error!(worker, "transmitter.panic");
                stop.sleep(sending_interval).await;
            }
        }

        if last_gc.elapsed() >= config.gc_interval {
            spool.gc().await;
            last_gc = tokio::time::Instant::now();
        }
    }
    info!(worker, "transmitter.stop");
}

async fn drain_once<F, C, S>(
    spool: &Spool<F, C>,
    sender: &S,
    config: &TransmitterConfig,
    backoff: &mut Backoff,
) -> DrainOutcome
where
    F: FileSystem,
    C: Clock,
    S: HttpSender,
{
    let Some(item) = spool.peek().await else {
        return DrainOutcome::Idle;
    };

    if spool.past_retry_deadline(item.transmission()) {
        warn!(file = %item.file_name(), "send.drop.deadline");
        config
            .counters
            .dropped_deadline
            .fetch_add(1, Ordering::Relaxed);
        spool.delete(item).await;
        return DrainOutcome::Progress;
    }

    // A panicking sender must not leak the in-flight claim; treat it as
    // one more retryable failure.
    let result = AssertUnwindSafe(sender.post(item.transmission(), config.request_timeout))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| HttpResult::Retryable {
            status: None,
            reason: "sender panicked".to_string(),
        });

    match result {
        HttpResult::Success { status } => {
            debug!(file = %item.file_name(), status, "send.ok");
            config.counters.sent.fetch_add(1, Ordering::Relaxed);
            spool.delete(item).await;
            backoff.reset();
            DrainOutcome::Progress
        }
        HttpResult::Permanent { status } => {
            warn!(file = %item.file_name(), status, "send.drop.permanent");
            config
                .counters
                .dropped_permanent
                .fetch_add(1, Ordering::Relaxed);
            spool.delete(item).await;
            DrainOutcome::Progress
        }
        HttpResult::Retryable { status, reason } => {
            info!(file = %item.file_name(), ?status, %reason, "send.retry");
            config.counters.retried.fetch_add(1, Ordering::Relaxed);
            spool.release(item);
            DrainOutcome::Retry
        }
    }
}
