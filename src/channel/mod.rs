//! Producer-facing façade. Items are queued to a single worker task
//! (preserving per-channel order without blocking producers), enriched
//! with context, serialized, and handed to the spool; the transmitter
//! drains the spool in the background.

mod file_sink;
mod serialization;

use crate::clock::SystemClock;
use crate::domain::{TelemetryContext, TelemetryItem};
use crate::sender::{HttpSender, ReqwestSender, SenderConfig, SenderError};
use crate::spool::{DropReason, EnqueueResult, OsFileSystem, Spool, SpoolConfig, Transmission};
use crate::stats::{ChannelStats, TelemetryCounters};
use crate::transmitter::{Transmitter, TransmitterConfig};
use bytes::Bytes;
use chrono::Utc;
use file_sink::FileSink;
use parking_lot::Mutex;
use serialization::EnvelopeSerializer;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use url::Url;

/// When `true` (or `1`), the channel is created disabled: every send is a
/// no-op and no spool or transmitter exists.
pub const OPTOUT_ENV: &str = "BEACON_TELEMETRY_OPTOUT";
/// When set, envelopes are appended to this file as NDJSON instead of
/// being spooled and transmitted.
pub const FILE_SINK_ENV: &str = "BEACON_TELEMETRY_FILE";

const DISPOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sender(#[from] SenderError),
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub endpoint: Url,
    pub product: String,
    pub product_version: String,
    pub spool: SpoolConfig,
    pub transmitter: TransmitterConfig,
    pub sender: SenderConfig,
}

impl ChannelConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            product: "beacon".to_string(),
            product_version: env!("CARGO_PKG_VERSION").to_string(),
            spool: SpoolConfig::default(),
            transmitter: TransmitterConfig::default(),
            sender: SenderConfig::default(),
        }
    }
}

enum Command {
    Item(TelemetryItem),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
    transmitter: Mutex<Option<Transmitter>>,
}

/// The telemetry entry point an application holds on to.
///
/// `send` never blocks beyond queueing and never fails; `dispose` is the
/// only way to stop the machinery underneath.
pub struct TelemetryChannel {
    inner: Option<Inner>,
    counters: Arc<TelemetryCounters>,
    disposed: AtomicBool,
}

impl TelemetryChannel {
    /// Builds a channel honoring the `BEACON_TELEMETRY_*` environment
    /// switches.
    pub async fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        if optout() {
            info!("telemetry.optout");
            return Ok(Self::disabled());
        }
        if let Some(path) = file_sink_path() {
            return Self::with_file_sink(config, &path).await;
        }
        let sender = ReqwestSender::new(config.sender.clone())?;
        Self::with_sender(config, sender).await
    }

    /// A channel that accepts and discards everything.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            counters: Arc::new(TelemetryCounters::default()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Full spool-and-transmit channel with a caller-provided sender.
    pub async fn with_sender<S: HttpSender>(
        config: ChannelConfig,
        sender: S,
    ) -> Result<Self, ChannelError> {
        let counters = Arc::new(TelemetryCounters::default());
        let spool: Arc<Spool<OsFileSystem, SystemClock>> =
            Arc::new(Spool::open(config.spool.clone()).await?);

        let mut transmitter_config = config.transmitter.clone();
        transmitter_config.counters = counters.clone();
        let transmitter =
            Transmitter::start(spool.clone(), Arc::new(sender), transmitter_config);

        let serializer = EnvelopeSerializer::new(TelemetryContext::collect(
            &config.product,
            &config.product_version,
        ));
        let sink = WorkerSink::Spool {
            spool,
            endpoint: config.endpoint.clone(),
        };
        Ok(Self::spawn_worker(serializer, sink, counters, Some(transmitter)))
    }

    async fn with_file_sink(config: ChannelConfig, path: &Path) -> Result<Self, ChannelError> {
        let sink = FileSink::create(path).await?;
        info!(path = %path.display(), "telemetry.file_sink");
        let serializer = EnvelopeSerializer::new(TelemetryContext::collect(
            &config.product,
            &config.product_version,
        ));
        let counters = Arc::new(TelemetryCounters::default());
        Ok(Self::spawn_worker(
            serializer,
            WorkerSink::File(sink),
            counters,
            None,
        ))
    }

    fn spawn_worker(
        serializer: EnvelopeSerializer,
        sink: WorkerSink,
        counters: Arc<TelemetryCounters>,
        transmitter: Option<Transmitter>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ChannelWorker {
            rx,
            serializer,
            sink,
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run());
        Self {
            inner: Some(Inner {
                tx: Mutex::new(Some(tx)),
                worker: Mutex::new(Some(handle)),
                transmitter: Mutex::new(transmitter),
            }),
            counters,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn stats(&self) -> ChannelStats {
        self.counters.snapshot()
    }

    /// Queues one item. No-op once disposed, disabled, or opted out.
    pub fn send(&self, item: impl Into<TelemetryItem>) {
        if self.disposed.load(Ordering::Relaxed) {
            return;
        }
        let Some(inner) = &self.inner else {
            return;
        };
        let guard = inner.tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(Command::Item(item.into())).is_ok() {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Waits until everything queued before this call has reached the
    /// spool (or the debug file), or until the timeout. Never fails.
    pub async fn flush(&self, timeout: Duration) {
        self.flush_with_cancel(timeout, std::future::pending()).await;
    }

    /// [`flush`](Self::flush) that also returns when `cancel` resolves.
    pub async fn flush_with_cancel(&self, timeout: Duration, cancel: impl Future<Output = ()>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let guard = inner.tx.lock();
            let Some(tx) = guard.as_ref() else {
                return;
            };
            if tx.send(Command::Flush(ack_tx)).is_err() {
                return;
            }
        }
        tokio::select! {
            _ = ack_rx => {}
            _ = tokio::time::sleep(timeout) => {}
            _ = cancel => {}
        }
    }

    /// Stops accepting sends, drains the worker queue, then stops the
    /// transmitter. Safe to call more than once.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = &self.inner else {
            return;
        };
        // Closing the queue lets the worker drain what is left and exit.
        drop(inner.tx.lock().take());
        let worker = inner.worker.lock().take();
        if let Some(handle) = worker {
            if tokio::time::timeout(DISPOSE_GRACE, handle).await.is_err() {
                warn!("channel.dispose.timeout");
            }
        }
        let transmitter = inner.transmitter.lock().take();
        if let Some(transmitter) = transmitter {
            transmitter.dispose().await;
        }
    }
}

enum WorkerSink {
    Spool {
        spool: Arc<Spool<OsFileSystem, SystemClock>>,
        endpoint: Url,
    },
    File(FileSink),
}

struct ChannelWorker {
    rx: mpsc::UnboundedReceiver<Command>,
    serializer: EnvelopeSerializer,
    sink: WorkerSink,
    counters: Arc<TelemetryCounters>,
}

impl ChannelWorker {
    async fn run(mut self) {
        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Item(item) => self.handle_item(item).await,
                Command::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }

    async fn handle_item(&mut self, item: TelemetryItem) {
        let json = match self.serializer.to_json(&item, Utc::now()) {
            Ok(json) => json,
            Err(e) => {
                self.counters
                    .serialization_failures
                    .fetch_add(1, Ordering::Relaxed);
                warn!(item = %item.name(), error = %e, "send.serialize.failed");
                return;
            }
        };

        match &mut self.sink {
            WorkerSink::File(sink) => sink.append(&json).await,
            WorkerSink::Spool { spool, endpoint } => {
                let payload = match serialization::gzip(&json) {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.counters
                            .serialization_failures
                            .fetch_add(1, Ordering::Relaxed);
                        warn!(item = %item.name(), error = %e, "send.serialize.failed");
                        return;
                    }
                };
                let transmission = Transmission::new(
                    endpoint.clone(),
                    Bytes::from(payload),
                    "application/json",
                    "gzip",
                    Utc::now(),
                );
                match spool.enqueue(&transmission).await {
                    EnqueueResult::Accepted => {}
                    EnqueueResult::Dropped(DropReason::Capacity) => {
                        self.counters
                            .enqueue_dropped_capacity
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    EnqueueResult::Dropped(DropReason::Io) => {
                        self.counters
                            .enqueue_dropped_io
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}

fn optout() -> bool {
    std::env::var(OPTOUT_ENV)
        .map(|v| {
            let v = v.trim();
            v == "1" || v.eq_ignore_ascii_case("true")
        })
        .unwrap_or(false)
}

fn file_sink_path() -> Option<PathBuf> {
    std::env::var(FILE_SINK_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}
