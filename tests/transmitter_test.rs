use beacon_telemetry::sender::{HttpResult, HttpSender, ReqwestSender, SenderConfig};
use beacon_telemetry::spool::{Spool, SpoolConfig, Transmission};
use beacon_telemetry::stats::TelemetryCounters;
use beacon_telemetry::transmitter::{Transmitter, TransmitterConfig};
use bytes::Bytes;
use chrono::Utc;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn fast_config(counters: Arc<TelemetryCounters>) -> TransmitterConfig {
    TransmitterConfig {
        sending_interval: Duration::from_millis(50),
        request_timeout: Duration::from_secs(5),
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(200),
        counters,
        ..Default::default()
    }
}

async fn spool_in(dir: &Path) -> Arc<Spool> {
    let config = SpoolConfig {
        directory: dir.to_path_buf(),
        ..Default::default()
    };
    Arc::new(Spool::open(config).await.unwrap())
}

fn transmission_to(endpoint: &str) -> Transmission {
    Transmission::new(
        Url::parse(endpoint).unwrap(),
        Bytes::from_static(b"{\"name\":\"startup\"}"),
        "application/json",
        "",
        Utc::now(),
    )
}

fn trn_count(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path().extension().and_then(|x| x.to_str()) == Some("trn")
                })
                .count()
        })
        .unwrap_or(0)
}

async fn wait_until(mut predicate: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

#[tokio::test]
async fn delivers_and_deletes_on_success() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/ingest"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;
    spool
        .enqueue(&transmission_to(&format!("{}/ingest", server.uri())))
        .await;

    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(ReqwestSender::new(SenderConfig::default()).unwrap());
    let transmitter = Transmitter::start(spool.clone(), sender, fast_config(counters.clone()));

    assert!(
        wait_until(|| trn_count(dir.path()) == 0, Duration::from_secs(5)).await,
        "spool should drain"
    );
    assert_eq!(counters.snapshot().sent, 1);
    transmitter.dispose().await;
}

#[tokio::test]
async fn retryable_failure_leaves_the_file_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;
    spool
        .enqueue(&transmission_to(&format!("{}/ingest", server.uri())))
        .await;

    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(ReqwestSender::new(SenderConfig::default()).unwrap());
    let transmitter = Transmitter::start(spool.clone(), sender, fast_config(counters.clone()));

    assert!(
        wait_until(|| trn_count(dir.path()) == 0, Duration::from_secs(5)).await,
        "retry should eventually deliver"
    );
    let stats = counters.snapshot();
    assert!(stats.retried >= 1, "first attempt should have been retried");
    assert_eq!(stats.sent, 1);
    transmitter.dispose().await;
}

#[tokio::test]
async fn permanent_rejection_drops_the_file() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;
    spool
        .enqueue(&transmission_to(&format!("{}/ingest", server.uri())))
        .await;

    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(ReqwestSender::new(SenderConfig::default()).unwrap());
    let transmitter = Transmitter::start(spool.clone(), sender, fast_config(counters.clone()));

    assert!(
        wait_until(|| trn_count(dir.path()) == 0, Duration::from_secs(5)).await,
        "permanently rejected file should be dropped"
    );
    let stats = counters.snapshot();
    assert_eq!(stats.dropped_permanent, 1);
    assert_eq!(stats.sent, 0);
    transmitter.dispose().await;
}

/// Never answers; counts attempts.
#[derive(Clone)]
struct CountingSender {
    calls: Arc<AtomicUsize>,
}

impl HttpSender for CountingSender {
    fn post(
        &self,
        _transmission: &Transmission,
        _timeout: Duration,
    ) -> impl Future<Output = HttpResult> + Send {
        let calls = self.calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            HttpResult::Retryable {
                status: None,
                reason: "connection refused".to_string(),
            }
        }
    }
}

#[tokio::test]
async fn deadline_exceeded_drops_without_posting() {
    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;
    let stale = Transmission::new(
        Url::parse("http://localhost:9600/ingest").unwrap(),
        Bytes::from_static(b"{}"),
        "application/json",
        "",
        Utc::now() - chrono::Duration::hours(3),
    );
    spool.enqueue(&stale).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(CountingSender {
        calls: calls.clone(),
    });
    let transmitter = Transmitter::start(spool.clone(), sender, fast_config(counters.clone()));

    assert!(
        wait_until(|| trn_count(dir.path()) == 0, Duration::from_secs(5)).await,
        "expired file should be dropped"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0, "no attempt should be made");
    assert_eq!(counters.snapshot().dropped_deadline, 1);
    transmitter.dispose().await;
}

/// Panics on the first attempt, succeeds afterwards.
#[derive(Clone)]
struct PanickySender {
    call_times: Arc<std::sync::Mutex<Vec<Instant>>>,
}

impl HttpSender for PanickySender {
    fn post(
        &self,
        _transmission: &Transmission,
        _timeout: Duration,
    ) -> impl Future<Output = HttpResult> + Send {
        let call_times = self.call_times.clone();
        async move {
            let first = {
                let mut calls = call_times.lock().unwrap();
                calls.push(Instant::now());
                calls.len() == 1
            };
            if first {
                panic!("simulated sender failure");
            }
            HttpResult::Success { status: 200 }
        }
    }
}

#[tokio::test]
async fn loop_survives_a_panicking_sender() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;
    spool
        .enqueue(&transmission_to("http://localhost:9600/ingest"))
        .await;

    let call_times = Arc::new(std::sync::Mutex::new(Vec::new()));
    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(PanickySender {
        call_times: call_times.clone(),
    });
    let transmitter = Transmitter::start(spool.clone(), sender, fast_config(counters.clone()));

    assert!(
        wait_until(|| trn_count(dir.path()) == 0, Duration::from_secs(5)).await,
        "delivery should succeed after the panic"
    );
    let calls = call_times.lock().unwrap().clone();
    assert!(calls.len() >= 2, "sender should be invoked again");
    assert!(
        calls[1] - calls[0] < Duration::from_secs(1),
        "retry after a panic should come within a second"
    );
    transmitter.dispose().await;
}

#[tokio::test]
async fn dispose_returns_within_the_grace_period() {
    let dir = TempDir::new().unwrap();
    let spool = spool_in(dir.path()).await;

    let counters = Arc::new(TelemetryCounters::default());
    let sender = Arc::new(CountingSender {
        calls: Arc::new(AtomicUsize::new(0)),
    });
    let transmitter = Transmitter::start(spool, sender, fast_config(counters));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let start = Instant::now();
    transmitter.dispose().await;
    assert!(start.elapsed() < Duration::from_secs(2));
}
