//! Environment-switch behavior. These tests mutate process-wide state, so
//! they live in their own binary and serialize on a lock.

use beacon_telemetry::spool::SpoolConfig;
use beacon_telemetry::{
    ChannelConfig, EventTelemetry, ExceptionTelemetry, FILE_SINK_ENV, OPTOUT_ENV, TelemetryChannel,
};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use url::Url;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn config_in(dir: &TempDir) -> ChannelConfig {
    let mut config = ChannelConfig::new(Url::parse("http://localhost:9600/ingest").unwrap());
    config.spool = SpoolConfig {
        directory: dir.path().join("spool"),
        ..Default::default()
    };
    config
}

#[tokio::test]
async fn optout_disables_the_channel_entirely() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    unsafe {
        std::env::remove_var(FILE_SINK_ENV);
        std::env::set_var(OPTOUT_ENV, "true");
    }

    let dir = TempDir::new().unwrap();
    let channel = TelemetryChannel::new(config_in(&dir)).await.unwrap();
    assert!(!channel.is_enabled());

    channel.send(EventTelemetry::new("ignored"));
    channel.flush(Duration::from_millis(100)).await;
    channel.dispose().await;

    assert_eq!(channel.stats().accepted, 0);
    assert!(
        !dir.path().join("spool").exists(),
        "an opted-out channel should never touch the spool directory"
    );

    unsafe {
        std::env::remove_var(OPTOUT_ENV);
    }
}

#[tokio::test]
async fn file_sink_replaces_the_spool() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = TempDir::new().unwrap();
    let sink_path = dir.path().join("telemetry.ndjson");
    unsafe {
        std::env::remove_var(OPTOUT_ENV);
        std::env::set_var(FILE_SINK_ENV, &sink_path);
    }

    let channel = TelemetryChannel::new(config_in(&dir)).await.unwrap();
    assert!(channel.is_enabled());

    channel.send(EventTelemetry::new("startup").with_property("a", "b"));
    channel.send(ExceptionTelemetry::new("IoError", "disk on fire"));
    channel.flush(Duration::from_secs(2)).await;
    channel.dispose().await;

    let contents = std::fs::read_to_string(&sink_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);

    let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(first["kind"], "event");
    assert_eq!(first["name"], "startup");
    assert_eq!(first["properties"]["a"], "b");

    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["kind"], "exception");
    assert_eq!(second["exception"]["message"], "disk on fire");

    assert!(
        !dir.path().join("spool").exists(),
        "the debug sink should stand in for the spool"
    );

    unsafe {
        std::env::remove_var(FILE_SINK_ENV);
    }
}
