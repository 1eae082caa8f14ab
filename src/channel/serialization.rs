use crate::domain::{TelemetryContext, TelemetryItem};
use chrono::{DateTime, SecondsFormat, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write;

/// Turns telemetry items into the wire envelope: one JSON document with
/// the context properties folded in.
#[derive(Debug, Clone)]
pub(crate) struct EnvelopeSerializer {
    context: TelemetryContext,
}

#[derive(Serialize)]
struct Envelope<'a> {
    time: String,
    kind: &'static str,
    name: &'a str,
    properties: HashMap<String, String>,
    measurements: &'a HashMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionDetails<'a>>,
}

#[derive(Serialize)]
struct ExceptionDetails<'a> {
    type_name: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stack_trace: Option<&'a str>,
}

impl EnvelopeSerializer {
    pub(crate) fn new(context: TelemetryContext) -> Self {
        Self { context }
    }

    pub(crate) fn to_json(
        &self,
        item: &TelemetryItem,
        time: DateTime<Utc>,
    ) -> Result<Vec<u8>, serde_json::Error> {
        let time = time.to_rfc3339_opts(SecondsFormat::Millis, true);
        let envelope = match item {
            TelemetryItem::Event(event) => Envelope {
                time,
                kind: "event",
                name: &event.name,
                properties: self.context.merged(&event.properties),
                measurements: &event.measurements,
                exception: None,
            },
            TelemetryItem::Exception(exception) => Envelope {
                time,
                kind: "exception",
                name: &exception.type_name,
                properties: self.context.merged(&exception.properties),
                measurements: &exception.measurements,
                exception: Some(ExceptionDetails {
                    type_name: &exception.type_name,
                    message: &exception.message,
                    stack_trace: exception.stack_trace.as_deref(),
                }),
            },
        };
        serde_json::to_vec(&envelope)
    }
}

pub(crate) fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(bytes)?;
    encoder.finish()
}
