use std::collections::HashMap;

/// A named application event with optional string properties and numeric
/// measurements.
#[derive(Debug, Clone, Default)]
pub struct EventTelemetry {
    pub name: String,
    pub properties: HashMap<String, String>,
    pub measurements: HashMap<String, f64>,
}

impl EventTelemetry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_measurement(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measurements.insert(key.into(), value);
        self
    }
}

/// An exception report. `type_name` doubles as the event name on the wire.
#[derive(Debug, Clone, Default)]
pub struct ExceptionTelemetry {
    pub type_name: String,
    pub message: String,
    pub stack_trace: Option<String>,
    pub properties: HashMap<String, String>,
    pub measurements: HashMap<String, f64>,
}

impl ExceptionTelemetry {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum TelemetryItem {
    Event(EventTelemetry),
    Exception(ExceptionTelemetry),
}

impl TelemetryItem {
    pub fn name(&self) -> &str {
        match self {
            TelemetryItem::Event(e) => &e.name,
            TelemetryItem::Exception(e) => &e.type_name,
        }
    }
}

impl From<EventTelemetry> for TelemetryItem {
    fn from(event: EventTelemetry) -> Self {
        TelemetryItem::Event(event)
    }
}

impl From<ExceptionTelemetry> for TelemetryItem {
    fn from(exception: ExceptionTelemetry) -> Self {
        TelemetryItem::Exception(exception)
    }
}
