//! Structured event emission with a pluggable sink.
//!
//! One interface, one method: `instrument(name, payload)`. The default is a
//! null sink so instrumentation is opt-in and carries no framework
//! dependency; `TracingInstrument` is a ready-made non-null sink for
//! services that just want these events folded into their existing logs.

use std::fmt;
use std::sync::Arc;

/// Ordered key/value pairs describing one instrumentation event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Payload(Vec<(String, String)>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.0.push((key.into(), value.to_string()));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, String)> {
        self.0.iter()
    }
}

/// A sink for structured events: one name, one payload, no return value.
///
/// Implementations must not block the calling request for long; a sink that
/// needs to do I/O should hand the event off to a queue rather than do it
/// inline.
pub trait Instrument: Send + Sync {
    fn instrument(&self, name: &str, payload: Payload);
}

/// Default sink: drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInstrument;

impl Instrument for NullInstrument {
    fn instrument(&self, _name: &str, _payload: Payload) {}
}

/// Emits every event through `tracing::debug!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInstrument;

impl Instrument for TracingInstrument {
    fn instrument(&self, name: &str, payload: Payload) {
        let fields: Vec<String> = payload.iter().map(|(k, v)| format!("{k}={v}")).collect();
        tracing::debug!(event = name, payload = %fields.join(" "), "instrument");
    }
}

/// A shared, cloneable handle to an `Instrument` sink.
pub type InstrumentSink = Arc<dyn Instrument>;

/// `Arc::new(NullInstrument)` as an `InstrumentSink`, for field defaults.
pub fn null_sink() -> InstrumentSink {
    Arc::new(NullInstrument)
}
