use crate::traits::TelemetrySink;
use crate::types::TelemetryEvent;

/// Telemetry bus using tokio broadcast channel.
/// All subscribers receive all events; the engine never subscribes.
pub struct TelemetryBus {
    tx: tokio::sync::broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TelemetryEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TelemetrySink for TelemetryBus {
    fn emit(&self, event: TelemetryEvent) {
        self.publish(event);
    }
}
