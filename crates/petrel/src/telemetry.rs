use log::info;
use petrel_update::{TelemetryEvent, TelemetrySink};

/// Writes telemetry events to the application log.
///
/// Stands in for the real telemetry pipeline; the engine only needs a
/// fire-and-forget sink.
pub struct LogTelemetry;

impl TelemetrySink for LogTelemetry {
    fn log_event(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::TimeSyncDelta { delta_secs } => {
                info!("[telemetry] time_sync_delta delta_secs={delta_secs}");
            }
            TelemetryEvent::UncaughtFailure { context } => {
                info!("[telemetry] uncaught_failure context={context}");
            }
        }
    }
}
