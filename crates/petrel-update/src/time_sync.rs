use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

/// Deltas within this bound are treated as noise and reset to zero.
const SAFE_DELTA_SECS: i64 = 180;

#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// Local clock differs from the server clock by `delta_secs`.
    TimeSyncDelta { delta_secs: i64 },
    /// A check or download failed in a way the engine absorbed.
    UncaughtFailure { context: String },
}

/// Fire-and-forget structured event sink; no response is expected.
pub trait TelemetrySink: Send + Sync {
    fn log_event(&self, event: TelemetryEvent);
}

/// Tracks the delta between server-reported time and the local clock.
///
/// Fed with the `Date` header of successful remote-config responses. An
/// excessive delta is reported to the telemetry sink once per process
/// lifetime, even if the skew later changes.
pub struct TimeSync {
    telemetry: Arc<dyn TelemetrySink>,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    delta_secs: i64,
    reported: bool,
}

impl TimeSync {
    #[must_use]
    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            telemetry,
            state: Mutex::new(State::default()),
        }
    }

    /// Update the delta from an HTTP `Date` header value.
    pub fn update_delta(&self, server_date_header: &str) {
        match DateTime::parse_from_rfc2822(server_date_header) {
            Ok(server_time) => {
                let delta = server_time.timestamp() - Utc::now().timestamp();
                if delta.abs() > SAFE_DELTA_SECS {
                    info!("[time-sync] delta time is {delta}s");
                    self.lock().delta_secs = delta;
                    self.report_excessive(delta);
                } else {
                    debug!("[time-sync] delta time is small, reset to 0");
                    self.lock().delta_secs = 0;
                }
            }
            Err(error) => {
                warn!("[time-sync] unable to parse server time, reset delta to 0: {error}");
                self.lock().delta_secs = 0;
            }
        }
    }

    #[must_use]
    pub fn delta_secs(&self) -> i64 {
        self.lock().delta_secs
    }

    /// Server-corrected unix timestamp in seconds.
    #[must_use]
    pub fn now(&self) -> i64 {
        Utc::now().timestamp() + self.delta_secs()
    }

    fn report_excessive(&self, delta_secs: i64) {
        {
            let mut state = self.lock();
            if state.reported {
                return;
            }
            state.reported = true;
        }
        self.telemetry
            .log_event(TelemetryEvent::TimeSyncDelta { delta_secs });
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
