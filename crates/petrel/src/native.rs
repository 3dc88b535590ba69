use std::sync::{Mutex, MutexGuard, PoisonError};

use log::info;
use petrel_update::{NativeAutoUpdater, StrategyEvent};
use tokio::sync::mpsc;

/// Boundary to the OS auto updater.
///
/// Until a framework bridge is wired in, checks report no update so the
/// coordinator's semaphore is always released.
pub struct OsUpdaterBridge {
    events: mpsc::UnboundedSender<StrategyEvent>,
    feed_url: Mutex<Option<String>>,
}

impl OsUpdaterBridge {
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<StrategyEvent>) -> Self {
        Self {
            events,
            feed_url: Mutex::new(None),
        }
    }

    fn feed_lock(&self) -> MutexGuard<'_, Option<String>> {
        self.feed_url.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NativeAutoUpdater for OsUpdaterBridge {
    fn set_feed_url(&self, url: &str) {
        *self.feed_lock() = Some(url.to_owned());
    }

    fn feed_url(&self) -> Option<String> {
        self.feed_lock().clone()
    }

    fn check_for_updates(&self) {
        info!("[native-updater] no OS updater bridged, reporting no update");
        let _ = self.events.send(StrategyEvent::NotAvailable);
    }

    fn quit_and_install(&self) {
        info!("[native-updater] install requested with no OS updater bridged");
    }
}
