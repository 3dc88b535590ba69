use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use tokio::sync::mpsc;

use super::{StrategyEvent, UpdateDetails, UpdateStrategy};
use crate::ecs::EcsConfig;
use crate::version;

/// Version-compare strategy for platforms where packages are installed
/// outside this process. Performs no download; an update is "downloaded"
/// the moment the remote config says a newer version exists, and the
/// application surfaces that to the user.
pub struct LinuxUpdateStrategy {
    ecs: EcsConfig,
    running_version: String,
    events: mpsc::UnboundedSender<StrategyEvent>,
    feed_url: Mutex<Option<String>>,
}

impl LinuxUpdateStrategy {
    #[must_use]
    pub fn new(
        ecs: EcsConfig,
        running_version: String,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> Self {
        Self {
            ecs,
            running_version,
            events,
            feed_url: Mutex::new(None),
        }
    }

    fn emit(&self, event: StrategyEvent) {
        let _ = self.events.send(event);
    }

    fn feed_lock(&self) -> MutexGuard<'_, Option<String>> {
        self.feed_url.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl UpdateStrategy for LinuxUpdateStrategy {
    fn set_feed_url(&self, url: &str) {
        *self.feed_lock() = Some(url.to_owned());
    }

    fn feed_url(&self) -> Option<String> {
        self.feed_lock().clone()
    }

    // The comparison runs off the remote config alone.
    fn requires_feed_url(&self) -> bool {
        false
    }

    async fn check_for_updates(&self) {
        self.emit(StrategyEvent::Checking);

        let Some(data) = self.ecs.data() else {
            warn!("[updater/linux] no remote config loaded yet");
            self.emit(StrategyEvent::NotAvailable);
            return;
        };

        if data.app_disabled {
            info!("[updater/linux] app is disabled, forcing a mandatory update");
            self.emit(StrategyEvent::Downloaded(UpdateDetails {
                version: data.last_version_available,
                ..UpdateDetails::default()
            }));
            return;
        }

        let Some(available) = data.last_version_available else {
            self.emit(StrategyEvent::NotAvailable);
            return;
        };

        match version::is_newer(&available, &self.running_version) {
            Ok(true) => {
                info!(
                    "[updater/linux] version {available} is newer than {}",
                    self.running_version
                );
                self.emit(StrategyEvent::Downloaded(UpdateDetails {
                    version: Some(available),
                    ..UpdateDetails::default()
                }));
            }
            Ok(false) => self.emit(StrategyEvent::NotAvailable),
            Err(error) => {
                warn!("[updater/linux] version comparison failed: {error}");
                self.emit(StrategyEvent::NotAvailable);
            }
        }
    }

    // Installation happens through the system package manager.
    fn quit_and_install(&self) -> bool {
        false
    }
}
