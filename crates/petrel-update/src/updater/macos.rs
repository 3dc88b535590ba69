use std::sync::Arc;

use tokio::sync::mpsc;

use super::{StrategyEvent, UpdateStrategy};

/// Boundary to the OS-native auto updater.
///
/// The native side is expected to report its outcomes through the same
/// [`StrategyEvent`] sender the strategy was built with, so that checks it
/// runs on its own schedule still flow through the coordinator.
pub trait NativeAutoUpdater: Send + Sync {
    fn set_feed_url(&self, url: &str);
    fn feed_url(&self) -> Option<String>;
    fn check_for_updates(&self);
    fn quit_and_install(&self);
}

/// Delegate strategy: forwards everything to the native updater.
pub struct MacosUpdateStrategy {
    native: Arc<dyn NativeAutoUpdater>,
    events: mpsc::UnboundedSender<StrategyEvent>,
}

impl MacosUpdateStrategy {
    #[must_use]
    pub fn new(
        native: Arc<dyn NativeAutoUpdater>,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> Self {
        Self { native, events }
    }
}

#[async_trait::async_trait]
impl UpdateStrategy for MacosUpdateStrategy {
    fn set_feed_url(&self, url: &str) {
        self.native.set_feed_url(url);
    }

    fn feed_url(&self) -> Option<String> {
        self.native.feed_url()
    }

    async fn check_for_updates(&self) {
        let _ = self.events.send(StrategyEvent::Checking);
        self.native.check_for_updates();
    }

    fn quit_and_install(&self) -> bool {
        self.native.quit_and_install();
        true
    }
}
