pub mod linux;
pub mod macos;
pub mod windows;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ecs::{EcsConfig, EcsEvent};
use crate::events::{CachedPublisher, Event};
use crate::time_sync::{TelemetryEvent, TelemetrySink};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// String-keyed persistence used for update bookkeeping that must survive
/// process restarts.
pub trait KeyValueStore: Send + Sync {
    fn has(&self, key: &str) -> bool;
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn delete(&self, key: &str);
}

/// Release metadata attached to `Downloaded` events. Strategies fill in
/// whatever their update source provides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDetails {
    pub version: Option<String>,
    pub release_name: Option<String>,
    pub release_notes: Option<String>,
    pub release_date: Option<String>,
    pub installer_path: Option<PathBuf>,
}

/// Events a platform strategy reports back to the coordinator.
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    Checking,
    Available,
    NotAvailable,
    Downloaded(UpdateDetails),
    Error(String),
}

/// Normalized update events exposed to the application.
#[derive(Debug, Clone)]
pub enum UpdaterEvent {
    Checking,
    Available,
    NotAvailable,
    Downloaded(UpdateDetails),
    Error(String),
    /// The application should finish up and call [`Updater::install_update`].
    InstallRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdaterEventKind {
    Checking,
    Available,
    NotAvailable,
    Downloaded,
    Error,
    InstallRequested,
}

impl Event for UpdaterEvent {
    type Kind = UpdaterEventKind;

    fn kind(&self) -> UpdaterEventKind {
        match self {
            Self::Checking => UpdaterEventKind::Checking,
            Self::Available => UpdaterEventKind::Available,
            Self::NotAvailable => UpdaterEventKind::NotAvailable,
            Self::Downloaded(_) => UpdaterEventKind::Downloaded,
            Self::Error(_) => UpdaterEventKind::Error,
            Self::InstallRequested => UpdaterEventKind::InstallRequested,
        }
    }
}

/// One platform's update mechanics behind the shared event contract.
#[async_trait]
pub trait UpdateStrategy: Send + Sync {
    fn set_feed_url(&self, url: &str);
    fn feed_url(&self) -> Option<String>;
    async fn check_for_updates(&self);
    /// Whether a check needs a resolved feed url before it can run.
    /// Strategies that decide from the remote config alone return false.
    fn requires_feed_url(&self) -> bool {
        true
    }
    /// Launch the platform install path. Returns false when there is
    /// nothing installable.
    fn quit_and_install(&self) -> bool;
    /// Startup gate for mandatory updates persisted by a previous run.
    /// Returns true when an install was launched and startup must stop.
    fn install_mandatory_updates_if_present(&self) -> bool {
        false
    }
}

pub struct UpdaterOptions {
    pub enabled: bool,
    /// Used when the remote config carries no platform feed url.
    pub fallback_feed_url: Option<String>,
    pub version: String,
    pub os: String,
    pub ring: String,
    pub app: String,
    pub default_interval: Duration,
    pub check_timeout: Duration,
    pub download_timeout: Duration,
}

/// In-progress flag with an expiry task.
///
/// Serializes update checks without a real lock: a native updater that
/// never reports a terminal event would otherwise leave checks disabled
/// forever, so the flag clears itself after a timeout.
struct UpdateSemaphore {
    state: Arc<Mutex<SemaphoreState>>,
}

#[derive(Default)]
struct SemaphoreState {
    active: bool,
    expiry: Option<JoinHandle<()>>,
}

impl UpdateSemaphore {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SemaphoreState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the flag unless it is already set.
    fn try_acquire(&self, ttl: Duration) -> bool {
        {
            let mut state = self.lock();
            if state.active {
                return false;
            }
            state.active = true;
        }
        self.arm(ttl);
        true
    }

    /// Push the expiry further out while keeping the flag set.
    fn extend(&self, ttl: Duration) {
        self.lock().active = true;
        self.arm(ttl);
    }

    fn release(&self) {
        let mut state = self.lock();
        state.active = false;
        if let Some(expiry) = state.expiry.take() {
            expiry.abort();
        }
    }

    fn arm(&self, ttl: Duration) {
        let shared = self.state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
            if state.active {
                warn!("[updater] check semaphore expired without a terminal event");
                state.active = false;
            }
            state.expiry = None;
        });
        let mut state = self.lock();
        if let Some(previous) = state.expiry.replace(handle) {
            previous.abort();
        }
    }
}

/// Cross-platform update coordinator.
///
/// Owns the polling cadence (derived from the remote config, rescheduled
/// when it changes), serializes checks through the semaphore, and forwards
/// strategy outcomes as one normalized event stream.
#[derive(Clone)]
pub struct Updater {
    inner: Arc<UpdaterInner>,
}

struct UpdaterInner {
    options: UpdaterOptions,
    ecs: EcsConfig,
    strategy: Arc<dyn UpdateStrategy>,
    telemetry: Arc<dyn TelemetrySink>,
    publisher: CachedPublisher<UpdaterEvent>,
    semaphore: UpdateSemaphore,
    install_requested: AtomicBool,
    state: Mutex<UpdaterState>,
}

#[derive(Default)]
struct UpdaterState {
    interval: Option<Duration>,
    poll_timer: Option<JoinHandle<()>>,
}

impl Updater {
    #[must_use]
    pub fn new(
        options: UpdaterOptions,
        ecs: EcsConfig,
        strategy: Arc<dyn UpdateStrategy>,
        strategy_events: mpsc::UnboundedReceiver<StrategyEvent>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let updater = Self {
            inner: Arc::new(UpdaterInner {
                options,
                ecs,
                strategy,
                telemetry,
                publisher: CachedPublisher::new(),
                semaphore: UpdateSemaphore::new(),
                install_requested: AtomicBool::new(false),
                state: Mutex::new(UpdaterState::default()),
            }),
        };
        updater.pump_strategy_events(strategy_events);
        updater
    }

    pub fn subscribe<F>(&self, kind: UpdaterEventKind, callback: F)
    where
        F: Fn(&UpdaterEvent) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(kind, callback);
    }

    /// Begin periodic update checks, starting with an immediate one.
    pub fn start(&self) {
        if !self.inner.options.enabled {
            info!("[updater] updates are disabled");
            return;
        }

        let interval = self.derive_interval();
        self.inner.lock().interval = Some(interval);
        self.schedule_polling(interval);

        let updater = self.clone();
        self.inner.ecs.subscribe(EcsEvent::Changed, move |_| {
            updater.handle_config_changed();
        });

        let updater = self.clone();
        tokio::spawn(async move {
            updater.check_for_updates(false).await;
        });
    }

    /// Run one update check.
    ///
    /// Re-emits `Checking` without starting new work while a check or
    /// download is already in progress, which makes repeated explicit
    /// user-triggered checks safe.
    pub async fn check_for_updates(&self, explicit: bool) {
        if !self.inner.options.enabled {
            return;
        }
        info!("[updater] checking for updates (explicit: {explicit})");

        if !self
            .inner
            .semaphore
            .try_acquire(self.inner.options.check_timeout)
        {
            info!("[updater] check already in progress");
            self.inner.publisher.emit(UpdaterEvent::Checking);
            return;
        }

        let feed_url = self
            .inner
            .ecs
            .data()
            .and_then(|data| data.platform_updater_feed_url)
            .or_else(|| self.inner.options.fallback_feed_url.clone());
        match feed_url {
            Some(feed_url) => self
                .inner
                .strategy
                .set_feed_url(&self.with_feed_query(&feed_url)),
            None if self.inner.strategy.requires_feed_url() => {
                warn!("[updater] no feed url available, skipping check");
                self.inner.semaphore.release();
                return;
            }
            None => {}
        }

        let strategy = self.inner.strategy.clone();
        tokio::spawn(async move {
            strategy.check_for_updates().await;
        });
    }

    /// Request an install on shutdown. Idempotent; only the first call
    /// emits `InstallRequested`.
    pub fn quit_and_install(&self) {
        if self.inner.install_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[updater] install requested");
        self.inner.publisher.emit(UpdaterEvent::InstallRequested);
    }

    /// Launch the platform install path.
    pub fn install_update(&self) -> bool {
        self.inner.strategy.quit_and_install()
    }

    /// Startup gate: installs a persisted pending mandatory update if one
    /// is newer than the running build. Returns true when startup must not
    /// proceed because an install was launched.
    #[must_use]
    pub fn install_mandatory_updates_if_present(&self) -> bool {
        if !self.inner.options.enabled {
            return false;
        }
        self.inner.strategy.install_mandatory_updates_if_present()
    }

    pub fn stop_timers(&self) {
        if let Some(timer) = self.inner.lock().poll_timer.take() {
            timer.abort();
        }
    }

    fn derive_interval(&self) -> Duration {
        self.inner
            .ecs
            .data()
            .and_then(|data| data.update_interval_ms)
            .map_or(self.inner.options.default_interval, Duration::from_millis)
    }

    fn handle_config_changed(&self) {
        let interval = self.derive_interval();
        {
            let mut state = self.inner.lock();
            if state.interval == Some(interval) {
                return;
            }
            state.interval = Some(interval);
        }
        info!("[updater] update interval changed to {interval:?}");
        self.schedule_polling(interval);
    }

    fn schedule_polling(&self, interval: Duration) {
        let updater = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                updater.check_for_updates(false).await;
            }
        });
        let mut state = self.inner.lock();
        if let Some(previous) = state.poll_timer.replace(handle) {
            previous.abort();
        }
    }

    fn pump_strategy_events(&self, mut events: mpsc::UnboundedReceiver<StrategyEvent>) {
        let updater = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                updater.handle_strategy_event(event);
            }
        });
    }

    fn handle_strategy_event(&self, event: StrategyEvent) {
        match event {
            StrategyEvent::Checking => self.inner.publisher.emit(UpdaterEvent::Checking),
            StrategyEvent::Available => {
                self.inner
                    .semaphore
                    .extend(self.inner.options.download_timeout);
                self.inner.publisher.emit(UpdaterEvent::Available);
            }
            StrategyEvent::NotAvailable => {
                self.inner.semaphore.release();
                self.inner.publisher.emit(UpdaterEvent::NotAvailable);
            }
            StrategyEvent::Downloaded(details) => {
                self.inner.semaphore.release();
                self.inner.publisher.emit(UpdaterEvent::Downloaded(details));
            }
            StrategyEvent::Error(message) => {
                warn!("[updater] update check failed: {message}");
                self.inner.semaphore.release();
                self.inner.telemetry.log_event(TelemetryEvent::UncaughtFailure {
                    context: message.clone(),
                });
                self.inner.publisher.emit(UpdaterEvent::Error(message));
            }
        }
    }

    fn with_feed_query(&self, base: &str) -> String {
        let options = &self.inner.options;
        let separator = if base.contains('?') { '&' } else { '?' };
        format!(
            "{base}{separator}version={}&os={}&ring={}&app={}&t={}",
            options.version,
            options.os,
            options.ring,
            options.app,
            Utc::now().timestamp()
        )
    }
}

impl UpdaterInner {
    fn lock(&self) -> MutexGuard<'_, UpdaterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
