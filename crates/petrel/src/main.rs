mod config;
mod device_info;
mod logging;
#[cfg(target_os = "macos")]
mod native;
mod store;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use petrel_platform::{AppPaths, platform_short_code};
use petrel_update::ecs::{
    DEFAULT_REFRESH_INTERVAL, DEFAULT_RETRY_DELAY, DEFAULT_RETRY_LIMIT, EcsConfig, EcsEvent,
    EcsOptions,
};
use petrel_update::updater::{DEFAULT_CHECK_TIMEOUT, DEFAULT_DOWNLOAD_TIMEOUT};
use petrel_update::{
    HttpClient, KeyValueStore, TelemetrySink, TimeSync, Updater, UpdaterEventKind, UpdaterOptions,
};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::store::StateStore;
use crate::telemetry::LogTelemetry;

const APP_ID: &str = "petrel";

#[tokio::main]
async fn main() -> ExitCode {
    let paths = match AppPaths::new() {
        Ok(paths) => paths,
        Err(error) => {
            eprintln!("petrel: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = paths.ensure_dirs() {
        eprintln!("petrel: failed to create application directories: {error}");
        return ExitCode::FAILURE;
    }

    let app_config = AppConfig::load(&paths.settings_file());
    logging::init(
        &paths.log_file(),
        app_config.debug_logging,
        app_config.max_log_size_bytes,
    );

    let version = env!("CARGO_PKG_VERSION").to_owned();
    info!("petrel {version} starting on {}", platform_short_code());

    let device_id = device_info::load_or_create_device_id(&paths.device_info_file());

    let telemetry: Arc<dyn TelemetrySink> = Arc::new(LogTelemetry);
    let http = match HttpClient::new() {
        Ok(client) => Arc::new(client),
        Err(http_error) => {
            error!("failed to build http client: {http_error}");
            return ExitCode::FAILURE;
        }
    };
    let time_sync = Arc::new(TimeSync::new(telemetry.clone()));

    let ecs = EcsConfig::new(
        http.clone(),
        time_sync,
        EcsOptions {
            hosts: app_config.hosts(),
            path_template: app_config.ecs_path_template.clone(),
            channel: app_config.ring.clone(),
            platform: platform_short_code().to_owned(),
            version: version.clone(),
            device_id,
            cache_file: paths.ecs_cache_file(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_limit: DEFAULT_RETRY_LIMIT,
        },
    );

    let state: Arc<dyn KeyValueStore> = Arc::new(StateStore::open(paths.state_file()));
    let (strategy_events, strategy_receiver) = mpsc::unbounded_channel();
    let strategy = match build_strategy(&http, &ecs, state, &paths, &version, strategy_events) {
        Ok(strategy) => strategy,
        Err(message) => {
            error!("failed to build update strategy: {message}");
            return ExitCode::FAILURE;
        }
    };

    let updater = Updater::new(
        UpdaterOptions {
            enabled: app_config.enable_updates,
            fallback_feed_url: app_config.fallback_updater_feed_url.clone(),
            version,
            os: platform_short_code().to_owned(),
            ring: app_config.ring.clone(),
            app: APP_ID.to_owned(),
            default_interval: app_config
                .update_interval_secs
                .map_or(petrel_update::updater::DEFAULT_UPDATE_INTERVAL, Duration::from_secs),
            check_timeout: DEFAULT_CHECK_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        },
        ecs.clone(),
        strategy,
        strategy_receiver,
        telemetry,
    );

    // A mandatory update persisted by a previous run preempts startup.
    if updater.install_mandatory_updates_if_present() {
        info!("mandatory update is installing, exiting");
        return ExitCode::SUCCESS;
    }

    {
        let updater = updater.clone();
        ecs.subscribe(EcsEvent::Ready, move |_| {
            info!("remote config ready, starting update checks");
            updater.start();
        });
    }
    {
        let handle = updater.clone();
        updater.subscribe(UpdaterEventKind::InstallRequested, move |_| {
            if !handle.install_update() {
                info!("nothing to install");
            }
        });
    }

    ecs.start();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(error) => error!("failed to listen for shutdown signal: {error}"),
    }
    updater.stop_timers();
    ecs.stop_timers();
    ExitCode::SUCCESS
}

#[cfg(target_os = "windows")]
fn build_strategy(
    http: &Arc<HttpClient>,
    _ecs: &EcsConfig,
    state: Arc<dyn KeyValueStore>,
    paths: &AppPaths,
    version: &str,
    events: mpsc::UnboundedSender<petrel_update::StrategyEvent>,
) -> Result<Arc<dyn petrel_update::UpdateStrategy>, String> {
    let downloader = petrel_update::Downloader::new().map_err(|error| error.to_string())?;
    Ok(Arc::new(petrel_update::WindowsUpdateStrategy::new(
        http.clone(),
        downloader,
        state,
        paths.installer_dir(),
        version.to_owned(),
        events,
    )))
}

#[cfg(target_os = "macos")]
fn build_strategy(
    _http: &Arc<HttpClient>,
    _ecs: &EcsConfig,
    _state: Arc<dyn KeyValueStore>,
    _paths: &AppPaths,
    _version: &str,
    events: mpsc::UnboundedSender<petrel_update::StrategyEvent>,
) -> Result<Arc<dyn petrel_update::UpdateStrategy>, String> {
    let native = Arc::new(native::OsUpdaterBridge::new(events.clone()));
    Ok(Arc::new(petrel_update::MacosUpdateStrategy::new(
        native, events,
    )))
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn build_strategy(
    _http: &Arc<HttpClient>,
    ecs: &EcsConfig,
    _state: Arc<dyn KeyValueStore>,
    _paths: &AppPaths,
    version: &str,
    events: mpsc::UnboundedSender<petrel_update::StrategyEvent>,
) -> Result<Arc<dyn petrel_update::UpdateStrategy>, String> {
    Ok(Arc::new(petrel_update::LinuxUpdateStrategy::new(
        ecs.clone(),
        version.to_owned(),
        events,
    )))
}
