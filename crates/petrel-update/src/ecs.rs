use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use reqwest::header::{ACCEPT, CONTENT_TYPE, DATE, HeaderValue, IF_NONE_MATCH};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::events::{CachedPublisher, Event};
use crate::http::{HttpClient, HttpRequest};
use crate::time_sync::TimeSync;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

const ACCEPT_HEADER: &str = "application/json;ver=1.0";

/// Lifecycle events of the remote config service.
///
/// `Ready` fires exactly once, on the first successful or cache-recovered
/// load; it is delivered through the cached publisher so subscribers that
/// attach late still observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcsEvent {
    Ready,
    Changed,
    Unchanged,
    /// Refresh retries were exhausted but a previous snapshot is kept.
    Failed,
    /// Terminal: retries exhausted with no snapshot and no usable cache.
    Error,
}

impl Event for EcsEvent {
    type Kind = Self;

    fn kind(&self) -> Self {
        *self
    }
}

/// Parsed remote configuration snapshot.
///
/// Either fully populated from a 200 response or absent; a 304 never
/// produces a new snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcsData {
    pub etag: String,
    pub expires: Option<DateTime<Utc>>,
    pub name: String,
    pub app: String,
    /// Feature payload passed through to the application unchanged.
    pub config: serde_json::Value,
    pub app_disabled: bool,
    pub token_scopes: String,
    /// Override values for this app, extracted from the nested per-app
    /// override map.
    pub app_override: HashMap<String, String>,
    pub platform_updater_feed_url: Option<String>,
    pub update_interval_ms: Option<u64>,
    pub last_version_available: Option<String>,
}

pub struct EcsOptions {
    /// Comma-split host list, round-robin selected per request.
    pub hosts: Vec<String>,
    /// Request path with `{channel}`, `{platform}`, `{version}` and
    /// `{deviceId}` placeholders.
    pub path_template: String,
    pub channel: String,
    pub platform: String,
    pub version: String,
    pub device_id: String,
    pub cache_file: PathBuf,
    pub refresh_interval: Duration,
    pub retry_delay: Duration,
    pub retry_limit: u32,
}

/// Remote config service: polls the config endpoint, caches the snapshot on
/// disk (version-tagged), and falls back to that cache when retries are
/// exhausted before any snapshot was loaded.
#[derive(Clone)]
pub struct EcsConfig {
    inner: Arc<EcsInner>,
}

struct EcsInner {
    http: Arc<HttpClient>,
    time_sync: Arc<TimeSync>,
    options: EcsOptions,
    publisher: CachedPublisher<EcsEvent>,
    state: Mutex<EcsState>,
}

#[derive(Default)]
struct EcsState {
    data: Option<EcsData>,
    retry_count: u32,
    host_index: usize,
    timer: Option<JoinHandle<()>>,
}

impl EcsConfig {
    #[must_use]
    pub fn new(http: Arc<HttpClient>, time_sync: Arc<TimeSync>, options: EcsOptions) -> Self {
        Self {
            inner: Arc::new(EcsInner {
                http,
                time_sync,
                options,
                publisher: CachedPublisher::new(),
                state: Mutex::new(EcsState::default()),
            }),
        }
    }

    /// Begin polling. The first refresh runs immediately.
    pub fn start(&self) {
        let config = self.clone();
        tokio::spawn(async move {
            config.refresh().await;
        });
    }

    #[must_use]
    pub fn data(&self) -> Option<EcsData> {
        self.inner.lock().data.clone()
    }

    #[must_use]
    pub fn has_data(&self) -> bool {
        self.inner.lock().data.is_some()
    }

    pub fn subscribe<F>(&self, kind: EcsEvent, callback: F)
    where
        F: Fn(&EcsEvent) + Send + Sync + 'static,
    {
        self.inner.publisher.subscribe(kind, callback);
    }

    #[cfg(test)]
    pub(crate) fn set_data(&self, data: EcsData) {
        self.inner.lock().data = Some(data);
    }

    pub fn stop_timers(&self) {
        if let Some(timer) = self.inner.lock().timer.take() {
            timer.abort();
        }
    }

    /// Run one refresh cycle and schedule the next one.
    pub async fn refresh(&self) {
        self.stop_timers();
        let first_run = !self.has_data();

        match self.fetch_once().await {
            Ok(Some(data)) => {
                {
                    let mut state = self.inner.lock();
                    state.data = Some(data.clone());
                    state.retry_count = 0;
                }
                cache_to_file(&self.inner.options.cache_file, &self.inner.options.version, &data)
                    .await;
                self.inner.publisher.emit(EcsEvent::Changed);
                if first_run {
                    self.inner.publisher.emit(EcsEvent::Ready);
                }
                self.schedule(self.inner.options.refresh_interval);
            }
            Ok(None) => {
                self.inner.lock().retry_count = 0;
                self.inner.publisher.emit(EcsEvent::Unchanged);
                if first_run {
                    self.inner.publisher.emit(EcsEvent::Ready);
                }
                self.schedule(self.inner.options.refresh_interval);
            }
            Err(message) => self.handle_failure(&message, first_run).await,
        }
    }

    async fn handle_failure(&self, message: &str, first_run: bool) {
        let (exceeded, retry_count) = {
            let mut state = self.inner.lock();
            let exceeded = state.retry_count >= self.inner.options.retry_limit;
            state.retry_count += 1;
            (exceeded, state.retry_count)
        };

        if !exceeded {
            warn!("[ecs] {message} (retry count: {retry_count})");
            self.schedule(self.inner.options.retry_delay);
            return;
        }

        if self.has_data() {
            warn!("[ecs] {message} (retry count limit exceeded), keeping stale config");
            self.inner.publisher.emit(EcsEvent::Failed);
            self.schedule(self.inner.options.refresh_interval);
            return;
        }

        let cached = load_cache(&self.inner.options.cache_file, &self.inner.options.version).await;
        if let Some(data) = cached {
            warn!("[ecs] {message} (retry count limit exceeded)");
            warn!("[ecs] config loaded from cache file");
            self.inner.lock().data = Some(data);
            if first_run {
                self.inner.publisher.emit(EcsEvent::Ready);
            }
            self.schedule(self.inner.options.refresh_interval);
        } else {
            error!("[ecs] {message} (retry count limit exceeded), no usable cache");
            self.inner.publisher.emit(EcsEvent::Error);
        }
    }

    async fn fetch_once(&self) -> Result<Option<EcsData>, String> {
        info!("[ecs] downloading config");

        let (host, etag) = {
            let mut state = self.inner.lock();
            let hosts = &self.inner.options.hosts;
            if hosts.is_empty() {
                return Err("no config hosts configured".to_owned());
            }
            let host = hosts[state.host_index % hosts.len()].trim().to_owned();
            state.host_index += 1;
            (host, state.data.as_ref().map(|data| data.etag.clone()))
        };

        let path = self
            .inner
            .options
            .path_template
            .replace("{channel}", &self.inner.options.channel)
            .replace("{platform}", &self.inner.options.platform)
            .replace("{version}", &self.inner.options.version)
            .replace("{deviceId}", &self.inner.options.device_id);
        let url = if host.contains("://") {
            format!("{host}{path}")
        } else {
            format!("https://{host}{path}")
        };

        let mut request = HttpRequest::get(url);
        request.retry_limit = 1;
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static(ACCEPT_HEADER));
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(etag) = etag {
            match HeaderValue::from_str(&etag) {
                Ok(value) => {
                    request.headers.insert(IF_NONE_MATCH, value);
                }
                Err(error) => warn!("[ecs] dropping unusable etag: {error}"),
            }
        }

        let response = self
            .inner
            .http
            .send(request)
            .await
            .map_err(|error| error.to_string())?;

        if let Some(date) = response.headers.get(DATE).and_then(|value| value.to_str().ok()) {
            self.inner.time_sync.update_delta(date);
        }

        match response.status {
            200 => {
                info!("[ecs] config successfully downloaded");
                parse_response(&response.body)
                    .map(Some)
                    .map_err(|error| format!("failed to parse config: {error}"))
            }
            304 => {
                info!("[ecs] config not changed");
                Ok(None)
            }
            status => Err(format!("config download failed with code: {status}")),
        }
    }

    fn schedule(&self, delay: Duration) {
        let config = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            config.refresh().await;
        });
        self.inner.lock().timer = Some(handle);
    }
}

impl EcsInner {
    fn lock(&self) -> MutexGuard<'_, EcsState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(rename = "Headers")]
    headers: WireHeaders,
    #[serde(rename = "PetrelWrapper")]
    wrapper: WireWrapper,
}

#[derive(Deserialize)]
struct WireHeaders {
    #[serde(rename = "ETag")]
    etag: String,
    #[serde(rename = "Expires", default)]
    expires: Option<String>,
}

#[derive(Deserialize)]
struct WireWrapper {
    name: String,
    app: String,
    #[serde(default)]
    config: serde_json::Value,
    #[serde(rename = "appDisabled", default)]
    app_disabled: bool,
    #[serde(default)]
    auth: Option<WireAuth>,
    #[serde(rename = "override", default)]
    overrides: Option<HashMap<String, HashMap<String, String>>>,
    #[serde(rename = "platformUpdaterFeedUrl", default)]
    platform_updater_feed_url: Option<String>,
    #[serde(rename = "updateInterval", default)]
    update_interval: Option<u64>,
    #[serde(rename = "lastVersionAvailable", default)]
    last_version_available: Option<String>,
}

#[derive(Deserialize)]
struct WireAuth {
    #[serde(rename = "tokenScopes", default)]
    token_scopes: String,
}

fn parse_response(body: &str) -> Result<EcsData, serde_json::Error> {
    let mut wire: WireResponse = serde_json::from_str(body)?;

    let app_override = wire
        .wrapper
        .overrides
        .take()
        .and_then(|mut overrides| overrides.remove(&wire.wrapper.app))
        .unwrap_or_default();

    let expires = wire
        .headers
        .expires
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc));

    Ok(EcsData {
        etag: wire.headers.etag,
        expires,
        name: wire.wrapper.name,
        app: wire.wrapper.app,
        config: wire.wrapper.config,
        app_disabled: wire.wrapper.app_disabled,
        token_scopes: wire
            .wrapper
            .auth
            .map(|auth| auth.token_scopes)
            .unwrap_or_default(),
        app_override,
        platform_updater_feed_url: wire.wrapper.platform_updater_feed_url,
        update_interval_ms: wire.wrapper.update_interval,
        last_version_available: wire.wrapper.last_version_available,
    })
}

#[derive(Serialize, Deserialize)]
struct EcsCacheFile {
    version: String,
    data: EcsData,
}

async fn cache_to_file(path: &Path, version: &str, data: &EcsData) {
    let cache = EcsCacheFile {
        version: version.to_owned(),
        data: data.clone(),
    };
    match serde_json::to_vec(&cache) {
        Ok(bytes) => {
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(error) = tokio::fs::write(path, bytes).await {
                warn!("[ecs] error writing config cache: {error}");
            }
        }
        Err(error) => warn!("[ecs] error serializing config cache: {error}"),
    }
}

/// Load the disk cache, discarding it when it was written by a different
/// client version.
async fn load_cache(path: &Path, version: &str) -> Option<EcsData> {
    let json = match tokio::fs::read_to_string(path).await {
        Ok(json) => json,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!("[ecs] config cache does not exist");
            return None;
        }
        Err(error) => {
            warn!("[ecs] error reading config cache: {error}");
            return None;
        }
    };

    let cache: EcsCacheFile = match serde_json::from_str(&json) {
        Ok(cache) => cache,
        Err(error) => {
            warn!("[ecs] error parsing config cache: {error}");
            return None;
        }
    };

    if cache.version == version {
        Some(cache.data)
    } else {
        let _ = tokio::fs::remove_file(path).await;
        None
    }
}
