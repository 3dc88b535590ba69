use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{KeyValueStore, StrategyEvent, UpdateDetails, UpdateStrategy};
use crate::download::{DownloadEvent, Downloader};
use crate::http::{HttpClient, HttpRequest};
use crate::version;

const PENDING_INSTALLER_KEY: &str = "updates.windows.awaiting-installer-version";
const INSTALLER_ARGS: [&str; 2] = ["/silent", "!desktopicon"];

/// Downloaded installer awaiting install, persisted across restarts so a
/// crash between download and install does not lose the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInstaller {
    pub version: String,
    pub path: PathBuf,
}

/// Polling-download strategy: fetches feed metadata, downloads the
/// installer, and launches it silently on install.
pub struct WindowsUpdateStrategy {
    http: Arc<HttpClient>,
    downloader: Downloader,
    store: Arc<dyn KeyValueStore>,
    installer_dir: PathBuf,
    running_version: String,
    events: mpsc::UnboundedSender<StrategyEvent>,
    feed_url: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct FeedResponse {
    url: String,
    name: String,
    #[serde(default)]
    pub_date: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

impl WindowsUpdateStrategy {
    #[must_use]
    pub fn new(
        http: Arc<HttpClient>,
        downloader: Downloader,
        store: Arc<dyn KeyValueStore>,
        installer_dir: PathBuf,
        running_version: String,
        events: mpsc::UnboundedSender<StrategyEvent>,
    ) -> Self {
        Self {
            http,
            downloader,
            store,
            installer_dir,
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

    fn pending_installer(&self) -> Option<PendingInstaller> {
        let raw = self.store.get(PENDING_INSTALLER_KEY)?;
        match serde_json::from_str(&raw) {
            Ok(pending) => Some(pending),
            Err(error) => {
                warn!("[updater/win] dropping unreadable pending installer entry: {error}");
                self.store.delete(PENDING_INSTALLER_KEY);
                None
            }
        }
    }

    fn persist_pending(&self, pending: &PendingInstaller) {
        match serde_json::to_string(pending) {
            Ok(raw) => self.store.set(PENDING_INSTALLER_KEY, &raw),
            Err(error) => warn!("[updater/win] failed to persist pending installer: {error}"),
        }
    }

    fn launch_installer(&self, path: &std::path::Path) -> bool {
        info!("[updater/win] launching installer {}", path.display());
        match tokio::process::Command::new(path)
            .args(INSTALLER_ARGS)
            .spawn()
        {
            Ok(_child) => true,
            Err(error) => {
                warn!("[updater/win] failed to launch installer: {error}");
                false
            }
        }
    }

    async fn download_installer(&self, feed: FeedResponse, feed_version: String) {
        let target = self
            .installer_dir
            .join(format!("installer-{feed_version}.exe"));
        let mut progress = self
            .downloader
            .fetch(&feed.url, &target, HeaderMap::new(), true);

        loop {
            match progress.recv().await {
                Ok(DownloadEvent::Progress(_)) => {}
                Ok(DownloadEvent::Finished { path, .. }) => {
                    let pending = PendingInstaller {
                        version: feed_version,
                        path: path.clone(),
                    };
                    self.persist_pending(&pending);
                    self.emit(StrategyEvent::Downloaded(UpdateDetails {
                        version: Some(pending.version),
                        release_name: Some(feed.name),
                        release_notes: feed.notes,
                        release_date: feed.pub_date,
                        installer_path: Some(path),
                    }));
                    return;
                }
                Ok(DownloadEvent::Failed { error, .. }) => {
                    self.emit(StrategyEvent::Error(format!(
                        "installer download failed: {error}"
                    )));
                    return;
                }
                Err(_) => {
                    self.emit(StrategyEvent::Error(
                        "installer download was aborted".to_owned(),
                    ));
                    return;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl UpdateStrategy for WindowsUpdateStrategy {
    fn set_feed_url(&self, url: &str) {
        *self.feed_lock() = Some(url.to_owned());
    }

    fn feed_url(&self) -> Option<String> {
        self.feed_lock().clone()
    }

    async fn check_for_updates(&self) {
        self.emit(StrategyEvent::Checking);

        let Some(feed_url) = self.feed_url() else {
            self.emit(StrategyEvent::Error("no feed url set".to_owned()));
            return;
        };

        let response = match self.http.send(HttpRequest::get(feed_url)).await {
            Ok(response) => response,
            Err(error) => {
                self.emit(StrategyEvent::Error(format!("feed fetch failed: {error}")));
                return;
            }
        };

        // Any non-200 feed answer means no update is being offered; only
        // transport failures count as errors.
        if response.status != 200 {
            info!(
                "[updater/win] feed returned status {}, no update offered",
                response.status
            );
            self.emit(StrategyEvent::NotAvailable);
            return;
        }

        let feed: FeedResponse = match serde_json::from_str(&response.body) {
            Ok(feed) => feed,
            Err(error) => {
                self.emit(StrategyEvent::Error(format!("malformed feed: {error}")));
                return;
            }
        };

        let Some(feed_version) = version::extract_version(&feed.name).map(str::to_owned) else {
            self.emit(StrategyEvent::Error(format!(
                "no version in feed name {:?}",
                feed.name
            )));
            return;
        };

        if let Some(pending) = self.pending_installer()
            && pending.version == feed_version
            && pending.path.exists()
        {
            info!("[updater/win] installer for {feed_version} already downloaded");
            self.emit(StrategyEvent::Downloaded(UpdateDetails {
                version: Some(pending.version),
                release_name: Some(feed.name),
                release_notes: feed.notes,
                release_date: feed.pub_date,
                installer_path: Some(pending.path),
            }));
            return;
        }

        self.emit(StrategyEvent::Available);
        self.download_installer(feed, feed_version).await;
    }

    fn quit_and_install(&self) -> bool {
        let Some(pending) = self.pending_installer() else {
            info!("[updater/win] no pending installer");
            return false;
        };
        if !pending.path.exists() {
            warn!(
                "[updater/win] pending installer {} is missing, clearing entry",
                pending.path.display()
            );
            self.store.delete(PENDING_INSTALLER_KEY);
            return false;
        }
        self.launch_installer(&pending.path)
    }

    fn install_mandatory_updates_if_present(&self) -> bool {
        let Some(pending) = self.pending_installer() else {
            return false;
        };
        match version::is_newer(&pending.version, &self.running_version) {
            Ok(true) => {}
            Ok(false) => {
                info!(
                    "[updater/win] pending installer {} is not newer than {}, discarding",
                    pending.version, self.running_version
                );
                self.store.delete(PENDING_INSTALLER_KEY);
                return false;
            }
            Err(error) => {
                warn!("[updater/win] unusable pending installer version: {error}");
                self.store.delete(PENDING_INSTALLER_KEY);
                return false;
            }
        }
        if !pending.path.exists() {
            warn!("[updater/win] pending installer file is missing, clearing entry");
            self.store.delete(PENDING_INSTALLER_KEY);
            return false;
        }
        self.launch_installer(&pending.path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::{PENDING_INSTALLER_KEY, PendingInstaller, WindowsUpdateStrategy};
    use crate::download::Downloader;
    use crate::http::HttpClient;
    use crate::testing::{http_response, serve_responses};
    use crate::updater::{KeyValueStore, StrategyEvent, UpdateStrategy};

    #[derive(Default)]
    struct MemoryStore {
        values: Mutex<HashMap<String, String>>,
    }

    impl KeyValueStore for MemoryStore {
        fn has(&self, key: &str) -> bool {
            self.values.lock().expect("store lock").contains_key(key)
        }

        fn get(&self, key: &str) -> Option<String> {
            self.values.lock().expect("store lock").get(key).cloned()
        }

        fn set(&self, key: &str, value: &str) {
            self.values
                .lock()
                .expect("store lock")
                .insert(key.to_owned(), value.to_owned());
        }

        fn delete(&self, key: &str) {
            self.values.lock().expect("store lock").remove(key);
        }
    }

    fn strategy(
        installer_dir: std::path::PathBuf,
        store: Arc<MemoryStore>,
    ) -> (
        WindowsUpdateStrategy,
        mpsc::UnboundedReceiver<StrategyEvent>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let strategy = WindowsUpdateStrategy::new(
            Arc::new(HttpClient::new().expect("client should build")),
            Downloader::new().expect("downloader should build"),
            store,
            installer_dir,
            "1.0.0".to_owned(),
            sender,
        );
        (strategy, receiver)
    }

    async fn next_event(receiver: &mut mpsc::UnboundedReceiver<StrategyEvent>) -> StrategyEvent {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("event should arrive")
            .expect("channel should stay open")
    }

    fn feed_body(installer_url: &str) -> String {
        format!(
            r#"{{"url": "{installer_url}", "name": "petrel 1.1.0.5",
                "pub_date": "2026-08-01T00:00:00Z", "notes": "fixes"}}"#
        )
    }

    #[tokio::test]
    async fn check_downloads_installer_and_persists_pending_entry() {
        let installer_server =
            serve_responses(vec![http_response(200, "OK", &[], "installer-bytes")]).await;
        let installer_url = format!("http://{}/installer.exe", installer_server.addr);
        let feed_server =
            serve_responses(vec![http_response(200, "OK", &[], &feed_body(&installer_url))]).await;

        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = Arc::new(MemoryStore::default());
        let (strategy, mut events) = strategy(temp.path().join("installers"), store.clone());
        strategy.set_feed_url(&format!("http://{}/feed", feed_server.addr));

        strategy.check_for_updates().await;

        assert!(matches!(next_event(&mut events).await, StrategyEvent::Checking));
        assert!(matches!(next_event(&mut events).await, StrategyEvent::Available));
        let StrategyEvent::Downloaded(details) = next_event(&mut events).await else {
            panic!("expected downloaded event");
        };
        assert_eq!(details.version.as_deref(), Some("1.1.0.5"));
        let path = details.installer_path.expect("installer path should be set");
        assert_eq!(
            std::fs::read(&path).expect("installer should exist"),
            b"installer-bytes"
        );

        let pending: PendingInstaller = serde_json::from_str(
            &store.get(PENDING_INSTALLER_KEY).expect("entry should persist"),
        )
        .expect("entry should parse");
        assert_eq!(pending.version, "1.1.0.5");
        assert_eq!(pending.path, path);
    }

    #[tokio::test]
    async fn matching_pending_installer_skips_the_download() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let installer = temp.path().join("installer-1.1.0.5.exe");
        std::fs::write(&installer, b"cached").expect("installer should be written");

        let store = Arc::new(MemoryStore::default());
        store.set(
            PENDING_INSTALLER_KEY,
            &serde_json::to_string(&PendingInstaller {
                version: "1.1.0.5".to_owned(),
                path: installer.clone(),
            })
            .expect("entry should serialize"),
        );

        // The feed's installer url points nowhere; it must not be fetched.
        let feed_server = serve_responses(vec![http_response(
            200,
            "OK",
            &[],
            &feed_body("http://127.0.0.1:1/unused"),
        )])
        .await;

        let (strategy, mut events) = strategy(temp.path().to_path_buf(), store);
        strategy.set_feed_url(&format!("http://{}/feed", feed_server.addr));

        strategy.check_for_updates().await;

        assert!(matches!(next_event(&mut events).await, StrategyEvent::Checking));
        let StrategyEvent::Downloaded(details) = next_event(&mut events).await else {
            panic!("expected downloaded event");
        };
        assert_eq!(details.installer_path, Some(installer));
    }

    #[tokio::test]
    async fn any_non_200_feed_status_reports_not_available() {
        for (status, message) in [(204, "No Content"), (404, "Not Found"), (500, "Server Error")] {
            let feed_server = serve_responses(vec![http_response(status, message, &[], "")]).await;
            let temp = tempfile::tempdir().expect("tempdir should be created");
            let (strategy, mut events) =
                strategy(temp.path().to_path_buf(), Arc::new(MemoryStore::default()));
            strategy.set_feed_url(&format!("http://{}/feed", feed_server.addr));

            strategy.check_for_updates().await;

            assert!(matches!(next_event(&mut events).await, StrategyEvent::Checking));
            assert!(
                matches!(next_event(&mut events).await, StrategyEvent::NotAvailable),
                "status {status} should report no update"
            );
        }
    }

    #[tokio::test]
    async fn quit_and_install_with_missing_file_clears_the_entry() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let store = Arc::new(MemoryStore::default());
        store.set(
            PENDING_INSTALLER_KEY,
            &serde_json::to_string(&PendingInstaller {
                version: "1.1.0.5".to_owned(),
                path: temp.path().join("gone.exe"),
            })
            .expect("entry should serialize"),
        );

        let (strategy, _events) = strategy(temp.path().to_path_buf(), store.clone());
        assert!(!strategy.quit_and_install());
        assert!(!store.has(PENDING_INSTALLER_KEY), "stale entry must be cleared");
    }

    #[tokio::test]
    async fn stale_pending_version_is_discarded_at_startup() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let installer = temp.path().join("installer-0.9.0.exe");
        std::fs::write(&installer, b"old").expect("installer should be written");

        let store = Arc::new(MemoryStore::default());
        store.set(
            PENDING_INSTALLER_KEY,
            &serde_json::to_string(&PendingInstaller {
                version: "0.9.0".to_owned(),
                path: installer,
            })
            .expect("entry should serialize"),
        );

        let (strategy, _events) = strategy(temp.path().to_path_buf(), store.clone());
        assert!(!strategy.install_mandatory_updates_if_present());
        assert!(!store.has(PENDING_INSTALLER_KEY));
    }
}
