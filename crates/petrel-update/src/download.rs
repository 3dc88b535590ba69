use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use log::{info, warn};
use reqwest::header::HeaderMap;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const READ_TIMEOUT: Duration = Duration::from_secs(2 * 60);
const PROGRESS_GRANULARITY: u64 = 1;
const SKIP_EXISTING_DELAY: Duration = Duration::from_millis(200);
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to build download client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// Monotonic percentage of the declared content length, reported in
    /// steps of at least one percent.
    Progress(u8),
    Finished {
        status: u16,
        path: PathBuf,
    },
    Failed {
        status: u16,
        error: String,
    },
}

struct InFlight {
    target: PathBuf,
    cancel: CancellationToken,
    events: broadcast::Sender<DownloadEvent>,
}

/// Single-flight URL-to-file downloader.
///
/// At most one transport-level transfer exists per source url; concurrent
/// fetches for the same url attach to the same progress channel. Failure
/// paths delete the partially written target file.
#[derive(Clone)]
pub struct Downloader {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    requests: Mutex<HashMap<String, InFlight>>,
}

impl Downloader {
    /// # Errors
    /// Returns an error when the underlying client cannot be built.
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .read_timeout(READ_TIMEOUT)
            .build()
            .map_err(DownloadError::ClientBuild)?;
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                requests: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start (or attach to) a download of `url` into `target`.
    ///
    /// With `skip_if_exists` set and `target` already on disk, a
    /// `Finished { status: 304 }` event is synthesized after a short delay
    /// and the network is never touched.
    pub fn fetch(
        &self,
        url: &str,
        target: &Path,
        headers: HeaderMap,
        skip_if_exists: bool,
    ) -> broadcast::Receiver<DownloadEvent> {
        info!("[downloader] GET file: {url} to target: {}", target.display());

        let mut requests = self.inner.lock();
        if let Some(inflight) = requests.get(url) {
            return inflight.events.subscribe();
        }

        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        if skip_if_exists && target.exists() {
            let path = target.to_path_buf();
            tokio::spawn(async move {
                // Delay preserves callback ordering expectations of callers
                // that subscribe right after fetch() returns.
                tokio::time::sleep(SKIP_EXISTING_DELAY).await;
                let _ = events.send(DownloadEvent::Finished { status: 304, path });
            });
            return receiver;
        }

        let cancel = CancellationToken::new();
        requests.insert(
            url.to_owned(),
            InFlight {
                target: target.to_path_buf(),
                cancel: cancel.clone(),
                events: events.clone(),
            },
        );
        drop(requests);

        let inner = self.inner.clone();
        let url = url.to_owned();
        let target = target.to_path_buf();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    // abort() already removed the in-flight entry and
                    // suppresses the failure event.
                    remove_partial_file(&target).await;
                }
                result = run_transfer(&inner.client, &url, &target, headers, &events) => {
                    match result {
                        Ok(status) => {
                            info!("[downloader] download of {url} finished");
                            inner.clear(&url);
                            let _ = events.send(DownloadEvent::Finished {
                                status,
                                path: target,
                            });
                        }
                        Err(failure) => {
                            warn!("[downloader] problem with response: {}", failure.error);
                            remove_partial_file(&target).await;
                            inner.clear(&url);
                            let _ = events.send(DownloadEvent::Failed {
                                status: failure.status,
                                error: failure.error,
                            });
                        }
                    }
                }
            }
        });

        receiver
    }

    /// Cancel the in-flight transfer for `url`, delete the partial file, and
    /// drop the in-flight entry. Returns false when nothing was in flight.
    pub fn abort(&self, url: &str) -> bool {
        info!("[downloader] aborting request for {url}");
        let removed = self.inner.lock().remove(url);
        let Some(inflight) = removed else {
            return false;
        };
        inflight.cancel.cancel();
        true
    }

    #[cfg(test)]
    fn inflight_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn clear(&self, url: &str) {
        self.lock().remove(url);
    }
}

struct TransferFailure {
    status: u16,
    error: String,
}

impl TransferFailure {
    fn new(status: u16, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }
}

async fn run_transfer(
    client: &reqwest::Client,
    url: &str,
    target: &Path,
    headers: HeaderMap,
    events: &broadcast::Sender<DownloadEvent>,
) -> Result<u16, TransferFailure> {
    let response = client
        .get(url)
        .headers(headers)
        .send()
        .await
        .map_err(|error| TransferFailure::new(0, error.to_string()))?;

    let status = response.status().as_u16();
    if status != 200 {
        return Err(TransferFailure::new(
            status,
            format!("fetch failed with code: {status}"),
        ));
    }

    // reqwest decodes gzip/deflate bodies transparently and drops the
    // content-length header when it does, so the completeness check below
    // only applies to identity transfers, where the header is meaningful.
    let declared_length = response.content_length();

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|_| TransferFailure::new(0, "failed to create file on local system"))?;
    }
    let mut file = tokio::fs::File::create(target)
        .await
        .map_err(|_| TransferFailure::new(0, "failed to create file on local system"))?;

    let mut received: u64 = 0;
    let mut last_percent: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|error| TransferFailure::new(status, error.to_string()))?;
        file.write_all(&chunk)
            .await
            .map_err(|error| TransferFailure::new(status, error.to_string()))?;
        received += chunk.len() as u64;

        if let Some(total) = declared_length
            && total > 0
        {
            let percent = received * 100 / total;
            if percent >= last_percent + PROGRESS_GRANULARITY {
                last_percent = percent;
                #[allow(clippy::cast_possible_truncation)]
                let _ = events.send(DownloadEvent::Progress(percent.min(100) as u8));
            }
        }
    }

    file.flush()
        .await
        .map_err(|error| TransferFailure::new(status, error.to_string()))?;
    drop(file);

    if let Some(total) = declared_length
        && received != total
    {
        return Err(TransferFailure::new(status, "file download incomplete"));
    }

    Ok(status)
}

async fn remove_partial_file(target: &Path) {
    match tokio::fs::remove_file(target).await {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            "[downloader] failed to delete {}: {error}",
            target.display()
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use reqwest::header::HeaderMap;

    use super::{DownloadEvent, Downloader};
    use crate::testing::{http_response, serve_responses, serve_stalled};

    async fn next_terminal(
        events: &mut tokio::sync::broadcast::Receiver<DownloadEvent>,
    ) -> DownloadEvent {
        loop {
            match events.recv().await.expect("event channel should stay open") {
                DownloadEvent::Progress(_) => {}
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn skip_if_exists_synthesizes_finished_304() {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let target = temp.path().join("existing.bin");
        std::fs::write(&target, b"already here").expect("target should be written");

        let downloader = Downloader::new().expect("downloader should build");
        let mut events =
            downloader.fetch("http://127.0.0.1:1/unused", &target, HeaderMap::new(), true);

        match next_terminal(&mut events).await {
            DownloadEvent::Finished { status, path } => {
                assert_eq!(status, 304);
                assert_eq!(path, target);
            }
            other => panic!("expected finished event, got {other:?}"),
        }
        assert_eq!(downloader.inflight_count(), 0);
    }

    #[tokio::test]
    async fn downloads_body_to_target_file() {
        let body = "installer-bytes";
        let server = serve_responses(vec![http_response(200, "OK", &[], body)]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let target = temp.path().join("nested/installer.bin");

        let downloader = Downloader::new().expect("downloader should build");
        let url = format!("http://{}/installer", server.addr);
        let mut events = downloader.fetch(&url, &target, HeaderMap::new(), false);

        match next_terminal(&mut events).await {
            DownloadEvent::Finished { status, .. } => assert_eq!(status, 200),
            other => panic!("expected finished event, got {other:?}"),
        }
        let written = std::fs::read(&target).expect("target should exist");
        assert_eq!(written, body.as_bytes());
        assert_eq!(downloader.inflight_count(), 0);
    }

    #[tokio::test]
    async fn short_body_fails_and_removes_partial_file() {
        // Declared length is longer than the body actually sent.
        let server = serve_responses(vec![http_response(
            200,
            "OK",
            &[("content-length", "9999")],
            "truncated",
        )])
        .await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let target = temp.path().join("partial.bin");

        let downloader = Downloader::new().expect("downloader should build");
        let url = format!("http://{}/file", server.addr);
        let mut events = downloader.fetch(&url, &target, HeaderMap::new(), false);

        match next_terminal(&mut events).await {
            DownloadEvent::Failed { .. } => {}
            other => panic!("expected failed event, got {other:?}"),
        }
        assert!(!target.exists(), "partial file must be deleted");
        assert_eq!(downloader.inflight_count(), 0);
    }

    #[tokio::test]
    async fn non_200_status_fails_the_download() {
        let server = serve_responses(vec![http_response(404, "Not Found", &[], "")]).await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let target = temp.path().join("missing.bin");

        let downloader = Downloader::new().expect("downloader should build");
        let url = format!("http://{}/gone", server.addr);
        let mut events = downloader.fetch(&url, &target, HeaderMap::new(), false);

        match next_terminal(&mut events).await {
            DownloadEvent::Failed { status, .. } => assert_eq!(status, 404),
            other => panic!("expected failed event, got {other:?}"),
        }
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn second_fetch_for_same_url_shares_the_transfer() {
        let server = serve_stalled().await;
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let target = temp.path().join("slow.bin");

        let downloader = Downloader::new().expect("downloader should build");
        let url = format!("http://{}/slow", server.addr);
        let _first = downloader.fetch(&url, &target, HeaderMap::new(), false);
        let _second = downloader.fetch(&url, &target, HeaderMap::new(), false);

        // Give the transfer task time to reach the server.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(downloader.inflight_count(), 1);
        assert_eq!(server.hits.load(Ordering::SeqCst), 1);

        assert!(downloader.abort(&url));
        assert_eq!(downloader.inflight_count(), 0);
        assert!(!downloader.abort(&url), "nothing left to abort");
    }
}
