//! Remote-configuration-driven update engine for Petrel.
//!
//! This crate keeps the desktop client current:
//! - Periodic fetch of the server-controlled configuration document
//!   (ECS) with ETag-conditional refresh and a version-gated disk
//!   cache fallback.
//! - A resilient HTTPS client with timeout, linear-backoff retry and
//!   environment proxy support.
//! - A single-flight streaming downloader with progress reporting and
//!   abort/cleanup.
//! - A cross-platform update coordinator that derives its polling
//!   cadence from the remote config and unifies three platform update
//!   strategies behind one normalized event stream.

pub mod download;
pub mod ecs;
pub mod events;
pub mod http;
pub mod time_sync;
pub mod updater;
pub mod version;

#[cfg(test)]
pub(crate) mod testing;

/// Single-flight downloader and its progress event type.
pub use download::{DownloadEvent, Downloader};
/// Remote config service, its typed snapshot, and lifecycle events.
pub use ecs::{EcsConfig, EcsData, EcsEvent, EcsOptions};
/// Cached publisher used for replayable "ready" style events.
pub use events::{CachedPublisher, Event};
/// Resilient HTTPS client.
pub use http::{HttpClient, HttpError, HttpRequest, HttpResponse};
/// Clock-skew detector and the telemetry boundary it reports through.
pub use time_sync::{TelemetryEvent, TelemetrySink, TimeSync};
/// Update coordinator, platform strategies, and the normalized event set.
pub use updater::{
    KeyValueStore, StrategyEvent, UpdateDetails, UpdateStrategy, Updater, UpdaterEvent,
    UpdaterEventKind, UpdaterOptions, linux::LinuxUpdateStrategy,
    macos::{MacosUpdateStrategy, NativeAutoUpdater},
    windows::{PendingInstaller, WindowsUpdateStrategy},
};
