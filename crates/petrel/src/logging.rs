use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(debug_assertions)]
use simplelog::{ColorChoice, TermLogger, TerminalMode};
use simplelog::{CombinedLogger, ConfigBuilder, LevelFilter, SharedLogger, WriteLogger};

/// Set up file logging, with terminal output in debug builds.
///
/// An oversized log file from earlier runs is cut down before the logger
/// attaches to it, so the file hovers around half the limit between runs.
pub fn init(log_path: &Path, debug: bool, max_size_bytes: u64) {
    truncate_to_recent_lines(log_path, max_size_bytes);

    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .add_filter_allow_str("petrel")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    #[cfg(debug_assertions)]
    loggers.push(TermLogger::new(
        level,
        config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ));
    match open_log_file(log_path) {
        Ok(file) => loggers.push(WriteLogger::new(level, config, file)),
        Err(error) => eprintln!("petrel: cannot open log file: {error}"),
    }

    let _ = CombinedLogger::init(loggers);
    log::debug!("logging to {}", log_path.display());
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Rewrite the log file with only its most recent lines, roughly half the
/// size limit, when it has grown past the limit.
fn truncate_to_recent_lines(path: &Path, max_size_bytes: u64) {
    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    if metadata.len() <= max_size_bytes {
        return;
    }
    let Ok(contents) = std::fs::read(path) else {
        return;
    };

    let keep = contents
        .len()
        .min(usize::try_from(max_size_bytes / 2).unwrap_or(usize::MAX));
    let tail = &contents[contents.len() - keep..];
    // Drop the partial line at the front of the tail.
    let start = tail
        .iter()
        .position(|&byte| byte == b'\n')
        .map_or(0, |pos| pos + 1);
    let _ = std::fs::write(path, &tail[start..]);
}
