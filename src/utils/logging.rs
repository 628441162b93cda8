//! Logging Utilities
//!
//! File-based and console logging.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Get the log file path
pub fn get_log_file_path() -> PathBuf {
    super::get_app_data_dir().join("streamer.log")
}

/// Simple file logger with per-target filtering.
pub struct FileLogger {
    file: Mutex<Option<File>>,
    console: bool,
}

impl FileLogger {
    pub fn new(console: bool) -> Self {
        let file = Self::open_log_file();
        Self {
            file: Mutex::new(file),
            console,
        }
    }

    fn open_log_file() -> Option<File> {
        let path = get_log_file_path();

        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok()
    }
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let target = metadata.target();
        let level = metadata.level();

        // External crates (wgpu, cpal, ffmpeg wrappers) are chatty; keep
        // them at WARN so the decode path stays off the logger's hot path.
        if target.starts_with("farview_streamer") {
            level <= Level::Debug
        } else {
            level <= Level::Warn
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!(
            "[{}] {} {} - {}\n",
            timestamp,
            record.level(),
            record.target(),
            record.args()
        );

        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.write_all(line.as_bytes());
            }
        }

        if self.console {
            print!("{}", line);
        }
    }

    fn flush(&self) {
        if let Ok(mut guard) = self.file.lock() {
            if let Some(ref mut file) = *guard {
                let _ = file.flush();
            }
        }
    }
}

/// Initialize the logging system.
///
/// File logging keeps console I/O off the frame path; pass `console` for
/// interactive debugging. Falls back to `env_logger` when file logging is
/// disabled entirely so `RUST_LOG` keeps working.
pub fn init_logging(to_file: bool, console: bool) {
    if to_file {
        let logger = Box::new(FileLogger::new(console));
        if log::set_boxed_logger(logger).is_ok() {
            log::set_max_level(LevelFilter::Debug);
        }
    } else {
        let _ = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or("info"),
        )
        .try_init();
    }
}

/// Clear log file
pub fn clear_logs() -> std::io::Result<()> {
    let path = get_log_file_path();
    if path.exists() {
        std::fs::write(&path, "")?;
    }
    Ok(())
}
