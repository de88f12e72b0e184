use chrono::Local;
use once_cell::sync::Lazy;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};

/// Global log file path protected by Mutex
///
/// When None, logs go to stdout.
pub static LOG_FILE: Lazy<Mutex<Option<String>>> = Lazy::new(|| Mutex::new(None));

/// Most verbose level that is still written
static LOG_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

/// Message severity, ordered from least to most verbose
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error = 0,
    Info = 1,
    Debug = 2,
}

impl Level {
    fn from_u8(v: u8) -> Level {
        match v {
            0 => Level::Error,
            1 => Level::Info,
            _ => Level::Debug,
        }
    }
}

/// Sets the most verbose level that reaches the log
pub fn set_level(level: Level) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> Level {
    Level::from_u8(LOG_LEVEL.load(Ordering::SeqCst))
}

pub fn enabled(level: Level) -> bool {
    level <= self::level()
}

/// Logs a message with timestamp to configured output
///
/// # Arguments
/// * `message` - The message to log
///
/// # Returns
/// * `io::Result<()>` - Ok on success, Err if writing fails
pub fn log(message: &str) -> io::Result<()> {
    log_with_thread(message, None)
}

/// Logs a message with timestamp and optional thread ID
///
/// # Arguments
/// * `message` - The message to log
/// * `thread_id` - Optional thread identifier
pub fn log_with_thread(message: &str, thread_id: Option<usize>) -> io::Result<()> {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let log_message = match thread_id {
        Some(tid) => format!("{} [T{}] {}\n", timestamp, tid, message),
        None => format!("{} {}\n", timestamp, message),
    };
    write_line(&log_message)
}

/// Logs a message tagged with the handle it belongs to
///
/// Dropped when `level` is more verbose than the configured level.
///
/// # Example
/// ```text
/// // log_handle(3, Level::Debug, "source connected")?;
/// // 2024-01-01 12:00:00 [handle 3] source connected
/// ```
pub fn log_handle(handle_id: u64, level: Level, message: &str) -> io::Result<()> {
    if !enabled(level) {
        return Ok(());
    }
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let tag = match level {
        Level::Error => "ERROR ",
        Level::Info | Level::Debug => "",
    };
    write_line(&format!(
        "{} [handle {}] {}{}\n",
        timestamp, handle_id, tag, message
    ))
}

fn write_line(line: &str) -> io::Result<()> {
    match &*LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner) {
        Some(log_file) => {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)?;
            file.write_all(line.as_bytes())?;
        }
        None => {
            print!("{}", line);
        }
    }
    Ok(())
}

/// Sets the path for the log file
///
/// Subsequent calls to the log functions append to this file.
/// A path that is not valid UTF-8 is rejected with `InvalidInput`.
pub fn set_log_file<P: AsRef<Path>>(path: P) -> io::Result<()> {
    let path_str = path.as_ref().to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "log file path is not valid UTF-8")
    })?;
    *LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner) = Some(path_str.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_log_to_file() {
        *LOG_FILE.lock().unwrap() = None;

        let dir = tempdir().unwrap();
        let log_file_path = dir.path().join("test.log");

        set_log_file(&log_file_path).unwrap();
        log("test message 1").unwrap();
        log_with_thread("test message 2", Some(1)).unwrap();

        let log_contents = fs::read_to_string(&log_file_path).unwrap();
        assert!(log_contents.contains("test message 1"));
        assert!(log_contents.contains("[T1] test message 2"));

        *LOG_FILE.lock().unwrap() = None;
    }

    #[test]
    #[serial]
    fn test_handle_lines_respect_level() {
        *LOG_FILE.lock().unwrap() = None;
        let dir = tempdir().unwrap();
        let log_file_path = dir.path().join("handle.log");
        set_log_file(&log_file_path).unwrap();

        set_level(Level::Info);
        log_handle(7, Level::Debug, "hidden").unwrap();
        log_handle(7, Level::Error, "connect failed").unwrap();
        set_level(Level::Debug);
        log_handle(8, Level::Debug, "visible").unwrap();
        set_level(Level::Info);

        let log_contents = fs::read_to_string(&log_file_path).unwrap();
        assert!(!log_contents.contains("hidden"));
        assert!(log_contents.contains("[handle 7] ERROR connect failed"));
        assert!(log_contents.contains("[handle 8] visible"));

        *LOG_FILE.lock().unwrap() = None;
    }

    #[test]
    #[serial]
    fn test_log_to_stdout() {
        *LOG_FILE.lock().unwrap() = None;
        log("test stdout message 1").unwrap();
        log_with_thread("test stdout message 2", Some(2)).unwrap();
    }
}
