use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

static DEBUG: AtomicBool = AtomicBool::new(false);

/// Enable per-frame debug lines on stderr (`--debug`).
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
}

pub fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Warn about an entry that was not transferred, then record it.
pub fn warn_skipped(logger: &dyn Logger, path: &str, reason: &str) {
    eprintln!("Warning: skipping {} ({})", path, reason);
    logger.skipped(path, reason);
}

/// Print a debug line; the message is only built when debugging is on.
pub fn debug<F: FnOnce() -> String>(msg: F) {
    if debug_enabled() {
        eprintln!("[debug {}] {}", Utc::now().format("%H:%M:%S%.3f"), msg());
    }
}

/// Transfer event sink; every method defaults to doing nothing.
pub trait Logger: Send + Sync {
    fn start(&self, _src: &str, _dst: &str) {}
    fn entry_done(&self, _path: &str, _bytes: u64) {}
    fn skipped(&self, _path: &str, _reason: &str) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, src: &str, dst: &str) {
        self.line(&format!("START src={} dst={}", src, dst));
    }
    fn entry_done(&self, path: &str, bytes: u64) {
        self.line(&format!("COPY path={} bytes={}", path, bytes));
    }
    fn skipped(&self, path: &str, reason: &str) {
        self.line(&format!("SKIP path={} reason={}", path, reason));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Fans events out to several loggers
pub struct TeeLogger {
    loggers: Vec<Arc<dyn Logger>>,
}

impl TeeLogger {
    pub fn new(loggers: Vec<Arc<dyn Logger>>) -> Self {
        Self { loggers }
    }
}

impl Logger for TeeLogger {
    fn start(&self, src: &str, dst: &str) {
        self.loggers.iter().for_each(|l| l.start(src, dst));
    }
    fn entry_done(&self, path: &str, bytes: u64) {
        self.loggers.iter().for_each(|l| l.entry_done(path, bytes));
    }
    fn skipped(&self, path: &str, reason: &str) {
        self.loggers.iter().for_each(|l| l.skipped(path, reason));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.loggers.iter().for_each(|l| l.error(context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.loggers.iter().for_each(|l| l.done(files, bytes, seconds));
    }
}

/// Records events in memory; handy for asserting on transfer behavior.
#[derive(Default)]
pub struct MemoryLogger {
    events: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, s: String) {
        if let Ok(mut e) = self.events.lock() {
            e.push(s);
        }
    }
}

impl Logger for MemoryLogger {
    fn start(&self, src: &str, dst: &str) {
        self.push(format!("start {} {}", src, dst));
    }
    fn entry_done(&self, path: &str, bytes: u64) {
        self.push(format!("copy {} {}", path, bytes));
    }
    fn skipped(&self, path: &str, reason: &str) {
        self.push(format!("skip {} {}", path, reason));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.push(format!("error {} {} {}", context, path, msg));
    }
    fn done(&self, files: u64, bytes: u64, _seconds: f64) {
        self.push(format!("done {} {}", files, bytes));
    }
}
