//! Cargo-style progress display for copies
//!
//! Finished entries scroll above a spinner that shows running totals. The
//! spinner draws on stderr so stdout stays clean for piped output.

use crate::logger::Logger;
use crossterm::style::{Color, Stylize};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct ConsoleProgress {
    spinner: ProgressBar,
    start_time: Instant,
    files: AtomicU64,
    bytes: AtomicU64,
    per_entry: bool,
    endpoints: Mutex<(String, String)>,
}

impl ConsoleProgress {
    /// `per_entry` prints one "Copied" line per finished entry (push); pulls
    /// only print the final summary.
    pub fn new(per_entry: bool) -> Self {
        let spinner = if std::io::stderr().is_terminal() {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .template("{spinner:.green} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner())
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ "),
            );
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        } else {
            ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden())
        };

        Self {
            spinner,
            start_time: Instant::now(),
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            per_entry,
            endpoints: Mutex::new((String::new(), String::new())),
        }
    }

    fn refresh(&self) {
        let files = self.files.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let elapsed = self.start_time.elapsed().as_secs_f64();
        self.spinner.set_message(format!(
            "{} {} files ({:.1} MB) in {:.1}s",
            "Copying".with(Color::Green).bold(),
            files,
            bytes as f64 / 1_048_576.0,
            elapsed
        ));
    }
}

impl Logger for ConsoleProgress {
    fn start(&self, src: &str, dst: &str) {
        if let Ok(mut e) = self.endpoints.lock() {
            *e = (src.to_string(), dst.to_string());
        }
        self.spinner.set_message(format!("{} -> {}", src, dst));
    }

    fn entry_done(&self, path: &str, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if self.per_entry {
            self.spinner.suspend(|| {
                println!("Copied {} ({} bytes)", path, bytes);
            });
        }
        self.refresh();
    }

    // The caller reports the error itself; just get the spinner out of the way
    fn error(&self, _context: &str, _path: &str, _msg: &str) {
        self.spinner.finish_and_clear();
    }

    fn done(&self, files: u64, bytes: u64, _seconds: f64) {
        self.spinner.finish_and_clear();
        if !self.per_entry {
            let (src, dst) = self.endpoints.lock().map(|e| e.clone()).unwrap_or_default();
            println!("Copied {} -> {} ({} files, {} bytes)", src, dst, files, bytes);
        }
    }
}

impl Drop for ConsoleProgress {
    fn drop(&mut self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}
