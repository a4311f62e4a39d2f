//! Run logger behind the `log` facade.
//!
//! Records carry a `jobname | step | index` prefix so interleaved worker
//! output stays attributable. The prefix is thread-local (every worker
//! thread installs its own task identity) and the level is re-read on
//! every record, so a `loglevel` write takes effect immediately.

use std::cell::RefCell;
use std::io::Write;
use std::sync::Once;

use log::{Level, LevelFilter, Log, Metadata, Record};

thread_local! {
    static TASK: RefCell<(String, String, String)> =
        RefCell::new(("---".to_string(), "---".to_string(), "-".to_string()));
}

struct RunLogger;

impl Log for RunLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        TASK.with(|task| {
            let task = task.borrow();
            let mut err = std::io::stderr().lock();
            let _ = writeln!(
                err,
                "| {:<7} | {:<7} | {:<12} | {:<3} | {}",
                level,
                task.0,
                task.1,
                task.2,
                record.args()
            );
        });
    }

    fn flush(&self) {}
}

static LOGGER: RunLogger = RunLogger;
static INIT: Once = Once::new();

/// Install the logger. Idempotent; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(LevelFilter::Info);
        }
    });
}

/// Update the active level from a schema `loglevel` string. Unknown
/// spellings fall back to info.
pub fn set_level(loglevel: &str) {
    let level = match loglevel.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warning" | "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" | "quiet" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };
    log::set_max_level(level);
}

/// Install this thread's task identity, shown in every record it logs.
pub fn set_task(jobname: &str, step: &str, index: &str) {
    TASK.with(|task| {
        *task.borrow_mut() = (jobname.to_string(), step.to_string(), index.to_string());
    });
}

/// Reset this thread's task identity to the idle placeholder.
pub fn clear_task() {
    TASK.with(|task| {
        *task.borrow_mut() = ("---".to_string(), "---".to_string(), "-".to_string());
    });
}
