use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;

static LOG_DIR: OnceLock<PathBuf> = OnceLock::new();

const CRASH_LOG: &str = "crash.log";
const ROTATE_BYTES: u64 = 2 * 1024 * 1024;
const KEEP_LOGS: usize = 5;

/// Set up `<data_dir>/logs`, the tracing subscriber and the panic hook.
/// Everything goes to stderr; warnings and errors are also appended to
/// `crash.log`. Safe to call more than once, only the first call installs.
pub fn init(data_dir: &Path, level: Level) {
    let log_dir = data_dir.join("logs");
    let _ = fs::create_dir_all(&log_dir);
    if LOG_DIR.set(log_dir.clone()).is_err() {
        return;
    }

    rotate_logs(&log_dir);

    let crash_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(CRASH_LOG));
    let result = match crash_file {
        Ok(file) => {
            let to_file = Mutex::new(file).with_max_level(Level::WARN);
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(std::io::stderr.and(to_file))
                .try_init()
        }
        Err(_) => tracing_subscriber::fmt().with_max_level(level).try_init(),
    };
    // someone else already owns the global subscriber; keep theirs
    let _ = result;

    let prev_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = format_panic(info);
        if let Some(dir) = LOG_DIR.get() {
            if let Ok(mut f) = OpenOptions::new().create(true).append(true).open(dir.join(CRASH_LOG)) {
                let _ = f.write_all(msg.as_bytes());
                let _ = f.write_all(b"\n");
            }
        }
        eprintln!("{}", msg);
        prev_hook(info);
    }));
}

pub fn log_dir() -> Option<&'static Path> {
    LOG_DIR.get().map(|p| p.as_path())
}

pub fn read_crash_log() -> Result<String, String> {
    let dir = LOG_DIR.get().ok_or("log dir not initialized")?;
    fs::read_to_string(dir.join(CRASH_LOG)).map_err(|e| e.to_string())
}

pub fn clear_crash_log() -> Result<(), String> {
    let dir = LOG_DIR.get().ok_or("log dir not initialized")?;
    fs::write(dir.join(CRASH_LOG), "").map_err(|e| e.to_string())
}

fn format_panic(info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_else(|| "unknown".into());
    let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".into()
    };

    format!(
        "=== BUSHIDO SYNC CRASH ===\n\
         Timestamp: {}\n\
         Location:  {}\n\
         Message:   {}\n\
         Thread:    {}\n\
         \n\
         Backtrace:\n{}\n\
         === END CRASH ===\n",
        timestamp,
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::force_capture()
    )
}

/// Shift crash.log -> crash.1.log -> ... once it grows past 2MB.
fn rotate_logs(log_dir: &Path) {
    let current = log_dir.join(CRASH_LOG);
    let too_big = fs::metadata(&current).map(|m| m.len() > ROTATE_BYTES).unwrap_or(false);
    if !too_big {
        return;
    }
    for i in (1..KEEP_LOGS).rev() {
        let from = log_dir.join(format!("crash.{}.log", i));
        let to = log_dir.join(format!("crash.{}.log", i + 1));
        let _ = fs::rename(&from, &to);
    }
    let _ = fs::rename(&current, log_dir.join("crash.1.log"));
}
