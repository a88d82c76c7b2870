#![allow(dead_code)]

use std::ffi::OsStr;
use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub mod clock;
pub mod filesystem;
pub mod mime;
pub mod net;

pub use clock::{Clock, ManualClock, RealClock};
pub use filesystem::{DirEntry, FileSystem, FileWriter, FsMetadata, RealFileSystem, VirtualFileSystem};
pub use mime::mime_for_path;
pub use net::{DynStream, Net, RealNet, TcpListenerLike, VirtualNet};

/// Guard for the non-blocking file writer so it is not dropped early.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();
/// Ensures logging is only initialized once.
static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Initialize tracing-based logging with both console and file output.
///
/// Subsequent calls are no-ops so every binary and test harness can call
/// this helper confidently and share the same configuration.
pub fn init_logging(log_path: &Path, fs: &dyn FileSystem) -> Result<()> {
    LOG_INIT
        .get_or_try_init(|| configure_logging(log_path, fs))
        .map(|_| ())
}

/// Write `data` to a unique temp sibling of `path`, then rename into
/// place. Either the full file appears at `path` or nothing does.
pub fn write_atomic(fs: &dyn FileSystem, path: &Path, data: &[u8]) -> io::Result<()> {
    let tmp = temp_sibling(path);
    let mut writer = fs.open_write(&tmp)?;
    writer.write_all(data)?;
    writer.sync()?;
    drop(writer);
    match fs.rename(&tmp, path) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs.remove_file(&tmp);
            Err(e)
        }
    }
}

/// Sibling path used for in-flight writes before the final rename.
pub fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .unwrap_or_else(|| OsStr::new("download"))
        .to_string_lossy();
    path.with_file_name(format!(".{name}.part"))
}

fn configure_logging(log_path: &Path, fs: &dyn FileSystem) -> Result<()> {
    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let _ = fs.create_dir_all(log_dir);
    let file_name = log_path
        .file_name()
        .unwrap_or_else(|| OsStr::new("lanshare.log"));

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep guard alive for the process lifetime.
    let _ = FILE_GUARD.set(guard);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console_layer = fmt::layer().with_writer(std::io::stdout);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}
