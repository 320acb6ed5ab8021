//! Console + file logging on top of `env_logger`.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};

/// Writes every record to stderr and to a log file.
struct Tee {
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}

/// Path of the log file for a run started now.
pub fn log_file_path(log_dir: &Path, name: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%y%m%d-%H%M%S");
    log_dir.join(format!("test_{name}_{stamp}.log"))
}

/// Install the global logger. Level defaults to `info`, `RUST_LOG` overrides it.
///
/// Returns the path of the log file.
pub fn setup_logger(log_dir: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let path = log_file_path(log_dir, name);
    let file = File::create(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;

    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {}: {}",
                chrono::Local::now().format("%y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(Tee { file })))
        .try_init()
        .context("logger already initialized")?;
    Ok(path)
}
