use crate::config::Config;
use std::{
    error::Error,
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

pub fn init_logging(config: &Config) -> Result<(), Box<dyn Error + Send + Sync>> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SIGNAL_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = match open_log_file(&config.log_dir, config.port) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(log_writer(file))
        .try_init()
}

// stdout always, plus the log file when one is open
fn log_writer(file: Option<File>) -> BoxMakeWriter {
    match file {
        Some(file) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        None => BoxMakeWriter::new(io::stdout),
    }
}

fn log_file_path(log_dir: &str, port: u16) -> Option<PathBuf> {
    if log_dir.trim().is_empty() {
        return None;
    }
    Some(PathBuf::from(log_dir).join(format!("signal-hub-{port}.log")))
}

fn open_log_file(log_dir: &str, port: u16) -> io::Result<Option<File>> {
    let Some(path) = log_file_path(log_dir, port) else {
        return Ok(None);
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Some)
}
