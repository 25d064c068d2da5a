/*!
 * LOGGING - Console + journal de run du hub
 *
 * FONCTIONNEMENT :
 * - `tracing-subscriber` : couche console + couche fichier non bloquante
 *   (`tracing-appender`) dans `<logging.dir>/run_<horodatage>/hub.log`
 * - Filtre `RUST_LOG`, sinon `logging.filter` de la config
 * - Au drain : résumé du run archivé (`summary.json`) puis le `WorkerGuard`
 *   est relâché pour vider le writer avant la sortie forcée
 */

use crate::config::LogConf;
use crate::error::StartupError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub struct LoggingGuard {
    file_guard: Option<WorkerGuard>,
    run_dir: PathBuf,
}

impl LoggingGuard {
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Vide le writer fichier ; les logs suivants ne vont plus qu'en console
    pub fn flush(&mut self) {
        self.file_guard.take();
    }
}

fn run_dir_name(now: OffsetDateTime) -> Result<String, StartupError> {
    let stamp = now
        .format(format_description!("[year][month][day]_[hour][minute][second]"))
        .map_err(|e| StartupError::Logging(e.to_string()))?;
    Ok(format!("run_{stamp}"))
}

pub fn init_logging(conf: &LogConf) -> Result<LoggingGuard, StartupError> {
    let run_dir = Path::new(&conf.dir).join(run_dir_name(OffsetDateTime::now_utc())?);
    std::fs::create_dir_all(&run_dir)
        .map_err(|e| StartupError::Logging(format!("{}: {e}", run_dir.display())))?;

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&conf.filter));
    let (writer, file_guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(&run_dir, "hub.log"));

    let console = tracing_subscriber::fmt::layer().with_target(false).with_filter(filter());
    let file = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(filter());

    // déjà initialisé (plusieurs hubs dans un même processus de test) : non fatal
    if let Err(e) = tracing_subscriber::registry().with(console).with(file).try_init() {
        eprintln!("[logging] subscriber already installed: {e}");
    }
    Ok(LoggingGuard { file_guard: Some(file_guard), run_dir })
}

/// Archive le résumé de run à côté du journal
pub fn archive_run_summary<T: Serialize>(run_dir: &Path, summary: &T) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(run_dir)?;
    let path = run_dir.join("summary.json");
    let body = serde_json::to_vec_pretty(summary).map_err(std::io::Error::other)?;
    std::fs::write(&path, body)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_run_dir_name() {
        assert_eq!(run_dir_name(datetime!(2025-03-07 09:05:01 UTC)).unwrap(), "run_20250307_090501");
    }

    #[test]
    fn test_archive_writes_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = archive_run_summary(dir.path(), &serde_json::json!({"nodes": 3})).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(v["nodes"], 3);
    }

    #[test]
    fn test_init_creates_run_dir() {
        let dir = tempfile::tempdir().unwrap();
        let conf = LogConf { dir: dir.path().to_string_lossy().into_owned(), filter: "debug".into() };
        let mut guard = init_logging(&conf).unwrap();
        assert!(guard.run_dir().starts_with(dir.path()));
        assert!(guard.run_dir().is_dir());
        guard.flush();
    }
}
