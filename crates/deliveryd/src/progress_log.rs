//! Progress logs for goal executions.
//!
//! A progress log is an append-only text buffer. Executions write to a
//! [`MultiProgressLog`] that fans out to the daemon log, an in-memory copy
//! used for interpretation, and a durable file linked from reported statuses.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use delivery_core::Id;
use tracing::{info, warn};

/// An append-only log sink.
pub trait ProgressLog: Send + Sync {
    /// Sink name for diagnostics.
    fn name(&self) -> &'static str;

    /// Append text as-is. Callers include their own newlines.
    fn write(&self, text: &str) -> io::Result<()>;

    /// Full text written so far, if this sink retains it.
    fn log(&self) -> Option<String> {
        None
    }

    /// Link to the persisted log, if this sink has one.
    fn url(&self) -> Option<String> {
        None
    }

    /// Flush and seal the sink. Further writes are errors or no-ops.
    fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Forwards each line to the daemon's tracing output.
#[derive(Debug)]
pub struct ConsoleProgressLog {
    label: String,
}

impl ConsoleProgressLog {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressLog for ConsoleProgressLog {
    fn name(&self) -> &'static str {
        "console"
    }

    fn write(&self, text: &str) -> io::Result<()> {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            info!(target: "progress", log = %self.label, "{}", line);
        }
        Ok(())
    }
}

/// Keeps the full text in memory.
#[derive(Debug, Default)]
pub struct InMemoryProgressLog {
    buffer: Mutex<String>,
}

impl InMemoryProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ProgressLog for InMemoryProgressLog {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn write(&self, text: &str) -> io::Result<()> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
        Ok(())
    }

    fn log(&self) -> Option<String> {
        Some(self.contents())
    }
}

/// Durable log file, served by the daemon at `{base_url}/logs/{id}`.
#[derive(Debug)]
pub struct FileProgressLog {
    id: Id,
    path: PathBuf,
    url: String,
    file: Mutex<Option<File>>,
}

impl FileProgressLog {
    /// Create `<dir>/<id>.log`.
    pub fn create(dir: &Path, id: &Id, base_url: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = log_path(dir, id);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            id: id.clone(),
            url: format!("{}/logs/{}", base_url.trim_end_matches('/'), id),
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProgressLog for FileProgressLog {
    fn name(&self) -> &'static str {
        "file"
    }

    fn write(&self, text: &str) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_mut() {
            Some(file) => file.write_all(text.as_bytes()),
            None => Err(io::Error::other("progress log is closed")),
        }
    }

    fn log(&self) -> Option<String> {
        std::fs::read_to_string(&self.path).ok()
    }

    fn url(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn close(&self) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut file) = guard.take() {
            file.flush()?;
        }
        Ok(())
    }
}

/// Path of the durable log for an execution.
pub fn log_path(dir: &Path, id: &Id) -> PathBuf {
    dir.join(format!("{id}.log"))
}

/// Writes to every sink in order; one failing sink never blocks the others.
pub struct MultiProgressLog {
    sinks: Vec<Arc<dyn ProgressLog>>,
}

impl std::fmt::Debug for MultiProgressLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sinks.iter().map(|s| s.name()))
            .finish()
    }
}

impl MultiProgressLog {
    pub fn new(sinks: Vec<Arc<dyn ProgressLog>>) -> Self {
        Self { sinks }
    }
}

impl ProgressLog for MultiProgressLog {
    fn name(&self) -> &'static str {
        "multi"
    }

    fn write(&self, text: &str) -> io::Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.write(text) {
                warn!(sink = sink.name(), error = %e, "progress log sink write failed");
            }
        }
        Ok(())
    }

    fn log(&self) -> Option<String> {
        self.sinks.iter().find_map(|s| s.log())
    }

    fn url(&self) -> Option<String> {
        self.sinks.iter().find_map(|s| s.url())
    }

    fn close(&self) -> io::Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.close() {
                warn!(sink = sink.name(), error = %e, "progress log sink close failed");
            }
        }
        Ok(())
    }
}

/// Creates the per-execution log stack.
#[derive(Debug, Clone)]
pub struct LogFactory {
    log_dir: PathBuf,
    base_url: String,
}

/// A freshly created execution log and where it lives.
pub struct ExecutionLog {
    pub log: Arc<dyn ProgressLog>,
    pub path: Option<PathBuf>,
    pub url: Option<String>,
}

impl LogFactory {
    pub fn new(log_dir: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            log_dir: log_dir.into(),
            base_url: base_url.into(),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Console + memory + file. Falls back to console + memory when the
    /// file cannot be created so the execution still has a log.
    pub fn create(&self, id: &Id, label: &str) -> ExecutionLog {
        let console: Arc<dyn ProgressLog> = Arc::new(ConsoleProgressLog::new(label));
        let memory: Arc<dyn ProgressLog> = Arc::new(InMemoryProgressLog::new());

        match FileProgressLog::create(&self.log_dir, id, &self.base_url) {
            Ok(file) => {
                let path = file.path().to_path_buf();
                let url = file.url();
                let file: Arc<dyn ProgressLog> = Arc::new(file);
                ExecutionLog {
                    log: Arc::new(MultiProgressLog::new(vec![console, memory, file])),
                    path: Some(path),
                    url,
                }
            }
            Err(e) => {
                warn!(
                    execution_id = %id,
                    dir = %self.log_dir.display(),
                    error = %e,
                    "failed to create durable progress log, continuing without it"
                );
                ExecutionLog {
                    log: Arc::new(MultiProgressLog::new(vec![console, memory])),
                    path: None,
                    url: None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct BrokenSink;

    impl ProgressLog for BrokenSink {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn write(&self, _text: &str) -> io::Result<()> {
            Err(io::Error::other("disk full"))
        }
    }

    #[test]
    fn in_memory_log_accumulates() {
        let log = InMemoryProgressLog::new();
        log.write("one\n").unwrap();
        log.write("two\n").unwrap();
        assert_eq!(log.log().unwrap(), "one\ntwo\n");
    }

    #[test]
    fn file_log_persists_and_links() {
        let dir = TempDir::new().unwrap();
        let id = Id::from_string("exec-1");
        let log = FileProgressLog::create(dir.path(), &id, "http://127.0.0.1:7800/").unwrap();
        log.write("hello\n").unwrap();
        assert_eq!(log.url().unwrap(), "http://127.0.0.1:7800/logs/exec-1");
        assert_eq!(log.log().unwrap(), "hello\n");
        log.close().unwrap();
        assert!(log.write("late\n").is_err());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("exec-1.log")).unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn multi_log_survives_failing_sink() {
        let memory = Arc::new(InMemoryProgressLog::new());
        let multi = MultiProgressLog::new(vec![
            Arc::new(BrokenSink),
            Arc::clone(&memory) as Arc<dyn ProgressLog>,
        ]);
        multi.write("a\n").unwrap();
        multi.write("b\n").unwrap();
        assert_eq!(memory.contents(), "a\nb\n");
        assert_eq!(multi.log().unwrap(), "a\nb\n");
        assert_eq!(multi.url(), None);
    }

    #[test]
    fn factory_builds_linked_log() {
        let dir = TempDir::new().unwrap();
        let factory = LogFactory::new(dir.path(), "http://localhost:7800");
        let id = Id::new();
        let created = factory.create(&id, "build");
        created.log.write("compiling\n").unwrap();
        assert_eq!(created.url.unwrap(), format!("http://localhost:7800/logs/{id}"));
        assert_eq!(created.log.log().unwrap(), "compiling\n");
        assert!(created.path.unwrap().exists());
    }

    #[test]
    fn factory_falls_back_without_file() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let factory = LogFactory::new(&blocker, "http://localhost:7800");
        let created = factory.create(&Id::new(), "build");
        assert!(created.url.is_none());
        created.log.write("still works\n").unwrap();
        assert_eq!(created.log.log().unwrap(), "still works\n");
    }
}
