//! Log interpretation for failed goal executions.
//!
//! An [`InterpreterChain`] runs a fixed list of heuristics over the full
//! progress log. The first one that yields a non-empty excerpt wins; if none
//! match, the failure has no specific diagnosis.

use serde::{Deserialize, Serialize};

/// Marker Spring Boot prints when the application context fails.
pub const FAILED_TO_START_MARKER: &str = "APPLICATION FAILED TO START";

/// Lines after the marker before the excerpt starts (banner and separator).
const FAILED_TO_START_OFFSET: usize = 3;

/// Last line (exclusive, relative to the marker) included in the excerpt.
const FAILED_TO_START_END: usize = 10;

/// Prefix Maven uses for error lines.
pub const MAVEN_ERROR_PREFIX: &str = "[ERROR]";

/// Message Maven prints when the local repository cache is corrupted.
pub const ARTIFACT_CACHE_MARKER: &str = "Error checking out artifact";

/// Logs shorter than this are shown whole.
pub const SHORT_LOG_THRESHOLD: usize = 200;

/// Diagnosis extracted from a failed run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpretedLog {
    /// The part of the log a human should look at.
    pub relevant_part: String,
    pub message: String,
    /// Whether the report should also carry the full log.
    pub include_full_log: bool,
}

/// A single log heuristic.
pub trait LogInterpreter: Send + Sync {
    fn name(&self) -> &'static str;

    fn interpret(&self, log: &str) -> Option<InterpretedLog>;
}

/// Excerpt after the "APPLICATION FAILED TO START" banner.
#[derive(Debug, Default)]
pub struct AppFailedToStart;

impl LogInterpreter for AppFailedToStart {
    fn name(&self) -> &'static str {
        "app_failed_to_start"
    }

    fn interpret(&self, log: &str) -> Option<InterpretedLog> {
        let lines: Vec<&str> = log.lines().collect();
        let idx = lines.iter().position(|l| l.contains(FAILED_TO_START_MARKER))?;
        let start = (idx + FAILED_TO_START_OFFSET).min(lines.len());
        let end = (idx + FAILED_TO_START_END).min(lines.len());
        Some(InterpretedLog {
            relevant_part: lines[start..end].join("\n"),
            message: "Application failed to start".to_string(),
            include_full_log: false,
        })
    }
}

/// Every `[ERROR]` line Maven printed.
#[derive(Debug, Default)]
pub struct MavenErrors;

impl LogInterpreter for MavenErrors {
    fn name(&self) -> &'static str {
        "maven_errors"
    }

    fn interpret(&self, log: &str) -> Option<InterpretedLog> {
        let errors: Vec<&str> = log
            .lines()
            .filter(|l| l.starts_with(MAVEN_ERROR_PREFIX))
            .collect();
        if errors.is_empty() {
            return None;
        }
        Some(InterpretedLog {
            relevant_part: errors.join("\n"),
            message: "Maven errors".to_string(),
            include_full_log: true,
        })
    }
}

/// Corrupted local artifact cache; a rebuild usually fixes it.
#[derive(Debug, Default)]
pub struct ArtifactCacheLost;

impl LogInterpreter for ArtifactCacheLost {
    fn name(&self) -> &'static str {
        "artifact_cache_lost"
    }

    fn interpret(&self, log: &str) -> Option<InterpretedLog> {
        log.contains(ARTIFACT_CACHE_MARKER).then(|| InterpretedLog {
            relevant_part: log.to_string(),
            message: "I lost the local cache. Please rebuild".to_string(),
            include_full_log: false,
        })
    }
}

/// The whole log, when it is short enough to read at a glance.
#[derive(Debug, Default)]
pub struct ShortLog;

impl LogInterpreter for ShortLog {
    fn name(&self) -> &'static str {
        "short_log"
    }

    fn interpret(&self, log: &str) -> Option<InterpretedLog> {
        (log.len() < SHORT_LOG_THRESHOLD).then(|| InterpretedLog {
            relevant_part: log.to_string(),
            message: "This is the whole log.".to_string(),
            include_full_log: false,
        })
    }
}

/// Ordered list of interpreters; first non-empty diagnosis wins.
pub struct InterpreterChain {
    interpreters: Vec<Box<dyn LogInterpreter>>,
}

impl std::fmt::Debug for InterpreterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interpreters.iter().map(|i| i.name()))
            .finish()
    }
}

impl Default for InterpreterChain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(AppFailedToStart),
            Box::new(MavenErrors),
            Box::new(ArtifactCacheLost),
            Box::new(ShortLog),
        ])
    }
}

impl InterpreterChain {
    pub fn new(interpreters: Vec<Box<dyn LogInterpreter>>) -> Self {
        Self { interpreters }
    }

    /// A chain that never produces a diagnosis.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn interpret(&self, log: &str) -> Option<InterpretedLog> {
        self.interpreters
            .iter()
            .filter_map(|i| i.interpret(log))
            .find(|d| !d.relevant_part.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maven_errors_are_collected_with_full_log() {
        let log = format!(
            "[INFO] Scanning\n[ERROR] build broke\n[INFO] noise\n[ERROR] again\n{}",
            "padding line\n".repeat(20)
        );
        let diagnosis = InterpreterChain::default().interpret(&log).unwrap();
        assert_eq!(diagnosis.message, "Maven errors");
        assert_eq!(diagnosis.relevant_part, "[ERROR] build broke\n[ERROR] again");
        assert!(diagnosis.include_full_log);
    }

    #[test]
    fn failed_to_start_takes_precedence() {
        let mut lines = vec!["[ERROR] also here".to_string()];
        lines.push("***************************".to_string());
        lines.push(FAILED_TO_START_MARKER.to_string());
        lines.push("***************************".to_string());
        lines.push(String::new());
        lines.push("Description:".to_string());
        for i in 0..20 {
            lines.push(format!("detail {i}"));
        }
        let log = lines.join("\n");

        let diagnosis = InterpreterChain::default().interpret(&log).unwrap();
        assert_eq!(diagnosis.message, "Application failed to start");
        assert!(!diagnosis.include_full_log);
        let excerpt: Vec<&str> = diagnosis.relevant_part.lines().collect();
        assert_eq!(excerpt.len(), FAILED_TO_START_END - FAILED_TO_START_OFFSET);
        assert_eq!(excerpt[0], "Description:");
    }

    #[test]
    fn failed_to_start_window_clips_at_end_of_log() {
        let log = format!("{FAILED_TO_START_MARKER}\n*\n\nlast line");
        let diagnosis = AppFailedToStart.interpret(&log).unwrap();
        assert_eq!(diagnosis.relevant_part, "last line");
    }

    #[test]
    fn empty_failed_to_start_window_falls_through() {
        let log = format!("{}\n{FAILED_TO_START_MARKER}", "x".repeat(10));
        let diagnosis = InterpreterChain::default().interpret(&log).unwrap();
        assert_eq!(diagnosis.message, "This is the whole log.");
    }

    #[test]
    fn cache_corruption_returns_whole_log() {
        let log = format!(
            "{}\n{ARTIFACT_CACHE_MARKER} org.example:thing\n",
            "download ".repeat(40)
        );
        let diagnosis = InterpreterChain::default().interpret(&log).unwrap();
        assert_eq!(diagnosis.message, "I lost the local cache. Please rebuild");
        assert_eq!(diagnosis.relevant_part, log);
        assert!(!diagnosis.include_full_log);
    }

    #[test]
    fn short_log_is_returned_verbatim() {
        let diagnosis = InterpreterChain::default().interpret("boom").unwrap();
        assert_eq!(diagnosis.relevant_part, "boom");
        assert_eq!(diagnosis.message, "This is the whole log.");
    }

    #[test]
    fn long_unrecognized_log_has_no_diagnosis() {
        let log = "nothing to see here\n".repeat(50);
        assert_eq!(InterpreterChain::default().interpret(&log), None);
        assert_eq!(InterpreterChain::empty().interpret("boom"), None);
    }
}
