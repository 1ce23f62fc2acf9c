//! Startup marker detection in streamed process output.
//!
//! A marker is a line pattern taken as proof that a supervised process
//! reached a lifecycle point, typically "server started on port N". The
//! first capture group, when present and numeric, is taken as the port.

use regex::Regex;

/// Default pattern for embedded Tomcat under Spring Boot.
///
/// Matches both `Tomcat started on port 8080` and
/// `Tomcat started on port(s): 8080 (http)`.
pub const TOMCAT_STARTED_PATTERN: &str = r"Tomcat started on port(?:\(s\))?:?\s*(\d+)?";

/// A line that matched the startup marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerMatch {
    /// Port extracted from the line, if the pattern captured one.
    pub port: Option<u16>,
    pub line: String,
}

/// Compiled startup marker.
#[derive(Debug, Clone)]
pub struct StartupMarker {
    pattern: Regex,
}

impl StartupMarker {
    /// Compile a marker from a regular expression.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Marker for Spring Boot's embedded Tomcat.
    pub fn tomcat() -> Self {
        Self {
            pattern: Regex::new(TOMCAT_STARTED_PATTERN).expect("built-in marker pattern compiles"),
        }
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    /// Check a single output line against the marker.
    ///
    /// # Example
    /// ```
    /// use delivery_core::marker::StartupMarker;
    ///
    /// let marker = StartupMarker::tomcat();
    /// let hit = marker.detect("Tomcat started on port 8080").unwrap();
    /// assert_eq!(hit.port, Some(8080));
    ///
    /// assert!(marker.detect("Starting service [Tomcat]").is_none());
    /// ```
    pub fn detect(&self, line: &str) -> Option<MarkerMatch> {
        let captures = self.pattern.captures(line)?;
        let port = captures
            .get(1)
            .and_then(|m| m.as_str().parse::<u16>().ok());
        Some(MarkerMatch {
            port,
            line: line.trim_end().to_string(),
        })
    }
}
