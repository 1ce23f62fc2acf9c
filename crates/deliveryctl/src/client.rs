//! HTTP client for the deliveryd daemon.

use delivery_core::types::{
    CommitRef, DeploymentInfo, DeploymentKey, Execution, ExecutionState, Id, StatusEntry,
    StatusState,
};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: deliveryd\n  → or set DELIVERYD_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Conflict(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check DELIVERYD_TOKEN env var or --token flag")]
    Unauthorized,
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map_or_else(|| "unknown".to_string(), ToString::to_string);
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map_or(0, |s| s.as_u16()),
                message: e.to_string(),
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    commit: &'a CommitRef,
}

#[derive(Debug, Serialize)]
struct StatusEventRequest<'a> {
    commit: &'a CommitRef,
    status: &'a StatusEntry,
}

#[derive(Debug, Serialize)]
struct GoalActionRequest<'a> {
    commit: &'a CommitRef,
    context: &'a str,
}

/// One goal run by a dispatch.
#[derive(Debug, Deserialize)]
pub struct FinishedGoal {
    pub context: String,
    pub execution_id: Id,
    pub state: ExecutionState,
    pub reported: StatusState,
}

/// What a dispatch did; empty when it was sent to the background.
#[derive(Debug, Default, Deserialize)]
pub struct DispatchSummary {
    pub finished: Vec<FinishedGoal>,
    pub suppressed: usize,
}

/// Error response from API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP client for deliveryd.
#[derive(Debug)]
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            http: reqwest::Client::new(),
        }
    }

    /// Fail fast with a readable error when the daemon is not up.
    pub async fn check_health(&self) -> Result<(), ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    /// Build headers with optional auth token.
    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    /// Handle error response from API.
    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }

        let message = response
            .json::<ErrorResponse>()
            .await
            .map_or_else(|_| "unknown error".to_string(), |e| e.error);

        match status {
            404 => ClientError::NotFound(message),
            409 => ClientError::Conflict(message),
            _ => ClientError::HttpError { status, message },
        }
    }

    async fn post_dispatch(
        &self,
        path: &str,
        body: &impl Serialize,
        wait: bool,
    ) -> Result<DispatchSummary, ClientError> {
        let url = format!("{}{path}?wait={wait}", self.base_url);
        let response = self
            .http
            .post(&url)
            .headers(self.headers())
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, ClientError> {
        let response = self.http.get(url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Plan the pipeline for a commit and dispatch.
    /// POST /pushes
    pub async fn push(&self, commit: &CommitRef, wait: bool) -> Result<DispatchSummary, ClientError> {
        self.post_dispatch("/pushes", &PushRequest { commit }, wait)
            .await
    }

    /// Send a status event for a commit.
    /// POST /statuses
    pub async fn send_status(
        &self,
        commit: &CommitRef,
        status: &StatusEntry,
        wait: bool,
    ) -> Result<DispatchSummary, ClientError> {
        self.post_dispatch("/statuses", &StatusEventRequest { commit, status }, wait)
            .await
    }

    /// POST /goals/approve
    pub async fn approve(
        &self,
        commit: &CommitRef,
        context: &str,
        wait: bool,
    ) -> Result<DispatchSummary, ClientError> {
        self.post_dispatch("/goals/approve", &GoalActionRequest { commit, context }, wait)
            .await
    }

    /// POST /goals/retry
    pub async fn retry(
        &self,
        commit: &CommitRef,
        context: &str,
        wait: bool,
    ) -> Result<DispatchSummary, ClientError> {
        self.post_dispatch("/goals/retry", &GoalActionRequest { commit, context }, wait)
            .await
    }

    /// Latest status per goal.
    /// GET /repos/{owner}/{repo}/commits/{sha}/statuses
    pub async fn statuses(
        &self,
        owner: &str,
        repo: &str,
        sha: &str,
    ) -> Result<Vec<StatusEntry>, ClientError> {
        let url = format!(
            "{}/repos/{}/{}/commits/{}/statuses",
            self.base_url,
            urlencoding::encode(owner),
            urlencoding::encode(repo),
            urlencoding::encode(sha)
        );
        self.get_json(&url).await
    }

    /// GET /executions?sha=...
    pub async fn list_executions(&self, sha: Option<&str>) -> Result<Vec<Execution>, ClientError> {
        let mut url = format!("{}/executions", self.base_url);
        if let Some(sha) = sha {
            url = format!("{url}?sha={}", urlencoding::encode(sha));
        }
        self.get_json(&url).await
    }

    /// GET /executions/{id}
    pub async fn get_execution(&self, id: &str) -> Result<Execution, ClientError> {
        let url = format!("{}/executions/{}", self.base_url, urlencoding::encode(id));
        self.get_json(&url).await
    }

    /// Full log text of an execution.
    /// GET /logs/{id}
    pub async fn log(&self, id: &str) -> Result<String, ClientError> {
        let url = format!("{}/logs/{}", self.base_url, urlencoding::encode(id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        response
            .text()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    /// Print a log as it is written until the execution finishes.
    /// GET /logs/{id}/stream
    pub async fn follow_log(&self, id: &str) -> Result<(), ClientError> {
        use futures::StreamExt;

        let url = format!("{}/logs/{}/stream", self.base_url, urlencoding::encode(id));
        let response = self.http.get(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::IoError(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line.
            while let Some(end) = buffer.find("\n\n") {
                let event_str = buffer[..end].to_string();
                buffer = buffer[end + 2..].to_string();
                if let Some(output) = parse_sse_output_event(&event_str) {
                    print!("{}", output.content);
                }
            }
        }

        if let Some(output) = parse_sse_output_event(&buffer) {
            print!("{}", output.content);
        }

        Ok(())
    }

    /// GET /deployments
    pub async fn deployments(&self) -> Result<Vec<DeploymentInfo>, ClientError> {
        let url = format!("{}/deployments", self.base_url);
        self.get_json(&url).await
    }

    /// DELETE /deployments/{owner}/{repo}/{branch}
    pub async fn undeploy(&self, key: &DeploymentKey) -> Result<(), ClientError> {
        let url = format!(
            "{}/deployments/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&key.owner),
            urlencoding::encode(&key.repo),
            urlencoding::encode(&key.branch)
        );
        let response = self.http.delete(&url).headers(self.headers()).send().await?;

        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }
}

/// Parsed output event from SSE stream.
#[derive(Debug, Deserialize)]
struct OutputEvent {
    #[allow(dead_code)]
    offset: u64,
    content: String,
}

/// Parse an SSE event string into OutputEvent if it's an output event.
fn parse_sse_output_event(event_str: &str) -> Option<OutputEvent> {
    let mut event_type = None;
    let mut data = None;

    for line in event_str.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("data:") {
            data = Some(value.trim());
        }
    }

    if event_type == Some("output") {
        if let Some(json_str) = data {
            return serde_json::from_str(json_str).ok();
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_output_event_valid() {
        let event_str = r#"event: output
data: {"offset":0,"content":"[INFO] BUILD SUCCESS\n"}"#;

        let output = parse_sse_output_event(event_str).unwrap();
        assert_eq!(output.offset, 0);
        assert_eq!(output.content, "[INFO] BUILD SUCCESS\n");
    }

    #[test]
    fn parse_output_event_ignores_other_events() {
        assert!(parse_sse_output_event(":keepalive").is_none());

        let event_str = r#"event: status
data: {"state":"pending"}"#;
        assert!(parse_sse_output_event(event_str).is_none());
    }

    #[test]
    fn parse_output_event_handles_invalid_json() {
        let event_str = "event: output\ndata: not valid json";
        assert!(parse_sse_output_event(event_str).is_none());
    }

    #[test]
    fn summary_parses_daemon_response() {
        let body = r#"{"finished":[{"context":"delivery/build","execution_id":"0191","state":"FAILED","reported":"failure"}],"suppressed":1}"#;
        let summary: DispatchSummary = serde_json::from_str(body).unwrap();
        assert_eq!(summary.suppressed, 1);
        assert_eq!(summary.finished[0].state, ExecutionState::Failed);
        assert_eq!(summary.finished[0].reported, StatusState::Failure);
    }
}
