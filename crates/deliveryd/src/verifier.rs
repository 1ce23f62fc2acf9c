//! Endpoint verification goal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use delivery_core::goals::ENDPOINT_CONTEXT;
use delivery_core::interpret::InterpreterChain;
use delivery_core::ExecuteGoalResult;
use tracing::{debug, warn};

use crate::executor::{GoalContext, GoalError, GoalExecutor};

/// Decides whether a deployed endpoint is healthy.
#[async_trait]
pub trait EndpointVerifier: Send + Sync {
    /// `Err` carries a human-readable reason.
    async fn verify(&self, url: &str) -> Result<(), String>;
}

/// GETs the endpoint until it answers 2xx or attempts run out.
#[derive(Debug, Clone)]
pub struct HttpEndpointVerifier {
    http: reqwest::Client,
    attempts: u32,
    interval: Duration,
}

impl HttpEndpointVerifier {
    pub fn new(attempts: u32, interval: Duration, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            attempts: attempts.max(1),
            interval,
        }
    }
}

#[async_trait]
impl EndpointVerifier for HttpEndpointVerifier {
    async fn verify(&self, url: &str) -> Result<(), String> {
        let mut last = String::new();
        for attempt in 1..=self.attempts {
            match self.http.get(url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, attempt, "endpoint verified");
                    return Ok(());
                }
                Ok(response) => last = format!("{url} answered {}", response.status()),
                Err(e) => last = format!("{url} unreachable: {e}"),
            }
            if attempt < self.attempts {
                debug!(url = %url, attempt, reason = %last, "endpoint not ready; retrying");
                tokio::time::sleep(self.interval).await;
            }
        }
        Err(last)
    }
}

pub struct VerifyGoalExecutor {
    verifier: Arc<dyn EndpointVerifier>,
}

impl std::fmt::Debug for VerifyGoalExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyGoalExecutor").finish_non_exhaustive()
    }
}

impl VerifyGoalExecutor {
    pub fn new(verifier: Arc<dyn EndpointVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl GoalExecutor for VerifyGoalExecutor {
    fn name(&self) -> &'static str {
        "verify"
    }

    async fn execute(&self, ctx: &GoalContext) -> Result<ExecuteGoalResult, GoalError> {
        let Some(endpoint) = ctx.sibling_target_url(ENDPOINT_CONTEXT) else {
            return Ok(ExecuteGoalResult::failure(1, "no endpoint reported for this commit"));
        };
        ctx.progress(format!("Verifying {endpoint}"));

        match self.verifier.verify(&endpoint).await {
            Ok(()) => Ok(ExecuteGoalResult::success().with_target_url(endpoint)),
            Err(reason) => {
                warn!(sha = %ctx.commit.sha, endpoint = %endpoint, reason = %reason, "verification failed");
                Ok(ExecuteGoalResult::failure(1, reason).with_target_url(endpoint))
            }
        }
    }

    fn interpreter(&self) -> InterpreterChain {
        InterpreterChain::empty()
    }
}
