//! Goal definitions and pipeline templates.
//!
//! A goal is one stage of delivery, visible externally as a status context.
//! Goals are declared once at startup and never mutated. Each goal names at
//! most one predecessor whose success unblocks it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const SCAN_CONTEXT: &str = "delivery/scan";
pub const REVIEW_CONTEXT: &str = "delivery/review";
pub const BUILD_CONTEXT: &str = "delivery/build";
pub const ARTIFACT_CONTEXT: &str = "delivery/artifact";
pub const DEPLOY_CONTEXT: &str = "delivery/deploy";
pub const ENDPOINT_CONTEXT: &str = "delivery/endpoint";
pub const VERIFY_CONTEXT: &str = "delivery/verify";
pub const PROMOTE_CONTEXT: &str = "delivery/promote";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("duplicate goal context: {0}")]
    DuplicateContext(String),
    #[error("goal {goal} names undeclared predecessor {predecessor}")]
    UnknownPredecessor { goal: String, predecessor: String },
    #[error("predecessor cycle through {0}")]
    Cycle(String),
    #[error("unknown pipeline template: {0}")]
    UnknownTemplate(String),
}

/// One stage of a delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub name: String,
    /// External status context; the goal's identity.
    pub context: String,
    /// Environment tag (e.g. `code`, `testing`, `production`).
    pub environment: String,
    pub success_description: String,
    pub failure_description: String,
    pub waiting_description: String,
    /// Context of the goal that must succeed first.
    pub predecessor: Option<String>,
}

impl Goal {
    pub fn new(name: &str, context: &str, environment: &str) -> Self {
        Self {
            name: name.to_string(),
            context: context.to_string(),
            environment: environment.to_string(),
            success_description: format!("{name} complete"),
            failure_description: format!("{name} failed"),
            waiting_description: format!("{name} awaiting approval"),
            predecessor: None,
        }
    }

    pub fn after(mut self, predecessor: &str) -> Self {
        self.predecessor = Some(predecessor.to_string());
        self
    }

    pub fn describe(mut self, success: &str, failure: &str) -> Self {
        self.success_description = success.to_string();
        self.failure_description = failure.to_string();
        self
    }

    pub fn pending_description(&self) -> String {
        format!("Planned: {}", self.name)
    }
}

/// Ordered set of goals forming a predecessor DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    pub name: String,
    goals: Vec<Goal>,
}

impl Pipeline {
    /// Build a pipeline, rejecting duplicate contexts, undeclared
    /// predecessors and predecessor cycles.
    pub fn new(name: impl Into<String>, goals: Vec<Goal>) -> Result<Self, PipelineError> {
        let mut contexts = HashSet::new();
        for goal in &goals {
            if !contexts.insert(goal.context.as_str()) {
                return Err(PipelineError::DuplicateContext(goal.context.clone()));
            }
        }

        let by_context: HashMap<&str, &Goal> =
            goals.iter().map(|g| (g.context.as_str(), g)).collect();

        for goal in &goals {
            if let Some(pred) = &goal.predecessor {
                if !by_context.contains_key(pred.as_str()) {
                    return Err(PipelineError::UnknownPredecessor {
                        goal: goal.context.clone(),
                        predecessor: pred.clone(),
                    });
                }
            }
        }

        for goal in &goals {
            // Single predecessor per goal, so walking the chain is enough.
            let mut visited = HashSet::new();
            let mut current = goal;
            while let Some(pred) = &current.predecessor {
                if !visited.insert(pred.as_str()) || pred == &goal.context {
                    return Err(PipelineError::Cycle(goal.context.clone()));
                }
                current = by_context[pred.as_str()];
            }
        }

        Ok(Self {
            name: name.into(),
            goals,
        })
    }

    /// Look up a built-in template by name.
    pub fn template(name: &str) -> Result<Self, PipelineError> {
        match name {
            "http_service" => Ok(Self::http_service()),
            "local_deployment" => Ok(Self::local_deployment()),
            "library" => Ok(Self::library()),
            "reviewed_library" => Ok(Self::reviewed_library()),
            _ => Err(PipelineError::UnknownTemplate(name.to_string())),
        }
    }

    pub fn goals(&self) -> &[Goal] {
        &self.goals
    }

    pub fn goal(&self, context: &str) -> Option<&Goal> {
        self.goals.iter().find(|g| g.context == context)
    }

    /// Goals whose predecessor is `context`.
    pub fn dependents(&self, context: &str) -> Vec<&Goal> {
        self.goals
            .iter()
            .filter(|g| g.predecessor.as_deref() == Some(context))
            .collect()
    }

    /// Scan, build, publish, deploy locally, verify the endpoint, promote.
    pub fn http_service() -> Self {
        Self::from_chain("http_service", Self::service_goals(true))
    }

    /// Same as `http_service` without the promotion step.
    pub fn local_deployment() -> Self {
        Self::from_chain("local_deployment", Self::service_goals(false))
    }

    /// Scan, build and publish an artifact; nothing is deployed.
    pub fn library() -> Self {
        Self::from_chain(
            "library",
            vec![
                scan_goal(),
                build_goal().after(SCAN_CONTEXT),
                artifact_goal().after(BUILD_CONTEXT),
            ],
        )
    }

    /// Library pipeline with a review gate in front of the build.
    pub fn reviewed_library() -> Self {
        Self::from_chain(
            "reviewed_library",
            vec![
                Goal::new("review", REVIEW_CONTEXT, "code")
                    .describe("Code review passed", "Code review failed"),
                build_goal().after(REVIEW_CONTEXT),
                artifact_goal().after(BUILD_CONTEXT),
            ],
        )
    }

    fn service_goals(promote: bool) -> Vec<Goal> {
        let mut goals = vec![
            scan_goal(),
            build_goal().after(SCAN_CONTEXT),
            artifact_goal().after(BUILD_CONTEXT),
            Goal::new("deploy locally", DEPLOY_CONTEXT, "testing")
                .describe("Deployed locally", "Local deployment failed")
                .after(ARTIFACT_CONTEXT),
            Goal::new("locate endpoint", ENDPOINT_CONTEXT, "testing")
                .describe("Endpoint available", "Endpoint unavailable")
                .after(DEPLOY_CONTEXT),
            Goal::new("verify endpoint", VERIFY_CONTEXT, "testing")
                .describe("Endpoint verified", "Endpoint verification failed")
                .after(ENDPOINT_CONTEXT),
        ];
        if promote {
            goals.push(
                Goal::new("promote", PROMOTE_CONTEXT, "production")
                    .describe("Promoted", "Promotion failed")
                    .after(VERIFY_CONTEXT),
            );
        }
        goals
    }

    fn from_chain(name: &str, goals: Vec<Goal>) -> Self {
        Self {
            name: name.to_string(),
            goals,
        }
    }
}

fn scan_goal() -> Goal {
    Goal::new("scan", SCAN_CONTEXT, "code").describe("Code scan passed", "Code scan failed")
}

fn build_goal() -> Goal {
    Goal::new("build", BUILD_CONTEXT, "code").describe("Build successful", "Build failed")
}

fn artifact_goal() -> Goal {
    Goal::new("store artifact", ARTIFACT_CONTEXT, "code")
        .describe("Artifact stored", "Artifact not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_pass_validation() {
        for template in [
            Pipeline::http_service(),
            Pipeline::local_deployment(),
            Pipeline::library(),
            Pipeline::reviewed_library(),
        ] {
            let name = template.name.clone();
            let rebuilt = Pipeline::new(name, template.goals().to_vec());
            assert!(rebuilt.is_ok(), "{rebuilt:?}");
        }
    }

    #[test]
    fn http_service_chains_in_order() {
        let pipeline = Pipeline::http_service();
        let contexts: Vec<_> = pipeline.goals().iter().map(|g| g.context.as_str()).collect();
        assert_eq!(
            contexts,
            vec![
                SCAN_CONTEXT,
                BUILD_CONTEXT,
                ARTIFACT_CONTEXT,
                DEPLOY_CONTEXT,
                ENDPOINT_CONTEXT,
                VERIFY_CONTEXT,
                PROMOTE_CONTEXT
            ]
        );
        assert_eq!(pipeline.goal(SCAN_CONTEXT).unwrap().predecessor, None);
        assert_eq!(
            pipeline.goal(PROMOTE_CONTEXT).unwrap().predecessor.as_deref(),
            Some(VERIFY_CONTEXT)
        );
        assert!(Pipeline::local_deployment().goal(PROMOTE_CONTEXT).is_none());
    }

    #[test]
    fn rejects_duplicate_context() {
        let err = Pipeline::new(
            "dup",
            vec![Goal::new("a", "x", "code"), Goal::new("b", "x", "code")],
        )
        .unwrap_err();
        assert_eq!(err, PipelineError::DuplicateContext("x".to_string()));
    }

    #[test]
    fn rejects_unknown_predecessor() {
        let err = Pipeline::new("p", vec![Goal::new("a", "a", "code").after("missing")])
            .unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPredecessor { .. }));
    }

    #[test]
    fn rejects_cycles() {
        let err = Pipeline::new(
            "p",
            vec![
                Goal::new("a", "a", "code").after("b"),
                Goal::new("b", "b", "code").after("a"),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::Cycle(_)));

        let self_loop = Pipeline::new("p", vec![Goal::new("a", "a", "code").after("a")]);
        assert!(matches!(self_loop, Err(PipelineError::Cycle(_))));
    }

    #[test]
    fn dependents_lists_direct_children_only() {
        let pipeline = Pipeline::http_service();
        let deps: Vec<_> = pipeline
            .dependents(BUILD_CONTEXT)
            .iter()
            .map(|g| g.context.clone())
            .collect();
        assert_eq!(deps, vec![ARTIFACT_CONTEXT.to_string()]);
    }

    #[test]
    fn unknown_template_is_an_error() {
        assert!(Pipeline::template("http_service").is_ok());
        assert_eq!(
            Pipeline::template("nope").unwrap_err(),
            PipelineError::UnknownTemplate("nope".to_string())
        );
    }
}
