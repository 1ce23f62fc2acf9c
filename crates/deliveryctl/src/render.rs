//! Output rendering for deliveryctl.

use delivery_core::types::{DeploymentInfo, Execution, ExecutionState, StatusEntry};

use crate::client::DispatchSummary;

/// Print what a dispatch ran.
pub fn print_summary(summary: &DispatchSummary) {
    if summary.finished.is_empty() && summary.suppressed == 0 {
        println!("Accepted.");
        return;
    }
    for goal in &summary.finished {
        println!(
            "  {:<24}  {:<18}  {}",
            goal.context,
            format_state(goal.state),
            goal.execution_id
        );
    }
    if summary.suppressed > 0 {
        println!("  {} duplicate trigger(s) suppressed", summary.suppressed);
    }
}

/// Print the latest status of every goal.
pub fn print_statuses(statuses: &[StatusEntry]) {
    if statuses.is_empty() {
        println!("No statuses found.");
        return;
    }

    println!("{:<24}  {:<22}  {:<30}  URL", "CONTEXT", "STATE", "DESCRIPTION");
    println!("{}", "-".repeat(100));
    for status in statuses {
        println!(
            "{:<24}  {:<22}  {:<30}  {}",
            status.context,
            status.state.as_str(),
            truncate(status.description.as_deref().unwrap_or("-"), 30),
            status.target_url.as_deref().unwrap_or("-"),
        );
    }
}

/// Print executions in tabular format.
pub fn print_executions(executions: &[Execution]) {
    if executions.is_empty() {
        println!("No executions found.");
        return;
    }

    println!(
        "{:<36}  {:<12}  {:<20}  {:<18}  {:<20}",
        "ID", "SHA", "CONTEXT", "STATE", "CREATED"
    );
    println!("{}", "-".repeat(114));

    for execution in executions {
        println!(
            "{:<36}  {:<12}  {:<20}  {:<18}  {:<20}",
            execution.id.0,
            truncate(&execution.sha, 12),
            truncate(&execution.context, 20),
            format_state(execution.state),
            format_time(&execution.created_at),
        );
    }

    println!();
    println!("{} execution(s)", executions.len());
}

/// Print one execution.
pub fn print_execution(execution: &Execution) {
    println!("Execution: {}", execution.id);
    println!();
    println!("  Commit:   {}/{}@{} ({})", execution.owner, execution.repo, execution.sha, execution.branch);
    println!("  Goal:     {} ({})", execution.goal_name, execution.context);
    println!("  State:    {}", format_state(execution.state));
    if let Some(message) = &execution.message {
        println!("  Message:  {message}");
    }
    if let Some(url) = &execution.target_url {
        println!("  Target:   {url}");
    }
    if let Some(url) = &execution.log_url {
        println!("  Log:      {url}");
    }
    println!("  Created:  {}", format_time(&execution.created_at));
    println!("  Updated:  {}", format_time(&execution.updated_at));
}

/// Print live deployments.
pub fn print_deployments(deployments: &[DeploymentInfo]) {
    if deployments.is_empty() {
        println!("No deployments running.");
        return;
    }

    println!(
        "{:<40}  {:<6}  {:<8}  {:<20}  ENDPOINT",
        "KEY", "PORT", "PID", "STARTED"
    );
    println!("{}", "-".repeat(110));
    for deployment in deployments {
        let pid = deployment
            .pid
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        println!(
            "{:<40}  {:<6}  {:<8}  {:<20}  {}",
            truncate(&deployment.key.to_string(), 40),
            deployment.port,
            pid,
            format_time(&deployment.started_at),
            deployment.endpoint,
        );
    }
}

fn format_state(state: ExecutionState) -> &'static str {
    match state {
        ExecutionState::Running => "RUNNING",
        ExecutionState::Succeeded => "SUCCEEDED",
        ExecutionState::Failed => "FAILED",
        ExecutionState::AwaitingApproval => "AWAITING_APPROVAL",
    }
}

fn format_time(dt: &chrono::DateTime<chrono::Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{kept}...")
    }
}
