//! deliveryctl - CLI client for deliveryd
//!
//! Pushes commits, acts on goals and inspects executions, logs and
//! deployments through the daemon's local HTTP API.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};
use delivery_core::types::{CommitRef, DeploymentKey, StatusEntry, StatusState};

/// CLI client for the deliveryd daemon.
#[derive(Parser)]
#[command(name = "deliveryctl")]
#[command(about = "Control plane for the deliveryd continuous delivery daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7800)
    #[arg(long, global = true, env = "DELIVERYD_ADDR")]
    addr: Option<String>,

    /// Auth token for daemon API
    #[arg(long, global = true, env = "DELIVERYD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Repository given as `owner/repo`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoName {
    owner: String,
    repo: String,
}

/// `owner/repo`, a commit sha and its branch.
#[derive(clap::Args)]
struct CommitArgs {
    /// Repository as owner/repo
    #[arg(value_parser = parse_repo)]
    repo: RepoName,

    /// Commit sha
    sha: String,

    /// Branch the commit was pushed to
    #[arg(long, default_value = "master")]
    branch: String,
}

impl CommitArgs {
    fn commit(&self) -> CommitRef {
        CommitRef::new(&self.repo.owner, &self.repo.repo, &self.sha, &self.branch)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Plan the pipeline for a pushed commit and run it
    Push {
        #[command(flatten)]
        commit: CommitArgs,

        /// Wait for the goals to finish
        #[arg(long)]
        wait: bool,
    },

    /// Send a status event for a goal
    Report {
        #[command(flatten)]
        commit: CommitArgs,

        /// Goal context, e.g. delivery/build
        context: String,

        /// pending, success, failure, error or waiting_for_approval
        #[arg(value_parser = parse_state)]
        state: StatusState,

        /// Link attached to the status
        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        description: Option<String>,

        /// Wait for the goals to finish
        #[arg(long)]
        wait: bool,
    },

    /// Show the latest status of every goal of a commit
    Statuses {
        /// Repository as owner/repo
        #[arg(value_parser = parse_repo)]
        repo: RepoName,

        /// Commit sha
        sha: String,
    },

    /// Approve a goal that is waiting for approval
    Approve {
        #[command(flatten)]
        commit: CommitArgs,

        /// Goal context, e.g. delivery/review
        context: String,

        /// Wait for the goals to finish
        #[arg(long)]
        wait: bool,
    },

    /// Re-run a failed goal
    Retry {
        #[command(flatten)]
        commit: CommitArgs,

        /// Goal context, e.g. delivery/build
        context: String,

        /// Wait for the goals to finish
        #[arg(long)]
        wait: bool,
    },

    /// List executions (optionally for one commit)
    Executions {
        #[arg(long)]
        sha: Option<String>,
    },

    /// Show one execution
    Inspect {
        /// Execution ID
        id: String,
    },

    /// Print the progress log of an execution
    Log {
        /// Execution ID
        id: String,

        /// Follow output until the execution finishes (like tail -f)
        #[arg(short, long)]
        follow: bool,
    },

    /// List running local deployments
    Deployments,

    /// Stop the local deployment of a branch
    Undeploy {
        /// Repository as owner/repo
        #[arg(value_parser = parse_repo)]
        repo: RepoName,

        /// Branch
        branch: String,
    },
}

fn parse_repo(s: &str) -> Result<RepoName, String> {
    match s.split_once('/') {
        Some((owner, repo)) if !owner.is_empty() && !repo.is_empty() && !repo.contains('/') => {
            Ok(RepoName {
                owner: owner.to_string(),
                repo: repo.to_string(),
            })
        }
        _ => Err(format!("invalid repository '{s}', expected: owner/repo")),
    }
}

fn parse_state(s: &str) -> Result<StatusState, String> {
    StatusState::parse(&s.to_lowercase()).ok_or_else(|| {
        format!(
            "invalid state '{s}', expected: pending, success, failure, error, waiting_for_approval"
        )
    })
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let addr = cli
        .addr
        .unwrap_or_else(|| "http://127.0.0.1:7800".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    if let Err(e) = client.check_health().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Push { commit, wait } => run_push(&client, &commit.commit(), wait).await,
        Command::Report {
            commit,
            context,
            state,
            url,
            description,
            wait,
        } => {
            let mut entry = StatusEntry::new(context, state);
            entry.target_url = url;
            entry.description = description;
            run_report(&client, &commit.commit(), &entry, wait).await
        }
        Command::Statuses { repo, sha } => {
            run_statuses(&client, &repo.owner, &repo.repo, &sha).await
        }
        Command::Approve {
            commit,
            context,
            wait,
        } => run_approve(&client, &commit.commit(), &context, wait).await,
        Command::Retry {
            commit,
            context,
            wait,
        } => run_retry(&client, &commit.commit(), &context, wait).await,
        Command::Executions { sha } => run_executions(&client, sha.as_deref()).await,
        Command::Inspect { id } => run_inspect(&client, &id).await,
        Command::Log { id, follow } => run_log(&client, &id, follow).await,
        Command::Deployments => run_deployments(&client).await,
        Command::Undeploy { repo, branch } => {
            run_undeploy(&client, &DeploymentKey::new(repo.owner, repo.repo, branch)).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run_push(client: &Client, commit: &CommitRef, wait: bool) -> Result<(), ClientError> {
    let summary = client.push(commit, wait).await?;
    println!("Pushed {commit}");
    render::print_summary(&summary);
    Ok(())
}

async fn run_report(
    client: &Client,
    commit: &CommitRef,
    entry: &StatusEntry,
    wait: bool,
) -> Result<(), ClientError> {
    let summary = client.send_status(commit, entry, wait).await?;
    println!("Reported {} {} for {commit}", entry.context, entry.state);
    render::print_summary(&summary);
    Ok(())
}

async fn run_statuses(client: &Client, owner: &str, repo: &str, sha: &str) -> Result<(), ClientError> {
    let statuses = client.statuses(owner, repo, sha).await?;
    render::print_statuses(&statuses);
    Ok(())
}

async fn run_approve(
    client: &Client,
    commit: &CommitRef,
    context: &str,
    wait: bool,
) -> Result<(), ClientError> {
    let summary = client.approve(commit, context, wait).await?;
    println!("Approved {context} for {commit}");
    render::print_summary(&summary);
    Ok(())
}

async fn run_retry(
    client: &Client,
    commit: &CommitRef,
    context: &str,
    wait: bool,
) -> Result<(), ClientError> {
    let summary = client.retry(commit, context, wait).await?;
    println!("Retrying {context} for {commit}");
    render::print_summary(&summary);
    Ok(())
}

async fn run_executions(client: &Client, sha: Option<&str>) -> Result<(), ClientError> {
    let executions = client.list_executions(sha).await?;
    render::print_executions(&executions);
    Ok(())
}

async fn run_inspect(client: &Client, id: &str) -> Result<(), ClientError> {
    let execution = client.get_execution(id).await?;
    render::print_execution(&execution);
    Ok(())
}

async fn run_log(client: &Client, id: &str, follow: bool) -> Result<(), ClientError> {
    if follow {
        return client.follow_log(id).await;
    }
    print!("{}", client.log(id).await?);
    Ok(())
}

async fn run_deployments(client: &Client) -> Result<(), ClientError> {
    let deployments = client.deployments().await?;
    render::print_deployments(&deployments);
    Ok(())
}

async fn run_undeploy(client: &Client, key: &DeploymentKey) -> Result<(), ClientError> {
    client.undeploy(key).await?;
    println!("Undeployed {key}");
    Ok(())
}
