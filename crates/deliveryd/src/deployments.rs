//! Registry of locally managed deployments.
//!
//! One registry is constructed at daemon startup and shared by reference.
//! It owns the key -> running process table and the key -> port table.
//!
//! Ports are handed out monotonically from the configured lower bound and
//! stay bound to their key for the registry's lifetime, so a redeploy of the
//! same branch lands on the same port. Ports are never reclaimed.
//!
//! `record` does not terminate a previous entry. Callers hold the per-key
//! lock from [`ManagedDeploymentRegistry::lock_key`] and call
//! [`ManagedDeploymentRegistry::terminate_if_running`] before `record`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use delivery_core::{DeploymentInfo, DeploymentKey};
use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use crate::supervisor::ProcessHandle;

/// How long to wait for SIGKILL to take effect after SIGTERM was ignored.
const KILL_WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no free port at or above {lower}")]
    PortsExhausted { lower: u16 },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A live process serving one deployment key.
#[derive(Debug, Clone)]
pub struct ManagedDeployment {
    pub key: DeploymentKey,
    pub port: u16,
    pub endpoint: String,
    pub handle: ProcessHandle,
    pub started_at: DateTime<Utc>,
}

impl ManagedDeployment {
    pub fn pid(&self) -> Option<u32> {
        self.handle.pid()
    }

    pub fn info(&self) -> DeploymentInfo {
        DeploymentInfo {
            key: self.key.clone(),
            port: self.port,
            pid: self.pid(),
            endpoint: self.endpoint.clone(),
            started_at: self.started_at,
        }
    }
}

/// Result of tearing down an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub key: DeploymentKey,
    pub pid: Option<u32>,
    /// Whether the process confirmed exit within the wait window.
    pub exited: bool,
}

#[derive(Debug)]
struct RegistryState {
    ports: HashMap<DeploymentKey, u16>,
    next_port: u32,
    deployments: HashMap<DeploymentKey, ManagedDeployment>,
}

#[derive(Debug)]
pub struct ManagedDeploymentRegistry {
    lower_port: u16,
    terminate_timeout: Duration,
    state: Mutex<RegistryState>,
    key_locks: Mutex<HashMap<DeploymentKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ManagedDeploymentRegistry {
    pub fn new(lower_port: u16, terminate_timeout: Duration) -> Self {
        Self {
            lower_port,
            terminate_timeout,
            state: Mutex::new(RegistryState {
                ports: HashMap::new(),
                next_port: u32::from(lower_port),
                deployments: HashMap::new(),
            }),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialize deploy and terminate sequences for one key.
    ///
    /// Locks nobody holds or waits on are dropped from the table here.
    pub async fn lock_key(&self, key: &DeploymentKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }

    /// Port bound to `key`, allocating the next one on first use.
    pub fn find_or_allocate_port(&self, key: &DeploymentKey) -> Result<u16> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(port) = state.ports.get(key) {
            return Ok(*port);
        }
        let port = u16::try_from(state.next_port).map_err(|_| RegistryError::PortsExhausted {
            lower: self.lower_port,
        })?;
        state.next_port += 1;
        state.ports.insert(key.clone(), port);
        info!(key = %key, port, "allocated deployment port");
        Ok(port)
    }

    pub fn port_for(&self, key: &DeploymentKey) -> Option<u16> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ports
            .get(key)
            .copied()
    }

    /// Terminate and clear the entry for `key`, if any.
    ///
    /// Waits a bounded time for exit and proceeds regardless; a process that
    /// ignores SIGTERM is sent SIGKILL.
    pub async fn terminate_if_running(&self, key: &DeploymentKey) -> Option<Termination> {
        let existing = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deployments
            .remove(key)?;
        Some(self.stop(existing).await)
    }

    /// Store the entry for its key. Never terminates a previous entry.
    pub fn record(&self, deployment: ManagedDeployment) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = state.deployments.get(&deployment.key) {
            if !previous.handle.has_exited() {
                warn!(
                    key = %deployment.key,
                    previous_pid = ?previous.pid(),
                    "replacing a live deployment that was not terminated first"
                );
            }
        }
        info!(
            key = %deployment.key,
            port = deployment.port,
            pid = ?deployment.pid(),
            endpoint = %deployment.endpoint,
            "recorded deployment"
        );
        state.deployments.insert(deployment.key.clone(), deployment);
    }

    /// Clear the entry only if it still belongs to the process `pid`.
    pub fn remove_if_same(&self, key: &DeploymentKey, pid: Option<u32>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let same = state.deployments.get(key).is_some_and(|d| d.pid() == pid);
        if same {
            state.deployments.remove(key);
        }
        same
    }

    pub fn get(&self, key: &DeploymentKey) -> Option<ManagedDeployment> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .deployments
            .get(key)
            .cloned()
    }

    /// All live deployments, ordered by key.
    pub fn list(&self) -> Vec<DeploymentInfo> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<_> = state.deployments.values().map(ManagedDeployment::info).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    /// Tear down every deployment. Used at daemon shutdown.
    pub async fn terminate_all(&self) -> Vec<Termination> {
        let drained: Vec<ManagedDeployment> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.deployments.drain().map(|(_, d)| d).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "terminating managed deployments");
        }
        join_all(drained.into_iter().map(|d| self.stop(d))).await
    }

    async fn stop(&self, deployment: ManagedDeployment) -> Termination {
        let ManagedDeployment { key, handle, .. } = deployment;
        let pid = handle.pid();
        info!(key = %key, pid = ?pid, "terminating deployment");

        handle.terminate();
        let mut exited = handle.wait_for_exit(self.terminate_timeout).await;
        if !exited {
            warn!(
                key = %key,
                pid = ?pid,
                timeout_sec = self.terminate_timeout.as_secs(),
                "deployment did not exit after SIGTERM; killing"
            );
            handle.force_kill();
            exited = handle.wait_for_exit(KILL_WAIT).await;
            if !exited {
                warn!(key = %key, pid = ?pid, "deployment still running, proceeding anyway");
            }
        }
        Termination { key, pid, exited }
    }
}
