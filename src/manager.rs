//! Bounded pool of live sandboxes with idle reclamation.
//!
//! [`SandboxManager`] owns every sandbox it creates. Callers address them by
//! an opaque identifier, run commands through the returned handle, and either
//! delete them explicitly or let the background pass reclaim them once they
//! have been idle for longer than the configured timeout.
//!
//! All bookkeeping lives in one table guarded by a single mutex. Backend calls
//! (provisioning, teardown, command execution) never run under that lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{duration_secs, Validate};
use crate::error::{Error, Result};
use crate::sandbox::{ExecResult, Sandbox, SandboxConfig, SandboxProvider};

/// Pool limits and reclamation timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Maximum number of concurrently live sandboxes.
    pub max_sandboxes: usize,

    /// Time without a touch after which a sandbox may be reclaimed.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Period of the background reclamation pass.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_sandboxes: 100,
            idle_timeout: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

impl ManagerConfig {
    /// Sets the capacity ceiling.
    pub fn with_max_sandboxes(mut self, max: usize) -> Self {
        self.max_sandboxes = max;
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the reclamation period.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Point-in-time view of a manager, for logs and health output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Live sandboxes.
    pub total_sandboxes: usize,
    /// Outstanding [`SandboxLease`]s across all sandboxes.
    pub active_leases: usize,
    /// Creations reserved but not yet provisioned.
    pub pending_creations: usize,
    /// Capacity ceiling.
    pub max_sandboxes: usize,
    /// Idle timeout in seconds.
    pub idle_timeout_secs: f64,
    /// Reclamation period in seconds.
    pub cleanup_interval_secs: f64,
    /// Whether [`SandboxManager::cleanup`] has run.
    pub closed: bool,
}

/// One row of the pool table.
struct Entry {
    sandbox: Arc<dyn Sandbox>,
    last_used: Instant,
    leases: usize,
    /// Set while a teardown is in flight so it is never started twice.
    deleting: bool,
}

impl Entry {
    fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_used {
            self.last_used = now;
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Entry>,
    /// Capacity slots held by creations still waiting on the backend.
    pending: usize,
    closed: bool,
}

struct Shared {
    config: ManagerConfig,
    sandbox_defaults: SandboxConfig,
    provider: Arc<dyn SandboxProvider>,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
    /// Signalled whenever a claimed teardown settles or is abandoned.
    teardown_settled: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let live = self.lock().entries.len();
        if live > 0 {
            tracing::warn!(
                live,
                "sandbox manager dropped without cleanup, sandboxes left to their backends"
            );
        }
    }
}

/// Capacity slot held while a sandbox is being provisioned.
///
/// Dropping it without [`Reservation::release`] (failure or cancellation)
/// returns the slot to the pool.
struct Reservation<'a> {
    shared: &'a Shared,
    released: bool,
}

impl<'a> Reservation<'a> {
    fn acquire(shared: &'a Shared) -> Result<Self> {
        let mut state = shared.lock();
        if state.closed {
            return Err(Error::Closed);
        }
        let max = shared.config.max_sandboxes;
        if state.entries.len() + state.pending >= max {
            return Err(Error::CapacityExceeded { max });
        }
        state.pending += 1;
        Ok(Self {
            shared,
            released: false,
        })
    }

    fn release(mut self, state: &mut PoolState) {
        state.pending = state.pending.saturating_sub(1);
        self.released = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.released {
            let mut state = self.shared.lock();
            state.pending = state.pending.saturating_sub(1);
        }
    }
}

/// An entry claimed for teardown.
///
/// If the teardown future is dropped before it settles, the claim is given
/// back so a later delete or reclamation pass can retry.
struct Teardown<'a> {
    shared: &'a Shared,
    id: String,
    sandbox: Arc<dyn Sandbox>,
    settled: bool,
}

impl<'a> Teardown<'a> {
    /// Marks the entry as deleting. Caller must hold the state lock.
    fn claim(shared: &'a Shared, state: &mut PoolState, id: &str) -> Option<Self> {
        let entry = state.entries.get_mut(id)?;
        if entry.deleting {
            return None;
        }
        entry.deleting = true;
        Some(Self {
            shared,
            id: id.to_string(),
            sandbox: Arc::clone(&entry.sandbox),
            settled: false,
        })
    }

    async fn run(mut self) -> Result<()> {
        let result = self.sandbox.destroy().await;
        self.settled = true;

        let outcome = {
            let mut state = self.shared.lock();
            match result {
                Ok(()) => {
                    state.entries.remove(&self.id);
                    tracing::info!(sandbox_id = %self.id, "deleted sandbox");
                    Ok(())
                }
                Err(e) => {
                    if state.closed {
                        // Nothing will retry once the manager is closed
                        state.entries.remove(&self.id);
                    } else if let Some(entry) = state.entries.get_mut(&self.id) {
                        entry.deleting = false;
                    }
                    let reason = match e {
                        Error::Destroy { reason, .. } => reason,
                        other => other.to_string(),
                    };
                    Err(Error::Destroy {
                        id: self.id.clone(),
                        reason,
                    })
                }
            }
        };

        self.shared.teardown_settled.notify_waiters();
        outcome
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if !self.settled {
            if let Some(entry) = self.shared.lock().entries.get_mut(&self.id) {
                entry.deleting = false;
            }
            self.shared.teardown_settled.notify_waiters();
        }
    }
}

/// Manages a bounded pool of sandboxes keyed by identifier.
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    /// Creates a manager that provisions sandboxes through `provider`.
    ///
    /// Fails with [`Error::Config`] if the configuration does not validate.
    /// The background reclamation pass is not running until [`start`] is
    /// called.
    ///
    /// [`start`]: SandboxManager::start
    pub fn new(config: ManagerConfig, provider: Arc<dyn SandboxProvider>) -> Result<Self> {
        Self::with_sandbox_defaults(config, SandboxConfig::default(), provider)
    }

    /// Like [`SandboxManager::new`], with the options used when
    /// [`create_sandbox`](SandboxManager::create_sandbox) is given none.
    pub fn with_sandbox_defaults(
        config: ManagerConfig,
        sandbox_defaults: SandboxConfig,
        provider: Arc<dyn SandboxProvider>,
    ) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!(%warning, "manager configuration");
        }

        tracing::debug!(
            backend = provider.name(),
            max_sandboxes = config.max_sandboxes,
            idle_timeout = ?config.idle_timeout,
            cleanup_interval = ?config.cleanup_interval,
            "created sandbox manager"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                sandbox_defaults,
                provider,
                state: Mutex::new(PoolState::default()),
                shutdown: CancellationToken::new(),
                reaper: Mutex::new(None),
                teardown_settled: Notify::new(),
            }),
        })
    }

    /// Starts the background reclamation task. Calling it again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.is_closed() {
            return;
        }

        let mut reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reaper.is_some() {
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        let token = self.shared.shutdown.clone();
        let period = self.shared.config.cleanup_interval;

        *reaper = Some(tokio::spawn(reclamation_loop(weak, token, period)));
        tracing::info!(interval = ?period, "started idle sandbox reclamation");
    }

    /// Provisions a new sandbox and returns its identifier.
    ///
    /// `options` overrides the manager's sandbox defaults. Fails with
    /// [`Error::CapacityExceeded`] when the pool is full, counting creations
    /// still in flight, and with [`Error::Closed`] after [`cleanup`].
    ///
    /// [`cleanup`]: SandboxManager::cleanup
    pub async fn create_sandbox(&self, options: Option<SandboxConfig>) -> Result<String> {
        let reservation = Reservation::acquire(&self.shared)?;
        let config = options.unwrap_or_else(|| self.shared.sandbox_defaults.clone());

        let sandbox = match self.shared.provider.create(config).await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::warn!(error = %e, "sandbox provisioning failed");
                return Err(match e {
                    Error::Provisioning(_) => e,
                    other => Error::Provisioning(other.to_string()),
                });
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let accepted = {
            let mut state = self.shared.lock();
            reservation.release(&mut state);
            if state.closed {
                false
            } else {
                state.entries.insert(
                    id.clone(),
                    Entry {
                        sandbox: Arc::clone(&sandbox),
                        last_used: Instant::now(),
                        leases: 0,
                        deleting: false,
                    },
                );
                true
            }
        };

        if !accepted {
            if let Err(e) = sandbox.destroy().await {
                tracing::warn!(error = %e, "failed to destroy sandbox provisioned after close");
            }
            return Err(Error::Closed);
        }

        tracing::info!(sandbox_id = %id, backend_id = sandbox.id(), "created sandbox");
        Ok(id)
    }

    /// Returns the sandbox for `id` and marks it as just used.
    pub fn get_sandbox(&self, id: &str) -> Result<Arc<dyn Sandbox>> {
        let mut state = self.shared.lock();
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        entry.touch();
        tracing::debug!(sandbox_id = %id, "touched sandbox");
        Ok(Arc::clone(&entry.sandbox))
    }

    /// Marks `id` as in use until the returned lease is dropped.
    ///
    /// Leased sandboxes are skipped by idle reclamation, so a long-running
    /// command cannot have its sandbox reclaimed underneath it. Explicit
    /// [`delete_sandbox`](SandboxManager::delete_sandbox) still proceeds.
    pub fn lease(&self, id: &str) -> Result<SandboxLease> {
        let sandbox = {
            let mut state = self.shared.lock();
            let entry = state
                .entries
                .get_mut(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?;
            entry.leases += 1;
            entry.touch();
            Arc::clone(&entry.sandbox)
        };

        Ok(SandboxLease {
            manager: self.clone(),
            id: id.to_string(),
            sandbox,
        })
    }

    /// Runs `command` in sandbox `id` while holding a lease on it.
    pub async fn execute(&self, id: &str, command: &str) -> Result<String> {
        let lease = self.lease(id)?;
        lease.execute(command).await
    }

    /// Like [`execute`](SandboxManager::execute), keeping the exit status.
    pub async fn run(&self, id: &str, command: &str) -> Result<ExecResult> {
        let lease = self.lease(id)?;
        lease.run(command).await
    }

    fn release(&self, id: &str) {
        let mut state = self.shared.lock();
        if let Some(entry) = state.entries.get_mut(id) {
            entry.leases = entry.leases.saturating_sub(1);
            entry.touch();
        }
    }

    /// Destroys sandbox `id` and stops tracking it.
    ///
    /// Fails with [`Error::NotFound`] if `id` is unknown or already being
    /// deleted. If the backend fails to destroy it, the sandbox stays tracked
    /// and the error is returned.
    pub async fn delete_sandbox(&self, id: &str) -> Result<()> {
        let teardown = {
            let mut state = self.shared.lock();
            Teardown::claim(&self.shared, &mut state, id)
        }
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

        teardown.run().await.inspect_err(|e| {
            tracing::warn!(sandbox_id = %id, error = %e, "failed to delete sandbox");
        })
    }

    /// Destroys every sandbox idle for at least the configured timeout.
    ///
    /// Leased sandboxes and sandboxes already being deleted are skipped.
    /// Individual failures are logged and leave the sandbox tracked for the
    /// next pass. Returns the identifiers that were reclaimed.
    pub async fn reclaim_idle(&self) -> Vec<String> {
        let timeout = self.shared.config.idle_timeout;
        let now = Instant::now();

        let claimed: Vec<Teardown<'_>> = {
            let mut state = self.shared.lock();
            let idle: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, entry)| {
                    !entry.deleting
                        && entry.leases == 0
                        && now.saturating_duration_since(entry.last_used) >= timeout
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut claimed = Vec::with_capacity(idle.len());
            for id in &idle {
                claimed.extend(Teardown::claim(&self.shared, &mut state, id));
            }
            claimed
        };

        if claimed.is_empty() {
            return Vec::new();
        }

        tracing::debug!(candidates = claimed.len(), "reclaiming idle sandboxes");

        let mut reclaimed = Vec::with_capacity(claimed.len());
        for teardown in claimed {
            let id = teardown.id.clone();
            match teardown.run().await {
                Ok(()) => reclaimed.push(id),
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "failed to reclaim idle sandbox");
                }
            }
        }

        if !reclaimed.is_empty() {
            tracing::info!(count = reclaimed.len(), "reclaimed idle sandboxes");
        }
        reclaimed
    }

    /// Stops reclamation and destroys every tracked sandbox.
    ///
    /// The manager is closed afterwards: further creations fail with
    /// [`Error::Closed`]. Teardowns already started by
    /// [`delete_sandbox`](SandboxManager::delete_sandbox) or
    /// [`reclaim_idle`](SandboxManager::reclaim_idle) are waited for, so the
    /// pool is empty on return. Teardown failures are logged and the sandbox
    /// is dropped from the pool regardless. Calling it again is a no-op.
    pub async fn cleanup(&self) {
        self.shared.lock().closed = true;
        self.shared.shutdown.cancel();

        let reaper = self
            .shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "reclamation task ended abnormally");
            }
        }

        let mut total = 0;
        let mut failed = 0;
        loop {
            let settled = self.shared.teardown_settled.notified();
            tokio::pin!(settled);
            // Registered before reading the table so no settle is missed
            settled.as_mut().enable();

            let (claimed, in_flight) = {
                let mut state = self.shared.lock();
                let ids: Vec<String> = state.entries.keys().cloned().collect();
                let mut claimed = Vec::with_capacity(ids.len());
                for id in &ids {
                    claimed.extend(Teardown::claim(&self.shared, &mut state, id));
                }
                let in_flight = state.entries.len() - claimed.len();
                (claimed, in_flight)
            };

            if claimed.is_empty() {
                if in_flight == 0 {
                    break;
                }
                tracing::debug!(in_flight, "waiting for in-flight sandbox teardowns");
                settled.await;
                continue;
            }

            total += claimed.len();
            for teardown in claimed {
                let id = teardown.id.clone();
                if let Err(e) = teardown.run().await {
                    failed += 1;
                    tracing::error!(sandbox_id = %id, error = %e, "failed to destroy sandbox during cleanup");
                }
            }
        }

        if total > 0 {
            tracing::info!(total, failed, "sandbox manager cleaned up");
        }
    }

    /// Number of live sandboxes.
    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Returns true if no sandboxes are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if `id` names a live sandbox.
    pub fn contains(&self, id: &str) -> bool {
        self.shared.lock().entries.contains_key(id)
    }

    /// When `id` was last created, fetched, or leased.
    pub fn last_used(&self, id: &str) -> Option<Instant> {
        self.shared.lock().entries.get(id).map(|entry| entry.last_used)
    }

    /// Identifiers of all live sandboxes, in no particular order.
    pub fn ids(&self) -> Vec<String> {
        self.shared.lock().entries.keys().cloned().collect()
    }

    /// Capacity ceiling.
    pub fn capacity(&self) -> usize {
        self.shared.config.max_sandboxes
    }

    /// Returns the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Returns true once [`cleanup`](SandboxManager::cleanup) has started.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Snapshot of pool counters.
    pub fn stats(&self) -> ManagerStats {
        let state = self.shared.lock();
        ManagerStats {
            total_sandboxes: state.entries.len(),
            active_leases: state.entries.values().map(|entry| entry.leases).sum(),
            pending_creations: state.pending,
            max_sandboxes: self.shared.config.max_sandboxes,
            idle_timeout_secs: self.shared.config.idle_timeout.as_secs_f64(),
            cleanup_interval_secs: self.shared.config.cleanup_interval.as_secs_f64(),
            closed: state.closed,
        }
    }
}

/// Periodically reclaims idle sandboxes until cancelled or the manager is gone.
async fn reclamation_loop(shared: Weak<Shared>, token: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                SandboxManager { shared }.reclaim_idle().await;
            }
        }
    }

    tracing::debug!("idle sandbox reclamation stopped");
}

/// Keeps a sandbox out of idle reclamation while held.
///
/// Acquiring and dropping the lease both count as a use.
pub struct SandboxLease {
    manager: SandboxManager,
    id: String,
    sandbox: Arc<dyn Sandbox>,
}

impl SandboxLease {
    /// Manager-assigned identifier of the leased sandbox.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The leased sandbox.
    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Runs a command in the leased sandbox.
    pub async fn execute(&self, command: &str) -> Result<String> {
        self.sandbox.execute(command).await
    }

    /// Runs a command in the leased sandbox, keeping the exit status.
    pub async fn run(&self, command: &str) -> Result<ExecResult> {
        self.sandbox.run(command).await
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        self.manager.release(&self.id);
    }
}
