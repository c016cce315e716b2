//! Bounded pool of reusable sessions, partitioned by endpoint group.
//!
//! Each group has a semaphore sized to its maximum and a FIFO of idle
//! sessions. Sessions are created lazily on first demand and handed out as
//! [`Lease`]s. A lease must go back through [`SessionPool::release`]; a lease
//! that is simply dropped (for example when an attempt is aborted) parks its
//! session on a retired list that the pool destroys on its next acquire or on
//! [`SessionPool::close_all`].
//!
//! Sessions are destroyed on tasks spawned into the pool's [`TaskTracker`].
//! Once a session leaves the pool's bookkeeping it is owned by such a task,
//! so cancelling `acquire`, `release` or `reap` part-way never loses one;
//! `close_all` waits for every teardown still running.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::PoolStats;
use crate::traits::SessionFactory;
use crate::util::duration_ms;

/// Pool sizing and session recycling limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum sessions per group unless overridden in `group_sizes`.
    pub default_size: usize,
    pub group_sizes: HashMap<String, usize>,
    /// Sessions older than this are destroyed instead of reused. Zero disables.
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    /// Sessions leased this many times are destroyed on release. Zero disables.
    pub max_uses: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_size: 4,
            group_sizes: HashMap::new(),
            max_age: Duration::from_secs(30 * 60),
            max_uses: 100,
        }
    }
}

impl PoolConfig {
    pub fn size_for(&self, group: &str) -> usize {
        self.group_sizes
            .get(group)
            .copied()
            .unwrap_or(self.default_size)
    }

    pub fn with_default_size(mut self, size: usize) -> Self {
        self.default_size = size;
        self
    }

    pub fn with_group_size(mut self, group: impl Into<String>, size: usize) -> Self {
        self.group_sizes.insert(group.into(), size);
        self
    }
}

struct PooledSession<S> {
    id: Uuid,
    group: String,
    session: S,
    created_at: Instant,
    uses: u32,
}

struct Group<S> {
    semaphore: Arc<Semaphore>,
    idle: VecDeque<PooledSession<S>>,
}

struct PoolState<S> {
    groups: HashMap<String, Group<S>>,
    retired: Vec<PooledSession<S>>,
    active: HashSet<Uuid>,
    closed: bool,
    created: u64,
    destroyed: u64,
}

impl<S> PoolState<S> {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
            retired: Vec::new(),
            active: HashSet::new(),
            closed: false,
            created: 0,
            destroyed: 0,
        }
    }
}

type SharedState<S> = Arc<Mutex<PoolState<S>>>;

fn lock_state<S>(state: &SharedState<S>) -> MutexGuard<'_, PoolState<S>> {
    state.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Session pool mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Exclusive hold on one pooled session.
pub struct Lease<S: Send + Sync + 'static> {
    session: Option<PooledSession<S>>,
    permit: Option<OwnedSemaphorePermit>,
    state: SharedState<S>,
}

impl<S: Send + Sync + 'static> Lease<S> {
    fn pooled(&self) -> &PooledSession<S> {
        // Only `take` empties the slot, and `take` consumes the lease.
        match &self.session {
            Some(pooled) => pooled,
            None => unreachable!("lease accessed after being returned"),
        }
    }

    pub fn session(&self) -> &S {
        &self.pooled().session
    }

    pub fn id(&self) -> Uuid {
        self.pooled().id
    }

    pub fn group(&self) -> &str {
        &self.pooled().group
    }

    /// How many times this session has been leased, this lease included.
    pub fn uses(&self) -> u32 {
        self.pooled().uses
    }

    fn take(mut self) -> (Option<PooledSession<S>>, Option<OwnedSemaphorePermit>) {
        (self.session.take(), self.permit.take())
    }
}

impl<S: Send + Sync + 'static> Drop for Lease<S> {
    fn drop(&mut self) {
        if let Some(pooled) = self.session.take() {
            tracing::debug!(session_id = %pooled.id, group = %pooled.group, "Lease dropped without release, retiring session");
            let mut state = lock_state(&self.state);
            state.active.remove(&pooled.id);
            state.retired.push(pooled);
        }
        // The permit is released after the session is accounted for.
        self.permit.take();
    }
}

/// Bounded, lazily-filled session pool. Cheap to clone.
pub struct SessionPool<F: SessionFactory> {
    factory: Arc<F>,
    config: Arc<PoolConfig>,
    state: SharedState<F::Session>,
    teardown: TaskTracker,
}

impl<F: SessionFactory> Clone for SessionPool<F> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            teardown: self.teardown.clone(),
        }
    }
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory: Arc::new(factory),
            config: Arc::new(config),
            state: Arc::new(Mutex::new(PoolState::new())),
            teardown: TaskTracker::new(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    fn expired(&self, pooled: &PooledSession<F::Session>) -> bool {
        let too_old =
            !self.config.max_age.is_zero() && pooled.created_at.elapsed() >= self.config.max_age;
        let worn_out = self.config.max_uses > 0 && pooled.uses >= self.config.max_uses;
        too_old || worn_out
    }

    /// Hand `sessions` to a tracked teardown task. The task owns them from
    /// here on and runs to completion even if the handle is dropped.
    fn retire(&self, sessions: Vec<PooledSession<F::Session>>) -> Option<JoinHandle<()>> {
        if sessions.is_empty() {
            return None;
        }
        let factory = self.factory.clone();
        let state = self.state.clone();
        Some(self.teardown.spawn(async move {
            for pooled in sessions {
                tracing::debug!(session_id = %pooled.id, group = %pooled.group, "Destroying session");
                factory.destroy(pooled.session).await;
                lock_state(&state).destroyed += 1;
            }
        }))
    }

    async fn destroy_all(&self, sessions: Vec<PooledSession<F::Session>>) {
        if let Some(handle) = self.retire(sessions)
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Session teardown task failed");
        }
    }

    /// Destroy sessions whose leases were dropped without release.
    pub async fn reap(&self) {
        let retired = std::mem::take(&mut lock_state(&self.state).retired);
        self.destroy_all(retired).await;
    }

    /// Lease a session for `group`, waiting at most `timeout` for a free slot.
    ///
    /// # Errors
    ///
    /// `LeaseTimeout` if no slot frees up in time, `PoolClosed` after
    /// [`Self::close_all`], or the factory's error if creation fails.
    pub async fn acquire(
        &self,
        group: &str,
        timeout: Duration,
    ) -> Result<Lease<F::Session>, AppError> {
        self.reap().await;

        let semaphore = {
            let mut state = lock_state(&self.state);
            if state.closed {
                return Err(AppError::PoolClosed);
            }
            let size = self.config.size_for(group);
            state
                .groups
                .entry(group.to_string())
                .or_insert_with(|| Group {
                    semaphore: Arc::new(Semaphore::new(size)),
                    idle: VecDeque::new(),
                })
                .semaphore
                .clone()
        };

        let permit = match tokio::time::timeout(timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AppError::PoolClosed),
            Err(_) => {
                tracing::debug!(%group, timeout_ms = timeout.as_millis() as u64, "Lease acquisition timed out");
                return Err(AppError::LeaseTimeout(timeout.as_millis() as u64, group.to_string()));
            }
        };

        let mut stale = Vec::new();
        let reused = {
            let mut state = lock_state(&self.state);
            let mut found = None;
            if let Some(g) = state.groups.get_mut(group) {
                while let Some(pooled) = g.idle.pop_front() {
                    if self.expired(&pooled) {
                        stale.push(pooled);
                    } else {
                        found = Some(pooled);
                        break;
                    }
                }
            }
            found
        };
        // Not awaited: `reused` must not sit in this future across a suspension point.
        drop(self.retire(stale));

        let mut pooled = match reused {
            Some(pooled) => pooled,
            None => {
                let session = self.factory.create(group).await?;
                let pooled = PooledSession {
                    id: Uuid::new_v4(),
                    group: group.to_string(),
                    session,
                    created_at: Instant::now(),
                    uses: 0,
                };
                lock_state(&self.state).created += 1;
                tracing::debug!(session_id = %pooled.id, %group, "Created session");
                pooled
            }
        };

        pooled.uses += 1;
        {
            let mut state = lock_state(&self.state);
            if !state.closed {
                state.active.insert(pooled.id);
                drop(state);
                return Ok(Lease {
                    session: Some(pooled),
                    permit: Some(permit),
                    state: self.state.clone(),
                });
            }
        }

        // Closed while we were creating or reusing.
        self.destroy_all(vec![pooled]).await;
        Err(AppError::PoolClosed)
    }

    /// Return a lease. Unhealthy, expired or post-close sessions are destroyed;
    /// the rest go back to the idle set.
    pub async fn release(&self, lease: Lease<F::Session>, healthy: bool) {
        let (session, permit) = lease.take();
        let Some(pooled) = session else {
            return;
        };

        let to_destroy = {
            let mut state = lock_state(&self.state);
            state.active.remove(&pooled.id);
            if state.closed || !healthy || self.expired(&pooled) {
                Some(pooled)
            } else {
                match state.groups.get_mut(&pooled.group) {
                    Some(g) => {
                        g.idle.push_back(pooled);
                        None
                    }
                    None => Some(pooled),
                }
            }
        };

        if let Some(pooled) = to_destroy {
            if !healthy {
                tracing::debug!(session_id = %pooled.id, group = %pooled.group, "Releasing unhealthy session");
            }
            self.destroy_all(vec![pooled]).await;
        }
        drop(permit);
    }

    /// Stop handing out leases and destroy every session the pool still owns.
    ///
    /// Waiters blocked in [`Self::acquire`] fail with `PoolClosed`. Sessions
    /// leased at this point are destroyed when released, or when dropped and
    /// a later `close_all`/[`Self::reap`] runs. Safe to call more than once;
    /// returns after every teardown started so far has finished.
    pub async fn close_all(&self) {
        let sessions = {
            let mut state = lock_state(&self.state);
            state.closed = true;
            let mut sessions = std::mem::take(&mut state.retired);
            for g in state.groups.values_mut() {
                g.semaphore.close();
                sessions.extend(g.idle.drain(..));
            }
            sessions
        };
        tracing::info!(sessions = sessions.len(), "Closing session pool");
        self.destroy_all(sessions).await;

        self.teardown.close();
        self.teardown.wait().await;
    }

    pub fn is_closed(&self) -> bool {
        lock_state(&self.state).closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = lock_state(&self.state);
        PoolStats {
            created: state.created,
            destroyed: state.destroyed,
            leased: state.active.len(),
            idle: state.groups.values().map(|g| g.idle.len()).sum(),
        }
    }

    /// IDs of sessions currently leased out.
    pub fn active_leases(&self) -> Vec<Uuid> {
        lock_state(&self.state).active.iter().copied().collect()
    }
}
