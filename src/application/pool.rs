//! Bounded pool of expensive, stateful render contexts.
//!
//! The pool owns at most `max_resources` contexts. A checked-out context is
//! represented by a [`Lease`]; dropping or releasing the lease returns the
//! context (after a reset) or destroys it when the reset fails. Waiters are
//! served strictly in arrival order and receive released contexts by direct
//! handoff rather than through the idle set.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{gauge, histogram};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::util::lock::mutex_lock;

const TARGET: &str = "papyrus::pool";

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ResourceError(pub String);

impl ResourceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("render context could not be created")]
    Create(#[source] ResourceError),
    #[error("timed out after {0:?} waiting for a render context")]
    Timeout(Duration),
    #[error("render pool is shut down")]
    Closed,
}

/// Lifecycle hooks for pooled resources.
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self) -> Result<Self::Resource, ResourceError>;

    /// Bring a used resource back to a clean state.
    async fn reset(&self, resource: &mut Self::Resource) -> Result<(), ResourceError>;

    async fn destroy(&self, resource: Self::Resource);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max: usize,
    pub live: usize,
    pub idle: usize,
    pub waiting: usize,
}

struct PoolState<M: ResourceManager> {
    idle: VecDeque<M::Resource>,
    /// Idle + checked out + being created.
    live: usize,
    waiters: VecDeque<oneshot::Sender<Grant<M>>>,
    closed: bool,
}

struct Shared<M: ResourceManager> {
    manager: M,
    max: usize,
    state: Mutex<PoolState<M>>,
    drained: Notify,
}

/// What a waiter receives: a ready resource, or the right to create one.
enum Grant<M: ResourceManager> {
    Ready(Lease<M>),
    Create(CreatePermit<M>),
}

impl<M: ResourceManager> Grant<M> {
    /// Take a grant back after its waiter went away, without running the
    /// guards' drop logic.
    fn disarm(self) -> Option<M::Resource> {
        match self {
            Grant::Ready(mut lease) => lease.resource.take(),
            Grant::Create(mut permit) => {
                permit.armed = false;
                None
            }
        }
    }
}

pub struct ResourcePool<M: ResourceManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    pub fn new(manager: M, max_resources: NonZeroUsize) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                max: max_resources.get(),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn status(&self) -> PoolStatus {
        let state = mutex_lock(&self.shared.state, TARGET, "status");
        PoolStatus {
            max: self.shared.max,
            live: state.live,
            idle: state.idle.len(),
            waiting: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
        }
    }

    /// Check out a resource, waiting in FIFO order when the pool is full.
    pub async fn acquire(&self) -> Result<Lease<M>, PoolError> {
        enum Step<M: ResourceManager> {
            Ready(M::Resource),
            Create,
            Wait(oneshot::Receiver<Grant<M>>),
        }

        let started = Instant::now();
        let step = {
            let mut state = mutex_lock(&self.shared.state, TARGET, "acquire");
            if state.closed {
                return Err(PoolError::Closed);
            }
            if let Some(resource) = state.idle.pop_front() {
                Step::Ready(resource)
            } else if state.live < self.shared.max {
                state.live += 1;
                gauge!("papyrus_pool_live_resources").set(state.live as f64);
                Step::Create
            } else {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Step::Wait(rx)
            }
        };

        let lease = match step {
            Step::Ready(resource) => Lease::new(Arc::clone(&self.shared), resource),
            Step::Create => self.create(CreatePermit::new(Arc::clone(&self.shared))).await?,
            Step::Wait(rx) => match rx.await {
                Ok(Grant::Ready(lease)) => lease,
                Ok(Grant::Create(permit)) => self.create(permit).await?,
                Err(_) => return Err(PoolError::Closed),
            },
        };

        histogram!("papyrus_pool_acquire_wait_ms")
            .record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(lease)
    }

    /// [`acquire`](Self::acquire) bounded by `timeout`. A timed-out caller
    /// leaves the queue without consuming a slot.
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Lease<M>, PoolError> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| PoolError::Timeout(timeout))?
    }

    async fn create(&self, permit: CreatePermit<M>) -> Result<Lease<M>, PoolError> {
        match self.shared.manager.create().await {
            Ok(resource) => {
                permit.consume();
                debug!(target = TARGET, "render context created");
                Ok(Lease::new(Arc::clone(&self.shared), resource))
            }
            Err(err) => {
                warn!(target = TARGET, error = %err, "render context creation failed");
                drop(permit);
                Err(PoolError::Create(err))
            }
        }
    }

    /// Close the pool: fail pending waiters, destroy idle resources, then
    /// wait up to `grace` for checked-out resources to come back. Returns
    /// the number of resources still checked out when the wait ended.
    pub async fn destroy_all(&self, grace: Duration) -> usize {
        let (idle, waiters) = {
            let mut state = mutex_lock(&self.shared.state, TARGET, "destroy_all");
            state.closed = true;
            state.live = state.live.saturating_sub(state.idle.len());
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);

        let destroyed = idle.len();
        for resource in idle {
            self.shared.manager.destroy(resource).await;
        }
        debug!(target = TARGET, destroyed, "idle render contexts destroyed");

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.shared.drained.notified();
            let live = mutex_lock(&self.shared.state, TARGET, "destroy_all").live;
            gauge!("papyrus_pool_live_resources").set(live as f64);
            if live == 0 {
                return 0;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    target = TARGET,
                    abandoned = live,
                    grace_ms = grace.as_millis() as u64,
                    "render contexts still checked out after grace period"
                );
                return live;
            }
        }
    }
}

/// Give `resource` to the longest waiter still listening, or park it idle.
fn hand_off<M: ResourceManager>(
    shared: &Arc<Shared<M>>,
    state: &mut PoolState<M>,
    mut resource: M::Resource,
) {
    while let Some(waiter) = state.waiters.pop_front() {
        match waiter.send(Grant::Ready(Lease::new(Arc::clone(shared), resource))) {
            Ok(()) => return,
            Err(grant) => match grant.disarm() {
                Some(returned) => resource = returned,
                None => return,
            },
        }
    }
    state.idle.push_back(resource);
}

/// A slot was vacated: let the next waiter create a replacement.
fn free_slot<M: ResourceManager>(shared: &Arc<Shared<M>>, state: &mut PoolState<M>) {
    state.live = state.live.saturating_sub(1);
    if state.closed {
        if state.live == 0 {
            shared.drained.notify_waiters();
        }
    } else {
        while let Some(waiter) = state.waiters.pop_front() {
            state.live += 1;
            match waiter.send(Grant::Create(CreatePermit::new(Arc::clone(shared)))) {
                Ok(()) => break,
                Err(grant) => {
                    grant.disarm();
                    state.live -= 1;
                }
            }
        }
    }
    gauge!("papyrus_pool_live_resources").set(state.live as f64);
}

async fn recycle<M: ResourceManager>(shared: Arc<Shared<M>>, mut resource: M::Resource) {
    let closed = mutex_lock(&shared.state, TARGET, "recycle").closed;
    if !closed {
        match shared.manager.reset(&mut resource).await {
            Ok(()) => {
                let mut state = mutex_lock(&shared.state, TARGET, "recycle");
                if !state.closed {
                    hand_off(&shared, &mut state, resource);
                    return;
                }
            }
            Err(err) => {
                warn!(
                    target = TARGET,
                    error = %err,
                    "render context reset failed; destroying it"
                );
            }
        }
    }

    shared.manager.destroy(resource).await;
    let mut state = mutex_lock(&shared.state, TARGET, "recycle");
    free_slot(&shared, &mut state);
}

/// Reserved slot for a resource being created. Dropping an unconsumed
/// permit frees the slot.
struct CreatePermit<M: ResourceManager> {
    shared: Arc<Shared<M>>,
    armed: bool,
}

impl<M: ResourceManager> CreatePermit<M> {
    fn new(shared: Arc<Shared<M>>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn consume(mut self) {
        self.armed = false;
    }
}

impl<M: ResourceManager> Drop for CreatePermit<M> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = mutex_lock(&self.shared.state, TARGET, "permit_drop");
            free_slot(&self.shared, &mut state);
        }
    }
}

/// A checked-out resource. Prefer [`Lease::release`]; dropping the lease
/// recycles the resource on a background task.
pub struct Lease<M: ResourceManager> {
    shared: Arc<Shared<M>>,
    resource: Option<M::Resource>,
}

impl<M: ResourceManager> Lease<M> {
    fn new(shared: Arc<Shared<M>>, resource: M::Resource) -> Self {
        Self {
            shared,
            resource: Some(resource),
        }
    }

    /// Reset and return the resource, or destroy it if the reset fails.
    pub async fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            recycle(Arc::clone(&self.shared), resource).await;
        }
    }

    /// Destroy the resource instead of returning it.
    pub async fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.manager.destroy(resource).await;
            let mut state = mutex_lock(&self.shared.state, TARGET, "discard");
            free_slot(&self.shared, &mut state);
        }
    }
}

impl<M: ResourceManager> std::fmt::Debug for Lease<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").finish_non_exhaustive()
    }
}

impl<M: ResourceManager> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("lease resource is only taken by consuming methods"),
        }
    }
}

impl<M: ResourceManager> DerefMut for Lease<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("lease resource is only taken by consuming methods"),
        }
    }
}

impl<M: ResourceManager> Drop for Lease<M> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(recycle(shared, resource));
            }
            Err(_) => {
                drop(resource);
                let mut state = mutex_lock(&shared.state, TARGET, "lease_drop");
                free_slot(&shared, &mut state);
            }
        }
    }
}
