//! Render worker pool.
//!
//! This module keeps a bounded set of warm backend instances (headless
//! browsers) and lends them out one caller at a time. Each instance is
//! either idle, checked out, or gone; the pool never holds more than
//! `pool_size` instances, counting the ones still being started.
//!
//! Checkout slots are a fair semaphore with `pool_size` permits. All
//! bookkeeping lives behind one mutex that is never held across an await.
//! A borrowed instance is a [`PooledWorker`] guard: it must end in exactly
//! one of [`PooledWorker::release`] or [`PooledWorker::retire`], and
//! dropping it without either (a cancelled request) retires it. An acquire
//! abandoned while its candidate is being probed puts the candidate back.

use crate::backend::{
    BackendError, BackendErrorKind, BackendFactory, BackendResult, RenderBackend, WorkerId,
};
use crate::config::PoolConfig;
use crate::error::{ConversionError, Result, WorkerDisposition};
use async_channel::{bounded, Receiver, Sender};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout, timeout_at, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Liveness of a backend instance as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Live,
    /// The last probe failed or timed out.
    Unresponsive,
    /// The process is gone.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Idle,
    CheckedOut,
}

struct Member {
    backend: Arc<dyn RenderBackend>,
    membership: Membership,
    liveness: Liveness,
    /// Number of checkouts served.
    uses: u32,
    /// Failed a health check while checked out; closed on return.
    suspect: bool,
    version: Option<String>,
}

impl Member {
    fn new(backend: Arc<dyn RenderBackend>, membership: Membership) -> Self {
        Self {
            backend,
            membership,
            liveness: Liveness::Live,
            uses: 0,
            suspect: false,
            version: None,
        }
    }
}

#[derive(Default)]
struct PoolState {
    members: BTreeMap<WorkerId, Member>,
    idle: VecDeque<WorkerId>,
    /// Instances being started, not yet in `members`.
    pending_create: usize,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.members.len() + self.pending_create
    }

    fn checked_out(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.membership == Membership::CheckedOut)
            .count()
    }
}

#[derive(Default)]
struct Counters {
    acquires: AtomicU64,
    releases: AtomicU64,
    retires: AtomicU64,
    evictions: AtomicU64,
    created: AtomicU64,
    creation_failures: AtomicU64,
}

/// Background refill request.
#[derive(Debug)]
struct ReplenishRequest {
    reason: String,
}

struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn BackendFactory>,
    state: Mutex<PoolState>,
    /// One permit per checkout slot.
    slots: Arc<Semaphore>,
    /// Signalled whenever an instance becomes idle or a slot frees up.
    changed: Notify,
    next_id: AtomicU64,
    is_shutdown: AtomicBool,
    counters: Counters,
    replenish_tx: Sender<ReplenishRequest>,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_worker_id(&self) -> WorkerId {
        WorkerId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    fn needs_recycling(&self, uses: u32) -> bool {
        self.config.max_uses_per_worker > 0 && uses >= self.config.max_uses_per_worker
    }

    async fn create_backend(&self, id: WorkerId) -> BackendResult<Arc<dyn RenderBackend>> {
        match timeout(self.config.create_timeout, self.factory.create(id)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::new(
                BackendErrorKind::Timeout,
                format!("startup exceeded {:?}", self.config.create_timeout),
            )),
        }
    }

    async fn probe_backend(&self, backend: &Arc<dyn RenderBackend>) -> BackendResult<String> {
        match timeout(self.config.probe_timeout, backend.probe()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::new(
                BackendErrorKind::Timeout,
                format!("probe exceeded {:?}", self.config.probe_timeout),
            )),
        }
    }

    /// Ask the replenisher to fill empty slots.
    fn request_replenish(&self, reason: String) {
        if !self.config.replenish || self.is_shutdown() {
            return;
        }
        if let Err(e) = self.replenish_tx.try_send(ReplenishRequest { reason }) {
            debug!("Replenish request not queued: {}", e);
        }
    }

    /// Apply the terminal disposition of a checked-out instance. Returns
    /// the backend when it has to be closed.
    fn finish(
        &self,
        id: WorkerId,
        disposition: WorkerDisposition,
        handed_out: bool,
        reason: &str,
    ) -> Option<Arc<dyn RenderBackend>> {
        if handed_out {
            let counter = match disposition {
                WorkerDisposition::Release => &self.counters.releases,
                WorkerDisposition::Retire => &self.counters.retires,
            };
            counter.fetch_add(1, Ordering::SeqCst);
        } else {
            self.counters.evictions.fetch_add(1, Ordering::SeqCst);
        }

        let to_close = {
            let mut guard = self.state();
            let state = &mut *guard;
            let shutdown = self.is_shutdown();
            let capacity = self.config.pool_size;
            let idle_len = state.idle.len();

            match state.members.get_mut(&id) {
                // Already dropped by `close`.
                None => None,
                Some(member) => {
                    let keep = disposition == WorkerDisposition::Release
                        && !shutdown
                        && !member.suspect
                        && !self.needs_recycling(member.uses)
                        && idle_len < capacity;

                    if keep {
                        member.membership = Membership::Idle;
                        state.idle.push_back(id);
                        None
                    } else {
                        let recycled = self.needs_recycling(member.uses);
                        state.members.remove(&id).map(|member| {
                            if recycled && disposition == WorkerDisposition::Release {
                                info!("Recycling {} after {} uses", id, member.uses);
                            } else {
                                debug!("Removing {} from pool: {}", id, reason);
                            }
                            member.backend
                        })
                    }
                }
            }
        };

        self.changed.notify_waiters();
        if handed_out && to_close.is_some() {
            self.request_replenish(format!("{} removed: {}", id, reason));
        }
        to_close
    }

    /// Start instances in the background until the pool is full again.
    async fn replenish(self: &Arc<Self>, reason: &str) {
        loop {
            if self.is_shutdown() {
                return;
            }
            let id = {
                let mut state = self.state();
                if state.occupied() >= self.config.pool_size {
                    return;
                }
                state.pending_create += 1;
                self.next_worker_id()
            };
            let pending = PendingCreate::new(Arc::clone(self));

            debug!("Replenishing pool with {} ({})", id, reason);
            match self.create_backend(id).await {
                Ok(backend) => {
                    self.counters.created.fetch_add(1, Ordering::SeqCst);
                    if let Some(backend) = pending.complete(id, backend, Membership::Idle) {
                        backend.close().await;
                        return;
                    }
                }
                Err(e) => {
                    self.counters.creation_failures.fetch_add(1, Ordering::SeqCst);
                    warn!("Background start of {} failed: {}", id, e);
                    drop(pending);
                    // The slot stays empty; the next acquire fills it.
                    return;
                }
            }
        }
    }
}

/// Reservation of one creation slot. Releases the reservation on drop
/// unless completed.
struct PendingCreate {
    shared: Arc<PoolShared>,
    armed: bool,
}

impl PendingCreate {
    fn new(shared: Arc<PoolShared>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    /// Turn the reservation into a member. Returns the backend if the pool
    /// shut down meanwhile.
    fn complete(
        mut self,
        id: WorkerId,
        backend: Arc<dyn RenderBackend>,
        membership: Membership,
    ) -> Option<Arc<dyn RenderBackend>> {
        self.armed = false;
        let leftover = {
            let mut state = self.shared.state();
            state.pending_create -= 1;
            if self.shared.is_shutdown() {
                Some(backend)
            } else {
                let mut member = Member::new(backend, membership);
                if membership == Membership::CheckedOut {
                    member.uses = 1;
                }
                state.members.insert(id, member);
                if membership == Membership::Idle {
                    state.idle.push_back(id);
                }
                None
            }
        };
        self.shared.changed.notify_waiters();
        leftover
    }
}

impl Drop for PendingCreate {
    fn drop(&mut self) {
        if self.armed {
            self.shared.state().pending_create -= 1;
            self.shared.changed.notify_waiters();
        }
    }
}

/// A backend instance borrowed from the pool.
pub struct PooledWorker {
    id: WorkerId,
    backend: Arc<dyn RenderBackend>,
    shared: Arc<PoolShared>,
    permit: Option<OwnedSemaphorePermit>,
    /// Passed its checkout probe and was given to a caller.
    handed_out: bool,
    disposed: bool,
}

impl std::fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledWorker")
            .field("id", &self.id)
            .field("handed_out", &self.handed_out)
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl PooledWorker {
    fn new(
        id: WorkerId,
        backend: Arc<dyn RenderBackend>,
        shared: Arc<PoolShared>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            backend,
            shared,
            permit: Some(permit),
            handed_out: false,
            disposed: false,
        }
    }

    /// Instance identity.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The borrowed backend.
    pub fn backend(&self) -> &dyn RenderBackend {
        self.backend.as_ref()
    }

    /// Return the instance to the idle set.
    pub async fn release(self) {
        self.dispose(WorkerDisposition::Release, "released").await;
    }

    /// Close the instance and drop it from the pool.
    pub async fn retire(self, reason: &str) {
        warn!("Retiring {}: {}", self.id, reason);
        self.dispose(WorkerDisposition::Retire, reason).await;
    }

    /// Release or retire.
    pub async fn dispose(mut self, disposition: WorkerDisposition, reason: &str) {
        self.disposed = true;
        let to_close = self
            .shared
            .finish(self.id, disposition, self.handed_out, reason);
        drop(self.permit.take());
        if let Some(backend) = to_close {
            backend.close().await;
        }
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        warn!("{} dropped without release, retiring it", self.id);
        let to_close = self.shared.finish(
            self.id,
            WorkerDisposition::Retire,
            self.handed_out,
            "dropped without release",
        );
        if let Some(backend) = to_close {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { backend.close().await });
            }
        }
    }
}

/// An idle instance taken out for its checkout probe.
///
/// Dropped before the probe settles (the acquire was cancelled or timed
/// out), it goes back to the idle set as it was.
struct ProbeCandidate {
    id: WorkerId,
    backend: Arc<dyn RenderBackend>,
    shared: Arc<PoolShared>,
    armed: bool,
}

impl ProbeCandidate {
    fn new(id: WorkerId, backend: Arc<dyn RenderBackend>, shared: Arc<PoolShared>) -> Self {
        Self {
            id,
            backend,
            shared,
            armed: true,
        }
    }

    /// The probe passed: hand the instance to the caller.
    fn accept(mut self, version: String, permit: OwnedSemaphorePermit) -> PooledWorker {
        self.armed = false;
        {
            let mut state = self.shared.state();
            if let Some(member) = state.members.get_mut(&self.id) {
                member.liveness = Liveness::Live;
                member.version = Some(version);
                member.uses += 1;
            }
        }
        self.shared.counters.acquires.fetch_add(1, Ordering::SeqCst);
        let mut worker = PooledWorker::new(
            self.id,
            Arc::clone(&self.backend),
            Arc::clone(&self.shared),
            permit,
        );
        worker.handed_out = true;
        worker
    }

    /// The probe failed: close the instance, keeping the caller's slot.
    async fn evict(mut self, reason: &str) {
        self.armed = false;
        let to_close = self
            .shared
            .finish(self.id, WorkerDisposition::Retire, false, reason);
        if let Some(backend) = to_close {
            backend.close().await;
        }
    }
}

impl Drop for ProbeCandidate {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let to_close = {
            let mut guard = self.shared.state();
            let state = &mut *guard;
            match state.members.get(&self.id).map(|m| m.suspect) {
                // Gone with `close`.
                None => None,
                Some(true) => {
                    self.shared.counters.evictions.fetch_add(1, Ordering::SeqCst);
                    state.members.remove(&self.id).map(|m| m.backend)
                }
                Some(false) => {
                    if let Some(member) = state.members.get_mut(&self.id) {
                        member.membership = Membership::Idle;
                    }
                    state.idle.push_front(self.id);
                    debug!("Probe of {} abandoned, back to idle", self.id);
                    None
                }
            }
        };
        self.shared.changed.notify_waiters();
        if let Some(backend) = to_close {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { backend.close().await });
            }
        }
    }
}

enum Step {
    Probe(WorkerId, Arc<dyn RenderBackend>),
    Create(WorkerId),
    Wait,
}

/// Pool of render backend instances.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("is_shutdown", &self.shared.is_shutdown())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool and start `pool_size` instances.
    ///
    /// Instances that fail to start are logged and left for later; the call
    /// only fails when none could be started.
    pub async fn new(config: PoolConfig, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        config.validate()?;

        let (replenish_tx, replenish_rx) = bounded(config.pool_size.max(1));
        let shared = Arc::new(PoolShared {
            slots: Arc::new(Semaphore::new(config.pool_size)),
            config,
            factory,
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
            next_id: AtomicU64::new(0),
            is_shutdown: AtomicBool::new(false),
            counters: Counters::default(),
            replenish_tx,
        });

        let pool_size = shared.config.pool_size;
        let ids: Vec<WorkerId> = (0..pool_size).map(|_| shared.next_worker_id()).collect();
        let attempts = join_all(ids.iter().map(|&id| {
            let shared = &shared;
            async move { (id, shared.create_backend(id).await) }
        }))
        .await;

        let mut last_error = None;
        {
            let mut state = shared.state();
            for (id, attempt) in attempts {
                match attempt {
                    Ok(backend) => {
                        shared.counters.created.fetch_add(1, Ordering::SeqCst);
                        state.members.insert(id, Member::new(backend, Membership::Idle));
                        state.idle.push_back(id);
                        debug!("Started {}", id);
                    }
                    Err(e) => {
                        shared
                            .counters
                            .creation_failures
                            .fetch_add(1, Ordering::SeqCst);
                        error!("Failed to start {}: {}", id, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        let started = shared.state().members.len();
        if started == 0 {
            shared.is_shutdown.store(true, Ordering::SeqCst);
            return Err(ConversionError::PoolInitializationFailure {
                attempted: pool_size,
                message: last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no instance started".to_string()),
            });
        }

        tokio::spawn(replenish_loop(Arc::downgrade(&shared), replenish_rx));

        info!(
            "Render worker pool initialized with {} of {} workers",
            started, pool_size
        );

        Ok(Self { shared })
    }

    /// Pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow an instance, waiting at most the configured acquire timeout.
    pub async fn acquire(&self) -> Result<PooledWorker> {
        self.acquire_timeout(self.shared.config.acquire_timeout)
            .await
    }

    /// Borrow an instance, waiting at most `wait`.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<PooledWorker> {
        self.acquire_until(Instant::now() + wait).await
    }

    /// Borrow an instance, waiting until `deadline` at the latest.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<PooledWorker> {
        if self.shared.is_shutdown() {
            return Err(ConversionError::PoolShutdown);
        }

        let started = Instant::now();
        match timeout_at(deadline, self.checkout()).await {
            Ok(result) => result,
            Err(_) => {
                let waited_ms = started.elapsed().as_millis() as u64;
                warn!("No render worker available after {} ms", waited_ms);
                Err(ConversionError::AcquireTimeout { waited_ms })
            }
        }
    }

    async fn checkout(&self) -> Result<PooledWorker> {
        let shared = &self.shared;
        let permit = Arc::clone(&shared.slots)
            .acquire_owned()
            .await
            .map_err(|_| ConversionError::PoolShutdown)?;

        loop {
            if shared.is_shutdown() {
                return Err(ConversionError::PoolShutdown);
            }

            let changed = shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let step = {
                let mut guard = shared.state();
                let state = &mut *guard;
                if let Some(id) = state.idle.pop_front() {
                    match state.members.get_mut(&id) {
                        Some(member) => {
                            member.membership = Membership::CheckedOut;
                            Step::Probe(id, Arc::clone(&member.backend))
                        }
                        None => continue,
                    }
                } else if state.occupied() < shared.config.pool_size {
                    state.pending_create += 1;
                    Step::Create(shared.next_worker_id())
                } else {
                    Step::Wait
                }
            };

            match step {
                Step::Probe(id, backend) => {
                    let candidate =
                        ProbeCandidate::new(id, Arc::clone(&backend), Arc::clone(shared));
                    match shared.probe_backend(&backend).await {
                        Ok(version) => {
                            debug!("Checked out {}", id);
                            return Ok(candidate.accept(version, permit));
                        }
                        Err(e) => {
                            warn!("{} failed its liveness probe, evicting: {}", id, e);
                            candidate.evict(&e.to_string()).await;
                        }
                    }
                }
                Step::Create(id) => {
                    let pending = PendingCreate::new(Arc::clone(shared));
                    match shared.create_backend(id).await {
                        Ok(backend) => {
                            shared.counters.created.fetch_add(1, Ordering::SeqCst);
                            if let Some(backend) =
                                pending.complete(id, Arc::clone(&backend), Membership::CheckedOut)
                            {
                                backend.close().await;
                                return Err(ConversionError::PoolShutdown);
                            }
                            let mut worker =
                                PooledWorker::new(id, backend, Arc::clone(shared), permit);
                            worker.handed_out = true;
                            shared.counters.acquires.fetch_add(1, Ordering::SeqCst);
                            info!("Started {} on demand", id);
                            return Ok(worker);
                        }
                        Err(e) => {
                            shared
                                .counters
                                .creation_failures
                                .fetch_add(1, Ordering::SeqCst);
                            warn!("Failed to start {} on demand: {}", id, e);
                            drop(pending);
                            sleep(shared.config.create_retry_backoff).await;
                        }
                    }
                }
                Step::Wait => changed.await,
            }
        }
    }

    /// Return a borrowed instance to the idle set.
    pub async fn release(&self, worker: PooledWorker) {
        worker.release().await;
    }

    /// Close a borrowed instance and drop it from the pool.
    pub async fn retire(&self, worker: PooledWorker, reason: &str) {
        worker.retire(reason).await;
    }

    /// Probe every instance.
    ///
    /// Idle instances stay available while they are probed. Unhealthy idle
    /// instances are closed and replaced in the background; unhealthy
    /// checked-out instances are closed when their borrower returns them.
    pub async fn health_check(&self) -> PoolHealth {
        let shared = &self.shared;
        let snapshot: Vec<(WorkerId, Arc<dyn RenderBackend>)> = shared
            .state()
            .members
            .iter()
            .map(|(id, m)| (*id, Arc::clone(&m.backend)))
            .collect();

        let probes = join_all(snapshot.iter().map(|(id, backend)| async move {
            (*id, shared.probe_backend(backend).await)
        }))
        .await;

        let mut errors = BTreeMap::new();
        let mut to_close = Vec::new();
        {
            let mut guard = shared.state();
            let state = &mut *guard;
            for (id, outcome) in probes {
                match outcome {
                    Ok(version) => {
                        if let Some(member) = state.members.get_mut(&id) {
                            member.liveness = Liveness::Live;
                            member.version = Some(version);
                        }
                    }
                    Err(e) => {
                        warn!("Health check: {} is unhealthy: {}", id, e);
                        let liveness = if e.kind == BackendErrorKind::Crashed {
                            Liveness::Closed
                        } else {
                            Liveness::Unresponsive
                        };
                        let idle = match state.members.get_mut(&id) {
                            Some(member) => {
                                member.liveness = liveness;
                                member.suspect = true;
                                member.membership == Membership::Idle
                            }
                            None => false,
                        };
                        if idle {
                            state.idle.retain(|i| *i != id);
                            if let Some(member) = state.members.remove(&id) {
                                to_close.push(member.backend);
                            }
                            shared.counters.evictions.fetch_add(1, Ordering::SeqCst);
                        }
                        errors.insert(id, (liveness, e.to_string()));
                    }
                }
            }
        }

        for backend in &to_close {
            backend.close().await;
        }
        if !to_close.is_empty() {
            shared.changed.notify_waiters();
            shared.request_replenish(format!("{} unhealthy worker(s) evicted", to_close.len()));
        }

        let state = shared.state();
        let mut instances: Vec<InstanceHealth> = state
            .members
            .iter()
            .map(|(id, m)| InstanceHealth {
                id: *id,
                liveness: m.liveness,
                in_use: m.membership == Membership::CheckedOut,
                uses: m.uses,
                needs_recycling: shared.needs_recycling(m.uses),
                version: m.version.clone(),
                error: errors.get(id).map(|(_, e)| e.clone()),
            })
            .collect();
        for (id, (liveness, error)) in errors {
            if !state.members.contains_key(&id) {
                instances.push(InstanceHealth {
                    id,
                    liveness,
                    in_use: false,
                    uses: 0,
                    needs_recycling: false,
                    version: None,
                    error: Some(error),
                });
            }
        }
        instances.sort_by_key(|i| i.id);

        PoolHealth {
            pool_size: shared.config.pool_size,
            is_shutdown: shared.is_shutdown(),
            instances,
        }
    }

    /// Current occupancy and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.state();
        let counters = &shared.counters;
        PoolStats {
            capacity: shared.config.pool_size,
            total: state.members.len(),
            idle: state.idle.len(),
            checked_out: state.checked_out(),
            pending: state.pending_create,
            acquires: counters.acquires.load(Ordering::SeqCst),
            releases: counters.releases.load(Ordering::SeqCst),
            retires: counters.retires.load(Ordering::SeqCst),
            evictions: counters.evictions.load(Ordering::SeqCst),
            created: counters.created.load(Ordering::SeqCst),
            creation_failures: counters.creation_failures.load(Ordering::SeqCst),
        }
    }

    /// Whether the pool has been closed.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Close every instance, including borrowed ones, and refuse further
    /// acquires.
    pub async fn close(&self) {
        let shared = &self.shared;
        if shared.is_shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down render worker pool");

        shared.slots.close();
        shared.replenish_tx.close();
        let backends: Vec<Arc<dyn RenderBackend>> = {
            let mut state = shared.state();
            state.idle.clear();
            std::mem::take(&mut state.members)
                .into_values()
                .map(|m| m.backend)
                .collect()
        };
        shared.changed.notify_waiters();

        join_all(backends.iter().map(|b| b.close())).await;
        info!("Closed {} render workers", backends.len());
    }
}

async fn replenish_loop(shared: Weak<PoolShared>, requests: Receiver<ReplenishRequest>) {
    while let Ok(request) = requests.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.replenish(&request.reason).await;
    }
    debug!("Replenisher stopped");
}

/// Occupancy and lifetime counters of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    /// Live instances, idle or checked out.
    pub total: usize,
    pub idle: usize,
    pub checked_out: usize,
    /// Instances being started.
    pub pending: usize,
    pub acquires: u64,
    pub releases: u64,
    pub retires: u64,
    /// Instances dropped by probes rather than by their borrower.
    pub evictions: u64,
    pub created: u64,
    pub creation_failures: u64,
}

/// Health information for the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    /// Total pool size.
    pub pool_size: usize,
    /// Whether the pool is shut down.
    pub is_shutdown: bool,
    /// Per-instance health info.
    pub instances: Vec<InstanceHealth>,
}

impl PoolHealth {
    /// Number of instances that answered their probe.
    pub fn healthy_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|i| i.liveness == Liveness::Live && i.error.is_none())
            .count()
    }
}

/// Health information for a single instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: WorkerId,
    pub liveness: Liveness,
    /// Whether currently checked out.
    pub in_use: bool,
    /// Checkouts served.
    pub uses: u32,
    /// Whether the instance reached its use limit.
    pub needs_recycling: bool,
    /// Backend version reported by the last successful probe.
    pub version: Option<String>,
    /// Probe error, if the probe failed.
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockControl, MockFactory};

    fn pool_config(size: usize) -> PoolConfig {
        PoolConfig::with_pool_size(size)
            .acquire_timeout(Duration::from_millis(500))
            .probe_timeout(Duration::from_millis(200))
    }

    async fn pool(size: usize) -> (WorkerPool, MockControl) {
        let factory = MockFactory::new();
        let control = factory.control();
        let pool = WorkerPool::new(pool_config(size), Arc::new(factory))
            .await
            .unwrap();
        (pool, control)
    }

    #[tokio::test]
    async fn test_pool_warms_up_to_capacity() {
        let (pool, control) = pool(3).await;
        let stats = pool.stats();
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.idle, 3);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(control.created(), 3);
    }

    #[tokio::test]
    async fn test_pool_rejects_zero_size() {
        let result = WorkerPool::new(pool_config(0), Arc::new(MockFactory::new())).await;
        assert!(matches!(result, Err(ConversionError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_pool_tolerates_partial_startup_failure() {
        let factory = MockFactory::new();
        factory.control().fail_next_creates(2);
        let pool = WorkerPool::new(pool_config(3), Arc::new(factory)).await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.creation_failures, 2);
    }

    #[tokio::test]
    async fn test_pool_fails_when_nothing_starts() {
        let factory = MockFactory::new();
        factory.control().fail_all_creates(true);
        let result = WorkerPool::new(pool_config(2), Arc::new(factory)).await;
        match result {
            Err(ConversionError::PoolInitializationFailure { attempted, .. }) => {
                assert_eq!(attempted, 2)
            }
            other => panic!("Expected PoolInitializationFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release_round_trip() {
        let (pool, _control) = pool(2).await;
        let worker = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().checked_out, 1);
        assert_eq!(pool.stats().idle, 1);

        pool.release(worker).await;
        let stats = pool.stats();
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.idle, 2);
        assert_eq!(stats.acquires, 1);
        assert_eq!(stats.releases, 1);
    }

    #[tokio::test]
    async fn test_lazy_creation_fills_missing_slot() {
        let factory = MockFactory::new();
        let control = factory.control();
        control.fail_next_creates(1);
        let pool = WorkerPool::new(pool_config(2), Arc::new(factory)).await.unwrap();
        assert_eq!(pool.stats().total, 1);

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().total, 2);
        assert_eq!(pool.stats().checked_out, 2);

        a.release().await;
        b.release().await;
        assert_eq!(pool.stats().idle, 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_exhausted() {
        let (pool, _control) = pool(1).await;
        let held = pool.acquire().await.unwrap();

        let started = Instant::now();
        let result = pool.acquire_timeout(Duration::from_millis(100)).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ConversionError::AcquireTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(400), "took {:?}", elapsed);

        held.release().await;
        assert_eq!(pool.stats().acquires, 1);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_worker() {
        let (pool, _control) = pool(1).await;
        let pool = Arc::new(pool);
        let held = pool.acquire().await.unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(2)).await })
        };
        sleep(Duration::from_millis(50)).await;
        held.release().await;

        let worker = waiter.await.unwrap().unwrap();
        assert_eq!(worker.id(), held_id);
        worker.release().await;
    }

    #[tokio::test]
    async fn test_failed_probe_is_never_handed_out() {
        let (pool, control) = pool(2).await;
        control.fail_probe(WorkerId(0));

        let worker = pool.acquire().await.unwrap();
        assert_ne!(worker.id(), WorkerId(0));
        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.total, 1);
        worker.release().await;
    }

    #[tokio::test]
    async fn test_failed_probe_replaced_on_demand() {
        let (pool, control) = pool(1).await;
        control.fail_probe(WorkerId(0));

        let worker = pool.acquire().await.unwrap();
        assert_ne!(worker.id(), WorkerId(0));
        assert_eq!(control.created(), 2);
        worker.release().await;
    }

    #[tokio::test]
    async fn test_retire_removes_worker() {
        let (pool, control) = pool(2).await;
        let worker = pool.acquire().await.unwrap();
        let id = worker.id();
        pool.retire(worker, "session crashed").await;

        let stats = pool.stats();
        assert_eq!(stats.retires, 1);
        assert_eq!(stats.checked_out, 0);
        assert!(control.is_closed(id));

        let again = pool.acquire().await.unwrap();
        let other = pool.acquire().await.unwrap();
        assert_ne!(again.id(), id);
        assert_ne!(other.id(), id);
        again.release().await;
        other.release().await;
    }

    #[tokio::test]
    async fn test_drop_without_release_retires() {
        let (pool, control) = pool(1).await;
        let worker = pool.acquire().await.unwrap();
        let id = worker.id();
        drop(worker);

        let stats = pool.stats();
        assert_eq!(stats.retires, 1);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.acquires, stats.releases + stats.retires);

        sleep(Duration::from_millis(20)).await;
        assert!(control.is_closed(id));
    }

    #[tokio::test]
    async fn test_recycles_after_max_uses() {
        let factory = MockFactory::new();
        let control = factory.control();
        let pool = WorkerPool::new(pool_config(1).max_uses_per_worker(2), Arc::new(factory))
            .await
            .unwrap();

        let first = pool.acquire().await.unwrap();
        let id = first.id();
        first.release().await;
        let second = pool.acquire().await.unwrap();
        assert_eq!(second.id(), id);
        second.release().await;
        assert!(control.is_closed(id));

        // Replaced in the background, not on the next acquire.
        for _ in 0..50 {
            if pool.stats().idle == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(control.created(), 2);

        let third = pool.acquire().await.unwrap();
        assert_ne!(third.id(), id);
        third.release().await;
    }

    #[tokio::test]
    async fn test_retired_worker_replaced_in_background() {
        let (pool, control) = pool(2).await;
        let worker = pool.acquire().await.unwrap();
        worker.retire("crashed").await;

        for _ in 0..50 {
            if pool.stats().total == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pool.stats().total, 2);
        assert_eq!(control.created(), 3);
    }

    #[tokio::test]
    async fn test_timeout_during_probe_keeps_worker() {
        let factory = MockFactory::new();
        let control = factory.control();
        let config = pool_config(1).probe_timeout(Duration::from_secs(1));
        let pool = WorkerPool::new(config, Arc::new(factory)).await.unwrap();
        control.set_probe_delay(Duration::from_millis(200));

        let result = pool.acquire_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ConversionError::AcquireTimeout { .. })));

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);
        assert_eq!(stats.evictions, 0);
        assert!(!control.is_closed(WorkerId(0)));

        control.set_probe_delay(Duration::ZERO);
        let worker = pool.acquire().await.unwrap();
        assert_eq!(worker.id(), WorkerId(0));
        worker.release().await;
    }

    #[tokio::test]
    async fn test_slow_failing_probe_evicts() {
        let (pool, control) = pool(1).await;
        control.set_probe_delay(Duration::from_millis(10));
        control.fail_probe(WorkerId(0));

        let worker = pool.acquire().await.unwrap();
        assert_ne!(worker.id(), WorkerId(0));
        assert_eq!(pool.stats().evictions, 1);
        worker.release().await;
    }

    #[tokio::test]
    async fn test_health_check_reports_and_replaces() {
        let (pool, control) = pool(2).await;
        control.fail_probe(WorkerId(1));

        let health = pool.health_check().await;
        assert_eq!(health.pool_size, 2);
        assert_eq!(health.instances.len(), 2);
        assert_eq!(health.healthy_count(), 1);
        let bad = health.instances.iter().find(|i| i.id == WorkerId(1)).unwrap();
        assert_eq!(bad.liveness, Liveness::Unresponsive);
        assert!(bad.error.is_some());

        // Replacement runs in the background.
        for _ in 0..50 {
            if pool.stats().total == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.evictions, 1);
        assert!(control.is_closed(WorkerId(1)));
    }

    #[tokio::test]
    async fn test_health_check_marks_checked_out_suspect() {
        let (pool, control) = pool(1).await;
        let worker = pool.acquire().await.unwrap();
        let id = worker.id();
        control.fail_probe(id);

        let health = pool.health_check().await;
        assert!(health.instances[0].in_use);
        assert_eq!(pool.stats().checked_out, 1);

        worker.release().await;
        assert!(control.is_closed(id));
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[tokio::test]
    async fn test_close_makes_pool_unusable() {
        let (pool, control) = pool(2).await;
        let worker = pool.acquire().await.unwrap();
        pool.close().await;

        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.acquire().await,
            Err(ConversionError::PoolShutdown)
        ));
        assert!(control.is_closed(worker.id()));

        worker.release().await;
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let (pool, _control) = pool(1).await;
        let pool = Arc::new(pool);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire_timeout(Duration::from_secs(5)).await })
        };
        sleep(Duration::from_millis(20)).await;
        pool.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ConversionError::PoolShutdown)));
        held.release().await;
    }
}
