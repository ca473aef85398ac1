//! Target-scoped operation scheduler
//!
//! Operations on the same (session, target) run strictly FIFO; operations on
//! different targets of one session run in parallel up to the governor's
//! effective cap. Admission and per-target ordering are decoupled: a slot is
//! acquired first, then the operation appends itself to its target's chain
//! and awaits the prior critical section.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::config::ParallelismConfig;
use crate::error::{BrokerError, Result};
use crate::governor::{GovernorState, PressureSample};
use crate::ids::{SessionId, TargetId};
use crate::request_id::now_ms;

/// Memory-side pressure input for governor refreshes. The scheduler supplies
/// the queue half of each sample itself.
pub trait PressureProbe: Send {
    /// Returns `(host_free_mem_pct, rss_usage_pct)`.
    fn memory(&mut self) -> (f64, f64);
}

impl PressureProbe for crate::governor::HostSampler {
    fn memory(&mut self) -> (f64, f64) {
        self.sample()
    }
}

struct Waiter {
    id: u64,
    target: TargetId,
    enqueued_at: Instant,
    permit_tx: oneshot::Sender<Result<()>>,
    timer: AbortHandle,
}

struct ChainTail {
    generation: u64,
    done_rx: oneshot::Receiver<()>,
}

struct SessionSched {
    inflight: usize,
    waiters: VecDeque<Waiter>,
    waiting_by_target: HashMap<TargetId, Vec<(u64, Instant)>>,
    chains: HashMap<TargetId, ChainTail>,
    governor: GovernorState,
    policy: ParallelismConfig,
    probe: Option<Box<dyn PressureProbe>>,
    pending_discarded: u32,
    pending_frozen: u32,
    next_waiter_id: u64,
    next_generation: u64,
    terminated: bool,
}

#[derive(Default)]
struct SchedInner {
    sessions: Mutex<HashMap<SessionId, SessionSched>>,
}

/// Scheduler shared across all sessions of one broker.
#[derive(Clone, Default)]
pub struct TargetScheduler {
    inner: Arc<SchedInner>,
}

impl TargetScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session with its governor and optional memory probe.
    pub fn register_session(
        &self,
        session: SessionId,
        governor: GovernorState,
        policy: ParallelismConfig,
        probe: Option<Box<dyn PressureProbe>>,
    ) {
        let mut sessions = self.inner.sessions.lock();
        sessions.insert(
            session,
            SessionSched {
                inflight: 0,
                waiters: VecDeque::new(),
                waiting_by_target: HashMap::new(),
                chains: HashMap::new(),
                governor,
                policy,
                probe,
                pending_discarded: 0,
                pending_frozen: 0,
                next_waiter_id: 0,
                next_generation: 0,
                terminated: false,
            },
        );
    }

    /// Record browser lifecycle signals consumed by the next governor sample.
    pub fn note_lifecycle_signals(&self, session: SessionId, discarded: u32, frozen: u32) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(state) = sessions.get_mut(&session) {
            state.pending_discarded += discarded;
            state.pending_frozen += frozen;
        }
    }

    /// Run `exec` as the target's next critical section.
    ///
    /// `backpressure_timeout_ms` of 0 uses the session policy default.
    pub async fn run_target_scoped<T, F, Fut>(
        &self,
        session: SessionId,
        target: TargetId,
        backpressure_timeout_ms: u64,
        exec: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_slot(session, target, backpressure_timeout_ms).await?;

        // From here on the guard owns the slot and the chain entry; dropping
        // it (including cancellation) releases both and wakes waiters.
        let (guard, prev) = self.append_chain(session, target)?;

        if let Some(prev_rx) = prev {
            // Sender dropped means the prior section was cancelled; either
            // way it no longer occupies the target.
            let _ = prev_rx.await;
        }

        trace!(%session, %target, "entering target critical section");
        let result = exec().await;
        drop(guard);
        result
    }

    /// Current effective cap, refreshing the governor first.
    pub fn effective_cap(&self, session: SessionId) -> Option<usize> {
        let mut sessions = self.inner.sessions.lock();
        sessions.get_mut(&session).map(|state| {
            Self::refresh_governor(state);
            state.governor.effective_cap
        })
    }

    /// Number of admissions currently executing for the session.
    pub fn inflight(&self, session: SessionId) -> usize {
        self.inner.sessions.lock().get(&session).map(|s| s.inflight).unwrap_or(0)
    }

    /// Pending waiter count for one target (test/introspection surface).
    pub fn waiting_for_target(&self, session: SessionId, target: TargetId) -> usize {
        self.inner
            .sessions
            .lock()
            .get(&session)
            .and_then(|s| s.waiting_by_target.get(&target).map(Vec::len))
            .unwrap_or(0)
    }

    /// Governor snapshot for result metadata and debug traces.
    pub fn governor_snapshot(&self, session: SessionId) -> Option<GovernorState> {
        self.inner.sessions.lock().get(&session).map(|s| s.governor.clone())
    }

    /// Teardown barrier: reject all waiters, drop chains and timers. Ops
    /// already inside their critical section run to completion.
    pub fn clear_session(&self, session: SessionId) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(mut state) = sessions.remove(&session) {
            state.terminated = true;
            let rejected = state.waiters.len();
            for waiter in state.waiters.drain(..) {
                waiter.timer.abort();
                let _ = waiter.permit_tx.send(Err(BrokerError::SessionTerminated));
            }
            state.waiting_by_target.clear();
            state.chains.clear();
            if rejected > 0 {
                debug!(%session, rejected, "rejected waiters on session teardown");
            }
        }
    }

    async fn acquire_slot(
        &self,
        session: SessionId,
        target: TargetId,
        backpressure_timeout_ms: u64,
    ) -> Result<()> {
        let permit_rx = {
            let mut sessions = self.inner.sessions.lock();
            let state = sessions
                .get_mut(&session)
                .ok_or_else(|| BrokerError::InvalidSession(session.to_string()))?;
            if state.terminated {
                return Err(BrokerError::SessionTerminated);
            }

            Self::refresh_governor(state);
            if state.inflight < state.governor.effective_cap {
                state.inflight += 1;
                return Ok(());
            }

            let timeout_ms = if backpressure_timeout_ms == 0 {
                state.policy.backpressure_timeout_ms
            } else {
                backpressure_timeout_ms
            };

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (permit_tx, permit_rx) = oneshot::channel();
            let enqueued_at = Instant::now();

            let inner = Arc::clone(&self.inner);
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                expire_waiter(&inner, session, id);
            })
            .abort_handle();

            state.waiters.push_back(Waiter { id, target, enqueued_at, permit_tx, timer });
            state.waiting_by_target.entry(target).or_default().push((id, enqueued_at));
            trace!(%session, %target, waiter = id, "queued behind governor cap");
            permit_rx
        };

        match permit_rx.await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::SessionTerminated),
        }
    }

    fn append_chain(
        &self,
        session: SessionId,
        target: TargetId,
    ) -> Result<(SectionGuard, Option<oneshot::Receiver<()>>)> {
        let mut sessions = self.inner.sessions.lock();
        let state = sessions.get_mut(&session).ok_or(BrokerError::SessionTerminated)?;

        state.next_generation += 1;
        let generation = state.next_generation;
        let (done_tx, done_rx) = oneshot::channel();
        let prev = state
            .chains
            .insert(target, ChainTail { generation, done_rx })
            .map(|tail| tail.done_rx);

        let guard = SectionGuard {
            inner: Arc::clone(&self.inner),
            session,
            target,
            generation,
            done_tx: Some(done_tx),
        };
        Ok((guard, prev))
    }

    fn refresh_governor(state: &mut SessionSched) {
        let now = now_ms();
        let interval = state.policy.sample_interval_ms;
        if state.governor.last_sample_at != 0
            && now.saturating_sub(state.governor.last_sample_at) < interval
        {
            return;
        }

        let (host_free_mem_pct, rss_usage_pct) =
            state.probe.as_mut().map(|p| p.memory()).unwrap_or((100.0, 0.0));
        let queue_age_ms = state
            .waiters
            .front()
            .map(|w| w.enqueued_at.elapsed().as_millis() as u64)
            .unwrap_or(0);
        let sample = PressureSample {
            host_free_mem_pct,
            rss_usage_pct,
            queue_age_ms,
            queue_depth: state.waiters.len(),
            discarded_signals: state.pending_discarded,
            frozen_signals: state.pending_frozen,
        };
        state.pending_discarded = 0;
        state.pending_frozen = 0;
        state.governor.apply_sample(&sample, &state.policy);
    }
}

/// Owns one admitted critical section; drop releases slot and chain entry
/// and wakes eligible waiters in FIFO order.
struct SectionGuard {
    inner: Arc<SchedInner>,
    session: SessionId,
    target: TargetId,
    generation: u64,
    done_tx: Option<oneshot::Sender<()>>,
}

impl Drop for SectionGuard {
    fn drop(&mut self) {
        let mut sessions = self.inner.sessions.lock();
        if let Some(state) = sessions.get_mut(&self.session) {
            if state
                .chains
                .get(&self.target)
                .is_some_and(|tail| tail.generation == self.generation)
            {
                state.chains.remove(&self.target);
            }
            state.inflight = state.inflight.saturating_sub(1);
            wake_waiters(state);
        }
        if let Some(done_tx) = self.done_tx.take() {
            let _ = done_tx.send(());
        }
    }
}

/// Admit head waiters while slots remain. A head that cannot be admitted
/// stays at the head; it is retried on the next release.
fn wake_waiters(state: &mut SessionSched) {
    while state.inflight < state.governor.effective_cap {
        let Some(waiter) = state.waiters.pop_front() else {
            break;
        };
        waiter.timer.abort();
        remove_target_wait(state, waiter.target, waiter.id);
        state.inflight += 1;
        if waiter.permit_tx.send(Ok(())).is_err() {
            // Receiver gone: the waiting op was dropped. Give the slot back.
            state.inflight -= 1;
        }
    }
}

fn remove_target_wait(state: &mut SessionSched, target: TargetId, id: u64) {
    if let Some(entries) = state.waiting_by_target.get_mut(&target) {
        entries.retain(|(wid, _)| *wid != id);
        if entries.is_empty() {
            state.waiting_by_target.remove(&target);
        }
    }
}

fn expire_waiter(inner: &SchedInner, session: SessionId, id: u64) {
    let mut sessions = inner.sessions.lock();
    let Some(state) = sessions.get_mut(&session) else {
        return;
    };
    let Some(pos) = state.waiters.iter().position(|w| w.id == id) else {
        return;
    };
    let Some(waiter) = state.waiters.remove(pos) else {
        return;
    };
    remove_target_wait(state, waiter.target, waiter.id);
    let waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64;
    let cap = state.governor.effective_cap;
    let _ = waiter.permit_tx.send(Err(BrokerError::BackpressureTimeout { waited_ms, cap }));
}
