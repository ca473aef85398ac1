//! Scheduler ordering, admission, and teardown behavior.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use tabmux::config::ParallelismConfig;
use tabmux::governor::{GovernorState, ModeVariant};
use tabmux::{SessionId, TargetId, TargetScheduler};

fn policy_with_cap(cap: usize) -> ParallelismConfig {
    let mut policy = ParallelismConfig { sample_interval_ms: 0, ..Default::default() };
    policy.mode_caps.managed_headless = cap;
    policy
}

fn register_session(sched: &TargetScheduler, cap: usize) -> SessionId {
    let session = SessionId::new();
    let policy = policy_with_cap(cap);
    let governor = GovernorState::new(ModeVariant::ManagedHeadless, &policy);
    sched.register_session(session, governor, policy, None);
    session
}

#[tokio::test]
async fn same_target_ops_run_fifo() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 8);
    let target = TargetId::new();

    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (release_a, gate_a) = oneshot::channel::<()>();

    let sched_a = sched.clone();
    let events_a = Arc::clone(&events);
    let op_a = tokio::spawn(async move {
        sched_a
            .run_target_scoped(session, target, 0, move || async move {
                events_a.lock().push("start-a");
                let _ = gate_a.await;
                events_a.lock().push("end-a");
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });

    // Let A occupy the target before B is submitted.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sched_b = sched.clone();
    let events_b = Arc::clone(&events);
    let op_b = tokio::spawn(async move {
        sched_b
            .run_target_scoped(session, target, 0, move || async move {
                events_b.lock().push("start-b");
                events_b.lock().push("end-b");
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });

    // B must not start while A holds the target.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(events.lock().as_slice(), &["start-a"]);

    release_a.send(()).expect("A should still be waiting on the gate");
    op_a.await.expect("op A task").expect("op A result");
    op_b.await.expect("op B task").expect("op B result");

    assert_eq!(events.lock().as_slice(), &["start-a", "end-a", "start-b", "end-b"]);
}

#[tokio::test]
async fn different_targets_run_concurrently() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 4);
    let t1 = TargetId::new();
    let t2 = TargetId::new();

    let started = Arc::new(AtomicUsize::new(0));
    let (release_1, gate_1) = oneshot::channel::<()>();
    let (release_2, gate_2) = oneshot::channel::<()>();

    let sched_1 = sched.clone();
    let started_1 = Arc::clone(&started);
    let op_1 = tokio::spawn(async move {
        sched_1
            .run_target_scoped(session, t1, 0, move || async move {
                started_1.fetch_add(1, Ordering::SeqCst);
                let _ = gate_1.await;
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });

    let sched_2 = sched.clone();
    let started_2 = Arc::clone(&started);
    let op_2 = tokio::spawn(async move {
        sched_2
            .run_target_scoped(session, t2, 0, move || async move {
                started_2.fetch_add(1, Ordering::SeqCst);
                let _ = gate_2.await;
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });

    // Both reach their critical sections while gated.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(started.load(Ordering::SeqCst), 2);
    assert_eq!(sched.inflight(session), 2);

    // Completing one does not disturb the other.
    release_1.send(()).expect("op1 gate");
    op_1.await.expect("op1 task").expect("op1 result");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(sched.inflight(session), 1);

    release_2.send(()).expect("op2 gate");
    op_2.await.expect("op2 task").expect("op2 result");
    assert_eq!(sched.inflight(session), 0);
}

#[tokio::test]
async fn backpressure_timeout_rejects_and_cleans_up() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 1);
    let t1 = TargetId::new();
    let t2 = TargetId::new();

    let (release, gate) = oneshot::channel::<()>();
    let sched_hold = sched.clone();
    let holder = tokio::spawn(async move {
        sched_hold
            .run_target_scoped(session, t1, 0, move || async move {
                let _ = gate.await;
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = sched
        .run_target_scoped(session, t2, 25, || async { Ok::<_, tabmux::BrokerError>(()) })
        .await
        .expect_err("op should time out waiting for a slot");
    assert_eq!(err.kind(), "backpressure_timeout");
    assert_eq!(sched.waiting_for_target(session, t2), 0);

    release.send(()).expect("holder gate");
    holder.await.expect("holder task").expect("holder result");
}

#[tokio::test]
async fn clear_session_rejects_all_waiters() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 1);
    let t1 = TargetId::new();
    let t2 = TargetId::new();

    let (release, gate) = oneshot::channel::<()>();
    let sched_hold = sched.clone();
    let holder = tokio::spawn(async move {
        sched_hold
            .run_target_scoped(session, t1, 0, move || async move {
                let _ = gate.await;
                Ok::<_, tabmux::BrokerError>(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sched_wait = sched.clone();
    let waiter = tokio::spawn(async move {
        sched_wait
            .run_target_scoped(session, t2, 60_000, || async { Ok::<_, tabmux::BrokerError>(()) })
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sched.waiting_for_target(session, t2), 1);

    sched.clear_session(session);

    let err = waiter.await.expect("waiter task").expect_err("waiter should be rejected");
    assert_eq!(err.kind(), "session_terminated");

    // No further admissions for the cleared session.
    let err = sched
        .run_target_scoped(session, t1, 0, || async { Ok::<_, tabmux::BrokerError>(()) })
        .await
        .expect_err("cleared session should not admit");
    assert_eq!(err.kind(), "invalid_session");

    // The in-flight op still completes cleanly.
    release.send(()).expect("holder gate");
    holder.await.expect("holder task").expect("holder result");
}

#[tokio::test]
async fn inflight_never_exceeds_effective_cap() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 2);

    let concurrent = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..6 {
        let sched = sched.clone();
        let concurrent = Arc::clone(&concurrent);
        let peak = Arc::clone(&peak);
        let target = TargetId::new();
        handles.push(tokio::spawn(async move {
            sched
                .run_target_scoped(session, target, 0, move || async move {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, tabmux::BrokerError>(())
                })
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("task").expect("result");
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {} exceeded cap", peak.load(Ordering::SeqCst));
}

#[tokio::test]
async fn same_target_waiters_keep_order_under_cap_pressure() {
    let sched = TargetScheduler::new();
    let session = register_session(&sched, 2);
    let target = TargetId::new();

    let events: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for index in 0..4 {
        let sched = sched.clone();
        let events = Arc::clone(&events);
        handles.push(tokio::spawn(async move {
            sched
                .run_target_scoped(session, target, 0, move || async move {
                    events.lock().push(index);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, tabmux::BrokerError>(())
                })
                .await
        }));
        // Stagger submissions so enqueue order is deterministic.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    for handle in handles {
        handle.await.expect("task").expect("result");
    }
    assert_eq!(events.lock().as_slice(), &[0, 1, 2, 3]);
}
