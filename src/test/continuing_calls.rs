use super::support::{Actor, Capture, answering, entries, new_log, push, recorder};
use crate::sim::{
    Controller, ControllerConfig, ControllerState, EntityRef, Failure, FailurePolicy, SimError,
    SimTime, ready,
};
use futures_util::FutureExt;
use futures_util::future::FusedFuture;
use futures_util::task::noop_waker_ref;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};

/// `void A.ask()`：continuing call 到 `b`，把观察到的结果放进 `seen`。
fn asker(b: EntityRef, seen: Rc<RefCell<Option<Result<Value, Failure>>>>) -> EntityRef {
    Actor::named("A")
        .method("void A.ask()", 0, move |_, ctl| {
            let b = b.clone();
            let seen = Rc::clone(&seen);
            async move {
                let outcome = ctl.post_continuing_event(b, 0, vec![]).await;
                *seen.borrow_mut() = Some(outcome);
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build()
}

#[test]
fn continuing_call_resumes_caller_with_the_value() {
    let seen = Rc::new(RefCell::new(None));
    let b: EntityRef = answering("B", Ok(json!("ok")));
    let a = asker(b, Rc::clone(&seen));

    let ctl = Controller::new();
    ctl.post_event_after(SimTime(5), a, 0, vec![]);
    let summary = ctl.run().expect("run");

    assert_eq!(*seen.borrow(), Some(Ok(json!("ok"))));
    assert!(ctl.now() >= SimTime(5));
    assert_eq!(summary.final_time, SimTime(5));
    assert_eq!(summary.dispatched, 3);
    assert_eq!(summary.stalled, 0);
    assert_eq!(ctl.pending(), 0);
    assert_eq!(ctl.suspended(), 0);
}

#[test]
fn continuing_call_raises_the_callee_failure_at_the_call_site() {
    let seen = Rc::new(RefCell::new(None));
    let b: EntityRef = answering("B", Err(Failure::raised("boom")));
    let a = asker(b, Rc::clone(&seen));

    let ctl = Controller::new();
    ctl.post_event_after(SimTime(5), a, 0, vec![]);
    let summary = ctl.run().expect("failure is caught by the caller");

    assert_eq!(*seen.borrow(), Some(Err(Failure::raised("boom"))));
    assert_eq!(summary.uncaught, 0);
}

#[test]
fn propagated_failure_is_traced_from_the_callee_through_the_caller() {
    let capture = Capture::default();
    let b: EntityRef = answering("B", Err(Failure::raised("boom")));
    let a = Actor::named("A")
        .method("void A.ask()", 0, move |_, ctl| {
            let b = b.clone();
            async move {
                ctl.post_continuing_event(b, 0, vec![]).await?;
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new().with_trace_sink(capture.sink());
    ctl.post_labeled_event("driver", SimTime(5), a, 0, vec![]);

    match ctl.run() {
        Err(SimError::Uncaught { failure, trace, .. }) => {
            assert_eq!(failure, Failure::raised("boom"));
            assert_eq!(trace.lines().count(), 2);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(
        capture.lines(),
        vec!["5 : String B.answer()", "5 : void A.ask() @ driver"]
    );
}

#[test]
fn replaced_failure_is_traced_from_the_record_that_raised_it() {
    let capture = Capture::default();
    let b: EntityRef = answering("B", Err(Failure::raised("boom")));
    let a = Actor::named("A")
        .method("void A.ask()", 0, move |_, ctl| {
            let b = b.clone();
            async move {
                ctl.post_continuing_event(b, 0, vec![])
                    .await
                    .map_err(|e| Failure::raised(format!("ask failed: {e}")))?;
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new().with_trace_sink(capture.sink());
    ctl.post_event_after(SimTime(2), a, 0, vec![]);

    assert!(matches!(ctl.run(), Err(SimError::Uncaught { .. })));
    assert_eq!(capture.lines(), vec!["2 : void A.ask()"]);
}

#[test]
fn chained_continuing_calls_resolve_transitively_in_the_same_instant() {
    let log = new_log();

    let log_c = Arc::clone(&log);
    let c = Actor::named("C")
        .method("long C.base()", 0, move |_, _| {
            push(&log_c, "c");
            ready(Ok(json!(7)))
        })
        .build();

    let log_b = Arc::clone(&log);
    let b = Actor::named("B")
        .method("long B.plus_one()", 0, move |_, ctl| {
            let c = c.clone();
            let log = Arc::clone(&log_b);
            async move {
                push(&log, "b start");
                let v = ctl.post_continuing_event(c, 0, vec![]).await?;
                push(&log, "b end");
                Ok::<Value, Failure>(json!(v.as_i64().unwrap_or_default() + 1))
            }
            .boxed_local()
        })
        .build();

    let log_a = Arc::clone(&log);
    let a = Actor::named("A")
        .method("void A.top()", 0, move |_, ctl| {
            let b = b.clone();
            let log = Arc::clone(&log_a);
            async move {
                push(&log, "a start");
                let v = ctl.post_continuing_event(b, 0, vec![]).await?;
                push(&log, format!("a end {v}@{}", ctl.now()));
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new();
    ctl.post_event_after(SimTime(3), a, 0, vec![]);
    let summary = ctl.run().expect("run");

    assert_eq!(
        entries(&log),
        vec!["a start", "b start", "c", "b end", "a end 8@3"]
    );
    assert_eq!(summary.dispatched, 5);
    assert_eq!(ctl.now(), SimTime(3));
}

#[test]
fn caller_resumes_after_events_the_callee_posted_at_the_same_instant() {
    let log = new_log();
    let d: EntityRef = recorder("d", &log);

    let log_b = Arc::clone(&log);
    let b = Actor::named("B")
        .method("void B.work()", 0, move |_, ctl| {
            push(&log_b, "b");
            ctl.post_event(d.clone(), 0, vec![]);
            ready(Ok(Value::Null))
        })
        .build();

    let log_a = Arc::clone(&log);
    let a = Actor::named("A")
        .method("void A.wait()", 0, move |_, ctl| {
            let b = b.clone();
            let log = Arc::clone(&log_a);
            async move {
                ctl.post_continuing_event(b, 0, vec![]).await?;
                push(&log, "a resumed");
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new();
    ctl.post_event(a, 0, vec![]);
    ctl.run().expect("run");

    assert_eq!(entries(&log), vec!["b", "d@0", "a resumed"]);
}

#[test]
fn callee_delay_moves_the_caller_resumption_time() {
    let log = new_log();
    let slow = Actor::named("Slow")
        .method("void Slow.nap()", 0, |_, ctl| {
            async move {
                ctl.sleep(SimTime(4)).await?;
                Ok::<Value, Failure>(json!("rested"))
            }
            .boxed_local()
        })
        .build();

    let log_a = Arc::clone(&log);
    let a = Actor::named("A")
        .method("void A.wait()", 0, move |_, ctl| {
            let slow = slow.clone();
            let log = Arc::clone(&log_a);
            async move {
                let v = ctl.post_continuing_event(slow, 0, vec![]).await?;
                push(&log, format!("{v}@{}", ctl.now()));
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new();
    ctl.post_event_after(SimTime(1), a, 0, vec![]);
    ctl.run().expect("run");

    assert_eq!(entries(&log), vec!["\"rested\"@5"]);
    assert_eq!(ctl.now(), SimTime(5));
}

#[test]
fn sleep_reschedules_the_caller_later() {
    let log = new_log();
    let log_a = Arc::clone(&log);
    let a = Actor::named("A")
        .method("void A.doze()", 0, move |_, ctl| {
            let log = Arc::clone(&log_a);
            async move {
                push(&log, format!("before@{}", ctl.now()));
                ctl.sleep(SimTime(10)).await?;
                push(&log, format!("after@{}", ctl.now()));
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();
    let other: EntityRef = recorder("other", &log);

    let ctl = Controller::new();
    ctl.post_event(a, 0, vec![]);
    ctl.post_event_after(SimTime(5), other, 0, vec![]);
    let summary = ctl.run().expect("run");

    assert_eq!(entries(&log), vec!["before@0", "other@5", "after@10"]);
    assert_eq!(summary.dispatched, 3);
    assert_eq!(ctl.now(), SimTime(10));
}

#[test]
fn two_suspensions_in_one_poll_are_rejected() {
    let seen = Rc::new(RefCell::new(None));
    let seen_in = Rc::clone(&seen);
    let log = new_log();
    let b: EntityRef = answering("B", Ok(json!(1)));
    let c: EntityRef = recorder("c", &log);

    let a = Actor::named("A")
        .method("void A.both()", 0, move |_, ctl| {
            let b = b.clone();
            let c = c.clone();
            let seen = Rc::clone(&seen_in);
            async move {
                let pair = futures_util::future::join(
                    ctl.post_continuing_event(b, 0, vec![]),
                    ctl.post_continuing_event(c, 0, vec![]),
                )
                .await;
                *seen.borrow_mut() = Some(pair);
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new();
    ctl.post_event(a, 0, vec![]);
    ctl.run().expect("run");

    assert_eq!(
        *seen.borrow(),
        Some((Ok(json!(1)), Err(Failure::ConcurrentSuspension)))
    );
    assert!(entries(&log).is_empty());
}

#[test]
fn continuing_call_outside_a_behavior_fails_immediately() {
    let b: EntityRef = answering("B", Ok(json!(1)));
    let ctl = Controller::new();

    assert_eq!(
        ctl.post_continuing_event(b, 0, vec![]).now_or_never(),
        Some(Err(Failure::NoCallerRecord))
    );
    assert_eq!(
        ctl.sleep(SimTime(1)).now_or_never(),
        Some(Err(Failure::NoCallerRecord))
    );
    assert_eq!(ctl.pending(), 0);
}

#[test]
fn arity_mismatch_is_delivered_to_the_waiting_caller() {
    let seen = Rc::new(RefCell::new(None));
    let seen_in = Rc::clone(&seen);
    let log = new_log();
    let target: EntityRef = recorder("t", &log);

    let a = Actor::named("A")
        .method("void A.misuse()", 0, move |_, ctl| {
            let target = target.clone();
            let seen = Rc::clone(&seen_in);
            async move {
                let outcome = ctl
                    .post_continuing_event(target, 0, vec![json!(1), json!(2)])
                    .await;
                *seen.borrow_mut() = Some(outcome);
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::new();
    ctl.post_event(a, 0, vec![]);
    let summary = ctl.run().expect("run");

    assert_eq!(
        *seen.borrow(),
        Some(Err(Failure::ArityMismatch {
            signature: "void t.record()".to_string(),
            expected: 0,
            actual: 2
        }))
    );
    assert_eq!(summary.uncaught, 0);
    assert!(entries(&log).is_empty());
}

#[test]
fn caller_left_waiting_past_end_time_is_reported_as_stalled() {
    let sleeper = Actor::named("Sleeper")
        .method("void Sleeper.long_nap()", 0, |_, ctl| {
            async move {
                ctl.sleep(SimTime(100)).await?;
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();
    let a = Actor::named("A")
        .method("void A.wait()", 0, move |_, ctl| {
            let sleeper = sleeper.clone();
            async move {
                ctl.post_continuing_event(sleeper, 0, vec![]).await?;
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let ctl = Controller::with_config(ControllerConfig {
        end_time: Some(SimTime(50)),
        ..ControllerConfig::default()
    });
    ctl.post_event(a, 0, vec![]);
    let summary = ctl.run().expect("run");

    assert_eq!(summary.state, ControllerState::Halted);
    assert_eq!(summary.stalled, 1);
    assert_eq!(ctl.suspended(), 1);
    assert_eq!(ctl.pending(), 1);
}

#[test]
fn completed_continuing_call_stays_pending_when_polled_again() {
    let b: EntityRef = answering("B", Ok(json!(1)));
    let ctl = Controller::new();
    let mut call = ctl.post_continuing_event(b, 0, vec![]);
    let mut cx = Context::from_waker(noop_waker_ref());

    assert!(!call.is_terminated());
    assert_eq!(
        call.poll_unpin(&mut cx),
        Poll::Ready(Err(Failure::NoCallerRecord))
    );
    assert!(call.is_terminated());
    assert_eq!(call.poll_unpin(&mut cx), Poll::Pending);
}

#[test]
fn failures_passed_up_a_chain_release_their_frames() {
    let b: EntityRef = answering("B", Err(Failure::raised("boom")));
    let a = Actor::named("A")
        .method("void A.ask()", 0, move |_, ctl| {
            let b = b.clone();
            async move {
                ctl.post_continuing_event(b, 0, vec![]).await?;
                Ok::<Value, Failure>(Value::Null)
            }
            .boxed_local()
        })
        .build();

    let capture = Capture::default();
    let ctl = Controller::with_config(ControllerConfig {
        failure_policy: FailurePolicy::Continue,
        ..ControllerConfig::default()
    })
    .with_trace_sink(capture.sink());
    ctl.post_event(a, 0, vec![]);

    let summary = ctl.run().expect("run");
    assert_eq!(summary.uncaught, 1);
    assert_eq!(
        capture.lines(),
        vec!["0 : String B.answer()", "0 : void A.ask()"]
    );
    assert_eq!(ctl.causal_frames(), 0);
}
