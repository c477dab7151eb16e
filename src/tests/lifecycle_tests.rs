use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Notify};

use crate::events::{self, new_testing_listener};
use crate::future::CallbackFuture;
use crate::prelude::*;
use crate::tests::components::*;

#[tokio::test]
async fn test_start_and_close() {
    let lifecycle = wait_done_component("worker");
    let (ev_listener, ev_buffer) = new_testing_listener();
    ev_listener.attach(&lifecycle);

    assert!(lifecycle.state().is_closed());
    lifecycle
        .start()
        .await
        .expect("component should start with no error");
    assert!(lifecycle.state().is_running());

    let closed = lifecycle.closed_waiter();
    lifecycle.close().expect("close request should be delivered");
    closed.await.expect("component should exit with no error");
    assert!(lifecycle.state().is_closed());
    assert!(lifecycle.error().is_none());

    ev_buffer
        .wait_till(events::closed("worker"), Duration::from_millis(250))
        .await;
    ev_buffer
        .assert_exact(vec![
            events::starting("worker"),
            events::started("worker"),
            events::closing("worker"),
            events::closed("worker"),
        ])
        .await;
}

#[tokio::test]
async fn test_start_failure() {
    let lifecycle = fail_start_component("worker");
    let (ev_listener, ev_buffer) = new_testing_listener();
    ev_listener.attach(&lifecycle);

    let started = lifecycle.started_waiter();
    let err = lifecycle
        .start()
        .await
        .expect_err("component should fail to start");
    assert_eq!("failing component", err.to_string());

    let started_err = started.await.expect_err("started future should get the error");
    assert_eq!("failing component", started_err.to_string());
    assert!(lifecycle.state().is_closed());
    assert_eq!(
        Some("failing component".to_owned()),
        lifecycle.error().map(|err| err.to_string())
    );

    ev_buffer
        .wait_till(events::start_failed("worker"), Duration::from_millis(250))
        .await;
    ev_buffer
        .assert_exact(vec![
            events::starting("worker"),
            events::start_failed("worker"),
        ])
        .await;
}

#[tokio::test]
async fn test_exit_error_reaches_every_closed_future() {
    let lifecycle = fail_run_component("worker");
    lifecycle.start().await.expect("component should start");
    // the run phase may be over already, late registrations get the last error
    let first = lifecycle.closed_waiter();
    let second = lifecycle.closed_waiter();

    let err = lifecycle
        .wait()
        .await
        .expect_err("wait should report the exit error");
    assert_eq!("component crashed", err.to_string());

    for waiter in vec![first, second] {
        let exit_err = waiter.await.expect_err("closed future should get the error");
        assert_eq!("component crashed", exit_err.to_string());
    }
    assert_eq!(
        Some("component crashed".to_owned()),
        lifecycle.error().map(|err| err.to_string())
    );

    // a closed component completes late registrations with its last error
    let late = lifecycle.closed_waiter();
    assert_eq!(
        "component crashed",
        late.await.expect_err("late future gets the last error").to_string()
    );
}

#[tokio::test]
async fn test_close_is_delivered_once() {
    let closes = Arc::new(AtomicU32::new(0));
    let notify = Arc::new(Notify::new());

    let run_notify = notify.clone();
    let (close_notify, close_count) = (notify.clone(), closes.clone());
    let lifecycle = Lifecycle::from_fn(
        "db",
        vec![],
        |_| async { Ok(()) },
        move |_| {
            let notify = run_notify.clone();
            async move {
                notify.notified().await;
                Ok(())
            }
        },
        move |_lifecycle: &Lifecycle| {
            close_count.fetch_add(1, Ordering::SeqCst);
            close_notify.notify_one();
            Ok(())
        },
    );

    lifecycle.start().await.expect("component should start");
    lifecycle.close().expect("first close should succeed");
    lifecycle.close().expect("second close should succeed");
    assert!(lifecycle.state().is_closing());

    lifecycle.wait().await.expect("component should exit cleanly");
    assert_eq!(1, closes.load(Ordering::SeqCst));

    // closing a closed component is not an error either
    lifecycle.close().expect("close on a closed component");
    assert_eq!(1, closes.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_state_errors() {
    let lifecycle = wait_done_component("worker");
    lifecycle.start().await.expect("component should start");

    let err = lifecycle.start().await.expect_err("second start should fail");
    assert!(err.is_state(StateErrorKind::Running));
    assert_eq!("lifecycle `worker` is running", err.to_string());

    lifecycle.shutdown().await.expect("shutdown should succeed");
    lifecycle.destroy().expect("destroy should succeed");
    assert!(lifecycle.state().is_destroyed());

    let err = lifecycle.start().await.expect_err("start after destroy");
    assert!(err.is_state(StateErrorKind::Destroyed));
    let err = lifecycle.restart().await.expect_err("restart after destroy");
    assert!(err.is_state(StateErrorKind::Destroyed));
    let err = lifecycle
        .started_waiter()
        .await
        .expect_err("started future on a destroyed component");
    assert!(err.is_state(StateErrorKind::Destroyed));
}

#[tokio::test]
async fn test_destroy_running_component() {
    let lifecycle = wait_done_component("cache");
    lifecycle.start().await.expect("component should start");

    let result = lifecycle
        .destroy_wait()
        .await
        .expect("destroy request should be delivered");
    result.expect("component should exit cleanly");
    assert!(lifecycle.state().is_destroyed());
    assert!(lifecycle.state().is_closed());

    // a second destroy completes right away
    let result = lifecycle.destroy_wait().await.expect("second destroy");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_restart() {
    let lifecycle = wait_done_component("api");
    let starts = Arc::new(AtomicU32::new(0));
    let counter = starts.clone();
    lifecycle.on_starting(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    lifecycle.start().await.expect("component should start");
    lifecycle.restart().await.expect("restart should succeed");
    assert!(lifecycle.state().is_running());
    assert!(!lifecycle.state().is_restarting());
    assert_eq!(2, starts.load(Ordering::SeqCst));

    lifecycle.shutdown().await.expect("shutdown should succeed");
    assert!(lifecycle.state().is_closed());

    // restarting a closed component starts it
    lifecycle.restart().await.expect("restart from closed");
    assert!(lifecycle.state().is_running());
    assert_eq!(3, starts.load(Ordering::SeqCst));
    lifecycle.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn test_close_during_interruptible_start() {
    let lifecycle = never_start_component("dialer");
    lifecycle.background().expect("background start");
    assert!(lifecycle.state().is_starting());

    let result = lifecycle
        .close_wait()
        .await
        .expect("close request should be delivered");
    let err = result.expect_err("cancelled start is reported as the exit result");
    assert_eq!("start was cancelled", err.to_string());
    assert!(lifecycle.state().is_closed());
}

#[tokio::test]
async fn test_starter_close_requested_mid_start() {
    let (gate_tx, gate_rx) = oneshot::channel::<()>();
    let gate = Arc::new(Mutex::new(Some(gate_rx)));
    let close_calls = Arc::new(AtomicU32::new(0));

    let calls = close_calls.clone();
    let lifecycle = Lifecycle::from_starter_fn("handshake", vec![], move |_| {
        let gate = gate.lock().unwrap().take();
        let calls = calls.clone();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            let notify = Arc::new(Notify::new());
            let run_notify = notify.clone();
            let run = run_fn(move |_| async move {
                run_notify.notified().await;
                Ok(())
            });
            let close = close_fn(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                notify.notify_one();
                Ok(())
            });
            Ok((run, close))
        }
    });

    lifecycle.background().expect("background start");
    let closed = lifecycle.closed_waiter();
    lifecycle.close().expect("close while starting");
    assert!(lifecycle.state().is_starting() && lifecycle.state().is_closing());
    assert_eq!(0, close_calls.load(Ordering::SeqCst));

    gate_tx.send(()).expect("start phase should be waiting");
    closed.await.expect("component should exit cleanly");
    assert_eq!(1, close_calls.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_start_check_rejects_start() {
    let lifecycle = Lifecycle::new(
        "maintenance",
        vec![with_start_check(|_state| Err(Error::msg("in maintenance")))],
    );
    let err = lifecycle.start().await.expect_err("start check should fail");
    assert_eq!("in maintenance", err.to_string());
    assert!(lifecycle.state().is_closed());
    assert!(lifecycle.error().is_some());
}

#[tokio::test]
async fn test_close_check_rejects_close() {
    let lifecycle = Lifecycle::new(
        "pinned",
        vec![with_close_check(|state| {
            if state.is_running() {
                Err(Error::msg("cannot close while running"))
            } else {
                Ok(())
            }
        })],
    );
    lifecycle.start().await.expect("component should start");
    let err = lifecycle.close().expect_err("close check should fail");
    assert_eq!("cannot close while running", err.to_string());
    assert!(lifecycle.state().is_running());
}

#[tokio::test]
async fn test_panicking_run_is_reported() {
    let lifecycle = Lifecycle::from_interruptible_fn(
        "panicky",
        vec![],
        |_lifecycle, _ctx: Context| async { Ok(()) },
        |_lifecycle, _ctx: Context| async {
            let fail = true;
            if fail {
                panic!("on purpose");
            }
            Ok(())
        },
    );
    let err = lifecycle.run().await.expect_err("panic should be reported");
    match err {
        Error::Panicked { target, message } => {
            assert_eq!("panicky", target);
            assert_eq!("on purpose", message);
        }
        other => panic!("expecting Panicked, got {:?}", other),
    }
    assert!(lifecycle.state().is_closed());
}

#[tokio::test]
async fn test_run_returns_after_close() {
    let lifecycle = wait_done_component("blocking");
    let runner = lifecycle.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    lifecycle
        .started_waiter()
        .await
        .expect("component should start");
    lifecycle.close().expect("close request");
    let result = handle.await.expect("run task should not panic");
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_callback_registration() {
    let lifecycle = wait_done_component("callbacks");
    let calls = Arc::new(Mutex::new(Vec::new()));

    let first = calls.clone();
    let second = calls.clone();
    lifecycle
        .on_started(move |_, _| first.lock().unwrap().push("first"))
        .on_started(move |_, _| second.lock().unwrap().push("second"));
    lifecycle.start().await.expect("component should start");
    lifecycle.shutdown().await.expect("shutdown");
    assert_eq!(vec!["first", "second"], *calls.lock().unwrap());

    let replaced = calls.clone();
    lifecycle.set_on_started(move |_, err| {
        assert!(err.is_none());
        replaced.lock().unwrap().push("replaced")
    });
    lifecycle.start().await.expect("component should start again");
    lifecycle.shutdown().await.expect("shutdown");
    assert_eq!(
        vec!["first", "second", "replaced"],
        *calls.lock().unwrap()
    );

    lifecycle.clear_callbacks();
    lifecycle.start().await.expect("component should start again");
    lifecycle.shutdown().await.expect("shutdown");
    assert_eq!(3, calls.lock().unwrap().len());
}

#[tokio::test]
async fn test_fields() {
    let lifecycle = Lifecycle::new("fields", vec![]);
    lifecycle.set_field("port", 8080u16);

    assert_eq!(Some(8080), lifecycle.field_as::<u16>("port").map(|port| *port));
    assert!(lifecycle.field_as::<String>("port").is_none());

    let (value, existed) = lifecycle.set_default_field("port", 9090u16);
    assert!(existed);
    assert_eq!(Some(&8080), value.downcast_ref::<u16>());
    let (_, existed) = lifecycle.set_default_field("host", "localhost".to_owned());
    assert!(!existed);

    let mut names = Vec::new();
    lifecycle.range_field(|name, _| {
        names.push(name.to_owned());
        true
    });
    names.sort();
    assert_eq!(vec!["host", "port"], names);

    assert!(lifecycle.remove_field("port").is_some());
    assert!(lifecycle.field("port").is_none());
    lifecycle.delete_field("host");
    assert!(lifecycle.fields().is_empty());
}

#[tokio::test]
async fn test_display() {
    let lifecycle = wait_done_component("display");
    assert_eq!("lifecycle(display)[closed]", lifecycle.to_string());
    lifecycle.start().await.expect("component should start");
    assert_eq!("lifecycle(display)[running]", lifecycle.to_string());
    lifecycle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn test_callback_future_observes_exit() {
    let lifecycle = fail_run_component("observed");
    let (sender, receiver) = oneshot::channel();
    lifecycle.start().await.expect("component should start");
    lifecycle.add_closed_future(CallbackFuture::new(move |result: ExitResult| {
        let _ = sender.send(result.map_err(|err| err.to_string()));
    }));
    let result = receiver.await.expect("callback should run");
    assert_eq!(Err("component crashed".to_owned()), result);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_start_keeps_the_cycle() {
    let lifecycle = slow_start_component("slow", Duration::from_millis(100));
    let result = tokio::time::timeout(Duration::from_millis(20), lifecycle.start()).await;
    assert!(result.is_err(), "start should still be executing");
    assert!(lifecycle.state().is_starting());

    lifecycle.close().expect("close request should be delivered");
    tokio::time::timeout(Duration::from_secs(2), lifecycle.wait())
        .await
        .expect("component should close")
        .expect("component should exit with no error");
    assert!(lifecycle.state().is_closed());

    lifecycle.start().await.expect("component should start again");
    assert!(lifecycle.state().is_running());
    lifecycle.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_leaves_the_component_running() {
    let lifecycle = wait_done_component("service");
    tokio::select! {
        _ = lifecycle.run() => panic!("run phase should still be executing"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
    }
    assert!(lifecycle.state().is_running());

    tokio::time::timeout(Duration::from_secs(2), lifecycle.shutdown())
        .await
        .expect("shutdown should complete")
        .expect("close request should be delivered");
    assert!(lifecycle.state().is_closed());
    assert!(lifecycle.error().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_restart_clears_restarting() {
    let lifecycle = slow_start_component("slow", Duration::from_millis(100));
    lifecycle.start().await.expect("component should start");

    let result = tokio::time::timeout(Duration::from_millis(20), lifecycle.restart()).await;
    assert!(result.is_err(), "restart should still be executing");
    assert!(lifecycle.state().is_restarting());

    lifecycle
        .started_waiter()
        .await
        .expect("restarted component should start");
    assert!(lifecycle.state().is_running());
    assert!(!lifecycle.state().is_restarting());
    lifecycle.shutdown().await.expect("shutdown should succeed");
}

#[tokio::test]
async fn test_once_component_runs_a_single_cycle() {
    let lifecycle = Lifecycle::once("job", vec![], |_lifecycle, ctx: Context| async move {
        let _ = ctx.done().await;
        Ok(())
    })
    .expect("once component should start");
    lifecycle
        .started_waiter()
        .await
        .expect("once component should be running");

    let result = lifecycle.close_wait().await.expect("close request should be delivered");
    assert!(result.is_ok());
    assert!(lifecycle.wait().await.is_ok());

    let err = lifecycle.start().await.expect_err("second cycle should be rejected");
    assert!(err.is_state(StateErrorKind::Spent));
    assert_eq!("lifecycle `job` already ran its single cycle", err.to_string());
    let err = lifecycle.restart().await.expect_err("restart should be rejected");
    assert!(err.is_state(StateErrorKind::Spent));
    assert!(lifecycle
        .background()
        .expect_err("background should be rejected")
        .is_state(StateErrorKind::Spent));

    lifecycle.destroy().expect("destroy should succeed");
    assert!(lifecycle.state().is_destroyed());
}

#[tokio::test]
async fn test_once_option_rejects_second_start() {
    let lifecycle = Lifecycle::new("single", vec![with_once()]);
    lifecycle.start().await.expect("first start should succeed");
    let err = lifecycle.start().await.expect_err("component is running");
    assert!(err.is_state(StateErrorKind::Running));
    lifecycle.shutdown().await.expect("shutdown should succeed");

    let err = lifecycle.run().await.expect_err("second cycle should be rejected");
    assert!(err.is_state(StateErrorKind::Spent));
    assert!(lifecycle.state().is_closed());
}
