use tracing_test::traced_test;

use crate::prelude::*;
use crate::supervisor::{GroupRef, GROUP_FIELD_NAME};
use crate::tests::components::*;

#[tokio::test]
async fn test_start_and_close_children() {
    let group = Group::new("root");
    let one = group.must_add("one", wait_done_component("one"));
    let two = group.must_add("two", wait_done_component("two"));

    group.start().await.expect("group should start with no error");
    assert!(group.state().is_running());
    assert!(one.lifecycle().state().is_running());
    assert!(two.lifecycle().state().is_running());

    group.shutdown().await.expect("group should close with no error");
    assert!(group.state().is_closed());
    assert!(one.lifecycle().state().is_closed());
    assert!(two.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_empty_group() {
    let group = Group::new("empty");
    assert!(group.is_empty());
    group.start().await.expect("empty group should start");
    assert!(group.state().is_running());
    group.shutdown().await.expect("empty group should close");
}

#[tokio::test]
#[traced_test]
async fn test_start_error_closes_every_child() {
    let group = Group::new("root");
    group.must_add("a", fail_start_component("a"));
    let b = group.must_add("b", wait_done_component("b"));
    let c = group.must_add("c", wait_done_component("c"));

    let err = group
        .start()
        .await
        .expect_err("group start should fail");
    match &err {
        Error::Interrupted(interrupted) => {
            let cause = interrupted.cause().expect("cause should be reported");
            assert_eq!("failing component", cause.to_string());
        }
        other => panic!("expecting an InterruptedError, got {:?}", other),
    }
    assert!(group.state().is_closed());
    assert!(b.lifecycle().state().is_closed());
    assert!(c.lifecycle().state().is_closed());
    assert!(logs_contain("child start failed"));
    assert!(logs_contain("closing every child while starting"));
}

#[tokio::test]
async fn test_tolerated_start_error() {
    let group = Group::new("root");
    let a = group.must_add("a", fail_start_component("a"));
    a.set_close_all_on_start_error(false);
    let b = group.must_add("b", wait_done_component("b"));

    group.start().await.expect("group should tolerate the start error");
    assert!(a.lifecycle().state().is_closed());
    assert!(b.lifecycle().state().is_running());

    group.shutdown().await.expect("group should close");
    assert!(b.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_exit_error_closes_group() {
    let (triggerer, trigger_listener) = component_trigger::new();
    let group = Group::new("root");
    group.must_add("flaky", trigger_listener.to_fail_run_component("flaky", 1));
    let steady = group.must_add("steady", wait_done_component("steady"));

    group.start().await.expect("group should start");
    let closed = group.closed_waiter();
    triggerer.trigger().await;

    let err = closed.await.expect_err("group should exit with the child error");
    assert_eq!("fail_run_component (1/1)", err.to_string());
    assert_eq!(1, triggerer.get_call_count().await);
    assert!(group.state().is_closed());
    assert!(steady.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_clean_exit_closes_group() {
    let (triggerer, trigger_listener) = component_trigger::new();
    let group = Group::new("root");
    group.must_add("oneshot", trigger_listener.to_success_exit_component("oneshot"));
    let steady = group.must_add("steady", wait_done_component("steady"));

    group.start().await.expect("group should start");
    let closed = group.closed_waiter();
    triggerer.trigger().await;

    closed.await.expect("group should exit cleanly");
    assert!(steady.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_tolerated_exit_error() {
    let (triggerer, trigger_listener) = component_trigger::new();
    let group = Group::new("root");
    let flaky = group.must_add("flaky", trigger_listener.to_fail_run_component("flaky", 1));
    flaky
        .set_close_all_on_exit(false)
        .set_close_all_on_exit_error(false);
    let steady = group.must_add("steady", wait_done_component("steady"));

    group.start().await.expect("group should start");
    let flaky_closed = flaky.lifecycle().closed_waiter();
    triggerer.trigger().await;
    flaky_closed
        .await
        .expect_err("child should exit with an error");

    tokio::task::yield_now().await;
    assert!(group.state().is_running());
    assert!(steady.lifecycle().state().is_running());

    group.shutdown().await.expect("group should close");
}

#[tokio::test]
async fn test_add_to_running_group() {
    let group = Group::new("root");
    group.must_add("first", wait_done_component("first"));
    group.start().await.expect("group should start");

    let late = group
        .add("late", wait_done_component("late"))
        .expect("late child should be added");
    late.lifecycle()
        .started_waiter()
        .await
        .expect("late child should start");
    assert!(late.lifecycle().state().is_running());

    group.shutdown().await.expect("group should close");
    assert!(late.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_duplicate_child_name() {
    let group = Group::new("root");
    group.must_add("db", wait_done_component("db"));
    let err = group
        .add("db", wait_done_component("db"))
        .expect_err("name should be taken");
    assert!(matches!(err, Error::ChildExists(ref name) if name == "db"));
    assert_eq!(1, group.len());
}

#[tokio::test]
async fn test_remove_running_child() {
    let group = Group::new("root");
    let removed = group.must_add("removed", wait_done_component("removed"));
    let kept = group.must_add("kept", wait_done_component("kept"));
    group.start().await.expect("group should start");

    let closed = removed.lifecycle().closed_waiter();
    let holder = group.remove("removed").expect("child should be registered");
    assert!(holder.is_removed());
    assert!(holder.lifecycle().field(GROUP_FIELD_NAME).is_none());
    closed.await.expect("removed child should close cleanly");

    tokio::task::yield_now().await;
    assert!(group.state().is_running());
    assert!(kept.lifecycle().state().is_running());
    assert!(group.child("removed").is_none());
    assert!(group.remove("removed").is_none());

    group.shutdown().await.expect("group should close");
}

#[tokio::test]
async fn test_group_ref_field() {
    let group = Group::new("root");
    let db = wait_done_component("db");
    group.must_add("db", &db);
    group.must_add("cache", wait_done_component("cache"));

    let group_ref = db
        .field_as::<GroupRef>(GROUP_FIELD_NAME)
        .expect("child should know its group");
    let sibling = group_ref.child("cache").expect("sibling should be found");
    assert_eq!("cache", sibling.name());
    assert_eq!(
        Some(group.id()),
        group_ref.lifecycle().map(|lifecycle| lifecycle.id())
    );
}

#[tokio::test]
async fn test_restart_group() {
    let group = Group::new("root");
    let child = group.must_add("child", wait_done_component("child"));
    group.start().await.expect("group should start");

    group.restart().await.expect("group should restart");
    assert!(group.state().is_running());
    assert!(child.lifecycle().state().is_running());

    group.shutdown().await.expect("group should close");
    assert!(child.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_nested_groups() {
    let root = Group::new("root");
    let subtree = Group::new("subtree");
    let leaf = subtree.must_add("leaf", wait_done_component("leaf"));
    root.must_add("subtree", &subtree);

    root.start().await.expect("root should start");
    assert!(subtree.state().is_running());
    assert!(leaf.lifecycle().state().is_running());

    root.shutdown().await.expect("root should close");
    assert!(subtree.state().is_closed());
    assert!(leaf.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_refused_child_fails_the_start() {
    let group = Group::new("root");
    let steady = group.must_add("steady", wait_done_component("steady"));
    group.must_add("refused", refused_start_component("refused"));

    let err = tokio::time::timeout(Duration::from_secs(2), group.start())
        .await
        .expect("group start should not hang")
        .expect_err("group start should fail");
    match &err {
        Error::Interrupted(interrupted) => {
            let cause = interrupted.cause().expect("cause should be reported");
            assert_eq!("start refused", cause.to_string());
        }
        other => panic!("expecting an InterruptedError, got {:?}", other),
    }
    assert!(group.state().is_closed());
    assert!(steady.lifecycle().state().is_closed());
}

#[tokio::test]
async fn test_tolerated_refused_child() {
    let group = Group::new("root");
    let steady = group.must_add("steady", wait_done_component("steady"));
    let refused = group.must_add("refused", refused_start_component("refused"));
    refused.set_close_all_on_start_error(false);

    tokio::time::timeout(Duration::from_secs(2), group.start())
        .await
        .expect("group start should not hang")
        .expect("group should tolerate the refusal");
    assert!(steady.lifecycle().state().is_running());
    assert!(refused.lifecycle().state().is_closed());

    group.shutdown().await.expect("group should close");
}
