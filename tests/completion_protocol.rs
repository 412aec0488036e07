//! Structured completion: a parent waits for every attached child.

#[macro_use]
mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::*;
use jobtree::{Cause, CompletableDeferred, Job, StateError};

/// A child that does not complete on cancellation, standing in for a body
/// that is still running.
fn running_child(parent: &Job) -> Job {
    Job::with_hooks(Some(parent), RecordingHooks::new(), true)
}

#[test]
fn completing_parent_waits_for_child() {
    init_test("completing_parent_waits_for_child");

    let parent = Job::new(None);
    let child = running_child(&parent);

    assert!(parent.complete());
    assert_with_log!(
        !parent.is_completed(),
        "parent keeps waiting for its child",
        false,
        parent.is_completed()
    );
    // Completing without a cancellation cause still counts as active.
    assert!(parent.is_active());

    child.complete();
    assert!(child.is_completed());
    assert!(parent.is_completed());
    assert!(!parent.is_cancelled());
    test_complete!("completing_parent_waits_for_child");
}

#[test]
fn parent_completes_only_after_every_child() {
    init_test("parent_completes_only_after_every_child");

    let parent = Job::new(None);
    let first = running_child(&parent);
    let second = running_child(&parent);

    assert!(parent.complete());
    assert!(!parent.is_completed());

    first.complete();
    assert_with_log!(
        !parent.is_completed(),
        "one child still running",
        false,
        parent.is_completed()
    );

    second.complete();
    assert!(parent.is_completed());
    test_complete!("parent_completes_only_after_every_child");
}

#[test]
fn cancelled_parent_still_waits_for_children() {
    init_test("cancelled_parent_still_waits_for_children");

    let parent = Job::new(None);
    let child = running_child(&parent);

    parent.cancel(None);
    assert!(parent.is_cancelled());
    assert!(!parent.is_completed());
    assert!(child.is_cancelled());

    child.complete();
    assert!(parent.is_completed());
    assert!(parent.is_cancelled());
    test_complete!("cancelled_parent_still_waits_for_children");
}

#[test]
fn child_attached_during_cancellation_is_notified_and_awaited() {
    init_test("child_attached_during_cancellation_is_notified_and_awaited");

    let parent = Job::new(None);
    let blocker = running_child(&parent);

    let cause = Cause::cancelled_with("tear down");
    parent.cancel(Some(cause.clone()));
    assert!(!parent.is_completed());

    // Attaching now still succeeds structurally, but the child learns the
    // cancellation cause immediately.
    let late = running_child(&parent);
    assert!(late.is_cancelled());
    assert!(!late.is_completed());

    blocker.complete();
    assert_with_log!(
        !parent.is_completed(),
        "parent waits for the late child too",
        false,
        parent.is_completed()
    );

    late.complete();
    assert!(parent.is_completed());
    test_complete!("child_attached_during_cancellation_is_notified_and_awaited");
}

#[test]
fn child_of_terminal_parent_is_cancelled_on_construction() {
    init_test("child_of_terminal_parent_is_cancelled_on_construction");

    let parent = Job::new(None);
    parent.cancel(None);
    assert!(parent.is_completed());

    let child = Job::new(Some(&parent));
    assert_with_log!(!child.is_active(), "child never became active", false, child.is_active());
    assert!(child.is_cancelled());
    assert!(child.is_completed());
    test_complete!("child_of_terminal_parent_is_cancelled_on_construction");
}

#[test]
fn children_snapshot_tracks_attachment_and_completion() {
    init_test("children_snapshot_tracks_attachment_and_completion");

    let parent = Job::new(None);
    assert!(parent.children().is_empty());

    let child = running_child(&parent);
    let listed = parent.children();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].same(&child));

    // At terminal the child detaches itself from the parent's list.
    child.complete();
    assert!(parent.children().is_empty());
    test_complete!("children_snapshot_tracks_attachment_and_completion");
}

#[test]
fn join_returns_only_after_children_finish() {
    init_test("join_returns_only_after_children_finish");

    let parent = Job::new(None);
    let child = running_child(&parent);

    // Registered before the parent starts waiting, so it runs ahead of the
    // parent's own completion callback, like a body's cleanup would.
    let finally_ran = Arc::new(Mutex::new(Vec::new()));
    {
        let log = Arc::clone(&finally_ran);
        child.invoke_on_completion(move |_| log.lock().unwrap().push("child cleanup"));
    }
    parent.complete();

    let waiter = {
        let parent = parent.clone();
        let log = Arc::clone(&finally_ran);
        std::thread::spawn(move || {
            block_on(parent.join());
            log.lock().unwrap().push("parent joined");
        })
    };

    child.complete();
    waiter.join().expect("join thread panicked");
    assert_eq!(
        *finally_ran.lock().unwrap(),
        vec!["child cleanup", "parent joined"]
    );
    test_complete!("join_returns_only_after_children_finish");
}

#[test]
fn deferred_value_waits_for_children_before_becoming_observable() {
    init_test("deferred_value_waits_for_children_before_becoming_observable");

    let deferred = CompletableDeferred::<u32>::new(None);
    let child = running_child(deferred.job());

    assert!(deferred.complete(5));
    assert!(matches!(
        deferred.completed_value(),
        Err(StateError::Incomplete)
    ));

    child.complete();
    assert_eq!(deferred.completed_value().expect("value"), 5);
    assert_eq!(block_on(deferred.wait()).expect("value"), 5);
    test_complete!("deferred_value_waits_for_children_before_becoming_observable");
}

#[test]
fn cancel_and_join_drains_the_subtree() {
    init_test("cancel_and_join_drains_the_subtree");

    let parent = Job::new(None);
    let child = running_child(&parent);

    let done = {
        let parent = parent.clone();
        std::thread::spawn(move || block_on(parent.cancel_and_join()))
    };

    wait_until(
        std::time::Duration::from_secs(5),
        "child observed the cancellation",
        || child.is_cancelled(),
    );
    child.complete();
    done.join().expect("cancel_and_join panicked");
    assert!(parent.is_completed());
    assert!(parent.is_cancelled());
    test_complete!("cancel_and_join_drains_the_subtree");
}

#[test]
fn on_start_hook_fires_for_attached_lazy_child() {
    init_test("on_start_hook_fires_for_attached_lazy_child");

    let parent = Job::new(None);
    let hooks = RecordingHooks::new();
    let child = Job::with_hooks(Some(&parent), Arc::clone(&hooks), false);
    assert_eq!(hooks.started.load(Ordering::SeqCst), 0);

    assert!(child.start());
    assert_eq!(hooks.started.load(Ordering::SeqCst), 1);
    test_complete!("on_start_hook_fires_for_attached_lazy_child");
}
