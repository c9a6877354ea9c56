//! Event system: registration, emit/broadcast propagation, tombstoned
//! deregistration, and destroy semantics.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use vigil::{Scope, Value};

#[test]
fn emit_invokes_every_listener_with_the_event_object() {
    let scope = Scope::new();
    let calls = Rc::new(RefCell::new(Vec::new()));

    for tag in ["L1", "L2"] {
        let log = calls.clone();
        let expected = scope.clone();
        scope.on("x", move |event, args| {
            assert_eq!(event.name(), "x");
            assert_eq!(event.target_scope(), expected);
            assert_eq!(event.current_scope(), Some(expected.clone()));
            assert_eq!(args, &[Value::from("p")]);
            log.borrow_mut().push(tag);
        });
    }

    let event = scope.emit("x", &[Value::from("p")]);
    assert_eq!(*calls.borrow(), vec!["L1", "L2"]);
    assert!(event.current_scope().is_none(), "current cleared after dispatch");
}

#[test]
fn emit_propagates_up_broadcast_propagates_down() {
    let root = Scope::new();
    let child = root.new_child(false);
    let grandchild = child.new_child(false);

    let order = Rc::new(RefCell::new(Vec::new()));
    for (scope, tag) in [(&root, "root"), (&child, "child"), (&grandchild, "grand")] {
        let log = order.clone();
        scope.on("ping", move |_, _| log.borrow_mut().push(tag));
    }

    child.emit("ping", &[]);
    assert_eq!(*order.borrow(), vec!["child", "root"]);

    order.borrow_mut().clear();
    child.broadcast("ping", &[]);
    assert_eq!(*order.borrow(), vec!["child", "grand"]);

    order.borrow_mut().clear();
    root.broadcast("ping", &[]);
    assert_eq!(*order.borrow(), vec!["root", "child", "grand"]);
}

#[test]
fn current_scope_tracks_the_dispatching_scope() {
    let root = Scope::new();
    let child = root.new_child(false);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let log = seen.clone();
    let root_clone = root.clone();
    root.on("up", move |event, _| {
        log.borrow_mut()
            .push(event.current_scope() == Some(root_clone.clone()));
    });
    let log = seen.clone();
    let child_clone = child.clone();
    child.on("up", move |event, _| {
        log.borrow_mut()
            .push(event.current_scope() == Some(child_clone.clone()));
    });

    child.emit("up", &[]);
    assert_eq!(*seen.borrow(), vec![true, true]);
}

#[test]
fn stop_propagation_halts_emit_but_not_broadcast() {
    let root = Scope::new();
    let child = root.new_child(false);
    let root_called = Rc::new(Cell::new(0usize));

    let count = root_called.clone();
    root.on("sig", move |_, _| count.set(count.get() + 1));
    child.on("sig", |event, _| event.stop_propagation());

    child.emit("sig", &[]);
    assert_eq!(root_called.get(), 0, "emit stopped below the root");

    // Broadcast events have no effective stop_propagation.
    let child_called = Rc::new(Cell::new(0usize));
    let count = child_called.clone();
    child.on("down", move |event, _| {
        event.stop_propagation();
        count.set(count.get() + 1);
    });
    let grandchild = child.new_child(false);
    let grand_called = Rc::new(Cell::new(0usize));
    let count = grand_called.clone();
    grandchild.on("down", move |_, _| count.set(count.get() + 1));

    root.broadcast("down", &[]);
    assert_eq!(child_called.get(), 1);
    assert_eq!(grand_called.get(), 1, "broadcast reached below the stopper");
}

#[test]
fn prevent_default_marks_the_event() {
    let scope = Scope::new();
    scope.on("evt", |event, _| event.prevent_default());
    let event = scope.emit("evt", &[]);
    assert!(event.default_prevented());

    let event = scope.emit("other", &[]);
    assert!(!event.default_prevented());
}

#[test]
fn deregistering_during_dispatch_does_not_skip_the_next_listener() {
    let scope = Scope::new();
    let order = Rc::new(RefCell::new(Vec::new()));

    let handle_slot: Rc<RefCell<Option<vigil::WatchHandle>>> = Rc::new(RefCell::new(None));
    let slot = handle_slot.clone();
    let log = order.clone();
    let first = scope.on("x", move |_, _| {
        log.borrow_mut().push("first");
        if let Some(h) = slot.borrow_mut().take() {
            h.deregister();
        }
    });
    *handle_slot.borrow_mut() = Some(first);

    let log = order.clone();
    scope.on("x", move |_, _| log.borrow_mut().push("second"));

    scope.emit("x", &[]);
    assert_eq!(*order.borrow(), vec!["first", "second"]);

    // The tombstone is compacted; only the survivor fires now.
    order.borrow_mut().clear();
    scope.emit("x", &[]);
    assert_eq!(*order.borrow(), vec!["second"]);
}

#[test]
fn destroy_broadcasts_destroy_event_to_subtree() {
    let root = Scope::new();
    let child = root.new_child(false);
    let grandchild = child.new_child(false);
    let seen = Rc::new(RefCell::new(Vec::new()));

    for (scope, tag) in [(&child, "child"), (&grandchild, "grand")] {
        let log = seen.clone();
        scope.on("$destroy", move |_, _| log.borrow_mut().push(tag));
    }

    child.destroy();
    assert_eq!(*seen.borrow(), vec!["child", "grand"]);
}

#[test]
fn destroyed_scope_is_detached_and_silent() {
    let root = Scope::new();
    let child = root.new_child(false);
    let fired = Rc::new(Cell::new(0usize));

    let count = fired.clone();
    child.on("x", move |_, _| count.set(count.get() + 1));
    let count = fired.clone();
    root.on("x", move |_, _| count.set(count.get() + 1));

    child.destroy();
    child.emit("x", &[]);
    assert_eq!(fired.get(), 0, "no listeners run, no upward propagation");

    root.broadcast("x", &[]);
    assert_eq!(fired.get(), 1, "root still works; child no longer reachable");
}

#[test]
fn emit_passes_arguments_through_the_chain() {
    let root = Scope::new();
    let child = root.new_child(false);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = seen.clone();
    root.on("data", move |_, args| {
        log.borrow_mut().push(args.to_vec());
    });

    child.emit("data", &[Value::Num(1.0), Value::from("two")]);
    assert_eq!(
        seen.borrow()[0],
        vec![Value::Num(1.0), Value::from("two")]
    );
}

#[test]
fn listeners_for_other_names_do_not_fire() {
    let scope = Scope::new();
    let fired = Rc::new(Cell::new(false));
    let flag = fired.clone();
    scope.on("a", move |_, _| flag.set(true));
    scope.emit("b", &[]);
    assert!(!fired.get());
}
