//! End-to-end scenarios driving the engine through its public API.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use filament_core::{Derivable, Engine, Error, Writable};

fn translate(cc: &str) -> &'static str {
    match cc {
        "de" => "Hallo",
        "fr" => "Bonjour",
        _ => "Hello",
    }
}

#[test]
fn greeting_scenario() {
    let engine = Engine::new();
    let cc = engine.atom("en");
    let name = engine.atom("World");

    let greeting = engine.derivation({
        let cc = cc.clone();
        move || translate(cc.get())
    });
    let message = engine.derivation({
        let greeting = greeting.clone();
        let name = name.clone();
        move || format!("{}, {}!", greeting.get(), name.get())
    });

    let log = Rc::new(RefCell::new(Vec::new()));
    let _watch = message.react({
        let log = log.clone();
        move |m: &String| log.borrow_mut().push(m.clone())
    });
    assert_eq!(*log.borrow(), vec!["Hello, World!"]);

    cc.set("de");
    assert_eq!(log.borrow().last().unwrap(), "Hallo, World!");

    name.set("Dieter");
    assert_eq!(log.borrow().last().unwrap(), "Hallo, Dieter!");

    // Both writes land as one cycle: no intermediate "Bonjour, Dieter!".
    let before = log.borrow().len();
    engine.transact(|| {
        cc.set("fr");
        name.set("Étienne");
    });
    assert_eq!(log.borrow().len(), before + 1);
    assert_eq!(log.borrow().last().unwrap(), "Bonjour, Étienne!");
}

#[test]
fn diamond_dependencies_notify_once() {
    let engine = Engine::new();
    let a = engine.atom(1);
    let left = engine.derivation({
        let a = a.clone();
        move || a.get() + 1
    });
    let right = engine.derivation({
        let a = a.clone();
        move || a.get() * 10
    });
    let sum = engine.derivation({
        let left = left.clone();
        let right = right.clone();
        move || left.get() + right.get()
    });

    let seen = Rc::new(RefCell::new(Vec::new()));
    let _watch = sum.react({
        let seen = seen.clone();
        move |v: &i32| seen.borrow_mut().push(*v)
    });
    assert_eq!(*seen.borrow(), vec![12]);

    // One write reaches the reaction along two paths but fires it once,
    // with both inputs already final.
    a.set(2);
    assert_eq!(*seen.borrow(), vec![12, 23]);
}

#[test]
fn reactions_are_notified_in_discovery_order() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let order = Rc::new(RefCell::new(Vec::new()));
    let _first = a.react({
        let order = order.clone();
        move |_: &i32| order.borrow_mut().push("first")
    });
    let _second = a.react({
        let order = order.clone();
        move |_: &i32| order.borrow_mut().push("second")
    });

    order.borrow_mut().clear();
    a.set(1);
    assert_eq!(*order.borrow(), vec!["first", "second"]);
}

#[test]
fn panicking_transaction_rolls_back() {
    let engine = Engine::new();
    let a = engine.atom(1);
    let b = engine.atom(10);
    let fired = Rc::new(Cell::new(0));
    let _watch = {
        let fired = fired.clone();
        a.react(move |_: &i32| fired.set(fired.get() + 1))
    };
    assert_eq!(fired.get(), 1);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        engine.transact(|| {
            a.set(2);
            b.set(20);
            panic!("boom");
        })
    }));
    assert!(outcome.is_err());

    // Both writes undone, nothing propagated.
    assert_eq!(a.get(), 1);
    assert_eq!(b.get(), 10);
    assert_eq!(fired.get(), 1);

    // The engine is still fully usable.
    a.set(3);
    assert_eq!(fired.get(), 2);
}

#[test]
fn failed_try_transact_rolls_back_and_returns_the_error() {
    let engine = Engine::new();
    let a = engine.atom(1);

    let result: Result<(), &str> = engine.try_transact(|| {
        a.set(5);
        Err("rejected")
    });
    assert_eq!(result, Err("rejected"));
    assert_eq!(a.get(), 1);

    let result: Result<i32, &str> = engine.try_transact(|| {
        a.set(5);
        Ok(a.get())
    });
    assert_eq!(result, Ok(5));
    assert_eq!(a.get(), 5);
}

#[test]
fn rollback_discards_derivations_computed_in_the_window() {
    let engine = Engine::new();
    let a = engine.atom(1);
    let d = engine.derivation({
        let a = a.clone();
        move || a.get() * 10
    });
    assert_eq!(d.get(), 10);

    let result: Result<(), ()> = engine.try_transact(|| {
        a.set(2);
        // Reads inside the window see the staged write.
        assert_eq!(a.get(), 2);
        assert_eq!(d.get(), 20);
        Err(())
    });
    assert!(result.is_err());

    // The mid-window evaluation must not survive the rollback.
    assert_eq!(a.get(), 1);
    assert_eq!(d.get(), 10);
}

#[test]
fn reactions_survive_an_aborted_transaction() {
    let engine = Engine::new();
    let a = engine.atom(1);
    let d = engine.derivation({
        let a = a.clone();
        move || a.get() * 10
    });
    let seen = Rc::new(RefCell::new(Vec::new()));
    let _watch = d.react({
        let seen = seen.clone();
        move |v: &i32| seen.borrow_mut().push(*v)
    });
    assert_eq!(*seen.borrow(), vec![10]);

    // The aborted write marks the chain but the rollback must unwind those
    // marks too, even for nodes the window never read.
    let result: Result<(), ()> = engine.try_transact(|| {
        a.set(2);
        Err(())
    });
    assert!(result.is_err());

    a.set(3);
    assert_eq!(*seen.borrow(), vec![10, 30]);
}

#[test]
fn inner_transactions_commit_with_the_outermost() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let b = engine.atom(0);
    let fired = Rc::new(Cell::new(0));
    let _watch = {
        let fired = fired.clone();
        let b = b.clone();
        let sum = engine.derivation({
            let a = a.clone();
            move || a.get() + b.get()
        });
        // Keep the derivation alive inside the reaction's upstream chain.
        sum.react(move |_: &i32| fired.set(fired.get() + 1))
    };
    assert_eq!(fired.get(), 1);

    engine.transact(|| {
        a.set(1);
        engine.transact(|| b.set(2));
        // The inner commit opened no propagation boundary.
        assert_eq!(fired.get(), 1);
    });
    assert_eq!(fired.get(), 2);
}

#[test]
fn outer_panic_rolls_back_completed_inner_transactions() {
    let engine = Engine::new();
    let a = engine.atom(1);

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        engine.transact(|| {
            engine.transact(|| a.set(2));
            panic!("after the inner commit");
        })
    }));
    assert!(outcome.is_err());
    assert_eq!(a.get(), 1);
    assert!(!engine.in_transaction());
}

#[test]
fn a_panicking_reaction_does_not_starve_the_others() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let healthy = Rc::new(Cell::new(0));

    let _faulty = a.react(|v: &i32| {
        if *v > 0 {
            panic!("faulty observer");
        }
    });
    let _healthy = {
        let healthy = healthy.clone();
        a.react(move |_: &i32| healthy.set(healthy.get() + 1))
    };
    assert_eq!(healthy.get(), 1);

    // The panic surfaces to the writer, after the second reaction ran.
    let outcome = catch_unwind(AssertUnwindSafe(|| a.set(1)));
    assert!(outcome.is_err());
    assert_eq!(healthy.get(), 2);

    // Colors were swept despite the panic: the next write works.
    let outcome = catch_unwind(AssertUnwindSafe(|| a.set(2)));
    assert!(outcome.is_err());
    assert_eq!(healthy.get(), 3);
}

#[test]
fn mutual_recursion_is_reported_as_a_cycle() {
    let engine = Engine::new();
    let slot: Rc<RefCell<Option<filament_core::Derivation<i32>>>> = Rc::new(RefCell::new(None));
    let first = engine.derivation({
        let slot = slot.clone();
        move || match slot.borrow().as_ref() {
            Some(second) => second.get(),
            None => 0,
        }
    });
    let second = engine.derivation({
        let first = first.clone();
        move || first.get()
    });
    *slot.borrow_mut() = Some(second);

    let outcome = catch_unwind(AssertUnwindSafe(|| first.get()));
    let message = *outcome
        .expect_err("cycle must not evaluate")
        .downcast::<String>()
        .expect("panic carries the error message");
    assert_eq!(message, Error::DependencyCycle.to_string());
}

#[test]
fn transactions_inside_a_ticker_window_stay_buffered() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let fired = Rc::new(Cell::new(0));
    let _watch = {
        let fired = fired.clone();
        a.react(move |_: &i32| fired.set(fired.get() + 1))
    };
    assert_eq!(fired.get(), 1);

    let ticker = engine.ticker();
    engine.transact(|| a.set(1));
    assert_eq!(fired.get(), 1);

    ticker.tick();
    assert_eq!(fired.get(), 2);
}

#[test]
fn stopping_the_only_reaction_detaches_the_chain() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let runs = Rc::new(Cell::new(0));
    let doubled = engine.derivation({
        let a = a.clone();
        let runs = runs.clone();
        move || {
            runs.set(runs.get() + 1);
            a.get() * 2
        }
    });
    let watch = doubled.react(|_: &i32| {});
    assert_eq!(runs.get(), 1);
    a.set(1);
    assert_eq!(runs.get(), 2);

    // With the observer gone, the first write sweeps the chain out of the
    // graph; the rest never reach it.
    watch.stop();
    for value in 2..12 {
        a.set(value);
    }
    assert_eq!(runs.get(), 2);

    // Reading reconnects and recomputes exactly once.
    assert_eq!(doubled.get(), 22);
    assert_eq!(runs.get(), 3);
}

#[test]
fn unobserved_branches_are_pruned_from_the_graph() {
    let engine = Engine::new();
    let a = engine.atom(0);
    let chain = {
        let inner = engine.derivation({
            let a = a.clone();
            move || a.get() + 1
        });
        engine.derivation(move || inner.get() * 2)
    };
    let watch = chain.react(|_: &i32| {});
    assert_eq!(engine.node_count(), 4);

    watch.stop();
    drop(watch);
    drop(chain);
    drop(a);
    assert_eq!(engine.node_count(), 0);
}
