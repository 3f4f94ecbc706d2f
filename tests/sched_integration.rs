/// Scheduler integration tests
///
/// Coverage for the tick/phase run loop:
/// - phase ordering within a tick
/// - DAG-priority draining and determinism across runs
/// - re-entrant scheduling rules (same phase, earlier phase)
/// - cancellation semantics
/// - continuing flag and stop conditions
/// - finalization requirements
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use chronon::{
    precedes, ClockManager, Event, EventSet, Scheduler, SchedulingPhase, TreeNode, UniqueEvent,
};

struct Harness {
    scheduler: Rc<Scheduler>,
    top: Rc<TreeNode>,
}

/// One root clock with period 1: ticks and cycles coincide.
fn harness() -> Harness {
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    manager.normalize().unwrap();
    let top = TreeNode::new_root("top");
    top.set_clock(&root_clk);
    Harness { scheduler, top }
}

#[test]
fn test_run_requires_finalize() {
    let h = harness();
    assert!(h.scheduler.run(None, false).is_err());
    h.scheduler.finalize().unwrap();
    assert!(h.scheduler.run(None, false).is_ok());
}

#[test]
fn test_schedule_requires_finalize() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let ev = Event::new(&events, "early", SchedulingPhase::Tick, || Ok(())).unwrap();
    let err = ev.schedule_in(1).unwrap_err();
    assert!(format!("{}", err).contains("finalized"));
}

#[test]
fn test_phase_ordering_within_tick() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let phases = [
        ("update", SchedulingPhase::Update),
        ("port_update", SchedulingPhase::PortUpdate),
        ("flush", SchedulingPhase::Flush),
        ("collection", SchedulingPhase::Collection),
        ("tick", SchedulingPhase::Tick),
        ("post_tick", SchedulingPhase::PostTick),
    ];
    let mut created = Vec::new();
    for (name, phase) in phases {
        let order = Rc::clone(&order);
        let ev = Event::new(&events, name, phase, move || {
            order.borrow_mut().push(name);
            Ok(())
        })
        .unwrap();
        created.push(ev);
    }

    h.scheduler.finalize().unwrap();
    // Schedule in reverse creation order; phase order must win.
    for ev in created.iter().rev() {
        ev.schedule_in(3).unwrap();
    }
    h.scheduler.run(None, false).unwrap();

    assert_eq!(
        *order.borrow(),
        vec!["update", "port_update", "flush", "collection", "tick", "post_tick"]
    );
}

#[test]
fn test_dag_order_beats_schedule_order() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let make = |name: &'static str| {
        let order = Rc::clone(&order);
        Event::new(&events, name, SchedulingPhase::Tick, move || {
            order.borrow_mut().push(name);
            Ok(())
        })
        .unwrap()
    };
    // Label order alone would run "alpha" first; edges force the
    // opposite.
    let zed = make("zed");
    let mid = make("mid");
    let alpha = make("alpha");
    precedes(&zed, &mid).unwrap();
    precedes(&mid, &alpha).unwrap();

    h.scheduler.finalize().unwrap();
    alpha.schedule_in(1).unwrap();
    mid.schedule_in(1).unwrap();
    zed.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*order.borrow(), vec!["zed", "mid", "alpha"]);
}

#[test]
fn test_unrelated_events_drain_by_label_deterministically() {
    // Two identical programs produce the identical firing sequence.
    let run_once = || {
        let h = harness();
        let events = EventSet::new(&h.top).unwrap();
        let order: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let names = ["walnut", "apple", "mango", "banana"];
        let mut evs = Vec::new();
        for name in names {
            let order = Rc::clone(&order);
            evs.push(
                Event::new(&events, name, SchedulingPhase::Tick, move || {
                    order.borrow_mut().push(name.to_string());
                    Ok(())
                })
                .unwrap(),
            );
        }
        h.scheduler.finalize().unwrap();
        for ev in &evs {
            ev.schedule_in(2).unwrap();
        }
        h.scheduler.run(None, false).unwrap();
        let result = order.borrow().clone();
        result
    };

    let first = run_once();
    let second = run_once();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4);
}

#[test]
fn test_handler_schedules_same_tick_later_phase() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let seen: Rc<RefCell<Vec<(SchedulingPhase, u64)>>> = Rc::new(RefCell::new(Vec::new()));

    let late = {
        let seen = Rc::clone(&seen);
        let scheduler = Rc::clone(&h.scheduler);
        Event::new(&events, "late", SchedulingPhase::PostTick, move || {
            seen.borrow_mut()
                .push((scheduler.current_phase(), scheduler.current_tick()));
            Ok(())
        })
        .unwrap()
    };
    let early = {
        let late = late.clone();
        Event::new(&events, "early", SchedulingPhase::Update, move || {
            late.schedule_in(0)?;
            Ok(())
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    early.schedule_in(5).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*seen.borrow(), vec![(SchedulingPhase::PostTick, 5)]);
}

#[test]
fn test_scheduling_into_earlier_phase_is_fatal() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();

    let update_ev = Event::new(&events, "upd", SchedulingPhase::Update, || Ok(())).unwrap();
    let tick_ev = {
        let update_ev = update_ev.clone();
        Event::new(&events, "tick", SchedulingPhase::Tick, move || {
            update_ev.schedule_in(0)?;
            Ok(())
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    tick_ev.schedule_in(1).unwrap();
    let err = h.scheduler.run(None, false).unwrap_err();
    let msg = format!("{:#}", err);
    assert!(msg.contains("already advanced"), "unexpected: {}", msg);
}

#[test]
fn test_reentrant_same_phase_requires_dag_order() {
    // A handler may push same-tick same-phase work only if that work is
    // ordered after it.
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let ran_follower = Rc::new(Cell::new(false));

    let follower = {
        let ran_follower = Rc::clone(&ran_follower);
        Event::new(&events, "follower", SchedulingPhase::Tick, move || {
            ran_follower.set(true);
            Ok(())
        })
        .unwrap()
    };
    let leader = {
        let follower = follower.clone();
        Event::new(&events, "leader", SchedulingPhase::Tick, move || {
            follower.schedule_in(0)?;
            Ok(())
        })
        .unwrap()
    };
    precedes(&leader, &follower).unwrap();

    h.scheduler.finalize().unwrap();
    leader.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();
    assert!(ran_follower.get());
}

#[test]
fn test_reentrant_same_phase_without_order_is_fatal() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();

    // "apple" sorts before "banana", so banana fires second and the
    // re-entrant schedule targets something already drained past.
    let apple = Event::new(&events, "apple", SchedulingPhase::Tick, || Ok(())).unwrap();
    let banana = {
        let apple = apple.clone();
        Event::new(&events, "banana", SchedulingPhase::Tick, move || {
            apple.schedule_in(0)?;
            Ok(())
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    banana.schedule_in(1).unwrap();
    let err = h.scheduler.run(None, false).unwrap_err();
    assert!(format!("{:#}", err).contains("not ordered after"));
}

#[test]
fn test_cancelled_entries_are_skipped_silently() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let victim = {
        let fired = Rc::clone(&fired);
        Event::new(&events, "victim", SchedulingPhase::Tick, move || {
            fired.set(fired.get() + 1);
            Ok(())
        })
        .unwrap()
    };
    // A keep-alive so the run actually reaches the cancelled tick.
    let keeper = Event::new(&events, "keeper", SchedulingPhase::Tick, || Ok(())).unwrap();

    h.scheduler.finalize().unwrap();
    victim.schedule_in(2).unwrap();
    victim.schedule_in(4).unwrap();
    keeper.schedule_in(6).unwrap();
    assert!(victim.is_scheduled());
    assert_eq!(victim.cancel_at(2).unwrap(), 1);
    h.scheduler.run(None, false).unwrap();

    assert_eq!(fired.get(), 1);
}

#[test]
fn test_cancel_all_occurrences() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let victim = {
        let fired = Rc::clone(&fired);
        Event::new(&events, "victim", SchedulingPhase::Tick, move || {
            fired.set(fired.get() + 1);
            Ok(())
        })
        .unwrap()
    };
    let keeper = Event::new(&events, "keeper", SchedulingPhase::Tick, || Ok(())).unwrap();

    h.scheduler.finalize().unwrap();
    victim.schedule_in(1).unwrap();
    victim.schedule_in(2).unwrap();
    victim.schedule_in(3).unwrap();
    keeper.schedule_in(5).unwrap();
    assert_eq!(victim.cancel().unwrap(), 3);
    assert!(!victim.is_scheduled());
    h.scheduler.run(None, false).unwrap();

    assert_eq!(fired.get(), 0);
}

#[test]
fn test_non_continuing_work_does_not_keep_scheduler_alive() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let fired = Rc::new(Cell::new(false));

    let heartbeat = {
        let fired = Rc::clone(&fired);
        Event::new(&events, "heartbeat", SchedulingPhase::Tick, move || {
            fired.set(true);
            Ok(())
        })
        .unwrap()
    };
    heartbeat.set_continuing(false);

    h.scheduler.finalize().unwrap();
    heartbeat.schedule_in(3).unwrap();
    h.scheduler.run(None, false).unwrap();

    // Only non-continuing work was pending, so the run stopped at once.
    assert!(!fired.get());
}

#[test]
fn test_non_continuing_fires_alongside_continuing_work() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let fired = Rc::new(Cell::new(false));

    let heartbeat = {
        let fired = Rc::clone(&fired);
        Event::new(&events, "heartbeat", SchedulingPhase::Tick, move || {
            fired.set(true);
            Ok(())
        })
        .unwrap()
    };
    heartbeat.set_continuing(false);
    let keeper = Event::new(&events, "keeper", SchedulingPhase::Tick, || Ok(())).unwrap();

    h.scheduler.finalize().unwrap();
    heartbeat.schedule_in(2).unwrap();
    keeper.schedule_in(5).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert!(fired.get());
}

#[test]
fn test_exacting_run_lands_on_tick_budget() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let ev = Event::new(&events, "only", SchedulingPhase::Tick, || Ok(())).unwrap();

    h.scheduler.finalize().unwrap();
    ev.schedule_in(10).unwrap();
    h.scheduler.run(Some(100), true).unwrap();
    assert_eq!(h.scheduler.current_tick(), 100);
}

#[test]
fn test_tick_budget_stops_before_future_work() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let fired = Rc::new(Cell::new(false));
    let ev = {
        let fired = Rc::clone(&fired);
        Event::new(&events, "far", SchedulingPhase::Tick, move || {
            fired.set(true);
            Ok(())
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    ev.schedule_in(50).unwrap();
    h.scheduler.run(Some(10), false).unwrap();
    assert!(!fired.get());

    // A later run picks the work back up.
    h.scheduler.run(None, false).unwrap();
    assert!(fired.get());
}

#[test]
fn test_unique_event_refire_same_tick_is_fatal() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();

    let holder: Rc<RefCell<Option<UniqueEvent>>> = Rc::new(RefCell::new(None));
    let uev = {
        let holder = Rc::clone(&holder);
        UniqueEvent::new(&events, "uniq", SchedulingPhase::Tick, move || {
            // Re-scheduling for the tick currently firing must fail.
            let me = holder.borrow();
            me.as_ref().expect("installed below").schedule_in(0)?;
            Ok(())
        })
        .unwrap()
    };
    *holder.borrow_mut() = Some(uev.clone());

    h.scheduler.finalize().unwrap();
    uev.schedule_in(1).unwrap();
    let err = h.scheduler.run(None, false).unwrap_err();
    assert!(format!("{:#}", err).contains("already fired"));
}

#[test]
fn test_events_fired_counter() {
    let h = harness();
    let events = EventSet::new(&h.top).unwrap();
    let ev = Event::new(&events, "ev", SchedulingPhase::Tick, || Ok(())).unwrap();

    h.scheduler.finalize().unwrap();
    ev.schedule_in(1).unwrap();
    ev.schedule_in(2).unwrap();
    ev.schedule_in(3).unwrap();
    h.scheduler.run(None, false).unwrap();
    assert_eq!(h.scheduler.events_fired(), 3);
}
