/// Clock tree integration tests
///
/// - cycle/tick conversion across a normalized ratio tree
/// - posedge coincidence between domains
/// - scheduling through clocks of different periods
use std::cell::RefCell;
use std::rc::Rc;

use chronon::{ClockManager, Event, EventSet, Scheduler, SchedulingPhase, TreeNode};

#[test]
fn test_cycles_resolve_through_ratio_tree() {
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    let half = manager.make_clock("half", &root_clk, 1, 2).unwrap();
    let two_thirds = manager.make_clock("two_thirds", &root_clk, 2, 3).unwrap();
    let norm = manager.normalize().unwrap();
    assert_eq!(norm, 2);

    assert_eq!(root_clk.period(), 2);
    assert_eq!(half.period(), 4);
    assert_eq!(two_thirds.period(), 3);

    assert_eq!(half.cycle_to_tick(5).unwrap(), 20);
    assert_eq!(half.tick_to_cycle(21).unwrap(), 5);
    assert_eq!(two_thirds.cycle_to_tick(4).unwrap(), 12);
}

#[test]
fn test_posedges_coincide_at_period_lcm() {
    // Periods 2000 and 3000 share a rising edge exactly at multiples
    // of 6000.
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    let a = manager
        .make_clock_with_frequency("a", &root_clk, 500.0)
        .unwrap();
    let b = manager
        .make_clock_with_frequency("b", &root_clk, 333.3333)
        .unwrap();
    manager.normalize().unwrap();

    for tick in (0u64..=12_000).step_by(1000) {
        let both = tick % a.period() == 0 && tick % b.period() == 0;
        assert_eq!(both, tick % 6000 == 0, "tick {}", tick);
    }
}

#[test]
fn test_events_on_different_domains_interleave_by_period() {
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    let fast = manager
        .make_clock_with_frequency("fast", &root_clk, 1000.0)
        .unwrap();
    let slow = manager
        .make_clock_with_frequency("slow", &root_clk, 500.0)
        .unwrap();
    manager.normalize().unwrap();

    let top = TreeNode::new_root("top");
    let fast_node = top.add_child("fast").unwrap();
    fast_node.set_clock(&fast);
    let slow_node = top.add_child("slow").unwrap();
    slow_node.set_clock(&slow);

    let ticks: Rc<RefCell<Vec<(&'static str, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    let fast_events = EventSet::new(&fast_node).unwrap();
    let fast_ev = {
        let ticks = Rc::clone(&ticks);
        let scheduler = Rc::clone(&scheduler);
        Event::new(&fast_events, "fast_ev", SchedulingPhase::Tick, move || {
            ticks.borrow_mut().push(("fast", scheduler.current_tick()));
            Ok(())
        })
        .unwrap()
    };
    let slow_events = EventSet::new(&slow_node).unwrap();
    let slow_ev = {
        let ticks = Rc::clone(&ticks);
        let scheduler = Rc::clone(&scheduler);
        Event::new(&slow_events, "slow_ev", SchedulingPhase::Tick, move || {
            ticks.borrow_mut().push(("slow", scheduler.current_tick()));
            Ok(())
        })
        .unwrap()
    };

    scheduler.finalize().unwrap();
    // Three fast cycles land at 1000/2000/3000; two slow cycles at
    // 2000/4000.
    fast_ev.schedule_in(1).unwrap();
    fast_ev.schedule_in(2).unwrap();
    fast_ev.schedule_in(3).unwrap();
    slow_ev.schedule_in(1).unwrap();
    slow_ev.schedule_in(2).unwrap();
    scheduler.run(None, false).unwrap();

    assert_eq!(
        *ticks.borrow(),
        vec![
            ("fast", 1000),
            ("fast", 2000),
            ("slow", 2000),
            ("fast", 3000),
            ("slow", 4000),
        ]
    );
}

#[test]
fn test_current_cycle_tracks_domain() {
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    let slow = manager
        .make_clock_with_frequency("slow", &root_clk, 500.0)
        .unwrap();
    manager.normalize().unwrap();

    let top = TreeNode::new_root("top");
    top.set_clock(&slow);
    let events = EventSet::new(&top).unwrap();
    let cycles: Rc<RefCell<Vec<(u64, bool)>>> = Rc::new(RefCell::new(Vec::new()));
    let probe = {
        let cycles = Rc::clone(&cycles);
        let slow = Rc::clone(&slow);
        Event::new(&events, "probe", SchedulingPhase::Tick, move || {
            cycles
                .borrow_mut()
                .push((slow.current_cycle()?, slow.is_posedge()?));
            Ok(())
        })
        .unwrap()
    };

    scheduler.finalize().unwrap();
    probe.schedule_in(3).unwrap();
    scheduler.run(None, false).unwrap();
    assert_eq!(*cycles.borrow(), vec![(3, true)]);
}
