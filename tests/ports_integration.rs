/// Data and signal port integration tests
///
/// - delayed data delivery (one sender cycle into PortUpdate)
/// - zero-cycle inline delivery and listener events
/// - data container semantics (pull/peek/timestamps)
/// - binding rules (direction, clock domains, duplicates, types)
/// - zero-delay auto-precedence across a bound pair
/// - exported port resolution
use std::cell::RefCell;
use std::rc::Rc;

use chronon::ports::{
    DataInPort, DataOutPort, ExportedPort, Port, SignalInPort, SignalOutPort,
};
use chronon::{
    bind, ClockManager, Event, EventSet, Scheduler, SchedulingPhase, TreeNode, UniqueEvent,
};

fn as_port<P: Port + 'static>(p: &Rc<P>) -> Rc<dyn Port> {
    Rc::clone(p) as Rc<dyn Port>
}

struct Harness {
    scheduler: Rc<Scheduler>,
    top: Rc<TreeNode>,
}

/// One clock of the given frequency on `top` (period = 1e6/mhz ticks).
fn harness_with_mhz(mhz: f64) -> Harness {
    let scheduler = Scheduler::new("sched");
    let manager = ClockManager::new(&scheduler);
    let root_clk = manager.make_root("root").unwrap();
    let core_clk = manager
        .make_clock_with_frequency("core", &root_clk, mhz)
        .unwrap();
    manager.normalize().unwrap();
    let top = TreeNode::new_root("top");
    top.set_clock(&core_clk);
    Harness { scheduler, top }
}

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
fn test_single_cycle_data_port_delivery() {
    // Units A and B on a 1000-tick clock; A sends 42 at sender cycle 5
    // through a one-cycle port. B sees it once, at tick 6000, in
    // PortUpdate.
    let h = harness_with_mhz(1000.0);
    let unit_a = h.top.add_child("unit_a").unwrap();
    let unit_b = h.top.add_child("unit_b").unwrap();

    let out_port = DataOutPort::<u32>::new(&unit_a.port_set(), "out_port").unwrap();
    let in_port = DataInPort::<u32>::new(&unit_b.port_set(), "in_port", 1).unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    let seen: Rc<RefCell<Vec<(u32, u64, SchedulingPhase)>>> = Rc::new(RefCell::new(Vec::new()));
    in_port
        .register_consumer_handler({
            let seen = Rc::clone(&seen);
            let scheduler = Rc::clone(&h.scheduler);
            move |value: &u32| {
                seen.borrow_mut().push((
                    *value,
                    scheduler.current_tick(),
                    scheduler.current_phase(),
                ));
                Ok(())
            }
        })
        .unwrap();

    let events = EventSet::new(&unit_a).unwrap();
    let sender = {
        let out_port = Rc::clone(&out_port);
        Event::new(&events, "sender", SchedulingPhase::Tick, move || {
            out_port.send(42)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    sender.schedule_in(5).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*seen.borrow(), vec![(42, 6000, SchedulingPhase::PortUpdate)]);
    assert!(in_port.data_received());
    assert_eq!(in_port.pull_data().unwrap(), 42);
    assert!(!in_port.data_received());
}

#[test]
fn test_zero_cycle_signal_with_listener_event() {
    // A zero-delay signal delivered inline in PortUpdate; a registered
    // listener in Tick runs within the same tick.
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();

    let out_port = SignalOutPort::new(&unit.port_set(), "sig_out").unwrap();
    let in_port =
        SignalInPort::with_phase(&unit.port_set(), "sig_in", SchedulingPhase::PortUpdate, 0)
            .unwrap();

    let events = EventSet::new(&unit).unwrap();
    let listener_at: Rc<RefCell<Vec<(u64, SchedulingPhase)>>> = Rc::new(RefCell::new(Vec::new()));
    let listener = {
        let listener_at = Rc::clone(&listener_at);
        let scheduler = Rc::clone(&h.scheduler);
        UniqueEvent::new(&events, "listener", SchedulingPhase::Tick, move || {
            listener_at
                .borrow_mut()
                .push((scheduler.current_tick(), scheduler.current_phase()));
            Ok(())
        })
        .unwrap()
    };
    in_port
        .register_consumer_event(listener.scheduleable())
        .unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    let handler_at: Rc<RefCell<Vec<(u64, SchedulingPhase)>>> = Rc::new(RefCell::new(Vec::new()));
    in_port
        .register_consumer_handler({
            let handler_at = Rc::clone(&handler_at);
            let scheduler = Rc::clone(&h.scheduler);
            move || {
                handler_at
                    .borrow_mut()
                    .push((scheduler.current_tick(), scheduler.current_phase()));
                Ok(())
            }
        })
        .unwrap();

    let driver = {
        let out_port = Rc::clone(&out_port);
        Event::new(&events, "driver", SchedulingPhase::PortUpdate, move || {
            out_port.send(0)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    driver.schedule_in(1000).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*handler_at.borrow(), vec![(1000, SchedulingPhase::PortUpdate)]);
    assert_eq!(*listener_at.borrow(), vec![(1000, SchedulingPhase::Tick)]);
    assert!(in_port.signal_received());
}

#[test]
fn test_zero_cycle_send_into_passed_phase_is_fatal() {
    // Delivery phase Update has already passed by the time a Tick
    // handler drives the port.
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();

    let out_port = SignalOutPort::new(&unit.port_set(), "sig_out").unwrap();
    let in_port =
        SignalInPort::with_phase(&unit.port_set(), "sig_in", SchedulingPhase::Update, 0).unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    let events = EventSet::new(&unit).unwrap();
    let driver = {
        let out_port = Rc::clone(&out_port);
        Event::new(&events, "driver", SchedulingPhase::Tick, move || {
            out_port.send(0)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    driver.schedule_in(1).unwrap();
    let err = h.scheduler.run(None, false).unwrap_err();
    assert!(format!("{:#}", err).contains("zero-cycle send"));
}

#[test]
fn test_peek_does_not_clear_validity() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();

    let out_port = DataOutPort::<u64>::new(&unit.port_set(), "d_out").unwrap();
    let in_port = DataInPort::<u64>::new(&unit.port_set(), "d_in", 1).unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    let events = EventSet::new(&unit).unwrap();
    let sender = {
        let out_port = Rc::clone(&out_port);
        Event::new(&events, "sender", SchedulingPhase::Tick, move || {
            out_port.send(99)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    sender.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(in_port.peek_data().unwrap(), 99);
    assert!(in_port.data_received());
    assert_eq!(in_port.received_time_stamp().unwrap(), 2);
    assert_eq!(in_port.pull_data().unwrap(), 99);
    assert!(in_port.pull_data().is_err());
}

#[test]
fn test_send_on_unbound_port_is_error() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let out_port = DataOutPort::<u8>::new(&unit.port_set(), "loose").unwrap();
    let err = out_port.send(1).unwrap_err();
    assert!(format!("{}", err).contains("unbound"));
}

#[test]
fn test_binding_same_directions_is_error() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let a = DataOutPort::<u8>::new(&unit.port_set(), "a_out").unwrap();
    let b = DataOutPort::<u8>::new(&unit.port_set(), "b_out").unwrap();
    assert!(bind(&as_port(&a), &as_port(&b)).is_err());

    let c = DataInPort::<u8>::new(&unit.port_set(), "c_in", 0).unwrap();
    let d = DataInPort::<u8>::new(&unit.port_set(), "d_in", 0).unwrap();
    assert!(bind(&as_port(&c), &as_port(&d)).is_err());
}

#[test]
fn test_binding_disparate_payload_types_is_error() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let out_port = DataOutPort::<u8>::new(&unit.port_set(), "a_out").unwrap();
    let in_port = DataInPort::<u16>::new(&unit.port_set(), "b_in", 0).unwrap();
    let err = bind(&as_port(&out_port), &as_port(&in_port)).unwrap_err();
    assert!(format!("{}", err).contains("disparate"));
}

#[test]
fn test_binding_across_clock_domains_is_error() {
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

    let out_port = DataOutPort::<u8>::new(&fast_node.port_set(), "a_out").unwrap();
    let in_port = DataInPort::<u8>::new(&slow_node.port_set(), "b_in", 0).unwrap();
    let err = bind(&as_port(&out_port), &as_port(&in_port)).unwrap_err();
    assert!(format!("{}", err).contains("sync ports"));
}

#[test]
fn test_double_binding_same_pair_is_error() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let out_port = DataOutPort::<u8>::new(&unit.port_set(), "a_out").unwrap();
    let in_port = DataInPort::<u8>::new(&unit.port_set(), "b_in", 0).unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();
    let err = bind(&as_port(&out_port), &as_port(&in_port)).unwrap_err();
    assert!(format!("{}", err).contains("already bound"));
}

#[test]
fn test_listener_registration_after_bind_is_error() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let out_port = SignalOutPort::new(&unit.port_set(), "s_out").unwrap();
    let in_port = SignalInPort::new(&unit.port_set(), "s_in", 0).unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    let events = EventSet::new(&unit).unwrap();
    let late = UniqueEvent::new(&events, "late", SchedulingPhase::Tick, || Ok(())).unwrap();
    let err = in_port
        .register_consumer_event(late.scheduleable())
        .unwrap_err();
    assert!(format!("{}", err).contains("after port"));
}

#[test]
fn test_zero_delay_auto_precedence_orders_producer_before_consumer() {
    // Producer and consumer both in Tick, wired through a zero-delay
    // port. Labels would run the consumer first; bind-time edges keep
    // the producer ahead, and the inline delivery lands in between.
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let out_port = DataOutPort::<u32>::new(&unit.port_set(), "d_out").unwrap();
    let in_port =
        DataInPort::<u32>::with_phase(&unit.port_set(), "d_in", SchedulingPhase::Tick, 0).unwrap();
    in_port
        .register_consumer_handler({
            let order = Rc::clone(&order);
            move |_: &u32| {
                order.borrow_mut().push("delivery");
                Ok(())
            }
        })
        .unwrap();

    let events = EventSet::new(&unit).unwrap();
    let consumer = {
        let order = Rc::clone(&order);
        UniqueEvent::new(&events, "a_consumer", SchedulingPhase::Tick, move || {
            order.borrow_mut().push("consumer");
            Ok(())
        })
        .unwrap()
    };
    let producer = {
        let order = Rc::clone(&order);
        let out_port = Rc::clone(&out_port);
        UniqueEvent::new(&events, "z_producer", SchedulingPhase::Tick, move || {
            order.borrow_mut().push("producer");
            out_port.send(5)
        })
        .unwrap()
    };

    out_port
        .register_producing_event(producer.scheduleable())
        .unwrap();
    in_port
        .register_consumer_event(consumer.scheduleable())
        .unwrap();
    bind(&as_port(&out_port), &as_port(&in_port)).unwrap();

    h.scheduler.finalize().unwrap();
    producer.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*order.borrow(), vec!["producer", "delivery", "consumer"]);
}

#[test]
fn test_exported_port_resolution_and_bind() {
    // Deep ports surfaced at the top level of two subsystems; binding
    // the exports binds the inner pair.
    let h = harness();
    let cpu = h.top.add_child("cpu").unwrap();
    let lsu = cpu.add_child("lsu").unwrap();
    let biu = lsu.add_child("biu_interface").unwrap();
    let mss = h.top.add_child("mss").unwrap();
    let coherency = mss.add_child("coherency_module").unwrap();

    let inner_out = DataOutPort::<u32>::new(&biu.port_set(), "out_cpu_request").unwrap();
    let inner_in = DataInPort::<u32>::new(&coherency.port_set(), "in_cpu_request", 1).unwrap();

    let exported_out =
        ExportedPort::new_deferred(&cpu.port_set(), "out_request", &cpu, "out_cpu_request")
            .unwrap();
    let exported_in =
        ExportedPort::new_deferred(&mss.port_set(), "in_request", &mss, "in_cpu_request").unwrap();

    bind(&as_port(&exported_out), &as_port(&exported_in)).unwrap();
    assert!(inner_out.is_bound());
    assert!(inner_in.is_bound());

    let got: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));
    inner_in
        .register_consumer_handler({
            let got = Rc::clone(&got);
            move |v: &u32| {
                got.borrow_mut().push(*v);
                Ok(())
            }
        })
        .unwrap();

    let events = EventSet::new(&cpu).unwrap();
    let sender = {
        let inner_out = Rc::clone(&inner_out);
        Event::new(&events, "sender", SchedulingPhase::Tick, move || {
            inner_out.send(123)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    sender.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();
    assert_eq!(*got.borrow(), vec![123]);
}

#[test]
fn test_exported_port_missing_target_is_error() {
    let h = harness();
    let cpu = h.top.add_child("cpu").unwrap();
    let exported =
        ExportedPort::new_deferred(&cpu.port_set(), "out_request", &cpu, "no_such_port").unwrap();
    let err = match exported.resolve() {
        Ok(_) => panic!("expected resolve() to fail"),
        Err(err) => err,
    };
    assert!(format!("{}", err).contains("no_such_port"));
}

#[test]
fn test_exported_port_direct_reference() {
    let h = harness();
    let cpu = h.top.add_child("cpu").unwrap();
    let lsu = cpu.add_child("lsu").unwrap();
    let inner = DataOutPort::<u8>::new(&lsu.port_set(), "deep_out").unwrap();
    let exported =
        ExportedPort::new_direct(&cpu.port_set(), "surface_out", &(as_port(&inner))).unwrap();
    assert_eq!(exported.direction(), chronon::Direction::Out);
    let resolved = exported.resolve().unwrap();
    assert_eq!(resolved.name(), "deep_out");
}

#[test]
fn test_fanout_to_multiple_in_ports() {
    let h = harness();
    let unit = h.top.add_child("unit").unwrap();
    let out_port = DataOutPort::<u32>::new(&unit.port_set(), "d_out").unwrap();
    let in_a = DataInPort::<u32>::new(&unit.port_set(), "a_in", 1).unwrap();
    let in_b = DataInPort::<u32>::new(&unit.port_set(), "b_in", 2).unwrap();
    bind(&as_port(&out_port), &as_port(&in_a)).unwrap();
    bind(&as_port(&out_port), &as_port(&in_b)).unwrap();

    let arrivals: Rc<RefCell<Vec<(&'static str, u64)>>> = Rc::new(RefCell::new(Vec::new()));
    for (port, tag) in [(&in_a, "a"), (&in_b, "b")] {
        port.register_consumer_handler({
            let arrivals = Rc::clone(&arrivals);
            let scheduler = Rc::clone(&h.scheduler);
            move |_: &u32| {
                arrivals.borrow_mut().push((tag, scheduler.current_tick()));
                Ok(())
            }
        })
        .unwrap();
    }

    let events = EventSet::new(&unit).unwrap();
    let sender = {
        let out_port = Rc::clone(&out_port);
        Event::new(&events, "sender", SchedulingPhase::Tick, move || {
            out_port.send(7)
        })
        .unwrap()
    };

    h.scheduler.finalize().unwrap();
    sender.schedule_in(1).unwrap();
    h.scheduler.run(None, false).unwrap();

    assert_eq!(*arrivals.borrow(), vec![("a", 2), ("b", 3)]);
}
