//! Clock-domain-crossing ports with ready/valid backpressure.
//!
//! Arrival ticks snap to the receiver's next rising edge, and a
//! `SyncInPort` accepts at most one arrival per receiver cycle. The
//! receiver drives `set_ready`; the value a sender observes is latched
//! one cycle, so not-ready driven on cycle M refuses data that would
//! arrive on cycle M+1. Data landing while the receiver is not ready
//! recirculates, redelivering itself one receiver cycle at a time until
//! ready is seen.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};
use log::debug;

use crate::clock::{clock_crossing_delay, reverse_clock_crossing_delay, Clock};
use crate::events::payload::PayloadHandler;
use crate::events::{PayloadEvent, ScheduleableRef};
use crate::sched::SchedulingPhase;
use crate::utils::DataContainer;
use crate::{Cycle, Tick};

use super::exported::ExportedPort;
use super::port_set::PortSet;
use super::{Direction, InPortCommon, OutPortCommon, Port};

/// Receiving end of a clock-crossing connection.
pub struct SyncInPort<T: Clone + 'static> {
    inp: InPortCommon,
    receive_delay_cycles: Cell<Cycle>,
    receive_delay_ticks: Cell<Tick>,
    delay_set: Cell<bool>,
    /// Tick of the most recent (possibly still pending) arrival.
    prev_arrival: Cell<Option<Tick>>,
    cur_ready: Cell<bool>,
    prev_ready: Cell<bool>,
    set_ready_tick: Cell<Tick>,
    num_in_flight: Cell<u32>,
    forward: PayloadEvent<T>,
    data: DataContainer<T>,
    handler: RefCell<Option<PayloadHandler<T>>>,
}

impl<T: Clone + 'static> SyncInPort<T> {
    pub fn new(port_set: &Rc<PortSet>, name: &str) -> Result<Rc<SyncInPort<T>>> {
        Self::with_phase(port_set, name, SchedulingPhase::PortUpdate)
    }

    pub fn with_phase(
        port_set: &Rc<PortSet>,
        name: &str,
        delivery_phase: SchedulingPhase,
    ) -> Result<Rc<SyncInPort<T>>> {
        let inp = InPortCommon::new(port_set, name, delivery_phase)?;
        let clock = inp.common.clock()?;
        let forward = PayloadEvent::<T>::with_clock(
            &clock,
            &format!("{}_forward_event", name),
            delivery_phase,
            |_: &T| Ok(()),
        )?;
        let port = Rc::new(SyncInPort {
            inp,
            receive_delay_cycles: Cell::new(0),
            receive_delay_ticks: Cell::new(0),
            delay_set: Cell::new(false),
            prev_arrival: Cell::new(None),
            cur_ready: Cell::new(true),
            prev_ready: Cell::new(true),
            set_ready_tick: Cell::new(0),
            num_in_flight: Cell::new(0),
            forward,
            data: DataContainer::new(Rc::downgrade(&clock)),
            handler: RefCell::new(None),
        });
        let weak = Rc::downgrade(&port);
        port.forward.set_handler(move |dat: &T| {
            weak.upgrade()
                .ok_or_else(|| anyhow!("sync in-port dropped with a delivery scheduled"))?
                .forward_data(dat)
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Install the single consumer handler invoked on each arrival.
    pub fn register_consumer_handler(
        &self,
        handler: impl FnMut(&T) -> Result<()> + 'static,
    ) -> Result<()> {
        if self.handler.borrow().is_some() {
            bail!(
                "only one handler is supported on port '{}'",
                self.inp.common.location()
            );
        }
        *self.handler.borrow_mut() = Some(Box::new(handler));
        self.forward
            .set_label(&format!("{}<SyncInPort>", self.inp.common.name()));
        Ok(())
    }

    /// Configure the ready state both latches start from. Only legal
    /// before the simulation first runs.
    pub fn set_initial_ready_state(&self, is_ready: bool) -> Result<()> {
        let scheduler = self.inp.common.scheduler()?;
        if scheduler.is_running() || scheduler.current_tick() != 0 {
            bail!(
                "initial ready state of '{}' must be set before the scheduler runs",
                self.inp.common.location()
            );
        }
        self.cur_ready.set(is_ready);
        self.prev_ready.set(is_ready);
        Ok(())
    }

    /// Drive backpressure. At most one value change per tick; repeats of
    /// the same value are allowed.
    pub fn set_ready(&self, is_ready: bool) -> Result<()> {
        let cur_tick = self.inp.common.scheduler()?.current_tick();
        if cur_tick > self.set_ready_tick.get() {
            self.set_ready_tick.set(cur_tick);
            self.prev_ready.set(self.cur_ready.get());
            self.cur_ready.set(is_ready);
        } else if is_ready != self.cur_ready.get() {
            bail!(
                "double set_ready with differing values in one cycle for '{}'",
                self.inp.common.location()
            );
        }
        Ok(())
    }

    /// The raw (unlatched) ready value.
    pub fn get_ready(&self) -> bool {
        self.cur_ready.get()
    }

    pub fn delivery_phase(&self) -> SchedulingPhase {
        self.inp.delivery_phase()
    }

    pub fn data_received(&self) -> bool {
        self.data.data_received()
    }

    pub fn data_received_this_cycle(&self) -> bool {
        self.data.data_received_this_cycle()
    }

    pub fn pull_data(&self) -> Result<T> {
        self.data.pull_data()
    }

    pub fn peek_data(&self) -> Result<T> {
        self.data.peek_data()
    }

    pub fn clear_data(&self) {
        self.data.clear_data()
    }

    /// The ready value a sender sees: the receiver's drive is latched
    /// one cycle, so a change on this tick exposes the previous value.
    fn latched_ready(&self, cur_tick: Tick) -> bool {
        let set_tick = self.set_ready_tick.get();
        if set_tick == cur_tick && !self.prev_ready.get() {
            return false;
        }
        if set_tick < cur_tick && !self.cur_ready.get() {
            return false;
        }
        true
    }

    fn receiver_period(&self) -> Result<Tick> {
        self.inp.common.clock()?.cycle_to_tick(1)
    }

    fn compute_send_to_receive_delay(
        &self,
        send_clk: &Clock,
        send_delay_cycles: Cycle,
        allow_slide: bool,
        prev_arrival: Option<Tick>,
    ) -> Result<Tick> {
        let cur_tick = self.inp.common.scheduler()?.current_tick();
        let send_ticks = send_clk.cycle_to_tick(send_delay_cycles)?;
        let period = self.receiver_period()?;
        let mut delay = clock_crossing_delay(
            cur_tick,
            send_ticks,
            self.receive_delay_ticks.get(),
            period,
        );
        if allow_slide {
            if let Some(prev) = prev_arrival {
                if cur_tick + delay <= prev {
                    delay = prev + period - cur_tick;
                }
            }
        }
        Ok(delay)
    }

    /// Could data sent now, with the given sender delay, be accepted?
    fn could_accept(&self, send_clk: &Clock, send_delay_cycles: Cycle) -> Result<bool> {
        let scheduler = self.inp.common.scheduler()?;
        let cur_tick = scheduler.current_tick();
        let delay =
            self.compute_send_to_receive_delay(send_clk, send_delay_cycles, false, None)?;
        let arrival = cur_tick + delay;

        let mut accept = self.prev_arrival.get().map_or(true, |prev| arrival > prev);

        if !self.latched_ready(cur_tick) {
            let recv_clock = self.inp.common.clock()?;
            if !send_clk.same_frequency(&recv_clock) {
                bail!(
                    "ready/valid backpressure on '{}' requires matched sender and receiver frequencies",
                    self.inp.common.location()
                );
            }
            if send_delay_cycles != 0 {
                bail!(
                    "ready/valid backpressure on '{}' requires a zero sender delay",
                    self.inp.common.location()
                );
            }
            let port_delay = self.receive_delay_cycles.get();
            if port_delay > 1 {
                bail!(
                    "ready/valid is only supported for zero and one cycle delays (not {}) on '{}'",
                    port_delay,
                    self.inp.common.location()
                );
            }
            // A waiting recirculated packet, or a same-cycle delivery
            // window, leaves no room for new data.
            if self.num_in_flight.get() > 0 || port_delay == 0 {
                accept = false;
            }
        }

        Ok(accept)
    }

    fn raw_ready(&self) -> Result<bool> {
        if self.receive_delay_cycles.get() != 0 {
            bail!(
                "raw ready is only meaningful for zero-cycle connections on '{}'",
                self.inp.common.location()
            );
        }
        Ok(self.cur_ready.get())
    }

    /// Schedule a delivery onto this port; the workhorse behind
    /// `SyncOutPort::send` and recirculation.
    fn send_from(
        &self,
        dat: &T,
        send_clk: &Clock,
        send_delay_cycles: Cycle,
        allow_slide: bool,
    ) -> Result<Tick> {
        let scheduler = self.inp.common.scheduler()?;
        let cur_tick = scheduler.current_tick();
        let period = self.receiver_period()?;

        let delay = self.compute_send_to_receive_delay(
            send_clk,
            send_delay_cycles,
            allow_slide,
            self.prev_arrival.get(),
        )?;
        let arrival = cur_tick + delay;

        // Every destination sees the event on a receiver rising edge.
        if arrival % period != 0 {
            bail!(
                "failed posedge check in '{}': arrival tick {} with period {}",
                self.inp.common.location(),
                arrival,
                period
            );
        }
        if let Some(prev) = self.prev_arrival.get() {
            if arrival <= prev {
                bail!(
                    "'{}': attempt to schedule an arrival for tick {}, not later than the previous \
                     data at tick {}; sync in-ports accept data at most once per cycle",
                    self.inp.common.location(),
                    arrival,
                    prev
                );
            }
        }
        self.prev_arrival.set(Some(arrival));

        if delay == 0 {
            self.inp.check_zero_cycle_delivery(self.forward.phase())?;
        }
        self.forward.schedule_relative_ticks(dat.clone(), delay)?;
        self.num_in_flight.set(self.num_in_flight.get() + 1);
        Ok(delay)
    }

    /// All arrivals land here first, so the port can hold data while the
    /// receiver is not ready; otherwise it goes through to the handler.
    fn forward_data(&self, dat: &T) -> Result<()> {
        let scheduler = self.inp.common.scheduler()?;
        let cur_tick = scheduler.current_tick();

        let in_flight = self.num_in_flight.get();
        if in_flight == 0 {
            bail!(
                "delivery underflow on '{}': more deliveries than sends",
                self.inp.common.location()
            );
        }
        self.num_in_flight.set(in_flight - 1);

        if !self.latched_ready(cur_tick) {
            debug!(
                "'{}' not ready at tick {}; recirculating",
                self.inp.common.location(),
                cur_tick
            );
            let recv_clock = self.inp.common.clock()?;
            self.send_from(dat, &recv_clock, 0, false)?;
            return Ok(());
        }

        self.data.set_data(dat.clone());
        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            handler(dat)?;
        }
        self.inp.schedule_consumers()
    }

    fn complete_bind(&self, out: &Rc<dyn Port>) -> Result<()> {
        self.inp.common.note_bound(out);
        self.inp.order_consumers_after(&self.forward)
    }
}

impl<T: Clone + 'static> Port for SyncInPort<T> {
    fn name(&self) -> String {
        self.inp.common.name().to_string()
    }

    fn location(&self) -> String {
        self.inp.common.location().to_string()
    }

    fn direction(&self) -> Direction {
        Direction::In
    }

    fn clock(&self) -> Option<Rc<Clock>> {
        self.inp.common.clock_opt()
    }

    fn is_bound(&self) -> bool {
        self.inp.common.is_bound()
    }

    fn port_delay(&self) -> Cycle {
        self.receive_delay_cycles.get()
    }

    /// The receive delay may be set once, before binding.
    fn set_port_delay(&self, delay_cycles: Cycle) -> Result<()> {
        if self.is_bound() {
            bail!(
                "cannot set the delay of '{}' after binding; precedence is derived at bind time",
                self.location()
            );
        }
        if self.delay_set.get() {
            bail!(
                "attempt to set the port delay twice for '{}'",
                self.location()
            );
        }
        let ticks = self.inp.common.clock()?.cycle_to_tick(delay_cycles)?;
        self.receive_delay_cycles.set(delay_cycles);
        self.receive_delay_ticks.set(ticks);
        self.delay_set.set(true);
        Ok(())
    }

    fn set_continuing(&self, continuing: bool) {
        self.inp.common.set_continuing(continuing);
        self.forward.set_continuing(continuing);
    }

    fn set_participate_in_auto_precedence(&self, participate: bool) {
        self.inp.common.set_participate(participate);
    }

    fn participates_in_auto_precedence(&self) -> bool {
        self.inp.common.participates()
    }

    fn register_consumer_event(&self, listener: ScheduleableRef) -> Result<()> {
        self.inp.add_consumer(listener)
    }

    fn register_producing_event(&self, producer: ScheduleableRef) -> Result<()> {
        bail!(
            "cannot register producer '{}' on in-port '{}'",
            producer.label(),
            self.location()
        )
    }

    fn bind_to(self: Rc<Self>, other: Rc<dyn Port>) -> Result<()> {
        if let Some(exported) = other.as_any().downcast_ref::<ExportedPort>() {
            return self.bind_to(exported.resolve()?);
        }
        if other.direction() != Direction::Out {
            bail!(
                "attempt to bind '{}' to '{}': both are input ports",
                other.location(),
                self.location()
            );
        }
        other.bind_to(self as Rc<dyn Port>)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Driving end of a clock-crossing connection. Supports exactly one
/// binding.
pub struct SyncOutPort<T: Clone + 'static> {
    out: OutPortCommon,
    bound_in: RefCell<Option<Rc<SyncInPort<T>>>>,
    prev_send_cycle: Cell<Option<Cycle>>,
}

impl<T: Clone + 'static> SyncOutPort<T> {
    pub fn new(port_set: &Rc<PortSet>, name: &str) -> Result<Rc<SyncOutPort<T>>> {
        Self::with_options(port_set, name, true)
    }

    pub fn with_options(
        port_set: &Rc<PortSet>,
        name: &str,
        presume_zero_delay: bool,
    ) -> Result<Rc<SyncOutPort<T>>> {
        let port = Rc::new(SyncOutPort {
            out: OutPortCommon::new(port_set, name, presume_zero_delay)?,
            bound_in: RefCell::new(None),
            prev_send_cycle: Cell::new(None),
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Send with no sender-side delay. Returns the delay in ticks until
    /// arrival.
    pub fn send(&self, dat: T) -> Result<Tick> {
        self.send_full(dat, 0, false)
    }

    pub fn send_in(&self, dat: T, send_delay_cycles: Cycle) -> Result<Tick> {
        self.send_full(dat, send_delay_cycles, false)
    }

    /// Send, pushing the arrival out past any earlier one rather than
    /// faulting on an arrival collision.
    pub fn send_and_allow_slide(&self, dat: T, send_delay_cycles: Cycle) -> Result<Tick> {
        self.send_full(dat, send_delay_cycles, true)
    }

    fn send_full(&self, dat: T, send_delay_cycles: Cycle, allow_slide: bool) -> Result<Tick> {
        let in_port = self.bound()?;
        let clk = self.out.common.clock()?;
        if !clk.is_posedge()? {
            bail!(
                "posedge check failed in '{}': sync sends happen on the sender's rising edge",
                self.out.common.location()
            );
        }
        let send_cycle = clk.current_cycle()? + send_delay_cycles;
        if let Some(prev) = self.prev_send_cycle.get() {
            if send_cycle <= prev {
                bail!(
                    "'{}': trying to send at cycle {}, not later than the previous send cycle {}; \
                     sync out-ports send at most once per cycle",
                    self.out.common.location(),
                    send_cycle,
                    prev
                );
            }
        }
        let delay_ticks = in_port.send_from(&dat, &clk, send_delay_cycles, allow_slide)?;
        self.prev_send_cycle.set(Some(send_cycle));
        Ok(delay_ticks)
    }

    /// Whether data sent with the given delay would be accepted, taking
    /// both latched ready and arrival spacing into account.
    pub fn is_ready(&self, send_delay_cycles: Cycle) -> Result<bool> {
        let in_port = self.bound()?;
        let clk = self.out.common.clock()?;
        in_port.could_accept(&clk, send_delay_cycles)
    }

    /// The ready signal alone, ignoring whether data was already sent.
    pub fn is_ready_now(&self) -> Result<bool> {
        self.bound()?.raw_ready()
    }

    /// The next relative cycle at which a send could go out, assuming
    /// `num_beats` back-to-back beats start at `send_delay_cycles`.
    pub fn compute_next_available_cycle_for_send(
        &self,
        send_delay_cycles: Cycle,
        num_beats: u32,
    ) -> Result<Cycle> {
        let in_port = self.bound()?;
        let clk = self.out.common.clock()?;
        if !clk.is_posedge()? {
            bail!(
                "posedge check failed in '{}'",
                self.out.common.location()
            );
        }
        let current_cycle = clk.current_cycle()?;
        let current_tick = clk.current_tick()?;

        // Walk each beat forward with slide to find where beat N+1 lands.
        let mut prev_arrival = in_port.prev_arrival.get();
        for beat in 0..=u64::from(num_beats) {
            let delay = in_port.compute_send_to_receive_delay(
                &clk,
                send_delay_cycles + beat,
                true,
                prev_arrival,
            )?;
            prev_arrival = Some(current_tick + delay);
        }
        let arrival = prev_arrival.expect("at least one beat was computed");

        let lead = reverse_clock_crossing_delay(
            arrival,
            clk.cycle_to_tick(send_delay_cycles)?,
            in_port.receive_delay_ticks.get(),
            clk.cycle_to_tick(1)?,
        )?;
        let send_tick = arrival - lead;
        let next_send_cycle = clk.tick_to_cycle(send_tick)?;
        if next_send_cycle <= current_cycle {
            bail!(
                "computed next send cycle {} is not in the future (current cycle {})",
                next_send_cycle,
                current_cycle
            );
        }
        Ok(next_send_cycle - current_cycle)
    }

    fn bound(&self) -> Result<Rc<SyncInPort<T>>> {
        self.bound_in
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("port '{}' is not bound", self.out.common.location()))
    }
}

impl<T: Clone + 'static> Port for SyncOutPort<T> {
    fn name(&self) -> String {
        self.out.common.name().to_string()
    }

    fn location(&self) -> String {
        self.out.common.location().to_string()
    }

    fn direction(&self) -> Direction {
        Direction::Out
    }

    fn clock(&self) -> Option<Rc<Clock>> {
        self.out.common.clock_opt()
    }

    fn is_bound(&self) -> bool {
        self.bound_in.borrow().is_some()
    }

    fn set_continuing(&self, continuing: bool) {
        self.out.common.set_continuing(continuing);
        if let Some(in_port) = self.bound_in.borrow().as_ref() {
            in_port.set_continuing(continuing);
        }
    }

    fn set_participate_in_auto_precedence(&self, participate: bool) {
        self.out.common.set_participate(participate);
    }

    fn participates_in_auto_precedence(&self) -> bool {
        self.out.common.participates()
    }

    fn register_consumer_event(&self, listener: ScheduleableRef) -> Result<()> {
        bail!(
            "cannot register consumer '{}' on out-port '{}'",
            listener.label(),
            self.location()
        )
    }

    fn register_producing_event(&self, producer: ScheduleableRef) -> Result<()> {
        self.out.add_producer(producer)
    }

    fn bind_to(self: Rc<Self>, other: Rc<dyn Port>) -> Result<()> {
        if let Some(exported) = other.as_any().downcast_ref::<ExportedPort>() {
            return self.bind_to(exported.resolve()?);
        }
        if self.bound_in.borrow().is_some() {
            bail!(
                "multiple bind attempts on sync port '{}'",
                self.out.common.location()
            );
        }
        self.out.check_bind(&other, true)?;
        let in_port = Rc::clone(&other)
            .as_any_rc()
            .downcast::<SyncInPort<T>>()
            .map_err(|_| {
                anyhow!(
                    "attempt to bind sync ports of disparate types: '{}' to '{}'",
                    other.location(),
                    self.out.common.location()
                )
            })?;

        if in_port.port_delay() == 0 && self.out.presume_zero_delay() {
            self.out
                .emit_zero_delay_edges(&in_port.inp, &in_port.forward)?;
        }

        self.out.common.note_bound(&other);
        *self.bound_in.borrow_mut() = Some(Rc::clone(&in_port));
        in_port.set_continuing(self.out.common.is_continuing());
        let self_dyn: Rc<dyn Port> = self;
        in_port.complete_bind(&self_dyn)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
