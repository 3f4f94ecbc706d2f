//! Typed payload ports within one clock domain.
//!
//! A `DataOutPort<T>` fans a value out to every bound `DataInPort<T>`.
//! Delivery lands `send_delay + port_delay` cycles later through the
//! in-port's internal payload event; a zero total delay delivers within
//! the sending tick, inline when the delivery phase is already current.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::events::payload::PayloadHandler;
use crate::events::{PayloadEvent, ScheduleableRef};
use crate::sched::SchedulingPhase;
use crate::utils::DataContainer;
use crate::Cycle;

use super::exported::ExportedPort;
use super::port_set::PortSet;
use super::{Direction, InPortCommon, OutPortCommon, Port};

/// Receiving end of a typed data connection.
pub struct DataInPort<T: Clone + 'static> {
    inp: InPortCommon,
    port_delay: Cell<Cycle>,
    forward: PayloadEvent<T>,
    data: DataContainer<T>,
    handler: RefCell<Option<PayloadHandler<T>>>,
}

impl<T: Clone + 'static> DataInPort<T> {
    /// Create with the default delivery phase: `Tick` for zero-delay
    /// ports, `PortUpdate` otherwise.
    pub fn new(port_set: &Rc<PortSet>, name: &str, delay: Cycle) -> Result<Rc<DataInPort<T>>> {
        let phase = if delay == 0 {
            SchedulingPhase::Tick
        } else {
            SchedulingPhase::PortUpdate
        };
        Self::with_phase(port_set, name, phase, delay)
    }

    pub fn with_phase(
        port_set: &Rc<PortSet>,
        name: &str,
        delivery_phase: SchedulingPhase,
        delay: Cycle,
    ) -> Result<Rc<DataInPort<T>>> {
        let inp = InPortCommon::new(port_set, name, delivery_phase)?;
        let clock = inp.common.clock()?;
        let forward = PayloadEvent::<T>::with_clock(
            &clock,
            &format!("{}_forward_event", name),
            delivery_phase,
            |_: &T| Ok(()),
        )?;
        let port = Rc::new(DataInPort {
            inp,
            port_delay: Cell::new(delay),
            forward,
            data: DataContainer::new(Rc::downgrade(&clock)),
            handler: RefCell::new(None),
        });
        let weak = Rc::downgrade(&port);
        port.forward.set_handler(move |dat: &T| {
            weak.upgrade()
                .ok_or_else(|| anyhow!("data in-port dropped with a delivery scheduled"))?
                .receive(dat)
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
            .set_label(&format!("{}<DataInPort>", self.inp.common.name()));
        Ok(())
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

    pub fn received_time_stamp(&self) -> Result<Cycle> {
        self.data.received_time_stamp()
    }

    /// Is a delivery pending exactly `rel_cycles` from now?
    pub fn is_driven_at(&self, rel_cycles: Cycle) -> Result<bool> {
        self.forward.is_scheduled_at(rel_cycles)
    }

    pub fn is_driven(&self) -> bool {
        self.forward.is_scheduled()
    }

    pub(crate) fn deliver_from(&self, dat: &T, rel_cycles: Cycle) -> Result<()> {
        let total = rel_cycles + self.port_delay.get();
        if total == 0 {
            self.inp.check_zero_cycle_delivery(self.forward.phase())?;
            let scheduler = self.inp.common.scheduler()?;
            if scheduler.is_running() && scheduler.current_phase() == self.forward.phase() {
                return self.receive(dat);
            }
        }
        self.forward.schedule(dat.clone(), total)
    }

    fn receive(&self, dat: &T) -> Result<()> {
        self.data.set_data(dat.clone());
        // The consumer handler always runs before listeners fire.
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

impl<T: Clone + 'static> Port for DataInPort<T> {
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
        self.port_delay.get()
    }

    fn set_port_delay(&self, delay_cycles: Cycle) -> Result<()> {
        if self.is_bound() {
            bail!(
                "cannot set the delay of '{}' after binding; precedence is derived at bind time",
                self.location()
            );
        }
        self.port_delay.set(delay_cycles);
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

/// Driving end of a typed data connection.
pub struct DataOutPort<T: Clone + 'static> {
    out: OutPortCommon,
    bound_in: RefCell<Vec<Rc<DataInPort<T>>>>,
}

impl<T: Clone + 'static> DataOutPort<T> {
    pub fn new(port_set: &Rc<PortSet>, name: &str) -> Result<Rc<DataOutPort<T>>> {
        Self::with_options(port_set, name, true)
    }

    pub fn with_options(
        port_set: &Rc<PortSet>,
        name: &str,
        presume_zero_delay: bool,
    ) -> Result<Rc<DataOutPort<T>>> {
        let port = Rc::new(DataOutPort {
            out: OutPortCommon::new(port_set, name, presume_zero_delay)?,
            bound_in: RefCell::new(Vec::new()),
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Send with no sender-side delay.
    pub fn send(&self, dat: T) -> Result<()> {
        self.send_in(dat, 0)
    }

    /// Send `rel_cycles` of the sending clock from now. Every bound
    /// in-port adds its own port delay on top.
    pub fn send_in(&self, dat: T, rel_cycles: Cycle) -> Result<()> {
        let bound = self.bound_in.borrow();
        if bound.is_empty() {
            bail!(
                "attempt to send data on unbound port '{}'",
                self.out.common.location()
            );
        }
        for in_port in bound.iter() {
            in_port.deliver_from(&dat, rel_cycles)?;
        }
        Ok(())
    }

    /// Is any bound in-port due a delivery exactly `rel_cycles` out?
    pub fn is_driven_at(&self, rel_cycles: Cycle) -> Result<bool> {
        for in_port in self.bound_in.borrow().iter() {
            if in_port.is_driven_at(rel_cycles)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn is_driven(&self) -> bool {
        self.bound_in.borrow().iter().any(|p| p.is_driven())
    }
}

impl<T: Clone + 'static> Port for DataOutPort<T> {
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
        self.out.common.is_bound()
    }

    fn set_continuing(&self, continuing: bool) {
        self.out.common.set_continuing(continuing);
        for in_port in self.bound_in.borrow().iter() {
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
        self.out.check_bind(&other, false)?;
        let in_port = Rc::clone(&other)
            .as_any_rc()
            .downcast::<DataInPort<T>>()
            .map_err(|_| {
                anyhow!(
                    "attempt to bind data ports of disparate types: '{}' to '{}'",
                    other.location(),
                    self.out.common.location()
                )
            })?;

        if in_port.port_delay() == 0 && self.out.presume_zero_delay() {
            self.out.emit_zero_delay_edges(&in_port.inp, &in_port.forward)?;
        }

        self.out.common.note_bound(&other);
        self.bound_in.borrow_mut().push(Rc::clone(&in_port));
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
