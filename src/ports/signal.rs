//! Dataless pulse ports.
//!
//! Signal ports carry no payload; the in-port records the pulse (with a
//! timestamp) and notifies its consumer. The internal delivery event is
//! unique per tick, so any number of pulses landing on one tick collapse
//! into a single notification.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::events::scheduleable::{DatalessHandler, ScheduleableCore, UniquenessPolicy};
use crate::events::ScheduleableRef;
use crate::sched::SchedulingPhase;
use crate::utils::DataContainer;
use crate::Cycle;

use super::exported::ExportedPort;
use super::port_set::PortSet;
use super::{Direction, InPortCommon, OutPortCommon, Port};

/// Receiving end of a pulse connection.
pub struct SignalInPort {
    inp: InPortCommon,
    port_delay: Cell<Cycle>,
    delivery: Rc<ScheduleableCore>,
    data: DataContainer<bool>,
    handler: RefCell<Option<DatalessHandler>>,
}

impl SignalInPort {
    /// Create with the default delivery phase: `Tick` for zero-delay
    /// ports, `PortUpdate` otherwise.
    pub fn new(port_set: &Rc<PortSet>, name: &str, delay: Cycle) -> Result<Rc<SignalInPort>> {
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
    ) -> Result<Rc<SignalInPort>> {
        let inp = InPortCommon::new(port_set, name, delivery_phase)?;
        let clock = inp.common.clock()?;
        let delivery = ScheduleableCore::new(
            &clock,
            &format!("{}_forward_event", name),
            delivery_phase,
            UniquenessPolicy::Unique,
            None,
        )?;
        let port = Rc::new(SignalInPort {
            inp,
            port_delay: Cell::new(delay),
            delivery,
            data: DataContainer::new(Rc::downgrade(&clock)),
            handler: RefCell::new(None),
        });
        let weak = Rc::downgrade(&port);
        port.delivery.set_handler(Box::new(move || {
            weak.upgrade()
                .ok_or_else(|| anyhow!("signal in-port dropped with a delivery scheduled"))?
                .receive()
        }));
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Install the single consumer handler invoked on each pulse.
    pub fn register_consumer_handler(
        &self,
        handler: impl FnMut() -> Result<()> + 'static,
    ) -> Result<()> {
        if self.handler.borrow().is_some() {
            bail!(
                "only one handler is supported on port '{}'",
                self.inp.common.location()
            );
        }
        *self.handler.borrow_mut() = Some(Box::new(handler));
        self.delivery
            .set_label(&format!("{}<SignalInPort>", self.inp.common.name()));
        Ok(())
    }

    pub fn delivery_phase(&self) -> SchedulingPhase {
        self.inp.delivery_phase()
    }

    /// Did a pulse ever land (and not get cleared)?
    pub fn signal_received(&self) -> bool {
        self.data.data_received()
    }

    pub fn signal_received_this_cycle(&self) -> bool {
        self.data.data_received_this_cycle()
    }

    pub fn clear_signal(&self) {
        self.data.clear_data()
    }

    pub fn received_time_stamp(&self) -> Result<Cycle> {
        self.data.received_time_stamp()
    }

    pub(crate) fn deliver_from(&self, rel_time: Cycle) -> Result<()> {
        let total = rel_time + self.port_delay.get();
        if total == 0 {
            self.inp.check_zero_cycle_delivery(self.delivery.phase())?;
            let scheduler = self.inp.common.scheduler()?;
            if scheduler.is_running() && scheduler.current_phase() == self.delivery.phase() {
                return self.receive();
            }
        }
        self.delivery.schedule_cycles(total)
    }

    fn receive(&self) -> Result<()> {
        self.data.set_data(true);
        if let Some(handler) = self.handler.borrow_mut().as_mut() {
            handler()?;
        }
        self.inp.schedule_consumers()
    }

    fn delivery_ref(&self) -> ScheduleableRef {
        ScheduleableRef {
            core: Rc::clone(&self.delivery),
        }
    }

    fn complete_bind(&self, out: &Rc<dyn Port>) -> Result<()> {
        self.inp.common.note_bound(out);
        self.inp.order_consumers_after(&self.delivery_ref())
    }
}

impl Port for SignalInPort {
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
        self.delivery.set_continuing(continuing);
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

/// Driving end of a pulse connection.
pub struct SignalOutPort {
    out: OutPortCommon,
    bound_in: RefCell<Vec<Rc<SignalInPort>>>,
}

impl SignalOutPort {
    pub fn new(port_set: &Rc<PortSet>, name: &str) -> Result<Rc<SignalOutPort>> {
        Self::with_options(port_set, name, true)
    }

    pub fn with_options(
        port_set: &Rc<PortSet>,
        name: &str,
        presume_zero_delay: bool,
    ) -> Result<Rc<SignalOutPort>> {
        let port = Rc::new(SignalOutPort {
            out: OutPortCommon::new(port_set, name, presume_zero_delay)?,
            bound_in: RefCell::new(Vec::new()),
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Pulse every bound in-port after `rel_time` cycles.
    pub fn send(&self, rel_time: Cycle) -> Result<()> {
        let bound = self.bound_in.borrow();
        if bound.is_empty() {
            bail!(
                "attempt to send on unbound port '{}'",
                self.out.common.location()
            );
        }
        for in_port in bound.iter() {
            in_port.deliver_from(rel_time)?;
        }
        Ok(())
    }
}

impl Port for SignalOutPort {
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
            .downcast::<SignalInPort>()
            .map_err(|_| {
                anyhow!(
                    "attempt to bind to something that is not a SignalInPort: '{}' to '{}'",
                    other.location(),
                    self.out.common.location()
                )
            })?;

        if in_port.port_delay() == 0 && self.out.presume_zero_delay() {
            self.out
                .emit_zero_delay_edges(&in_port.inp, &in_port.delivery_ref())?;
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
