// Port Module
// Typed communication endpoints between model components

pub mod bus;
pub mod data;
pub mod exported;
pub mod port_set;
pub mod signal;
pub mod sync;

pub use bus::{Bus, BusSet};
pub use data::{DataInPort, DataOutPort};
pub use exported::ExportedPort;
pub use port_set::PortSet;
pub use signal::{SignalInPort, SignalOutPort};
pub use sync::{SyncInPort, SyncOutPort};

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::events::precedence::{precedes, DagParticipant};
use crate::events::ScheduleableRef;
use crate::sched::{Scheduler, SchedulingPhase};
use crate::Cycle;

/// The direction of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    /// Exported ports defer direction until resolution.
    Unknown,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::In => 0,
            Direction::Out => 1,
            Direction::Unknown => 2,
        }
    }
}

/// The interface every port flavor presents to binding, buses, and port
/// sets. Concrete types recover each other across a bind seam through
/// the `Any`-based downcasts.
pub trait Port {
    fn name(&self) -> String;

    /// Dotted tree path of this port, for diagnostics.
    fn location(&self) -> String;

    fn direction(&self) -> Direction;

    fn clock(&self) -> Option<Rc<Clock>>;

    fn is_bound(&self) -> bool;

    /// Receiver-side delay in cycles. Out ports have none.
    fn port_delay(&self) -> Cycle {
        0
    }

    /// Set the receiver-side delay. Must happen before binding.
    fn set_port_delay(&self, _delay_cycles: Cycle) -> Result<()> {
        Err(anyhow!("port '{}' does not take a delay", self.location()))
    }

    /// Do pending deliveries on this port keep the scheduler running?
    fn set_continuing(&self, continuing: bool);

    fn set_participate_in_auto_precedence(&self, participate: bool);

    fn participates_in_auto_precedence(&self) -> bool;

    /// Add a listener event scheduled whenever data arrives (in ports).
    fn register_consumer_event(&self, listener: ScheduleableRef) -> Result<()>;

    /// Declare an event that drives this port (out ports), so zero-delay
    /// sends order after it.
    fn register_producing_event(&self, producer: ScheduleableRef) -> Result<()>;

    fn bind_to(self: Rc<Self>, other: Rc<dyn Port>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Bind two complementary ports bidirectionally.
pub fn bind(a: &Rc<dyn Port>, b: &Rc<dyn Port>) -> Result<()> {
    Rc::clone(a).bind_to(Rc::clone(b))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared state for concrete port types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct PortCommon {
    name: String,
    location: String,
    clock: RefCell<Weak<Clock>>,
    bound: RefCell<Vec<Weak<dyn Port>>>,
    continuing: Cell<bool>,
    participate: Cell<bool>,
}

impl PortCommon {
    pub(crate) fn new(port_set: &PortSet, name: &str) -> Result<PortCommon> {
        if name.is_empty() {
            bail!("you cannot have an unnamed port");
        }
        let clock = port_set.clock().map(|c| Rc::downgrade(&c)).unwrap_or_default();
        Ok(PortCommon {
            name: name.to_string(),
            location: format!("{}.{}", port_set.location(), name),
            clock: RefCell::new(clock),
            bound: RefCell::new(Vec::new()),
            continuing: Cell::new(true),
            participate: Cell::new(true),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn location(&self) -> &str {
        &self.location
    }

    pub(crate) fn clock(&self) -> Result<Rc<Clock>> {
        self.clock
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("port '{}' has no clock; its node needs one", self.location))
    }

    pub(crate) fn clock_opt(&self) -> Option<Rc<Clock>> {
        self.clock.borrow().upgrade()
    }

    pub(crate) fn scheduler(&self) -> Result<Rc<Scheduler>> {
        self.clock()?.scheduler()
    }

    pub(crate) fn is_bound(&self) -> bool {
        !self.bound.borrow().is_empty()
    }

    pub(crate) fn is_already_bound(&self, peer: &Rc<dyn Port>) -> bool {
        self.bound
            .borrow()
            .iter()
            .any(|w| w.upgrade().is_some_and(|p| Rc::ptr_eq(&p, peer)))
    }

    pub(crate) fn note_bound(&self, peer: &Rc<dyn Port>) {
        self.bound.borrow_mut().push(Rc::downgrade(peer));
    }

    pub(crate) fn is_continuing(&self) -> bool {
        self.continuing.get()
    }

    pub(crate) fn set_continuing(&self, continuing: bool) {
        self.continuing.set(continuing);
    }

    pub(crate) fn set_participate(&self, participate: bool) {
        self.participate.set(participate);
    }

    pub(crate) fn participates(&self) -> bool {
        self.participate.get()
    }
}

pub(crate) struct InPortCommon {
    pub(crate) common: PortCommon,
    delivery_phase: SchedulingPhase,
    consumers: RefCell<Vec<ScheduleableRef>>,
}

impl InPortCommon {
    pub(crate) fn new(
        port_set: &PortSet,
        name: &str,
        delivery_phase: SchedulingPhase,
    ) -> Result<InPortCommon> {
        Ok(InPortCommon {
            common: PortCommon::new(port_set, name)?,
            delivery_phase,
            consumers: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn delivery_phase(&self) -> SchedulingPhase {
        self.delivery_phase
    }

    /// Listener registration window closes at bind time: the ordering
    /// edges for listeners are emitted exactly once, when the bind
    /// happens.
    pub(crate) fn add_consumer(&self, listener: ScheduleableRef) -> Result<()> {
        if self.common.is_bound() {
            bail!(
                "cannot register consuming event '{}' after port '{}' is bound; \
                 register it at construction time (or disable auto-precedence participation)",
                listener.label(),
                self.common.location()
            );
        }
        self.consumers.borrow_mut().push(listener);
        Ok(())
    }

    /// For a delivery landing on the current tick, the delivery phase
    /// must not already have passed.
    pub(crate) fn check_zero_cycle_delivery(&self, delivery_phase: SchedulingPhase) -> Result<()> {
        let scheduler = self.common.scheduler()?;
        if scheduler.is_running() && delivery_phase < scheduler.current_phase() {
            bail!(
                "zero-cycle send into '{}' cannot work: its delivery phase {} is earlier than the \
                 current phase {} (driven from '{}'); move the handler to a later phase or add a \
                 cycle of port delay",
                self.common.location(),
                delivery_phase,
                scheduler.current_phase(),
                scheduler.current_firing_label().unwrap_or_default()
            );
        }
        Ok(())
    }

    /// Edges from the internal delivery to each same-phase listener.
    pub(crate) fn order_consumers_after(&self, delivery: &dyn DagParticipant) -> Result<()> {
        for consumer in self.consumers.borrow().iter() {
            if consumer.phase() == delivery.dag_phase() {
                precedes(delivery, consumer)?;
            }
        }
        Ok(())
    }

    /// Schedule every registered listener for the current tick.
    pub(crate) fn schedule_consumers(&self) -> Result<()> {
        for consumer in self.consumers.borrow().iter() {
            consumer.core.schedule_cycles(0)?;
        }
        Ok(())
    }
}

pub(crate) struct OutPortCommon {
    pub(crate) common: PortCommon,
    presume_zero_delay: Cell<bool>,
    producers: RefCell<Vec<ScheduleableRef>>,
}

impl OutPortCommon {
    pub(crate) fn new(
        port_set: &PortSet,
        name: &str,
        presume_zero_delay: bool,
    ) -> Result<OutPortCommon> {
        Ok(OutPortCommon {
            common: PortCommon::new(port_set, name)?,
            presume_zero_delay: Cell::new(presume_zero_delay),
            producers: RefCell::new(Vec::new()),
        })
    }

    pub(crate) fn presume_zero_delay(&self) -> bool {
        self.presume_zero_delay.get()
    }

    pub(crate) fn add_producer(&self, producer: ScheduleableRef) -> Result<()> {
        if self.common.is_bound() {
            bail!(
                "cannot register producing event '{}' after port '{}' is bound; \
                 register it at construction time (or disable auto-precedence participation)",
                producer.label(),
                self.common.location()
            );
        }
        self.producers.borrow_mut().push(producer);
        Ok(())
    }

    /// Sanity checks shared by every out-port bind.
    pub(crate) fn check_bind(&self, in_port: &Rc<dyn Port>, sync: bool) -> Result<()> {
        if in_port.direction() != Direction::In {
            bail!(
                "attempt to bind '{}' to '{}': both are output ports",
                in_port.location(),
                self.common.location()
            );
        }
        if self.common.is_already_bound(in_port) {
            bail!(
                "port '{}' is already bound to '{}'",
                self.common.location(),
                in_port.location()
            );
        }
        if !sync {
            let my_clock = self.common.clock()?;
            let in_clock = in_port
                .clock()
                .ok_or_else(|| anyhow!("port '{}' has no clock", in_port.location()))?;
            if !my_clock.same_frequency(&in_clock) {
                bail!(
                    "trying to bind two ports on clocks of different frequency ('{}' vs '{}'); \
                     use sync ports across clock domains",
                    self.common.location(),
                    in_port.location()
                );
            }
        }
        Ok(())
    }

    /// Zero-delay auto-precedence: order every registered producer ahead
    /// of the in-port's internal delivery and its same-phase listeners.
    pub(crate) fn emit_zero_delay_edges(
        &self,
        in_common: &InPortCommon,
        delivery: &dyn DagParticipant,
    ) -> Result<()> {
        for producer in self.producers.borrow().iter() {
            for consumer in in_common.consumers.borrow().iter() {
                if producer.core.vertex() == consumer.core.vertex() {
                    bail!(
                        "'{}' is registered as a producer of '{}' and, at the same time, \
                         a consumer of '{}'",
                        producer.label(),
                        self.common.location(),
                        in_common.common.location()
                    );
                }
                if producer.phase() == consumer.phase() {
                    precedes(producer, consumer)?;
                }
            }
            if producer.phase() == delivery.dag_phase() {
                precedes(producer, delivery)?;
            }
        }
        Ok(())
    }
}
