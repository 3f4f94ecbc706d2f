// Event types: schedulable units of work with phase and uniqueness rules

pub mod event_set;
pub mod payload;
pub mod precedence;
pub mod scheduleable;

pub use event_set::EventSet;
pub use payload::{PayloadEvent, PayloadHandle};
pub use scheduleable::ScheduleableRef;

use std::rc::Rc;

use anyhow::Result;

use crate::sched::dag::VertexId;
use crate::sched::{Scheduler, SchedulingPhase};
use crate::Cycle;
use precedence::DagParticipant;
use scheduleable::{DatalessHandler, ScheduleableCore, UniquenessPolicy};

macro_rules! common_event_api {
    () => {
        /// Schedule using the default delay configured on this event.
        pub fn schedule(&self) -> Result<()> {
            self.core.schedule_default()
        }

        /// Schedule `delay_cycles` of this event's clock from now.
        pub fn schedule_in(&self, delay_cycles: Cycle) -> Result<()> {
            self.core.schedule_cycles(delay_cycles)
        }

        /// Cancel every pending occurrence.
        pub fn cancel(&self) -> Result<u32> {
            self.core.cancel_all()
        }

        /// Cancel occurrences exactly `delay_cycles` from now.
        pub fn cancel_at(&self, delay_cycles: Cycle) -> Result<u32> {
            self.core.cancel_at_cycles(delay_cycles)
        }

        pub fn is_scheduled(&self) -> bool {
            self.core.is_scheduled()
        }

        pub fn is_scheduled_at(&self, delay_cycles: Cycle) -> Result<bool> {
            self.core.is_scheduled_at_cycles(delay_cycles)
        }

        pub fn label(&self) -> String {
            self.core.label()
        }

        pub fn set_label(&self, label: &str) {
            self.core.set_label(label);
        }

        pub fn phase(&self) -> SchedulingPhase {
            self.core.phase()
        }

        /// Whether pending occurrences keep the scheduler's run loop alive.
        pub fn set_continuing(&self, continuing: bool) {
            self.core.set_continuing(continuing);
        }

        pub fn set_default_delay(&self, delay_cycles: Cycle) {
            self.core.set_default_delay(delay_cycles);
        }

        /// Opaque reference for listener registration on ports.
        pub fn scheduleable(&self) -> ScheduleableRef {
            ScheduleableRef {
                core: Rc::clone(&self.core),
            }
        }
    };
}

macro_rules! impl_dag_participant {
    ($ty:ty) => {
        impl DagParticipant for $ty {
            fn dag_vertex(&self) -> VertexId {
                self.core.vertex()
            }

            fn dag_phase(&self) -> SchedulingPhase {
                self.core.phase()
            }

            fn dag_scheduler(&self) -> Result<Rc<Scheduler>> {
                self.core.scheduler()
            }

            fn dag_label(&self) -> String {
                self.core.label()
            }
        }
    };
}

/// An event with no uniqueness constraint: every schedule call produces
/// a distinct firing, any non-negative delay.
#[derive(Clone)]
pub struct Event {
    core: Rc<ScheduleableCore>,
}

impl Event {
    pub fn new(
        event_set: &EventSet,
        name: &str,
        phase: SchedulingPhase,
        handler: impl FnMut() -> Result<()> + 'static,
    ) -> Result<Event> {
        let core = ScheduleableCore::new(
            &event_set.clock()?,
            name,
            phase,
            UniquenessPolicy::Repeatable,
            Some(Box::new(handler) as DatalessHandler),
        )?;
        event_set.register(phase, name);
        Ok(Event { core })
    }

    common_event_api!();
}

/// An event that fires at most once per tick: repeat schedule requests
/// for the same target tick coalesce silently, and re-scheduling for the
/// tick in which its handler already fired is an error.
#[derive(Clone)]
pub struct UniqueEvent {
    core: Rc<ScheduleableCore>,
}

impl UniqueEvent {
    pub fn new(
        event_set: &EventSet,
        name: &str,
        phase: SchedulingPhase,
        handler: impl FnMut() -> Result<()> + 'static,
    ) -> Result<UniqueEvent> {
        let core = ScheduleableCore::new(
            &event_set.clock()?,
            name,
            phase,
            UniquenessPolicy::Unique,
            Some(Box::new(handler) as DatalessHandler),
        )?;
        event_set.register(phase, name);
        Ok(UniqueEvent { core })
    }

    common_event_api!();
}

/// A unique event whose delay is fixed at exactly one cycle. Most unique
/// events reschedule themselves for the next cycle; pinning the delay
/// skips the general already-scheduled probe on that hot path.
#[derive(Clone)]
pub struct SingleCycleUniqueEvent {
    core: Rc<ScheduleableCore>,
}

impl SingleCycleUniqueEvent {
    pub fn new(
        event_set: &EventSet,
        name: &str,
        phase: SchedulingPhase,
        handler: impl FnMut() -> Result<()> + 'static,
    ) -> Result<SingleCycleUniqueEvent> {
        let core = ScheduleableCore::new(
            &event_set.clock()?,
            name,
            phase,
            UniquenessPolicy::SingleCycleUnique,
            Some(Box::new(handler) as DatalessHandler),
        )?;
        event_set.register(phase, name);
        Ok(SingleCycleUniqueEvent { core })
    }

    /// Schedule for exactly one cycle from now. This flavor accepts no
    /// other delay.
    pub fn schedule(&self) -> Result<()> {
        self.core.schedule_cycles(1)
    }

    pub fn cancel(&self) -> Result<u32> {
        self.core.cancel_all()
    }

    pub fn is_scheduled(&self) -> bool {
        self.core.is_scheduled()
    }

    pub fn label(&self) -> String {
        self.core.label()
    }

    pub fn phase(&self) -> SchedulingPhase {
        self.core.phase()
    }

    pub fn set_continuing(&self, continuing: bool) {
        self.core.set_continuing(continuing);
    }

    pub fn scheduleable(&self) -> ScheduleableRef {
        ScheduleableRef {
            core: Rc::clone(&self.core),
        }
    }
}

impl_dag_participant!(Event);
impl_dag_participant!(UniqueEvent);
impl_dag_participant!(SingleCycleUniqueEvent);
impl_dag_participant!(ScheduleableRef);
