//! The uniform record behind every schedulable unit of work.
//!
//! Concrete event flavors differ only in their uniqueness policy and
//! delay rules, so they share one core record carrying the handler, the
//! phase, the owning clock and scheduler, and the DAG vertex identity.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::sched::dag::VertexId;
use crate::sched::{EntryState, Scheduler, SchedulingPhase};
use crate::{Cycle, Tick};

/// How repeat schedule requests for the same `(tick, phase)` are treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum UniquenessPolicy {
    /// Unbounded repeats per tick.
    Repeatable,
    /// At most one firing per tick; duplicates coalesce silently.
    Unique,
    /// Unique, and the delay is fixed at exactly one cycle.
    SingleCycleUnique,
}

pub(crate) type DatalessHandler = Box<dyn FnMut() -> Result<()>>;

struct PendingInstance {
    tick: Tick,
    state: Rc<EntryState>,
}

pub(crate) struct ScheduleableCore {
    label: RefCell<String>,
    phase: SchedulingPhase,
    default_delay: Cell<Cycle>,
    clock: RefCell<Weak<Clock>>,
    scheduler: RefCell<Weak<Scheduler>>,
    vertex: VertexId,
    continuing: Cell<bool>,
    policy: UniquenessPolicy,
    handler: RefCell<Option<DatalessHandler>>,
    pending: RefCell<Vec<PendingInstance>>,
    last_fired: Cell<Option<Tick>>,
    self_weak: RefCell<Weak<ScheduleableCore>>,
}

impl ScheduleableCore {
    /// Create a core with its own DAG vertex.
    pub(crate) fn new(
        clock: &Rc<Clock>,
        label: &str,
        phase: SchedulingPhase,
        policy: UniquenessPolicy,
        handler: Option<DatalessHandler>,
    ) -> Result<Rc<ScheduleableCore>> {
        let scheduler = clock.scheduler()?;
        let vertex = scheduler.new_vertex(label, phase)?;
        Ok(Self::with_vertex(clock, &scheduler, label, phase, policy, handler, vertex))
    }

    /// Create a core that shares an existing vertex (payload proxies all
    /// drain under their prototype's DAG position).
    pub(crate) fn with_vertex(
        clock: &Rc<Clock>,
        scheduler: &Rc<Scheduler>,
        label: &str,
        phase: SchedulingPhase,
        policy: UniquenessPolicy,
        handler: Option<DatalessHandler>,
        vertex: VertexId,
    ) -> Rc<ScheduleableCore> {
        let core = Rc::new(ScheduleableCore {
            label: RefCell::new(label.to_string()),
            phase,
            default_delay: Cell::new(0),
            clock: RefCell::new(Rc::downgrade(clock)),
            scheduler: RefCell::new(Rc::downgrade(scheduler)),
            vertex,
            continuing: Cell::new(true),
            policy,
            handler: RefCell::new(handler),
            pending: RefCell::new(Vec::new()),
            last_fired: Cell::new(None),
            self_weak: RefCell::new(Weak::new()),
        });
        *core.self_weak.borrow_mut() = Rc::downgrade(&core);
        core
    }

    pub(crate) fn label(&self) -> String {
        self.label.borrow().clone()
    }

    pub(crate) fn set_label(&self, label: &str) {
        *self.label.borrow_mut() = label.to_string();
        if let Some(s) = self.scheduler.borrow().upgrade() {
            if !s.is_finalized() {
                s.rename_vertex(self.vertex, label);
            }
        }
    }

    pub(crate) fn phase(&self) -> SchedulingPhase {
        self.phase
    }

    pub(crate) fn vertex(&self) -> VertexId {
        self.vertex
    }

    pub(crate) fn policy(&self) -> UniquenessPolicy {
        self.policy
    }

    pub(crate) fn is_continuing(&self) -> bool {
        self.continuing.get()
    }

    pub(crate) fn set_continuing(&self, continuing: bool) {
        self.continuing.set(continuing);
    }

    pub(crate) fn set_default_delay(&self, cycles: Cycle) {
        self.default_delay.set(cycles);
    }

    pub(crate) fn set_handler(&self, handler: DatalessHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }

    pub(crate) fn clock(&self) -> Result<Rc<Clock>> {
        self.clock
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("clock for '{}' is gone", self.label()))
    }

    pub(crate) fn scheduler(&self) -> Result<Rc<Scheduler>> {
        self.scheduler
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for '{}' is gone", self.label()))
    }

    // ────────────────────────────────────────────────────────────────────
    // Scheduling and cancellation
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn schedule_default(&self) -> Result<()> {
        self.schedule_cycles(self.default_delay.get())
    }

    pub(crate) fn schedule_cycles(&self, delay_cycles: Cycle) -> Result<()> {
        let rel_ticks = self.clock()?.cycle_to_tick(delay_cycles)?;
        self.schedule_relative_ticks(rel_ticks)
    }

    pub(crate) fn schedule_relative_ticks(&self, rel_ticks: Tick) -> Result<()> {
        let me = self
            .self_weak
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("schedulable '{}' is being torn down", self.label()))?;
        self.scheduler()?.schedule_entry(&me, rel_ticks)
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    pub(crate) fn is_scheduled_at_cycles(&self, delay_cycles: Cycle) -> Result<bool> {
        let rel_ticks = self.clock()?.cycle_to_tick(delay_cycles)?;
        Ok(self.is_pending_at(self.scheduler()?.current_tick() + rel_ticks))
    }

    /// Cancel every future occurrence; returns how many were cancelled.
    pub(crate) fn cancel_all(&self) -> Result<u32> {
        let scheduler = self.scheduler()?;
        let drained: Vec<PendingInstance> = self.pending.borrow_mut().drain(..).collect();
        for instance in &drained {
            scheduler.retire_cancelled(&instance.state);
        }
        Ok(drained.len() as u32)
    }

    /// Cancel occurrences at exactly `delay_cycles` from now.
    pub(crate) fn cancel_at_cycles(&self, delay_cycles: Cycle) -> Result<u32> {
        let scheduler = self.scheduler()?;
        let target = scheduler.current_tick() + self.clock()?.cycle_to_tick(delay_cycles)?;
        let mut cancelled = 0;
        self.pending.borrow_mut().retain(|instance| {
            if instance.tick == target {
                scheduler.retire_cancelled(&instance.state);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        Ok(cancelled)
    }

    // ────────────────────────────────────────────────────────────────────
    // Scheduler-side bookkeeping
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn note_scheduled(&self, tick: Tick, state: Rc<EntryState>) {
        self.pending.borrow_mut().push(PendingInstance { tick, state });
    }

    pub(crate) fn note_fired(&self, tick: Tick, state: &Rc<EntryState>) {
        self.pending
            .borrow_mut()
            .retain(|instance| !Rc::ptr_eq(&instance.state, state));
        self.last_fired.set(Some(tick));
    }

    pub(crate) fn last_fired_tick(&self) -> Option<Tick> {
        self.last_fired.get()
    }

    pub(crate) fn is_pending_at(&self, tick: Tick) -> bool {
        self.pending
            .borrow()
            .iter()
            .any(|instance| instance.tick == tick && !instance.state.is_cancelled())
    }

    /// Invoke the handler. Called only by the scheduler's drain.
    pub(crate) fn invoke(&self) -> Result<()> {
        let mut handler = self.handler.borrow_mut();
        match handler.as_mut() {
            Some(f) => f(),
            None => bail!("schedulable '{}' fired with no handler installed", self.label()),
        }
    }
}

/// Opaque, clonable reference to a schedulable used where heterogeneous
/// event flavors must be treated uniformly (port listener registration).
#[derive(Clone)]
pub struct ScheduleableRef {
    pub(crate) core: Rc<ScheduleableCore>,
}

impl ScheduleableRef {
    pub fn label(&self) -> String {
        self.core.label()
    }

    pub fn phase(&self) -> SchedulingPhase {
        self.core.phase()
    }
}
