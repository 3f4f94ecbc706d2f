// Scheduler Module
// Virtual-time tick queue with phased execution and DAG-ordered draining

pub mod dag;
pub mod phase;

pub use phase::{SchedulingPhase, NUM_SCHEDULING_PHASES};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BinaryHeap};
use std::cmp::Ordering;
use std::rc::Rc;

use anyhow::{bail, Context, Result};
use log::{debug, info};

use crate::events::scheduleable::{ScheduleableCore, UniquenessPolicy};
use crate::Tick;
use dag::{Dag, VertexId};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue entries
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared state of one scheduled occurrence. Cancellation tombstones the
/// entry in place; the drain skips tombstones silently.
pub(crate) struct EntryState {
    cancelled: Cell<bool>,
    /// Whether this occurrence currently counts toward the keep-alive
    /// total. Cleared exactly once, on fire or on cancel.
    counted: Cell<bool>,
}

impl EntryState {
    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

struct QueueEntry {
    priority: u32,
    seq: u64,
    core: Rc<ScheduleableCore>,
    state: Rc<EntryState>,
}

impl QueueEntry {
    fn key(&self) -> (u32, u64) {
        (self.priority, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Inverted so the std max-heap pops the smallest (priority, seq).
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

struct TickQuantum {
    phases: [BinaryHeap<QueueEntry>; NUM_SCHEDULING_PHASES],
}

impl TickQuantum {
    fn new() -> Self {
        TickQuantum {
            phases: std::array::from_fn(|_| BinaryHeap::new()),
        }
    }

    fn is_empty(&self) -> bool {
        self.phases.iter().all(|h| h.is_empty())
    }
}

struct FiringContext {
    label: String,
    phase: SchedulingPhase,
    priority: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drives simulated time forward: advances to the next tick with work,
/// walks the seven phases in order, and within each phase drains ready
/// entries by the priority their DAG vertex received at finalization.
///
/// The scheduler is shared as `Rc<Scheduler>` and is single-threaded by
/// construction; handlers run one at a time and may re-enter only through
/// scheduling and cancellation calls.
pub struct Scheduler {
    name: String,
    current_tick: Cell<Tick>,
    current_phase: Cell<SchedulingPhase>,
    running: Cell<bool>,
    finalized: Cell<bool>,
    queue: RefCell<BTreeMap<Tick, TickQuantum>>,
    dag: RefCell<Dag>,
    /// Insertion sequence; makes same-priority draining reproducible.
    next_seq: Cell<u64>,
    /// Pending occurrences whose owner keeps the simulation alive.
    continuing_pending: Cell<u64>,
    events_fired: Cell<u64>,
    firing: RefCell<Option<FiringContext>>,
}

impl Scheduler {
    pub fn new(name: &str) -> Rc<Scheduler> {
        Rc::new(Scheduler {
            name: name.to_string(),
            current_tick: Cell::new(0),
            current_phase: Cell::new(SchedulingPhase::Trigger),
            running: Cell::new(false),
            finalized: Cell::new(false),
            queue: RefCell::new(BTreeMap::new()),
            dag: RefCell::new(Dag::new()),
            next_seq: Cell::new(0),
            continuing_pending: Cell::new(0),
            events_fired: Cell::new(0),
            firing: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The absolute tick counter. Tick 0 is pre-simulation.
    pub fn current_tick(&self) -> Tick {
        self.current_tick.get()
    }

    /// The phase currently draining. Meaningful only while running.
    pub fn current_phase(&self) -> SchedulingPhase {
        self.current_phase.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.get()
    }

    /// Total handlers invoked across all runs.
    pub fn events_fired(&self) -> u64 {
        self.events_fired.get()
    }

    /// Label of the handler currently being invoked, if any.
    pub fn current_firing_label(&self) -> Option<String> {
        self.firing.borrow().as_ref().map(|f| f.label.clone())
    }

    // ────────────────────────────────────────────────────────────────────
    // DAG construction (setup time only)
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn new_vertex(&self, label: &str, phase: SchedulingPhase) -> Result<VertexId> {
        if self.finalized.get() {
            bail!(
                "cannot create schedulable '{}' after the scheduler is finalized",
                label
            );
        }
        Ok(self.dag.borrow_mut().new_vertex(label, phase))
    }

    pub(crate) fn add_precedence_edge(&self, source: VertexId, dest: VertexId) -> Result<()> {
        if self.finalized.get() {
            bail!(
                "cannot add precedence '{}' -> '{}' after the scheduler is finalized",
                self.dag.borrow().label(source),
                self.dag.borrow().label(dest)
            );
        }
        self.dag.borrow_mut().add_edge(source, dest)
    }

    pub(crate) fn rename_vertex(&self, v: VertexId, label: &str) {
        self.dag.borrow_mut().set_label(v, label);
    }

    /// Topologically sort the DAG, assign per-vertex priorities, and lock
    /// the structure. Must be called once, before `run`.
    pub fn finalize(&self) -> Result<()> {
        if self.finalized.get() {
            bail!("scheduler '{}' is already finalized", self.name);
        }
        let mut dag = self.dag.borrow_mut();
        dag.finalize()?;
        self.finalized.set(true);
        info!(
            "scheduler '{}' finalized: {} vertices, {} edges",
            self.name,
            dag.vertex_count(),
            dag.edge_count()
        );
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // Scheduling
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn schedule_entry(
        &self,
        core: &Rc<ScheduleableCore>,
        rel_ticks: Tick,
    ) -> Result<()> {
        if !self.finalized.get() {
            bail!(
                "cannot schedule '{}' before the scheduler is finalized",
                core.label()
            );
        }

        let target = self.current_tick.get() + rel_ticks;
        match core.policy() {
            UniquenessPolicy::Repeatable => {}
            UniquenessPolicy::Unique | UniquenessPolicy::SingleCycleUnique => {
                if self.running.get() && core.last_fired_tick() == Some(target) {
                    bail!(
                        "unique event '{}' already fired at tick {}; are you missing a precedence rule?",
                        core.label(),
                        target
                    );
                }
                if core.is_pending_at(target) {
                    // Coalesce silently.
                    return Ok(());
                }
            }
        }

        let phase = core.phase();
        if self.running.get() && rel_ticks == 0 {
            let current = self.current_phase.get();
            if phase < current {
                bail!(
                    "cannot schedule '{}' into phase {} of tick {}: the scheduler has already advanced to phase {}",
                    core.label(),
                    phase,
                    target,
                    current
                );
            }
            if phase == current {
                if let Some(firing) = self.firing.borrow().as_ref() {
                    if firing.phase == phase {
                        let priority = self.dag.borrow().priority(core.vertex());
                        if priority <= firing.priority {
                            bail!(
                                "'{}' (fired from '{}') cannot run later in the current phase {}: it is not ordered after the firing event",
                                core.label(),
                                firing.label,
                                phase
                            );
                        }
                    }
                }
            }
        }

        let priority = self.dag.borrow().priority(core.vertex());
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);

        let continuing = core.is_continuing();
        let state = Rc::new(EntryState {
            cancelled: Cell::new(false),
            counted: Cell::new(continuing),
        });
        if continuing {
            self.continuing_pending
                .set(self.continuing_pending.get() + 1);
        }

        self.queue
            .borrow_mut()
            .entry(target)
            .or_insert_with(TickQuantum::new)
            .phases[phase.index()]
            .push(QueueEntry {
                priority,
                seq,
                core: Rc::clone(core),
                state: Rc::clone(&state),
            });
        core.note_scheduled(target, state);
        debug!(
            "scheduled '{}' for tick {} phase {} (priority {})",
            core.label(),
            target,
            phase,
            priority
        );
        Ok(())
    }

    /// Tombstone one occurrence. The queue entry stays where it is and is
    /// skipped on drain.
    pub(crate) fn retire_cancelled(&self, state: &Rc<EntryState>) {
        if state.cancelled.get() {
            return;
        }
        state.cancelled.set(true);
        if state.counted.get() {
            state.counted.set(false);
            self.continuing_pending
                .set(self.continuing_pending.get() - 1);
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Main loop
    // ────────────────────────────────────────────────────────────────────

    /// Run the simulation.
    ///
    /// Advances to successive ticks with work and drains them phase by
    /// phase. Returns when no continuing work remains, or once `max_ticks`
    /// ticks have elapsed. With `exacting` the tick counter lands exactly
    /// on the budget boundary even when the tail of the window is idle.
    pub fn run(&self, max_ticks: Option<Tick>, exacting: bool) -> Result<()> {
        if !self.finalized.get() {
            bail!("scheduler '{}' must be finalized before run", self.name);
        }
        if self.running.get() {
            bail!("recursive call to Scheduler::run from a handler");
        }
        self.running.set(true);
        let result = self.run_loop(max_ticks, exacting);
        self.running.set(false);
        self.current_phase.set(SchedulingPhase::Trigger);
        result
    }

    fn run_loop(&self, max_ticks: Option<Tick>, exacting: bool) -> Result<()> {
        let end = max_ticks.map(|m| self.current_tick.get().saturating_add(m));
        loop {
            if self.continuing_pending.get() == 0 {
                // Only non-continuing work (or nothing) is left.
                if exacting {
                    if let Some(e) = end {
                        self.current_tick.set(e);
                    }
                }
                debug!("scheduler '{}' idle at tick {}", self.name, self.current_tick.get());
                return Ok(());
            }

            let next = self
                .queue
                .borrow()
                .range(self.current_tick.get()..)
                .find(|(_, q)| !q.is_empty())
                .map(|(t, _)| *t);

            let Some(tick) = next else {
                if exacting {
                    if let Some(e) = end {
                        self.current_tick.set(e);
                    }
                }
                return Ok(());
            };

            if let Some(e) = end {
                if tick >= e {
                    self.current_tick.set(e);
                    return Ok(());
                }
            }

            self.current_tick.set(tick);
            self.process_tick(tick)?;
            self.current_tick.set(tick + 1);
        }
    }

    fn process_tick(&self, tick: Tick) -> Result<()> {
        debug!("scheduler '{}' processing tick {}", self.name, tick);
        for phase in SchedulingPhase::ALL {
            self.current_phase.set(phase);
            loop {
                let entry = self
                    .queue
                    .borrow_mut()
                    .get_mut(&tick)
                    .and_then(|q| q.phases[phase.index()].pop());
                let Some(entry) = entry else { break };

                if entry.state.cancelled.get() {
                    continue;
                }
                if entry.state.counted.get() {
                    entry.state.counted.set(false);
                    self.continuing_pending
                        .set(self.continuing_pending.get() - 1);
                }

                entry.core.note_fired(tick, &entry.state);
                let label = entry.core.label();
                *self.firing.borrow_mut() = Some(FiringContext {
                    label: label.clone(),
                    phase,
                    priority: entry.priority,
                });
                let result = entry.core.invoke();
                *self.firing.borrow_mut() = None;
                result.with_context(|| {
                    format!("while firing '{}' at tick {} phase {}", label, tick, phase)
                })?;
                self.events_fired.set(self.events_fired.get() + 1);
            }
        }
        self.queue.borrow_mut().remove(&tick);
        Ok(())
    }
}
