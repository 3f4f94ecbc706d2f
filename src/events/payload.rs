//! Payload-carrying events backed by a proxy pool.
//!
//! A `PayloadEvent<T>` is never scheduled itself. Each send allocates a
//! proxy from a preallocated slab; the proxy carries one `T` and is the
//! thing that actually sits on the scheduler. Fired or cancelled proxies
//! return to a free list once no outside handle refers to them, so steady
//! state traffic schedules without allocating.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};
use log::warn;

use crate::clock::Clock;
use crate::sched::dag::VertexId;
use crate::sched::{Scheduler, SchedulingPhase};
use crate::utils::FastList;
use crate::utils::fast_list::NodeIndex;
use crate::{Cycle, Tick};

use super::event_set::EventSet;
use super::precedence::DagParticipant;
use super::scheduleable::{DatalessHandler, ScheduleableCore, UniquenessPolicy};

// Pool grows by 16 at a time.
const PROXY_ALLOCATION_CADENCE: usize = 16;
const OUTSTANDING_WARN_THRESHOLD: usize = 100_000;

pub(crate) type PayloadHandler<T> = Box<dyn FnMut(&T) -> Result<()>>;

struct Slot<T: Clone> {
    core: Rc<ScheduleableCore>,
    payload: Option<T>,
    /// Position in the in-flight list while allocated.
    node: Option<NodeIndex>,
    handles: u32,
    scheduled: bool,
    cancelled: bool,
}

struct Pool<T: Clone> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    in_flight: FastList<usize>,
}

struct PayloadInner<T: Clone + 'static> {
    name: RefCell<String>,
    phase: SchedulingPhase,
    clock: Weak<Clock>,
    scheduler: Weak<Scheduler>,
    vertex: VertexId,
    default_delay: Cell<Cycle>,
    continuing: Cell<bool>,
    handler: RefCell<PayloadHandler<T>>,
    pool: RefCell<Pool<T>>,
    self_weak: Weak<PayloadInner<T>>,
    warned_outstanding: Cell<bool>,
}

/// Factory for payload-carrying schedulable proxies.
pub struct PayloadEvent<T: Clone + 'static> {
    inner: Rc<PayloadInner<T>>,
}

impl<T: Clone + 'static> Clone for PayloadEvent<T> {
    fn clone(&self) -> Self {
        PayloadEvent {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Clone + 'static> PayloadEvent<T> {
    pub fn new(
        event_set: &EventSet,
        name: &str,
        phase: SchedulingPhase,
        handler: impl FnMut(&T) -> Result<()> + 'static,
    ) -> Result<PayloadEvent<T>> {
        let pe = Self::with_clock(&event_set.clock()?, name, phase, handler)?;
        event_set.register(phase, name);
        Ok(pe)
    }

    /// Internal constructor used by ports, whose delivery events hang off
    /// the port's clock rather than an event set.
    pub(crate) fn with_clock(
        clock: &Rc<Clock>,
        name: &str,
        phase: SchedulingPhase,
        handler: impl FnMut(&T) -> Result<()> + 'static,
    ) -> Result<PayloadEvent<T>> {
        let scheduler = clock.scheduler()?;
        let vertex = scheduler.new_vertex(name, phase)?;
        let inner = Rc::new_cyclic(|weak| PayloadInner {
            name: RefCell::new(name.to_string()),
            phase,
            clock: Rc::downgrade(clock),
            scheduler: Rc::downgrade(&scheduler),
            vertex,
            default_delay: Cell::new(0),
            continuing: Cell::new(true),
            handler: RefCell::new(Box::new(handler) as PayloadHandler<T>),
            pool: RefCell::new(Pool {
                slots: Vec::new(),
                free: Vec::new(),
                in_flight: FastList::with_capacity(PROXY_ALLOCATION_CADENCE),
            }),
            self_weak: weak.clone(),
            warned_outstanding: Cell::new(false),
        });
        Ok(PayloadEvent { inner })
    }

    pub fn name(&self) -> String {
        self.inner.name.borrow().clone()
    }

    pub fn phase(&self) -> SchedulingPhase {
        self.inner.phase
    }

    pub fn set_default_delay(&self, delay_cycles: Cycle) {
        self.inner.default_delay.set(delay_cycles);
    }

    /// Whether pending proxies keep the scheduler's run loop alive.
    pub fn set_continuing(&self, continuing: bool) {
        self.inner.continuing.set(continuing);
        for slot in self.inner.pool.borrow().slots.iter() {
            slot.core.set_continuing(continuing);
        }
    }

    pub(crate) fn set_label(&self, label: &str) {
        *self.inner.name.borrow_mut() = label.to_string();
        if let Some(s) = self.inner.scheduler.upgrade() {
            if !s.is_finalized() {
                s.rename_vertex(self.inner.vertex, label);
            }
        }
    }

    /// Replace the consumer handler. Ports construct their delivery
    /// event first and install the real handler once the port exists.
    pub(crate) fn set_handler(&self, handler: impl FnMut(&T) -> Result<()> + 'static) {
        *self.inner.handler.borrow_mut() = Box::new(handler);
    }

    /// Allocate a proxy carrying `payload` and return a handle to it.
    /// The proxy stays outstanding while the handle lives or the proxy is
    /// scheduled.
    pub fn prepare_payload(&self, payload: T) -> Result<PayloadHandle<T>> {
        let idx = self.inner.allocate(payload)?;
        self.inner.pool.borrow_mut().slots[idx].handles = 1;
        Ok(PayloadHandle {
            inner: Rc::clone(&self.inner),
            idx,
        })
    }

    /// Allocate and schedule in one step.
    pub fn schedule(&self, payload: T, delay_cycles: Cycle) -> Result<()> {
        let idx = self.inner.allocate(payload)?;
        if let Err(e) = self.inner.schedule_slot_cycles(idx, delay_cycles) {
            let _ = self.inner.cancel_slot(idx);
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn schedule_relative_ticks(&self, payload: T, rel_ticks: Tick) -> Result<()> {
        let idx = self.inner.allocate(payload)?;
        if let Err(e) = self.inner.schedule_slot_ticks(idx, rel_ticks) {
            let _ = self.inner.cancel_slot(idx);
            return Err(e);
        }
        Ok(())
    }

    /// Unfired and unreclaimed proxies, scheduled or externally held.
    pub fn num_outstanding(&self) -> usize {
        self.inner.pool.borrow().in_flight.len()
    }

    pub fn is_scheduled(&self) -> bool {
        self.num_outstanding() > 0
    }

    /// Is any proxy due exactly `delay_cycles` from now?
    pub fn is_scheduled_at(&self, delay_cycles: Cycle) -> Result<bool> {
        for idx in self.live_slots() {
            let core = {
                let pool = self.inner.pool.borrow();
                let slot = &pool.slots[idx];
                if !slot.scheduled {
                    continue;
                }
                Rc::clone(&slot.core)
            };
            if core.is_scheduled_at_cycles(delay_cycles)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Cancel every in-flight proxy; returns how many were live.
    pub fn cancel(&self) -> Result<u32> {
        let mut count = 0;
        for idx in self.live_slots() {
            if self.inner.cancel_slot(idx)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Cancel proxies due exactly `delay_cycles` from now.
    pub fn cancel_at(&self, delay_cycles: Cycle) -> Result<u32> {
        let mut count = 0;
        for idx in self.live_slots() {
            let core = {
                let pool = self.inner.pool.borrow();
                let slot = &pool.slots[idx];
                if !slot.scheduled {
                    continue;
                }
                Rc::clone(&slot.core)
            };
            if core.is_scheduled_at_cycles(delay_cycles)? && self.inner.cancel_slot(idx)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Cancel every in-flight proxy whose payload satisfies `pred`.
    pub fn cancel_if(&self, mut pred: impl FnMut(&T) -> bool) -> Result<u32> {
        let mut count = 0;
        for idx in self.live_slots() {
            let payload = self.slot_payload(idx);
            match payload {
                Some(p) if pred(&p) => {
                    if self.inner.cancel_slot(idx)? {
                        count += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(count)
    }

    /// Does any in-flight proxy carry a payload satisfying `pred`?
    pub fn confirm_if(&self, mut pred: impl FnMut(&T) -> bool) -> bool {
        for idx in self.live_slots() {
            if let Some(p) = self.slot_payload(idx) {
                if pred(&p) {
                    return true;
                }
            }
        }
        false
    }

    /// Handles to every in-flight proxy whose payload satisfies `pred`.
    pub fn handles_if(&self, mut pred: impl FnMut(&T) -> bool) -> Vec<PayloadHandle<T>> {
        let mut out = Vec::new();
        for idx in self.live_slots() {
            if let Some(p) = self.slot_payload(idx) {
                if pred(&p) {
                    self.inner.pool.borrow_mut().slots[idx].handles += 1;
                    out.push(PayloadHandle {
                        inner: Rc::clone(&self.inner),
                        idx,
                    });
                }
            }
        }
        out
    }

    fn live_slots(&self) -> Vec<usize> {
        self.inner.pool.borrow().in_flight.iter().copied().collect()
    }

    fn slot_payload(&self, idx: usize) -> Option<T> {
        let pool = self.inner.pool.borrow();
        let slot = &pool.slots[idx];
        if slot.cancelled || slot.node.is_none() {
            return None;
        }
        slot.payload.clone()
    }
}

impl<T: Clone + 'static> PayloadInner<T> {
    fn clock(&self) -> Result<Rc<Clock>> {
        self.clock
            .upgrade()
            .ok_or_else(|| anyhow!("clock for payload event '{}' is gone", self.name.borrow()))
    }

    fn allocate(&self, payload: T) -> Result<usize> {
        let mut pool_ref = self.pool.borrow_mut();
        let pool = &mut *pool_ref;
        if pool.free.is_empty() {
            self.grow(pool)?;
        }
        let idx = pool.free.pop().expect("pool grown above");
        let node = pool.in_flight.push_front(idx);
        let slot = &mut pool.slots[idx];
        slot.payload = Some(payload);
        slot.node = Some(node);
        slot.handles = 0;
        slot.scheduled = false;
        slot.cancelled = false;
        Ok(idx)
    }

    fn grow(&self, pool: &mut Pool<T>) -> Result<()> {
        let clock = self.clock()?;
        let scheduler = self
            .scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for payload event '{}' is gone", self.name.borrow()))?;
        let start = pool.slots.len();
        for i in start..start + PROXY_ALLOCATION_CADENCE {
            let weak = self.self_weak.clone();
            let proxy_handler: DatalessHandler = Box::new(move || {
                let inner = weak
                    .upgrade()
                    .ok_or_else(|| anyhow!("payload event dropped with a proxy still scheduled"))?;
                inner.fire_slot(i)
            });
            let core = ScheduleableCore::with_vertex(
                &clock,
                &scheduler,
                &format!("{}[{}]", self.name.borrow(), i),
                self.phase,
                UniquenessPolicy::Repeatable,
                Some(proxy_handler),
                self.vertex,
            );
            core.set_continuing(self.continuing.get());
            pool.slots.push(Slot {
                core,
                payload: None,
                node: None,
                handles: 0,
                scheduled: false,
                cancelled: false,
            });
            pool.free.push(i);
        }
        if pool.slots.len() > OUTSTANDING_WARN_THRESHOLD && !self.warned_outstanding.get() {
            self.warned_outstanding.set(true);
            warn!(
                "payload event '{}' has allocated over {} outstanding proxies; does that seem right?",
                self.name.borrow(),
                OUTSTANDING_WARN_THRESHOLD
            );
        }
        Ok(())
    }

    fn schedule_slot_cycles(&self, idx: usize, delay_cycles: Cycle) -> Result<()> {
        let rel_ticks = self.clock()?.cycle_to_tick(delay_cycles)?;
        self.schedule_slot_ticks(idx, rel_ticks)
    }

    fn schedule_slot_ticks(&self, idx: usize, rel_ticks: Tick) -> Result<()> {
        let core = {
            let mut pool = self.pool.borrow_mut();
            let slot = &mut pool.slots[idx];
            if slot.scheduled || slot.cancelled {
                bail!(
                    "payload handle for '{}' is already scheduled or was previously cancelled; prepare a new one",
                    self.name.borrow()
                );
            }
            Rc::clone(&slot.core)
        };
        core.schedule_relative_ticks(rel_ticks)?;
        self.pool.borrow_mut().slots[idx].scheduled = true;
        Ok(())
    }

    /// Returns true when the slot was live (not already cancelled or
    /// reclaimed).
    fn cancel_slot(&self, idx: usize) -> Result<bool> {
        let core = {
            let mut pool = self.pool.borrow_mut();
            let slot = &mut pool.slots[idx];
            if slot.node.is_none() || slot.cancelled {
                return Ok(false);
            }
            let core = slot.scheduled.then(|| Rc::clone(&slot.core));
            slot.cancelled = true;
            slot.scheduled = false;
            core
        };
        if let Some(core) = core {
            core.cancel_all()?;
        }
        self.release_if_idle(idx);
        Ok(true)
    }

    /// Deliver the payload to the consumer handler, then recycle.
    fn fire_slot(&self, idx: usize) -> Result<()> {
        let payload = {
            let mut pool = self.pool.borrow_mut();
            let slot = &mut pool.slots[idx];
            if !slot.scheduled {
                bail!(
                    "payload proxy of '{}' delivered while not scheduled",
                    self.name.borrow()
                );
            }
            slot.scheduled = false;
            slot.payload
                .clone()
                .ok_or_else(|| anyhow!("payload proxy of '{}' fired empty", self.name.borrow()))?
        };
        {
            let mut handler = self.handler.borrow_mut();
            (*handler)(&payload)?;
        }
        self.release_if_idle(idx);
        Ok(())
    }

    fn release_if_idle(&self, idx: usize) {
        let mut pool_ref = self.pool.borrow_mut();
        let pool = &mut *pool_ref;
        let slot = &mut pool.slots[idx];
        if slot.scheduled || slot.handles > 0 {
            return;
        }
        let Some(node) = slot.node.take() else { return };
        slot.payload = None;
        slot.cancelled = false;
        pool.in_flight.remove(node);
        pool.free.push(idx);
    }
}

/// Reference-counted handle to one prepared proxy. While any handle
/// exists or the proxy is scheduled, the slot is not reclaimed.
pub struct PayloadHandle<T: Clone + 'static> {
    inner: Rc<PayloadInner<T>>,
    idx: usize,
}

impl<T: Clone + 'static> PayloadHandle<T> {
    /// Schedule using the payload event's default delay.
    pub fn schedule(&self) -> Result<()> {
        self.schedule_in(self.inner.default_delay.get())
    }

    pub fn schedule_in(&self, delay_cycles: Cycle) -> Result<()> {
        self.inner.schedule_slot_cycles(self.idx, delay_cycles)
    }

    pub(crate) fn schedule_relative_ticks(&self, rel_ticks: Tick) -> Result<()> {
        self.inner.schedule_slot_ticks(self.idx, rel_ticks)
    }

    pub fn cancel(&self) -> Result<()> {
        self.inner.cancel_slot(self.idx)?;
        Ok(())
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.pool.borrow().slots[self.idx].scheduled
    }

    pub fn payload(&self) -> Option<T> {
        self.inner.pool.borrow().slots[self.idx].payload.clone()
    }
}

impl<T: Clone + 'static> Clone for PayloadHandle<T> {
    fn clone(&self) -> Self {
        self.inner.pool.borrow_mut().slots[self.idx].handles += 1;
        PayloadHandle {
            inner: Rc::clone(&self.inner),
            idx: self.idx,
        }
    }
}

impl<T: Clone + 'static> Drop for PayloadHandle<T> {
    fn drop(&mut self) {
        {
            let mut pool = self.inner.pool.borrow_mut();
            let slot = &mut pool.slots[self.idx];
            slot.handles = slot.handles.saturating_sub(1);
        }
        self.inner.release_if_idle(self.idx);
    }
}

impl<T: Clone + 'static> DagParticipant for PayloadEvent<T> {
    fn dag_vertex(&self) -> VertexId {
        self.inner.vertex
    }

    fn dag_phase(&self) -> SchedulingPhase {
        self.inner.phase
    }

    fn dag_scheduler(&self) -> Result<Rc<Scheduler>> {
        self.inner
            .scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for payload event '{}' is gone", self.inner.name.borrow()))
    }

    fn dag_label(&self) -> String {
        self.inner.name.borrow().clone()
    }
}
