//! Virtual frequency domains resolved onto the scheduler's tick timeline.
//!
//! Clocks form a tree rooted at a clock owned by the [`ClockManager`].
//! Each non-root clock is specified either as an exact ratio to its parent
//! or as an explicit frequency in MHz; the two modes cannot be mixed in
//! one tree. [`ClockManager::normalize`] fixes every period to an integral
//! number of ticks (a global LCM pass in ratio mode, picosecond periods in
//! frequency mode). After normalization periods are immutable.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};
use log::info;

use crate::sched::Scheduler;
use crate::utils::{lcm, Rational};
use crate::{Cycle, Tick};

/// One clock domain. Create through a [`ClockManager`].
pub struct Clock {
    name: String,
    scheduler: Weak<Scheduler>,
    parent: RefCell<Weak<Clock>>,
    children: RefCell<Vec<Rc<Clock>>>,
    ratio_to_parent: Rational,
    frequency_mhz: f64,
    period: Cell<Tick>,
    is_root: bool,
}

impl Clock {
    fn new(
        name: &str,
        scheduler: Weak<Scheduler>,
        ratio_to_parent: Rational,
        frequency_mhz: f64,
        is_root: bool,
    ) -> Rc<Clock> {
        Rc::new(Clock {
            name: name.to_string(),
            scheduler,
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(Vec::new()),
            ratio_to_parent,
            frequency_mhz,
            period: Cell::new(0),
            is_root,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> Result<Rc<Scheduler>> {
        self.scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for clock '{}' is gone", self.name))
    }

    pub fn parent(&self) -> Option<Rc<Clock>> {
        self.parent.borrow().upgrade()
    }

    pub fn frequency_mhz(&self) -> f64 {
        self.frequency_mhz
    }

    /// Ticks per cycle of this clock; 0 until the tree is normalized.
    pub fn period(&self) -> Tick {
        self.period.get()
    }

    pub fn is_normalized(&self) -> bool {
        self.period.get() != 0
    }

    pub fn cycle_to_tick(&self, cycle: Cycle) -> Result<Tick> {
        Ok(cycle * self.checked_period()?)
    }

    pub fn tick_to_cycle(&self, tick: Tick) -> Result<Cycle> {
        Ok(tick / self.checked_period()?)
    }

    /// The current tick of the owning scheduler.
    pub fn current_tick(&self) -> Result<Tick> {
        Ok(self.scheduler()?.current_tick())
    }

    /// The current scheduler tick expressed in this clock's cycles.
    pub fn current_cycle(&self) -> Result<Cycle> {
        self.tick_to_cycle(self.current_tick()?)
    }

    /// Does the current tick fall on a rising edge of this clock?
    pub fn is_posedge(&self) -> Result<bool> {
        Ok(self.current_tick()? % self.checked_period()? == 0)
    }

    /// Two clocks agree on frequency when their periods match.
    pub fn same_frequency(&self, other: &Clock) -> bool {
        self.period.get() == other.period.get()
    }

    fn checked_period(&self) -> Result<Tick> {
        let p = self.period.get();
        if p == 0 {
            bail!(
                "clock '{}' was never normalized; call ClockManager::normalize before use",
                self.name
            );
        }
        Ok(p)
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Clock({} period={})", self.name, self.period.get())
    }
}

/// Builds and normalizes a clock tree against one scheduler.
pub struct ClockManager {
    scheduler: Rc<Scheduler>,
    root: RefCell<Option<Rc<Clock>>>,
    clocks: RefCell<Vec<Rc<Clock>>>,
    any_explicit_freq: Cell<bool>,
    any_ratioed: Cell<bool>,
    normalized: Cell<bool>,
}

impl ClockManager {
    pub fn new(scheduler: &Rc<Scheduler>) -> Self {
        ClockManager {
            scheduler: Rc::clone(scheduler),
            root: RefCell::new(None),
            clocks: RefCell::new(Vec::new()),
            any_explicit_freq: Cell::new(false),
            any_ratioed: Cell::new(false),
            normalized: Cell::new(false),
        }
    }

    /// Create the root clock. Its period is defined by `normalize`.
    pub fn make_root(&self, name: &str) -> Result<Rc<Clock>> {
        if self.root.borrow().is_some() {
            bail!("clock manager already has a root clock");
        }
        let clock = Clock::new(
            name,
            Rc::downgrade(&self.scheduler),
            Rational::one(),
            0.0,
            true,
        );
        *self.root.borrow_mut() = Some(Rc::clone(&clock));
        self.clocks.borrow_mut().push(Rc::clone(&clock));
        Ok(clock)
    }

    pub fn root(&self) -> Option<Rc<Clock>> {
        self.root.borrow().clone()
    }

    /// Create a clock whose frequency relates to its parent's as
    /// `parent_ratio : child_ratio`. A 1:2 child runs at half the parent
    /// frequency (twice the period).
    pub fn make_clock(
        &self,
        name: &str,
        parent: &Rc<Clock>,
        parent_ratio: u32,
        child_ratio: u32,
    ) -> Result<Rc<Clock>> {
        if parent_ratio == 0 || child_ratio == 0 {
            bail!("clock '{}' has a zero ratio term", name);
        }
        self.check_open(name)?;
        self.any_ratioed.set(true);
        let ratio = Rational::new(child_ratio as u64, parent_ratio as u64);
        let clock = Clock::new(name, Rc::downgrade(&self.scheduler), ratio, 0.0, false);
        self.attach(&clock, parent);
        Ok(clock)
    }

    /// Create a clock with an explicit frequency. Ticks become picoseconds
    /// for the whole tree once any clock is specified this way.
    pub fn make_clock_with_frequency(
        &self,
        name: &str,
        parent: &Rc<Clock>,
        frequency_mhz: f64,
    ) -> Result<Rc<Clock>> {
        if !(frequency_mhz > 0.0) {
            bail!("clock '{}' has non-positive frequency {}", name, frequency_mhz);
        }
        self.check_open(name)?;
        self.any_explicit_freq.set(true);
        let clock = Clock::new(
            name,
            Rc::downgrade(&self.scheduler),
            Rational::one(),
            frequency_mhz,
            false,
        );
        self.attach(&clock, parent);
        Ok(clock)
    }

    /// Fix every clock's period to an integral tick count and return the
    /// normalization factor (1 in frequency mode).
    pub fn normalize(&self) -> Result<u64> {
        if self.normalized.get() {
            bail!("clock tree is already normalized");
        }
        let root = self
            .root
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("cannot normalize a clock tree with no root"))?;

        let norm = if self.any_explicit_freq.get() {
            if self.any_ratioed.get() {
                bail!("clock tree mixes ratio-specified and frequency-specified clocks");
            }
            self.normalize_frequencies(&root)?;
            1
        } else {
            self.normalize_ratios(&root)?
        };

        self.normalized.set(true);
        info!(
            "clock tree normalized: {} clocks, factor {}",
            self.clocks.borrow().len(),
            norm
        );
        Ok(norm)
    }

    fn check_open(&self, name: &str) -> Result<()> {
        if self.normalized.get() {
            bail!("cannot add clock '{}' after normalization", name);
        }
        if self.clocks.borrow().iter().any(|c| c.name() == name) {
            bail!("duplicate clock name '{}'", name);
        }
        Ok(())
    }

    fn attach(&self, clock: &Rc<Clock>, parent: &Rc<Clock>) {
        *clock.parent.borrow_mut() = Rc::downgrade(parent);
        parent.children.borrow_mut().push(Rc::clone(clock));
        self.clocks.borrow_mut().push(Rc::clone(clock));
    }

    /// Ratio mode: cumulative period ratios from the root, then a global
    /// LCM over the denominators so every period comes out integral.
    fn normalize_ratios(&self, root: &Rc<Clock>) -> Result<u64> {
        let mut cumulative: Vec<(Rc<Clock>, Rational)> = Vec::new();
        collect_cumulative(root, Rational::one(), &mut cumulative);

        let mut norm = 1u64;
        for (_, ratio) in &cumulative {
            norm = lcm(norm, ratio.denominator());
        }
        for (clock, ratio) in &cumulative {
            let period = ratio.scaled(norm);
            if period == 0 {
                bail!("clock '{}' normalizes to a zero-tick period", clock.name());
            }
            clock.period.set(period);
        }
        Ok(norm)
    }

    /// Frequency mode: ticks are picoseconds, the root gets period 1.
    fn normalize_frequencies(&self, root: &Rc<Clock>) -> Result<()> {
        root.period.set(1);
        for clock in self.clocks.borrow().iter() {
            if clock.is_root {
                continue;
            }
            let mhz = clock.frequency_mhz;
            if mhz <= 0.0 {
                bail!(
                    "clock '{}' has no frequency in a frequency-specified tree",
                    clock.name()
                );
            }
            clock.period.set(period_from_frequency_mhz(mhz));
        }
        Ok(())
    }
}

fn collect_cumulative(clock: &Rc<Clock>, upto: Rational, out: &mut Vec<(Rc<Clock>, Rational)>) {
    let cumulative = upto * clock.ratio_to_parent;
    out.push((Rc::clone(clock), cumulative));
    for child in clock.children.borrow().iter() {
        collect_cumulative(child, cumulative, out);
    }
}

/// Clock period in picosecond ticks for a frequency in MHz.
pub fn period_from_frequency_mhz(frequency_mhz: f64) -> Tick {
    ((1.0 / frequency_mhz) * 1000.0 * 1000.0) as Tick
}

/// Relative ticks from `current_tick` until data sent with the given
/// delays lands on the receiver's next rising edge.
///
/// The nominal arrival is `current + send_delay + receive_delay`; the
/// actual arrival snaps up to the next multiple of the receiver's period.
pub fn clock_crossing_delay(
    current_tick: Tick,
    send_delay_ticks: Tick,
    receive_delay_ticks: Tick,
    receiver_period: Tick,
) -> Tick {
    let nominal = current_tick + send_delay_ticks + receive_delay_ticks;
    let arrival = nominal.div_ceil(receiver_period) * receiver_period;
    arrival - current_tick
}

/// Ticks from the latest valid send edge back to a known arrival tick:
/// the inverse of [`clock_crossing_delay`] for "when can the next beat
/// go out" queries.
pub fn reverse_clock_crossing_delay(
    arrival_tick: Tick,
    send_delay_ticks: Tick,
    receive_delay_ticks: Tick,
    sender_period: Tick,
) -> Result<Tick> {
    let lead = send_delay_ticks + receive_delay_ticks;
    if arrival_tick < lead {
        bail!(
            "arrival tick {} is earlier than the send-to-receive lead of {} ticks",
            arrival_tick,
            lead
        );
    }
    let send_tick = (arrival_tick - lead) / sender_period * sender_period;
    Ok(arrival_tick - send_tick)
}
