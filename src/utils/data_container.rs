//! Timestamped value holder behind the receiving side of a port.

use std::cell::{Cell, RefCell};
use std::rc::Weak;

use anyhow::{anyhow, Result};

use crate::clock::Clock;
use crate::{Cycle, Tick};

/// Holds the most recently received value on an in-port together with the
/// tick it arrived, and tracks whether the value is still valid.
pub struct DataContainer<T: Clone> {
    clock: RefCell<Weak<Clock>>,
    data: RefCell<Option<T>>,
    received_tick: Cell<Tick>,
}

impl<T: Clone> DataContainer<T> {
    pub fn new(clock: Weak<Clock>) -> Self {
        DataContainer {
            clock: RefCell::new(clock),
            data: RefCell::new(None),
            received_tick: Cell::new(0),
        }
    }

    /// Was a value ever received (and not yet pulled or cleared)?
    pub fn data_received(&self) -> bool {
        self.data.borrow().is_some()
    }

    /// Was the live value received at the current tick?
    pub fn data_received_this_cycle(&self) -> bool {
        if !self.data_received() {
            return false;
        }
        match self.current_tick() {
            Ok(now) => self.received_tick.get() == now,
            Err(_) => false,
        }
    }

    /// Take the value out, clearing validity.
    pub fn pull_data(&self) -> Result<T> {
        self.data
            .borrow_mut()
            .take()
            .ok_or_else(|| anyhow!("pull_data on a port that has received no data"))
    }

    /// Copy of the value without clearing validity.
    pub fn peek_data(&self) -> Result<T> {
        self.data
            .borrow()
            .clone()
            .ok_or_else(|| anyhow!("peek_data on a port that has received no data"))
    }

    pub fn clear_data(&self) {
        self.data.borrow_mut().take();
    }

    /// Receiver-clock cycle at which the live value arrived.
    pub fn received_time_stamp(&self) -> Result<Cycle> {
        if !self.data_received() {
            return Err(anyhow!("no received data to timestamp"));
        }
        let clock = self
            .clock
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("data container's clock is gone"))?;
        clock.tick_to_cycle(self.received_tick.get())
    }

    pub(crate) fn set_data(&self, value: T) {
        if let Ok(now) = self.current_tick() {
            self.received_tick.set(now);
        }
        *self.data.borrow_mut() = Some(value);
    }

    fn current_tick(&self) -> Result<Tick> {
        let clock = self
            .clock
            .borrow()
            .upgrade()
            .ok_or_else(|| anyhow!("data container's clock is gone"))?;
        Ok(clock.scheduler()?.current_tick())
    }
}
