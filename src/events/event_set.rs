//! Per-component registry of events.
//!
//! An event set hangs off a tree node and is the place events acquire
//! their clock (and through it, their scheduler). It also keeps a
//! per-phase roster of event names for diagnostics.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, Result};

use crate::clock::Clock;
use crate::sched::{SchedulingPhase, NUM_SCHEDULING_PHASES};
use crate::tree::TreeNode;

pub struct EventSet {
    owner: Weak<TreeNode>,
    names: RefCell<[Vec<String>; NUM_SCHEDULING_PHASES]>,
}

impl EventSet {
    /// Create an event set on `node`. The node (or an ancestor) must have
    /// a clock, since every event needs one.
    pub fn new(node: &Rc<TreeNode>) -> Result<Rc<EventSet>> {
        if node.clock().is_none() {
            return Err(anyhow!(
                "event set on '{}' requires a clock on the node or an ancestor",
                node.location()
            ));
        }
        Ok(Rc::new(EventSet {
            owner: Rc::downgrade(node),
            names: RefCell::new(std::array::from_fn(|_| Vec::new())),
        }))
    }

    pub fn clock(&self) -> Result<Rc<Clock>> {
        self.owner()?
            .clock()
            .ok_or_else(|| anyhow!("event set's node lost its clock"))
    }

    pub fn location(&self) -> String {
        match self.owner.upgrade() {
            Some(node) => format!("{}.events", node.location()),
            None => "<detached>.events".to_string(),
        }
    }

    /// Names of events registered in the given phase.
    pub fn event_names(&self, phase: SchedulingPhase) -> Vec<String> {
        self.names.borrow()[phase.index()].clone()
    }

    pub(crate) fn register(&self, phase: SchedulingPhase, name: &str) {
        self.names.borrow_mut()[phase.index()].push(name.to_string());
    }

    fn owner(&self) -> Result<Rc<TreeNode>> {
        self.owner
            .upgrade()
            .ok_or_else(|| anyhow!("event set's owning node is gone"))
    }
}
