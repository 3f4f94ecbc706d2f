//! Buses: named bundles of ports bound collectively.
//!
//! Two buses bind by pairing complementary ports whose names agree after
//! canonicalization (direction tokens and underscores stripped). The
//! bind is complete or it does not happen: any port without a partner on
//! the other side fails the whole operation with the full list.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::{bail, Result};

use crate::events::ScheduleableRef;
use crate::tree::TreeNode;
use crate::Cycle;

use super::port_set::PortSet;
use super::{Direction, Port};

/// Strip a leading `in_`/`out_` and trailing `_in`/`_out` token, then
/// remove every remaining underscore. Comparison is case-sensitive.
pub(crate) fn canonical_name(name: &str) -> String {
    let mut s = name;
    for prefix in ["in_", "out_"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    for suffix in ["_in", "_out"] {
        if let Some(rest) = s.strip_suffix(suffix) {
            s = rest;
        }
    }
    s.chars().filter(|c| *c != '_').collect()
}

/// A named group of complementary ports bound in one call.
pub struct Bus {
    name: String,
    node: Rc<TreeNode>,
}

impl Bus {
    fn new(name: &str, node: Rc<TreeNode>) -> Rc<Bus> {
        Rc::new(Bus {
            name: name.to_string(),
            node,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> String {
        self.node.location()
    }

    /// The port set member ports are constructed against.
    pub fn port_set(&self) -> Rc<PortSet> {
        self.node.port_set()
    }

    /// Set the delay of every member in-port.
    pub fn set_in_port_delay(&self, delay_cycles: Cycle) -> Result<()> {
        for (_, port) in self.port_set().ports(Direction::In) {
            port.set_port_delay(delay_cycles)?;
        }
        Ok(())
    }

    /// Make every member in-port's delivery precede `event`.
    pub fn inports_precede(&self, event: &ScheduleableRef) -> Result<()> {
        for (_, port) in self.port_set().ports(Direction::In) {
            port.register_consumer_event(event.clone())?;
        }
        Ok(())
    }

    /// Make `event` precede every member out-port's zero-delay sends.
    pub fn outports_succeed(&self, event: &ScheduleableRef) -> Result<()> {
        for (_, port) in self.port_set().ports(Direction::Out) {
            port.register_producing_event(event.clone())?;
        }
        Ok(())
    }

    /// Bind every port of this bus to its complementary partner on
    /// `other`, matching by canonical name.
    pub fn bind(&self, other: &Bus) -> Result<()> {
        let my_in = self.canonical_map(Direction::In)?;
        let my_out = self.canonical_map(Direction::Out)?;
        let other_in = other.canonical_map(Direction::In)?;
        let other_out = other.canonical_map(Direction::Out)?;

        // Find every port that would be left unbound before touching
        // anything, so a mismatch names them all.
        let mut unbound: Vec<String> = Vec::new();
        collect_unmatched(&my_in, &other_out, &mut unbound);
        collect_unmatched(&other_out, &my_in, &mut unbound);
        collect_unmatched(&my_out, &other_in, &mut unbound);
        collect_unmatched(&other_in, &my_out, &mut unbound);
        if !unbound.is_empty() {
            bail!(
                "when binding bus '{}' to bus '{}', the following ports have no equivalent and \
                 will not get bound: {}",
                self.location(),
                other.location(),
                unbound.join(", ")
            );
        }

        for (canonical, in_port) in &my_in {
            let out_port = &other_out[canonical];
            super::bind(out_port, in_port)?;
        }
        for (canonical, out_port) in &my_out {
            let in_port = &other_in[canonical];
            super::bind(out_port, in_port)?;
        }
        Ok(())
    }

    fn canonical_map(&self, direction: Direction) -> Result<BTreeMap<String, Rc<dyn Port>>> {
        let mut map: BTreeMap<String, Rc<dyn Port>> = BTreeMap::new();
        for (name, port) in self.port_set().ports(direction) {
            let canonical = canonical_name(&name);
            if let Some(existing) = map.get(&canonical) {
                bail!(
                    "cannot discern between port name '{}' and '{}' on bus '{}'",
                    name,
                    existing.name(),
                    self.location()
                );
            }
            map.insert(canonical, port);
        }
        Ok(map)
    }
}

fn collect_unmatched(
    these: &BTreeMap<String, Rc<dyn Port>>,
    against: &BTreeMap<String, Rc<dyn Port>>,
    unbound: &mut Vec<String>,
) {
    for (canonical, port) in these {
        if !against.contains_key(canonical) {
            let loc = port.location();
            if !unbound.contains(&loc) {
                unbound.push(loc);
            }
        }
    }
}

/// Hosts the buses of one component under a `buses` tree node.
pub struct BusSet {
    node: Rc<TreeNode>,
    buses: RefCell<BTreeMap<String, Rc<Bus>>>,
}

impl BusSet {
    pub fn new(parent: &Rc<TreeNode>) -> Result<Rc<BusSet>> {
        let node = parent.add_child("buses")?;
        Ok(Rc::new(BusSet {
            node,
            buses: RefCell::new(BTreeMap::new()),
        }))
    }

    pub fn make_bus(&self, name: &str) -> Result<Rc<Bus>> {
        if self.buses.borrow().contains_key(name) {
            bail!(
                "bus '{}' already exists in '{}'",
                name,
                self.node.location()
            );
        }
        let node = self.node.add_child(name)?;
        let bus = Bus::new(name, node);
        self.buses
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&bus));
        Ok(bus)
    }

    pub fn get_bus(&self, name: &str) -> Option<Rc<Bus>> {
        self.buses.borrow().get(name).cloned()
    }
}
