//! Direction-indexed registry of the ports a component owns.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::tree::TreeNode;

use super::{Direction, Port};

const N_DIRECTIONS: usize = 3;

pub struct PortSet {
    owner: Weak<TreeNode>,
    location: String,
    registered: RefCell<[BTreeMap<String, Rc<dyn Port>>; N_DIRECTIONS]>,
}

impl PortSet {
    /// Created through [`TreeNode::port_set`].
    pub(crate) fn new(owner: &Rc<TreeNode>) -> Rc<PortSet> {
        Rc::new(PortSet {
            owner: Rc::downgrade(owner),
            location: format!("{}.ports", owner.location()),
            registered: RefCell::new(std::array::from_fn(|_| BTreeMap::new())),
        })
    }

    pub fn location(&self) -> String {
        self.location.clone()
    }

    /// The clock ports constructed here will use, inherited through the
    /// owning node.
    pub fn clock(&self) -> Option<Rc<Clock>> {
        self.owner.upgrade()?.clock()
    }

    pub fn owner(&self) -> Option<Rc<TreeNode>> {
        self.owner.upgrade()
    }

    /// Register a port. Names are unique within a direction.
    pub(crate) fn add(&self, port: Rc<dyn Port>) -> Result<()> {
        let name = port.name();
        let dir = port.direction();
        let mut maps = self.registered.borrow_mut();
        if maps[dir.index()].contains_key(&name) {
            bail!("port '{}' already registered in '{}'", name, self.location());
        }
        maps[dir.index()].insert(name, port);
        Ok(())
    }

    /// Look a port up by name across all directions.
    pub fn get_port(&self, name: &str) -> Result<Rc<dyn Port>> {
        let maps = self.registered.borrow();
        for map in maps.iter() {
            if let Some(port) = map.get(name) {
                return Ok(Rc::clone(port));
            }
        }
        Err(anyhow!(
            "no port named '{}' in '{}'",
            name,
            self.location()
        ))
    }

    /// Ports of one direction, in name order.
    pub fn ports(&self, direction: Direction) -> Vec<(String, Rc<dyn Port>)> {
        self.registered.borrow()[direction.index()]
            .iter()
            .map(|(n, p)| (n.clone(), Rc::clone(p)))
            .collect()
    }

    pub(crate) fn find_by_name(&self, name: &str, found: &mut Vec<Rc<dyn Port>>) {
        let maps = self.registered.borrow();
        for map in maps.iter() {
            if let Some(port) = map.get(name) {
                found.push(Rc::clone(port));
            }
        }
    }
}
