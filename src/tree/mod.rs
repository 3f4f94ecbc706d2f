//! The naming and ownership substrate.
//!
//! Components hang off a tree of named nodes. A node may carry a clock
//! (children inherit it) and a port set. The tree exists to give ports
//! and events locations for diagnostics and to let exported ports
//! resolve inner ports by name; it is deliberately not a framework.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use anyhow::{bail, Result};

use crate::clock::Clock;
use crate::ports::{Port, PortSet};

pub struct TreeNode {
    name: String,
    parent: RefCell<Weak<TreeNode>>,
    children: RefCell<Vec<Rc<TreeNode>>>,
    clock: RefCell<Option<Rc<Clock>>>,
    port_set: RefCell<Option<Rc<PortSet>>>,
    self_weak: RefCell<Weak<TreeNode>>,
}

impl TreeNode {
    fn alloc(name: &str, parent: Weak<TreeNode>) -> Rc<TreeNode> {
        let node = Rc::new(TreeNode {
            name: name.to_string(),
            parent: RefCell::new(parent),
            children: RefCell::new(Vec::new()),
            clock: RefCell::new(None),
            port_set: RefCell::new(None),
            self_weak: RefCell::new(Weak::new()),
        });
        *node.self_weak.borrow_mut() = Rc::downgrade(&node);
        node
    }

    pub fn new_root(name: &str) -> Rc<TreeNode> {
        Self::alloc(name, Weak::new())
    }

    /// Create a named child. Sibling names must be unique.
    pub fn add_child(&self, name: &str) -> Result<Rc<TreeNode>> {
        if self.children.borrow().iter().any(|c| c.name == name) {
            bail!("node '{}' already has a child named '{}'", self.location(), name);
        }
        let child = Self::alloc(name, self.self_weak.borrow().clone());
        self.children.borrow_mut().push(Rc::clone(&child));
        Ok(child)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted path from the root, e.g. `top.core0.lsu`.
    pub fn location(&self) -> String {
        match self.parent.borrow().upgrade() {
            Some(parent) => format!("{}.{}", parent.location(), self.name),
            None => self.name.clone(),
        }
    }

    pub fn parent(&self) -> Option<Rc<TreeNode>> {
        self.parent.borrow().upgrade()
    }

    pub fn children(&self) -> Vec<Rc<TreeNode>> {
        self.children.borrow().clone()
    }

    pub fn get_child(&self, name: &str) -> Option<Rc<TreeNode>> {
        self.children
            .borrow()
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn set_clock(&self, clock: &Rc<Clock>) {
        *self.clock.borrow_mut() = Some(Rc::clone(clock));
    }

    /// This node's clock, inherited from the nearest clocked ancestor.
    pub fn clock(&self) -> Option<Rc<Clock>> {
        if let Some(clock) = self.clock.borrow().as_ref() {
            return Some(Rc::clone(clock));
        }
        self.parent()?.clock()
    }

    /// The node's port set, created on first use.
    pub fn port_set(&self) -> Rc<PortSet> {
        if let Some(ps) = self.port_set.borrow().as_ref() {
            return Rc::clone(ps);
        }
        let me = self
            .self_weak
            .borrow()
            .upgrade()
            .expect("a node reachable through &self is alive");
        let ps = PortSet::new(&me);
        *self.port_set.borrow_mut() = Some(Rc::clone(&ps));
        ps
    }

    /// Thorough search of this subtree for ports with the given name.
    /// No pattern matching; every port set in the subtree is visited.
    pub fn search_ports(&self, name: &str, found: &mut Vec<Rc<dyn Port>>) {
        if let Some(ps) = self.port_set.borrow().as_ref() {
            ps.find_by_name(name, found);
        }
        for child in self.children.borrow().iter() {
            child.search_ports(name, found);
        }
    }
}
