//! Port indirection: represent a port buried in a component hierarchy
//! at a higher level, so top-level wiring does not hard-code deep paths.
//!
//! An exported port either references its inner port directly or holds a
//! search root and a port name, resolved by recursive descent the first
//! time it participates in a bind.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, bail, Result};

use crate::clock::Clock;
use crate::events::ScheduleableRef;
use crate::tree::TreeNode;
use crate::Cycle;

use super::port_set::PortSet;
use super::{Direction, Port};

enum ExportTarget {
    Direct(Rc<dyn Port>),
    Deferred {
        search_root: Rc<TreeNode>,
        port_name: String,
    },
}

pub struct ExportedPort {
    name: String,
    location: String,
    target: RefCell<ExportTarget>,
}

impl ExportedPort {
    /// Export a known inner port under a (possibly different) name.
    pub fn new_direct(
        port_set: &Rc<PortSet>,
        name: &str,
        inner: &Rc<dyn Port>,
    ) -> Result<Rc<ExportedPort>> {
        let port = Rc::new(ExportedPort {
            name: name.to_string(),
            location: format!("{}.{}", port_set.location(), name),
            target: RefCell::new(ExportTarget::Direct(Rc::clone(inner))),
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// Export a port found later by name somewhere under `search_root`.
    pub fn new_deferred(
        port_set: &Rc<PortSet>,
        name: &str,
        search_root: &Rc<TreeNode>,
        internal_port_name: &str,
    ) -> Result<Rc<ExportedPort>> {
        let port = Rc::new(ExportedPort {
            name: name.to_string(),
            location: format!("{}.{}", port_set.location(), name),
            target: RefCell::new(ExportTarget::Deferred {
                search_root: Rc::clone(search_root),
                port_name: internal_port_name.to_string(),
            }),
        });
        port_set.add(Rc::clone(&port) as Rc<dyn Port>)?;
        Ok(port)
    }

    /// The inner port, searching for it on first use.
    pub fn resolve(&self) -> Result<Rc<dyn Port>> {
        let resolved = match &*self.target.borrow() {
            ExportTarget::Direct(port) => return Ok(Rc::clone(port)),
            ExportTarget::Deferred {
                search_root,
                port_name,
            } => {
                let mut found: Vec<Rc<dyn Port>> = Vec::new();
                search_root.search_ports(port_name, &mut found);
                // An exported port may share its inner port's name;
                // matches that are themselves exports are not inner
                // ports.
                found.retain(|p| p.as_any().downcast_ref::<ExportedPort>().is_none());
                if found.is_empty() {
                    bail!(
                        "could not find a port named '{}' under '{}' for exported port '{}'",
                        port_name,
                        search_root.location(),
                        self.location
                    );
                }
                if found.len() > 1 {
                    bail!(
                        "found {} ports named '{}' under '{}' for exported port '{}'",
                        found.len(),
                        port_name,
                        search_root.location(),
                        self.location
                    );
                }
                found.remove(0)
            }
        };
        *self.target.borrow_mut() = ExportTarget::Direct(Rc::clone(&resolved));
        Ok(resolved)
    }

    fn resolved(&self) -> Option<Rc<dyn Port>> {
        match &*self.target.borrow() {
            ExportTarget::Direct(port) => Some(Rc::clone(port)),
            ExportTarget::Deferred { .. } => None,
        }
    }
}

impl Port for ExportedPort {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn location(&self) -> String {
        self.location.clone()
    }

    /// Unknown until resolution; direction checks defer to the inner
    /// port.
    fn direction(&self) -> Direction {
        match self.resolved() {
            Some(port) => port.direction(),
            None => Direction::Unknown,
        }
    }

    fn clock(&self) -> Option<Rc<Clock>> {
        self.resolved()?.clock()
    }

    fn is_bound(&self) -> bool {
        self.resolved().map(|p| p.is_bound()).unwrap_or(false)
    }

    fn port_delay(&self) -> Cycle {
        self.resolved().map(|p| p.port_delay()).unwrap_or(0)
    }

    fn set_port_delay(&self, delay_cycles: Cycle) -> Result<()> {
        self.resolve()?.set_port_delay(delay_cycles)
    }

    fn set_continuing(&self, continuing: bool) {
        if let Some(port) = self.resolved() {
            port.set_continuing(continuing);
        }
    }

    fn set_participate_in_auto_precedence(&self, participate: bool) {
        if let Some(port) = self.resolved() {
            port.set_participate_in_auto_precedence(participate);
        }
    }

    fn participates_in_auto_precedence(&self) -> bool {
        self.resolved()
            .map(|p| p.participates_in_auto_precedence())
            .unwrap_or(true)
    }

    fn register_consumer_event(&self, listener: ScheduleableRef) -> Result<()> {
        self.resolve()?.register_consumer_event(listener)
    }

    fn register_producing_event(&self, producer: ScheduleableRef) -> Result<()> {
        self.resolve()?.register_producing_event(producer)
    }

    fn bind_to(self: Rc<Self>, other: Rc<dyn Port>) -> Result<()> {
        // Resolve this side first; the concrete bind resolves `other`
        // if it is exported too.
        self.resolve()?.bind_to(other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
