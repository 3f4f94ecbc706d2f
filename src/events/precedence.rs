//! Precedence composition: must-run-before edges between schedulables.
//!
//! `precedes(&a, &b)` records that `a` completes before `b` within any
//! tick where both fire. Both sides must live in the same scheduling
//! phase; ordering across phases already follows from phase order.
//! `EventGroup` expands to edge cross products for fan-in/fan-out
//! ordering. Ports never participate directly; their listener
//! registration methods insert the equivalent edges at bind time.

use std::rc::{Rc, Weak};

use anyhow::{anyhow, bail, Result};

use crate::sched::dag::VertexId;
use crate::sched::{Scheduler, SchedulingPhase};

/// Anything that occupies a vertex in the precedence graph.
pub trait DagParticipant {
    fn dag_vertex(&self) -> VertexId;
    fn dag_phase(&self) -> SchedulingPhase;
    fn dag_scheduler(&self) -> Result<Rc<Scheduler>>;
    fn dag_label(&self) -> String;
}

/// Record that `producer` must complete before `consumer` within a tick.
/// Returns an error naming both endpoints when their phases differ.
pub fn precedes(producer: &dyn DagParticipant, consumer: &dyn DagParticipant) -> Result<()> {
    let pp = producer.dag_phase();
    let cp = consumer.dag_phase();
    if pp != cp {
        bail!(
            "cannot set precedence between different phases: producer '{}' is in {} but consumer '{}' is in {}",
            producer.dag_label(),
            pp,
            consumer.dag_label(),
            cp
        );
    }
    let scheduler = producer.dag_scheduler()?;
    scheduler.add_precedence_edge(producer.dag_vertex(), consumer.dag_vertex())
}

struct GroupMember {
    vertex: VertexId,
    phase: SchedulingPhase,
    scheduler: Weak<Scheduler>,
    label: String,
}

impl DagParticipant for GroupMember {
    fn dag_vertex(&self) -> VertexId {
        self.vertex
    }

    fn dag_phase(&self) -> SchedulingPhase {
        self.phase
    }

    fn dag_scheduler(&self) -> Result<Rc<Scheduler>> {
        self.scheduler
            .upgrade()
            .ok_or_else(|| anyhow!("scheduler for '{}' is gone", self.label))
    }

    fn dag_label(&self) -> String {
        self.label.clone()
    }
}

/// An ordered collection of schedulables treated as one side of a
/// precedence relationship. `group.before(&x)` adds an edge from every
/// member to `x`; group-to-group combinations expand to the full cross
/// product.
#[derive(Default)]
pub struct EventGroup {
    members: Vec<GroupMember>,
}

impl EventGroup {
    pub fn new() -> EventGroup {
        EventGroup {
            members: Vec::new(),
        }
    }

    pub fn add(&mut self, member: &dyn DagParticipant) -> Result<&mut Self> {
        let scheduler = member.dag_scheduler()?;
        self.members.push(GroupMember {
            vertex: member.dag_vertex(),
            phase: member.dag_phase(),
            scheduler: Rc::downgrade(&scheduler),
            label: member.dag_label(),
        });
        Ok(self)
    }

    /// Builder form of [`EventGroup::add`].
    pub fn with(mut self, member: &dyn DagParticipant) -> Result<Self> {
        self.add(member)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Every member precedes `consumer`.
    pub fn before(&self, consumer: &dyn DagParticipant) -> Result<()> {
        for member in &self.members {
            precedes(member, consumer)?;
        }
        Ok(())
    }

    /// `producer` precedes every member.
    pub fn after(&self, producer: &dyn DagParticipant) -> Result<()> {
        for member in &self.members {
            precedes(producer, member)?;
        }
        Ok(())
    }

    /// Every member of `self` precedes every member of `consumers`.
    pub fn before_group(&self, consumers: &EventGroup) -> Result<()> {
        for producer in &self.members {
            for consumer in &consumers.members {
                precedes(producer, consumer)?;
            }
        }
        Ok(())
    }
}
